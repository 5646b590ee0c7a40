// src/arch/riscv64/trap.rs
//! Trap handling.
//!
//! Two vectors: `kernelvec` for traps taken while in the kernel (all of
//! which are bugs on this machine, which runs without device or timer
//! interrupts) and the trampoline's `uservec` for traps from user mode.
//! `usertrap` decodes the cause, services syscalls and store faults, and
//! `usertrapret` climbs back down through the trampoline.

use riscv::register::mtvec::TrapMode;
use riscv::register::scause::{self, Exception, Trap};
use riscv::register::{sepc, sstatus, stval, stvec};

use super::make_satp;
use crate::kernel::mm::memlayout::TRAMPOLINE;
use crate::kernel::mm::{page_fault_resolve, PageFaultError, VirtAddr};
use crate::kernel::process::{self, PROCESS_TABLE};
use crate::kernel::syscall;

core::arch::global_asm!(
    r#"
    .section .text
    .globl kernelvec
    .align 4
kernelvec:
    addi sp, sp, -256
    sd ra, 0(sp)
    sd sp, 8(sp)
    sd gp, 16(sp)
    sd tp, 24(sp)
    sd t0, 32(sp)
    sd t1, 40(sp)
    sd t2, 48(sp)
    sd s0, 56(sp)
    sd s1, 64(sp)
    sd a0, 72(sp)
    sd a1, 80(sp)
    sd a2, 88(sp)
    sd a3, 96(sp)
    sd a4, 104(sp)
    sd a5, 112(sp)
    sd a6, 120(sp)
    sd a7, 128(sp)
    sd s2, 136(sp)
    sd s3, 144(sp)
    sd s4, 152(sp)
    sd s5, 160(sp)
    sd s6, 168(sp)
    sd s7, 176(sp)
    sd s8, 184(sp)
    sd s9, 192(sp)
    sd s10, 200(sp)
    sd s11, 208(sp)
    sd t3, 216(sp)
    sd t4, 224(sp)
    sd t5, 232(sp)
    sd t6, 240(sp)

    call kerneltrap

    ld ra, 0(sp)
    ld gp, 16(sp)
    ld t0, 32(sp)
    ld t1, 40(sp)
    ld t2, 48(sp)
    ld s0, 56(sp)
    ld s1, 64(sp)
    ld a0, 72(sp)
    ld a1, 80(sp)
    ld a2, 88(sp)
    ld a3, 96(sp)
    ld a4, 104(sp)
    ld a5, 112(sp)
    ld a6, 120(sp)
    ld a7, 128(sp)
    ld s2, 136(sp)
    ld s3, 144(sp)
    ld s4, 152(sp)
    ld s5, 160(sp)
    ld s6, 168(sp)
    ld s7, 176(sp)
    ld s8, 184(sp)
    ld s9, 192(sp)
    ld s10, 200(sp)
    ld s11, 208(sp)
    ld t3, 216(sp)
    ld t4, 224(sp)
    ld t5, 232(sp)
    ld t6, 240(sp)
    addi sp, sp, 256

    sret
"#
);

extern "C" {
    fn kernelvec();
    fn uservec();
    fn userret();
    fn trampoline();
}

/// Point `stvec` at the kernel trap vector.
pub fn init() {
    // SAFETY: kernelvec is a valid, aligned trap entry.
    unsafe {
        stvec::write(kernelvec as usize, TrapMode::Direct);
    }
}

/// Traps taken from kernel mode. With no device or timer interrupts
/// enabled, every one of them is a kernel bug.
#[no_mangle]
extern "C" fn kerneltrap() {
    let cause = scause::read();
    panic!(
        "kernel trap: scause={:?} stval={:#x} sepc={:#x}",
        cause.cause(),
        stval::read(),
        sepc::read()
    );
}

/// Entry for traps from user mode, reached through the trampoline.
#[no_mangle]
pub extern "C" fn usertrap() -> ! {
    // Traps from now on are kernel traps.
    init();

    let tf_pa = {
        let table = PROCESS_TABLE.lock();
        table
            .current()
            .expect("user trap without a current process")
            .trapframe_pa()
            .expect("current process has no trapframe")
    };
    // SAFETY: the process trapped into the kernel, so its trapframe is
    // quiescent until usertrapret.
    let tf = unsafe { &mut *tf_pa.as_mut_ptr::<process::trapframe::TrapFrame>() };
    tf.epc = sepc::read() as u64;

    match scause::read().cause() {
        Trap::Exception(Exception::UserEnvCall) => {
            syscall::dispatch(tf);
        }
        Trap::Exception(Exception::StorePageFault)
        | Trap::Exception(Exception::StoreFault) => {
            handle_user_page_fault(VirtAddr::new(stval::read()), true);
        }
        Trap::Exception(Exception::LoadPageFault)
        | Trap::Exception(Exception::InstructionPageFault) => {
            handle_user_page_fault(VirtAddr::new(stval::read()), false);
        }
        cause => {
            crate::debug_println!(
                "[trap] unexpected user trap {:?}, stval={:#x}",
                cause,
                stval::read()
            );
            process::kill_current(-1);
        }
    }

    if process::current_is_dead() {
        // A zombie is never rescheduled; this hands the hart back to the
        // scheduler for good.
        process::yield_now();
        unreachable!("zombie process rescheduled");
    }

    usertrapret();
}

fn handle_user_page_fault(va: VirtAddr, is_store: bool) {
    let mm = match process::current_mm() {
        Some(mm) => mm,
        None => {
            process::kill_current(-1);
            return;
        }
    };
    match page_fault_resolve(&mm, va, is_store) {
        Ok(()) => {}
        Err(e) => {
            let pid = process::current_pid().map(|p| p.as_u64()).unwrap_or(0);
            match e {
                PageFaultError::AccessViolation => {
                    crate::debug_println!(
                        "[trap] pid={} store to read-only page at {}",
                        pid,
                        va
                    );
                }
                PageFaultError::InvalidAccess => {
                    crate::debug_println!("[trap] pid={} segfault at {}", pid, va);
                }
                PageFaultError::OutOfMemory => {
                    crate::debug_println!("[trap] pid={} out of memory at {}", pid, va);
                }
            }
            process::kill_current(-1);
        }
    }
}

/// First kernel-side return of a newly created process.
#[no_mangle]
pub extern "C" fn forkret() -> ! {
    usertrapret();
}

/// Return to user mode through the trampoline.
pub fn usertrapret() -> ! {
    use crate::arch::Cpu;

    // Interrupts stay off while stvec points into the trampoline.
    super::Rv64Cpu::disable_interrupts();

    let (tf_pa, user_root, kstack_top) = {
        let table = PROCESS_TABLE.lock();
        let p = table.current().expect("usertrapret without current");
        let root = p
            .mm()
            .expect("current process has no mm")
            .lock()
            .root();
        (
            p.trapframe_pa().expect("no trapframe"),
            root,
            p.kernel_stack_top(),
        )
    };

    let uservec_va = TRAMPOLINE.as_usize() + (uservec as usize - trampoline as usize);
    // SAFETY: the trampoline is mapped at TRAMPOLINE in every address space.
    unsafe {
        stvec::write(uservec_va, TrapMode::Direct);
    }

    // SAFETY: the trapframe is quiescent while its process is in-kernel.
    let tf = unsafe { &mut *tf_pa.as_mut_ptr::<process::trapframe::TrapFrame>() };
    tf.kernel_satp = make_satp(crate::kernel::mm::kvm::kernel_root()) as u64;
    tf.kernel_sp = kstack_top as u64;
    tf.kernel_trap = usertrap as usize as u64;
    // Single hart; tp carries no per-CPU state in this kernel.
    tf.kernel_hartid = 0;

    // SAFETY: setting the privilege fields for the sret below.
    unsafe {
        sstatus::set_spp(sstatus::SPP::User);
        sstatus::set_spie();
        sepc::write(tf.epc as usize);
    }

    let satp_val = make_satp(user_root);
    let userret_va = TRAMPOLINE.as_usize() + (userret as usize - trampoline as usize);
    // SAFETY: userret_va is the trampoline's userret, mapped in both the
    // kernel table (current satp) and the user table it switches to.
    let enter: extern "C" fn(usize) -> ! = unsafe { core::mem::transmute(userret_va) };
    enter(satp_val);
}
