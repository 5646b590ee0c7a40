// src/main.rs
//! Kernel entry point.
//!
//! OpenSBI drops us at `BASE_ADDRESS` (see `linker.ld`) in S-mode with the
//! hart id in `a0` and a devicetree pointer in `a1`. The assembly stub sets
//! up a boot stack, zeroes .bss, and calls [`rust_main`].

#![cfg_attr(target_arch = "riscv64", no_std)]
#![cfg_attr(target_arch = "riscv64", no_main)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(target_arch = "riscv64")]
mod boot {
    use tiny_rv64::kernel::mm::addr::PhysAddr;
    use tiny_rv64::kernel::mm::memlayout::PHYS_TOP;
    use tiny_rv64::kernel::{mm, process};
    use tiny_rv64::{arch, console_println, debug_println, serial};

    core::arch::global_asm!(
        r#"
        .section .text.entry
        .globl _start
    _start:
        # Zero .bss before touching any Rust static.
        la t0, sbss
        la t1, ebss
        bgeu t0, t1, 2f
    1:
        sd zero, 0(t0)
        addi t0, t0, 8
        bltu t0, t1, 1b
    2:
        la sp, boot_stack_top
        call rust_main
    3:
        wfi
        j 3b

        .section .bss.stack
        .align 4
        .globl boot_stack
    boot_stack:
        .space 16384
        .globl boot_stack_top
    boot_stack_top:
    "#
    );

    extern "C" {
        // Provided by linker.ld: first byte past the loaded kernel image.
        fn ekernel();
    }

    #[no_mangle]
    extern "C" fn rust_main(hartid: usize, _dtb: usize) -> ! {
        serial::init();
        console_println!("tiny_rv64 booting on hart {}", hartid);

        // SAFETY: boot runs once, before any allocation.
        unsafe {
            tiny_rv64::init_heap();
        }

        let free_base = PhysAddr::new(ekernel as usize).page_round_up();
        // SAFETY: everything between the kernel image and PHYS_TOP is ours.
        unsafe {
            mm::init(free_base, PhysAddr::new(PHYS_TOP)).expect("mm init failed");
        }
        debug_println!(
            "[boot] {} free pages ({} .. {:#x})",
            mm::frame::free_pages(),
            free_base,
            PHYS_TOP
        );

        mm::kvm::init();
        arch::riscv64::trap::init();

        spawn_init();

        process::scheduler();
    }

    /// Launch the first user process, if one is embedded in the image.
    #[cfg(feature = "embed_cowtest")]
    fn spawn_init() {
        use tiny_rv64::kernel::loader;
        use tiny_rv64::kernel::mm::PGSIZE;

        static COWTEST: &[u8] = include_bytes!(concat!(
            "../userland/programs/cowtest/target/",
            "riscv64gc-unknown-none-elf/release/cowtest.bin"
        ));

        let trapframe = mm::frame::alloc_zeroed_page().expect("no frame for init trapframe");
        let mm = tiny_rv64::kernel::mm::Mm::create(arch::trampoline_pa(), trapframe)
            .expect("init mm");
        // The whole flat image is mapped read-only/executable; cowtest keeps
        // its mutable state on the stack and heap.
        let ro_size = (COWTEST.len() + PGSIZE - 1) & !(PGSIZE - 1);
        let image = loader::load_flat_binary(&mm, COWTEST, ro_size).expect("load cowtest");
        process::spawn(mm, trapframe, image.entry, image.stack_top, image.heap_start)
            .expect("spawn cowtest");
    }

    #[cfg(not(feature = "embed_cowtest"))]
    fn spawn_init() {
        console_println!("no user program embedded (build with --features embed_cowtest); idling");
    }
}

#[cfg(not(target_arch = "riscv64"))]
fn main() {
    eprintln!("tiny_rv64 is a riscv64 kernel; build it with");
    eprintln!("    cargo build --target riscv64gc-unknown-none-elf");
    eprintln!("(the library and its tests run on any host: cargo test)");
}
