// src/arch/riscv64/trampoline.rs
//! The trampoline page.
//!
//! RISC-V does not switch page tables on a trap, so the instructions at
//! `stvec` must be mapped in user space. This page is linked into its own
//! page-aligned section (`.trampsec`, see `linker.ld`) and mapped R|X at
//! the [`TRAMPOLINE`](crate::kernel::mm::memlayout::TRAMPOLINE) virtual
//! address in every address space, kernel included, so the `satp` switch
//! in the middle of `uservec`/`userret` does not pull the rug out from
//! under the executing code.
//!
//! `sscratch` holds the TRAPFRAME virtual address while a process runs in
//! user mode; `uservec` swaps it with the user registers and climbs into
//! the kernel, `userret` does the mirror image.

core::arch::global_asm!(
    r#"
    .section .trampsec
    .align 12
    .globl trampoline
trampoline:

    .align 4
    .globl uservec
uservec:
    # Trade a0 for the trapframe pointer kept in sscratch.
    csrrw a0, sscratch, a0

    # Save user registers into the trapframe.
    sd ra, 40(a0)
    sd sp, 48(a0)
    sd gp, 56(a0)
    sd tp, 64(a0)
    sd t0, 72(a0)
    sd t1, 80(a0)
    sd t2, 88(a0)
    sd s0, 96(a0)
    sd s1, 104(a0)
    sd a1, 120(a0)
    sd a2, 128(a0)
    sd a3, 136(a0)
    sd a4, 144(a0)
    sd a5, 152(a0)
    sd a6, 160(a0)
    sd a7, 168(a0)
    sd s2, 176(a0)
    sd s3, 184(a0)
    sd s4, 192(a0)
    sd s5, 200(a0)
    sd s6, 208(a0)
    sd s7, 216(a0)
    sd s8, 224(a0)
    sd s9, 232(a0)
    sd s10, 240(a0)
    sd s11, 248(a0)
    sd t3, 256(a0)
    sd t4, 264(a0)
    sd t5, 272(a0)
    sd t6, 280(a0)

    # Save the traded-away a0 as well.
    csrr t0, sscratch
    sd t0, 112(a0)

    # Pick up the kernel environment stashed by usertrapret.
    ld sp, 8(a0)
    ld tp, 32(a0)
    ld t0, 16(a0)
    ld t1, 0(a0)

    # Switch to the kernel page table.
    sfence.vma zero, zero
    csrw satp, t1
    sfence.vma zero, zero

    # Jump to usertrap().
    jr t0

    .globl userret
userret:
    # userret(satp) -- switch back to the user page table.
    sfence.vma zero, zero
    csrw satp, a0
    sfence.vma zero, zero

    # TRAPFRAME (MAXVA - 2 pages); keep in sync with memlayout.rs.
    li a0, 0x3FFFFFE000

    # Restore user registers.
    ld ra, 40(a0)
    ld sp, 48(a0)
    ld gp, 56(a0)
    ld tp, 64(a0)
    ld t0, 72(a0)
    ld t1, 80(a0)
    ld t2, 88(a0)
    ld s0, 96(a0)
    ld s1, 104(a0)
    ld a1, 120(a0)
    ld a2, 128(a0)
    ld a3, 136(a0)
    ld a4, 144(a0)
    ld a5, 152(a0)
    ld a6, 160(a0)
    ld a7, 168(a0)
    ld s2, 176(a0)
    ld s3, 184(a0)
    ld s4, 192(a0)
    ld s5, 200(a0)
    ld s6, 208(a0)
    ld s7, 216(a0)
    ld s8, 224(a0)
    ld s9, 232(a0)
    ld s10, 240(a0)
    ld s11, 248(a0)
    ld t3, 256(a0)
    ld t4, 264(a0)
    ld t5, 272(a0)
    ld t6, 280(a0)

    # sscratch keeps the trapframe pointer for the next trap.
    csrw sscratch, a0
    ld a0, 112(a0)

    sret
"#
);
