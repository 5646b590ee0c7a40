// src/kernel/mm/memlayout.rs
//! Physical and virtual memory layout of the kernel.
//!
//! Physical layout (qemu -machine virt):
//!
//! ```text
//! 0x1000_0000  UART0 (NS16550A registers)
//! 0x8000_0000  DRAM base (OpenSBI firmware lives in the first 2 MiB)
//! 0x8020_0000  kernel text + data
//! ...          pages handed to the frame allocator
//! PHYS_TOP     end of managed DRAM
//! ```
//!
//! User virtual layout (Sv39, addresses grow upward):
//!
//! ```text
//! 0x0001_0000  user code base (flat binaries are linked here)
//! ...          data, heap (grows up via sbrk)
//! USER_TOP     top of VMA-managed space; the user stack sits just below
//! TRAPFRAME    per-process trapframe page (R|W, kernel-owned frame)
//! TRAMPOLINE   trap entry/exit page (R|X, shared kernel text)
//! MAXVA        top of the Sv39 low canonical half
//! ```
//!
//! The kernel runs on a direct map: kernel-virtual addresses equal physical
//! addresses, so [`pa_to_kva`] is the identity. This also lets the address
//! space code run unmodified in hosted tests, where "physical" frames come
//! from a static arena.

use super::addr::{PhysAddr, VirtAddr, PGSIZE};

/// Start of DRAM on the qemu virt machine.
pub const DRAM_BASE: usize = 0x8000_0000;

/// Amount of DRAM the kernel manages.
pub const PHYS_MEM_SIZE: usize = 128 * 1024 * 1024;

/// One past the last managed physical address.
pub const PHYS_TOP: usize = DRAM_BASE + PHYS_MEM_SIZE;

/// Number of page frames in managed DRAM; also the capacity of the frame
/// refcount table.
pub const NFRAMES: usize = PHYS_MEM_SIZE / PGSIZE;

/// NS16550A UART MMIO base.
pub const UART0: usize = 0x1000_0000;

/// One beyond the highest usable virtual address.
///
/// Sv39 offers 39 bits; using one bit less avoids sign-extended addresses.
pub const MAXVA: usize = 1 << 38;

/// The trap entry/exit page, mapped R|X at the same VA in every address
/// space (and in the kernel page table).
pub const TRAMPOLINE: VirtAddr = VirtAddr::new(MAXVA - PGSIZE);

/// The per-process trapframe page, just below the trampoline.
pub const TRAPFRAME: VirtAddr = VirtAddr::new(MAXVA - 2 * PGSIZE);

/// Exclusive upper bound for user VMAs. The trapframe and trampoline live
/// above this and are mapped outside any VMA.
pub const USER_TOP: VirtAddr = TRAPFRAME;

/// Where flat user binaries are linked and loaded.
pub const USER_CODE_BASE: VirtAddr = VirtAddr::new(0x1_0000);

/// Top of the initial user stack (grows down from here).
pub const USER_STACK_TOP: VirtAddr = USER_TOP;

/// Initial user stack size (16 pages).
pub const USER_STACK_SIZE: usize = 16 * PGSIZE;

/// Size of the kernel byte heap backing `alloc` (riscv64 builds only).
pub const KERNEL_HEAP_SIZE: usize = 512 * 1024;

/// Translate a physical address into a kernel-virtual one.
///
/// The kernel direct map is the identity, so this is a type conversion.
#[inline]
pub const fn pa_to_kva(pa: PhysAddr) -> usize {
    pa.as_usize()
}

/// Translate a kernel-virtual address back to physical.
#[inline]
pub const fn kva_to_pa(kva: usize) -> PhysAddr {
    PhysAddr::new(kva)
}

/// Whether `va` can appear in a page-table walk at all (user pages plus the
/// fixed trapframe/trampoline mappings).
#[inline]
pub const fn is_walkable_va(va: VirtAddr) -> bool {
    va.as_usize() < MAXVA
}

/// Whether `[va, va + PGSIZE)` may be covered by a user VMA.
#[inline]
pub fn is_user_va(va: VirtAddr) -> bool {
    va < USER_TOP
}
