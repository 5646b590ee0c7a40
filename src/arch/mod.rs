// src/arch/mod.rs
//! Architecture-specific abstractions.
//!
//! Real implementations live in [`riscv64`]; other targets (the hosted test
//! build) get no-op stubs so the arch-neutral kernel code compiles and runs
//! anywhere.

#[cfg(target_arch = "riscv64")]
pub mod riscv64;

#[cfg(target_arch = "riscv64")]
pub use self::riscv64::{flush_tlb_all, flush_tlb_page, trampoline_pa, ArchCpu};

#[cfg(not(target_arch = "riscv64"))]
use crate::kernel::mm::VirtAddr;

/// Trait for CPU-specific operations.
pub trait Cpu {
    /// Halt the CPU until the next interrupt.
    fn halt();

    /// Disable interrupts.
    fn disable_interrupts();

    /// Enable interrupts.
    fn enable_interrupts();
}

/// Remove the translation for one page from this hart's TLB.
#[cfg(not(target_arch = "riscv64"))]
#[inline]
pub fn flush_tlb_page(_va: VirtAddr) {}

/// Flush this hart's entire TLB.
#[cfg(not(target_arch = "riscv64"))]
#[inline]
pub fn flush_tlb_all() {}

/// Physical address of the trampoline page.
#[cfg(not(target_arch = "riscv64"))]
pub fn trampoline_pa() -> crate::kernel::mm::PhysAddr {
    panic!("the trampoline page only exists on riscv64");
}

/// Stub CPU for hosted builds.
#[cfg(not(target_arch = "riscv64"))]
pub struct ArchCpu;

#[cfg(not(target_arch = "riscv64"))]
impl Cpu for ArchCpu {
    fn halt() {}
    fn disable_interrupts() {}
    fn enable_interrupts() {}
}
