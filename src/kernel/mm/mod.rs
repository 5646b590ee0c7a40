// src/kernel/mm/mod.rs
//! Memory management: frames, refcounts, Sv39 page tables, address spaces,
//! CoW fork, fault resolution, and kernel access to user memory.

pub mod addr;
pub mod frame;
pub mod memlayout;
#[allow(clippy::module_inception)]
pub mod mm;
pub mod page_fault;
pub mod page_table;
pub mod refcount;
pub mod strbuf;
pub mod uaccess;

#[cfg(target_arch = "riscv64")]
pub mod kvm;

pub use self::addr::{PhysAddr, VirtAddr, PGSIZE};
pub use self::mm::{Mm, MmInner, Vma};
pub use self::page_fault::{page_fault_resolve, PageFaultError, PageFaultResult};
pub use self::page_table::{print_page_table, Pte, PteFlags};
pub use self::uaccess::{copy_from_user, copy_string_from_user, copy_to_user};

use crate::kernel::core::KernelResult;

/// Hand the physical range `[base, end)` to the VM subsystem: the frame
/// allocator takes ownership of the pages and the refcount table starts
/// covering them.
///
/// # Safety
///
/// The range must be page-aligned, reachable through the kernel direct map,
/// and unused by anything else from here on.
pub unsafe fn init(base: PhysAddr, end: PhysAddr) -> KernelResult<()> {
    // SAFETY: forwarded caller contract.
    unsafe {
        frame::FRAME_ALLOCATOR.init(base, end)?;
    }
    refcount::REFCOUNTS.init(base, (end - base) / PGSIZE);
    Ok(())
}
