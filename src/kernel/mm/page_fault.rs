// src/kernel/mm/page_fault.rs
//! User page-fault resolution.
//!
//! The only fault this kernel repairs is a store to a CoW-shared page. The
//! resolver either restores writability (sole sharer) or moves the writer
//! onto a private copy; everything else is a segmentation fault and the
//! process dies.
//!
//! The same break procedure runs from two contexts: the trap path (a user
//! store trapped) and the kernel write path (`copy_to_user` found a COW
//! entry). Both hold the MM lock around [`resolve_locked`].

use core::ptr;

use super::addr::{PhysAddr, VirtAddr, PGSIZE};
use super::frame;
use super::mm::{Mm, MmInner};
use super::page_table::PteFlags;
use super::refcount::{refcount_dec, refcount_get, refcount_inc};

/// Result type for fault handling.
pub type PageFaultResult<T> = Result<T, PageFaultError>;

/// Outcomes of a failed fault resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultError {
    /// The address is unmapped, invalid, or not user-accessible.
    InvalidAccess,
    /// Store to a genuinely read-only mapping (no COW bit).
    AccessViolation,
    /// No frame available for the private copy.
    OutOfMemory,
}

/// Resolve a user page fault at `va` in `mm`.
///
/// On `Ok(())` the faulting instruction can simply be re-executed. Fatal
/// outcomes are returned for the trap layer to turn into a kill.
pub fn page_fault_resolve(mm: &Mm, va: VirtAddr, is_store: bool) -> PageFaultResult<()> {
    let mut inner = mm.lock();
    resolve_locked(&mut inner, va, is_store).map(|_| ())
}

/// The fault resolution proper, with the MM lock held.
///
/// Returns the physical frame that is now writable through `va`'s PTE, for
/// the benefit of the kernel write path.
pub(crate) fn resolve_locked(
    inner: &mut MmInner,
    va: VirtAddr,
    is_store: bool,
) -> PageFaultResult<PhysAddr> {
    let page = va.page_round_down();

    let pte = match inner.walk(page, false) {
        Some(p) => p,
        None => return Err(PageFaultError::InvalidAccess),
    };
    if !pte.is_valid() || !pte.is_user() {
        return Err(PageFaultError::InvalidAccess);
    }

    // Loads and fetches on a mapped user page never fault here (U pages
    // are always readable in this kernel); a non-store fault that reaches
    // this point is some other corruption and stays fatal.
    if !is_store {
        return Err(PageFaultError::InvalidAccess);
    }

    let flags = pte.flags();
    if flags.contains(PteFlags::W) {
        // Spurious: another path resolved this page between the fault and
        // the lock acquisition.
        return Ok(pte.pa());
    }
    if !flags.contains(PteFlags::COW) {
        // Genuinely read-only mapping; the writer dies.
        return Err(PageFaultError::AccessViolation);
    }

    let pa = pte.pa();
    let rc = refcount_get(pa);

    let resolved = if rc == 1 {
        // Sole sharer: take the frame back in place.
        let mut f = flags;
        f.remove(PteFlags::COW);
        f.insert(PteFlags::W | PteFlags::D);
        pte.set_flags(f);
        pa
    } else {
        // Shared: move this address space onto a private copy.
        let new_pa = frame::alloc_page().ok_or(PageFaultError::OutOfMemory)?;
        // SAFETY: `pa` is a live user frame (refcount > 1) and `new_pa` was
        // just allocated; both are in the direct map and do not overlap.
        unsafe {
            ptr::copy_nonoverlapping(pa.as_ptr::<u8>(), new_pa.as_mut_ptr::<u8>(), PGSIZE);
        }
        let mut f = flags;
        f.remove(PteFlags::COW);
        f.insert(PteFlags::W | PteFlags::D);
        pte.set(new_pa, f);
        refcount_inc(new_pa);
        // The frame stays with the remaining sharers. If another hart
        // raced us to its own copy, this decrement may be the last one and
        // returns the frame to the allocator.
        refcount_dec(pa);
        new_pa
    };

    crate::arch::flush_tlb_page(page);
    Ok(resolved)
}
