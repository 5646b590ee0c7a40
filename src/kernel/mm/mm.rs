// src/kernel/mm/mm.rs
//! Per-process address spaces.
//!
//! An [`Mm`] owns a root page table and the list of [`Vma`]s describing the
//! mapped user ranges. The mutable state lives behind a spin mutex; every
//! walk and mapping primitive is a method on the guarded [`MmInner`], so
//! holding the lock is enforced by the borrow checker rather than asserted
//! at run time.
//!
//! Address spaces are handed out as `Arc<Mm>`; the process that owns one
//! drops the last reference on exit, which tears down the VMAs (dropping
//! the per-frame share counts) and then the page-table tree.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use super::addr::{PhysAddr, VirtAddr, PGSIZE};
use super::memlayout::{is_user_va, is_walkable_va, TRAMPOLINE, TRAPFRAME};
use super::page_table::{self, Pte, PteFlags};
use super::frame;
use super::refcount::{refcount_dec, refcount_inc};
use crate::kernel::core::{KernelResult, MemoryError};

/// A contiguous user range with uniform protection.
///
/// `flags` holds the protection subset (some non-empty combination of
/// R/W/X); V, U and the accessed/dirty bits are added when the leaf PTEs
/// are written. Flags never change after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    start: VirtAddr,
    end: VirtAddr,
    flags: PteFlags,
}

impl Vma {
    /// Inclusive start of the range.
    #[inline]
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Exclusive end of the range.
    #[inline]
    pub fn end(&self) -> VirtAddr {
        self.end
    }

    /// Protection flags (R/W/X subset).
    #[inline]
    pub fn flags(&self) -> PteFlags {
        self.flags
    }

    /// Number of pages covered.
    #[inline]
    pub fn pages(&self) -> usize {
        (self.end - self.start) / PGSIZE
    }
}

/// Compute the full leaf-PTE flag set for a VMA protection subset.
///
/// A is always preset (no Svadu on the target), D whenever the page is
/// writable.
fn leaf_flags(prot: PteFlags) -> PteFlags {
    let mut f = prot | PteFlags::V | PteFlags::U | PteFlags::A;
    if prot.contains(PteFlags::W) {
        f |= PteFlags::D;
    }
    f
}

/// The lock-protected part of an address space.
pub struct MmInner {
    root: PhysAddr,
    vmas: Vec<Vma>,
}

/// An address space: root page table plus VMA list behind one lock.
pub struct Mm {
    inner: Mutex<MmInner>,
}

impl Mm {
    /// Create an address space with the trampoline and trapframe pages
    /// pre-mapped at their fixed high addresses.
    ///
    /// Both frames are kernel-owned: they are mapped without entering the
    /// frame refcount table and are not covered by any VMA.
    pub fn create(trampoline: PhysAddr, trapframe: PhysAddr) -> KernelResult<Arc<Mm>> {
        let root = page_table::alloc_table().ok_or(MemoryError::OutOfMemory)?;
        let mm = Mm {
            inner: Mutex::new(MmInner {
                root,
                vmas: Vec::new(),
            }),
        };
        {
            // Dropping `mm` on the error path releases whatever the partial
            // mappings allocated.
            let mut inner = mm.inner.lock();
            inner.map_page_at(
                TRAMPOLINE,
                trampoline,
                PteFlags::R | PteFlags::X | PteFlags::A,
            )?;
            inner.map_page_at(
                TRAPFRAME,
                trapframe,
                PteFlags::R | PteFlags::W | PteFlags::A | PteFlags::D,
            )?;
        }
        Ok(Arc::new(mm))
    }

    /// Acquire the address-space lock.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, MmInner> {
        self.inner.lock()
    }

    /// Clone this address space for fork, sharing every user frame.
    ///
    /// The child gets its own trapframe mapping; all user pages are shared
    /// with incremented refcounts, and previously writable PTEs become
    /// read-only + COW **on both sides**. Costs O(pages) PTE edits and no
    /// data-frame allocations.
    ///
    /// Lock order is parent first, then child; the child is newly created
    /// and unreachable from anywhere else, so the order cannot deadlock.
    pub fn fork_cow(
        &self,
        trampoline: PhysAddr,
        child_trapframe: PhysAddr,
    ) -> KernelResult<Arc<Mm>> {
        let child = Mm::create(trampoline, child_trapframe)?;
        {
            let mut parent = self.lock();
            let mut new = child.inner.lock();
            parent.fork_cow_into(&mut new)?;
        }
        Ok(child)
    }
}

impl Drop for Mm {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.free_vmas();
        // SAFETY: the last owner is going away; nobody can walk or run on
        // this table anymore. User leaf refcounts were dropped just above,
        // and the remaining leaves (trampoline, trapframe) name frames the
        // kernel owns elsewhere.
        unsafe {
            page_table::free_pagetable(inner.root);
        }
    }
}

impl MmInner {
    /// Physical address of the root page table (for `satp` and dumps).
    #[inline]
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Return the leaf PTE for `va`, allocating intermediate table pages
    /// when `alloc` is set. The entry may be invalid; `None` means the VA
    /// is out of range or a needed table page was missing/unallocatable.
    pub fn walk(&mut self, va: VirtAddr, alloc: bool) -> Option<&mut Pte> {
        // SAFETY: `self.root` is this address space's live root table and
        // `&mut self` proves the MM lock is held.
        unsafe { page_table::walk_raw(self.root, va, alloc).map(|p| &mut *p) }
    }

    /// Page-aligned VA in, page-aligned PA out; `None` if the page is
    /// unmapped, invalid, or not user-accessible.
    pub fn walkaddr(&mut self, va: VirtAddr) -> Option<PhysAddr> {
        assert!(va.is_page_aligned(), "walkaddr: unaligned {}", va);
        let pte = *self.walk(va, false)?;
        if !pte.is_valid() {
            return None;
        }
        if !pte.is_user() {
            crate::debug_println!("[mm] walkaddr: kernel pte at {}", va);
            return None;
        }
        Some(pte.pa())
    }

    /// Translate an arbitrary user VA, preserving the page offset.
    pub fn user_addr(&mut self, va: VirtAddr) -> Option<PhysAddr> {
        let page = self.walkaddr(va.page_round_down())?;
        Some(page + va.page_offset())
    }

    /// Find the VMA whose start equals `va` exactly.
    ///
    /// Exact-start lookup is all the callers need (sbrk addresses the heap
    /// VMA by its base); containment lookup is deliberately not offered.
    pub fn find_vma(&self, va: VirtAddr) -> Option<usize> {
        self.vmas.iter().position(|v| v.start == va)
    }

    /// The VMA at `idx` (from [`MmInner::find_vma`]).
    #[inline]
    pub fn vma(&self, idx: usize) -> &Vma {
        &self.vmas[idx]
    }

    /// The VMAs of this address space.
    #[inline]
    pub fn vmas(&self) -> &[Vma] {
        &self.vmas
    }

    /// Strict half-open intersection test against every VMA except
    /// `exclude`. Adjacent ranges (`[a,b)` / `[b,c)`) do not overlap.
    fn check_overlap(&self, start: VirtAddr, end: VirtAddr, exclude: Option<usize>) -> bool {
        if start == end {
            return false;
        }
        self.vmas
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != exclude)
            .any(|(_, v)| start < v.end && v.start < end)
    }

    /// Eagerly map `[start, end)` with fresh zeroed frames and link the
    /// resulting VMA.
    ///
    /// On any failure all pages mapped by this call are released again and
    /// no VMA is created.
    pub fn map_pages(
        &mut self,
        start: VirtAddr,
        end: VirtAddr,
        prot: PteFlags,
    ) -> KernelResult<()> {
        assert!(start.is_page_aligned(), "map_pages: unaligned {}", start);
        assert!(end.is_page_aligned(), "map_pages: unaligned {}", end);
        assert!(prot.is_leaf(), "map_pages: empty protection set");
        if start >= end || !is_user_va(start) || !is_user_va(end - PGSIZE) {
            return Err(MemoryError::InvalidAddress.into());
        }
        if self.check_overlap(start, end, None) {
            crate::debug_println!("[mm] map_pages: overlap [{}, {})", start, end);
            return Err(MemoryError::Overlap.into());
        }

        let mut va = start;
        let result = loop {
            if va >= end {
                break Ok(());
            }
            match self.map_fresh_page(va, prot) {
                Ok(()) => va += PGSIZE,
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = result {
            self.unmap_range(start, va);
            return Err(e);
        }
        crate::arch::flush_tlb_all();

        self.vmas.push(Vma {
            start,
            end,
            flags: prot,
        });
        Ok(())
    }

    /// Map one single page with a caller-provided physical frame.
    ///
    /// Used for the trampoline and trapframe: the frame is kernel-owned, so
    /// the refcount table is not involved and no VMA is created.
    pub fn map_page_at(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        flags: PteFlags,
    ) -> KernelResult<()> {
        assert!(va.is_page_aligned() && pa.is_page_aligned());
        assert!(is_walkable_va(va), "map_page_at: bad va {}", va);
        if self.check_overlap(va, va + PGSIZE, None) {
            return Err(MemoryError::Overlap.into());
        }
        let pte = self
            .walk(va, true)
            .ok_or(MemoryError::OutOfMemory)?;
        if pte.is_valid() {
            crate::debug_println!("[mm] map_page_at: remap at {}", va);
            return Err(MemoryError::AlreadyMapped.into());
        }
        pte.set(pa, flags | PteFlags::V);
        crate::arch::flush_tlb_page(va);
        Ok(())
    }

    /// Grow the VMA at `idx` to `[start, end)`.
    ///
    /// The only supported shape is monotonic heap growth: same start, same
    /// flags, non-shrinking end. Anything else is a kernel bug. Newly
    /// covered pages are fresh zeroed frames with refcount one; existing
    /// pages are untouched. On allocation failure the new pages are rolled
    /// back and the VMA keeps its old bounds.
    pub fn remap(
        &mut self,
        idx: usize,
        start: VirtAddr,
        end: VirtAddr,
        prot: PteFlags,
    ) -> KernelResult<()> {
        assert!(start.is_page_aligned() && end.is_page_aligned());
        let vma = self.vmas[idx];
        if start != vma.start || end < vma.end || prot != vma.flags {
            panic!(
                "remap: unsupported shape [{}, {}) -> [{}, {})",
                vma.start, vma.end, start, end
            );
        }
        if !is_user_va(end - PGSIZE) {
            return Err(MemoryError::InvalidAddress.into());
        }
        if self.check_overlap(start, end, Some(idx)) {
            return Err(MemoryError::Overlap.into());
        }

        let old_end = vma.end;
        let mut va = old_end;
        let result = loop {
            if va >= end {
                break Ok(());
            }
            match self.map_fresh_page(va, prot) {
                Ok(()) => va += PGSIZE,
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = result {
            self.unmap_range(old_end, va);
            return Err(e);
        }
        crate::arch::flush_tlb_all();

        self.vmas[idx].end = end;
        Ok(())
    }

    /// Mirror every VMA of `self` into `new`, sharing all frames.
    ///
    /// Writable source PTEs lose W and gain COW in place; the mirror entry
    /// gets the same flags. Read-only entries are copied unchanged. Each
    /// shared frame's refcount rises by one (the parent's reference was
    /// already counted when the page was first mapped).
    pub fn fork_cow_into(&mut self, new: &mut MmInner) -> KernelResult<()> {
        let vmas = self.vmas.clone();
        for vma in vmas.iter() {
            let mut va = vma.start;
            let result = loop {
                if va >= vma.end {
                    break Ok(());
                }
                match self.share_page_into(new, va) {
                    Ok(()) => va += PGSIZE,
                    Err(e) => break Err(e),
                }
            };

            if let Err(e) = result {
                // Unwind the partial mirror of this VMA. Fully mirrored
                // VMAs are already linked into `new` and are released when
                // the caller drops the child. The parent PTEs we already
                // demoted stay COW with refcount back at one; the next
                // parent write restores W lazily.
                new.unmap_range(vma.start, va);
                return Err(e);
            }

            new.vmas.push(*vma);
        }
        crate::arch::flush_tlb_all();
        Ok(())
    }

    /// Share the single page at `va` into `new` (fork step).
    fn share_page_into(&mut self, new: &mut MmInner, va: VirtAddr) -> KernelResult<()> {
        let old_pte = match self.walk(va, false) {
            Some(p) if p.is_valid() => p,
            // Every page inside a VMA is mapped; anything else means the
            // address space is corrupt.
            _ => panic!("fork: unmapped page {} inside VMA", va),
        };

        let pa = old_pte.pa();
        let mut flags = old_pte.flags();
        if flags.contains(PteFlags::W) {
            flags.remove(PteFlags::W);
            flags.insert(PteFlags::COW);
            old_pte.set_flags(flags);
        }

        let new_pte = new
            .walk(va, true)
            .ok_or(MemoryError::OutOfMemory)?;
        assert!(!new_pte.is_valid(), "fork: child page {} already mapped", va);
        new_pte.set(pa, flags);
        refcount_inc(pa);
        Ok(())
    }

    /// Allocate a zeroed frame and install it at `va` with `prot`.
    fn map_fresh_page(&mut self, va: VirtAddr, prot: PteFlags) -> KernelResult<()> {
        let pte = self
            .walk(va, true)
            .ok_or(MemoryError::OutOfMemory)?;
        if pte.is_valid() {
            crate::debug_println!("[mm] remap at {}", va);
            return Err(MemoryError::AlreadyMapped.into());
        }
        let pa = frame::alloc_zeroed_page().ok_or(MemoryError::OutOfMemory)?;
        pte.set(pa, leaf_flags(prot));
        let rc = refcount_inc(pa);
        debug_assert_eq!(rc, 1, "fresh frame already shared");
        Ok(())
    }

    /// Drop the mappings in `[start, end)`: clear each valid PTE and give
    /// up its frame share. Unmapped pages are skipped (this runs on
    /// partially built ranges during unwinds).
    fn unmap_range(&mut self, start: VirtAddr, end: VirtAddr) {
        let mut va = start;
        while va < end {
            match self.walk(va, false) {
                Some(pte) if pte.is_valid() => {
                    let pa = pte.pa();
                    pte.clear();
                    refcount_dec(pa);
                }
                _ => {
                    crate::debug_println!("[mm] unmap of unmapped page {}", va);
                }
            }
            va += PGSIZE;
        }
        crate::arch::flush_tlb_all();
    }

    /// Release every VMA and the frame shares it holds.
    pub fn free_vmas(&mut self) {
        let vmas = core::mem::take(&mut self.vmas);
        for vma in vmas {
            self.unmap_range(vma.start, vma.end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner_with_vmas(ranges: &[(usize, usize)]) -> MmInner {
        MmInner {
            root: PhysAddr::zero(),
            vmas: ranges
                .iter()
                .map(|&(s, e)| Vma {
                    start: VirtAddr::new(s),
                    end: VirtAddr::new(e),
                    flags: PteFlags::R | PteFlags::W,
                })
                .collect(),
        }
    }

    #[test]
    fn test_overlap_detection() {
        let inner = inner_with_vmas(&[(0x2000, 0x5000)]);

        // Strict intersections.
        assert!(inner.check_overlap(VirtAddr::new(0x1000), VirtAddr::new(0x3000), None));
        assert!(inner.check_overlap(VirtAddr::new(0x3000), VirtAddr::new(0x4000), None));
        assert!(inner.check_overlap(VirtAddr::new(0x4000), VirtAddr::new(0x8000), None));
        assert!(inner.check_overlap(VirtAddr::new(0x1000), VirtAddr::new(0x8000), None));

        // Exactly adjacent ranges do not overlap.
        assert!(!inner.check_overlap(VirtAddr::new(0x1000), VirtAddr::new(0x2000), None));
        assert!(!inner.check_overlap(VirtAddr::new(0x5000), VirtAddr::new(0x7000), None));

        // Empty ranges never overlap.
        assert!(!inner.check_overlap(VirtAddr::new(0x3000), VirtAddr::new(0x3000), None));
    }

    #[test]
    fn test_overlap_exclude() {
        let inner = inner_with_vmas(&[(0x2000, 0x5000), (0x8000, 0x9000)]);
        // Growing VMA 0 over its own range is fine when excluded...
        assert!(!inner.check_overlap(VirtAddr::new(0x2000), VirtAddr::new(0x6000), Some(0)));
        // ...but not when it would run into VMA 1.
        assert!(inner.check_overlap(VirtAddr::new(0x2000), VirtAddr::new(0x8800), Some(0)));
    }

    #[test]
    fn test_find_vma_exact_start_only() {
        let inner = inner_with_vmas(&[(0x2000, 0x5000), (0x8000, 0x9000)]);
        assert_eq!(inner.find_vma(VirtAddr::new(0x2000)), Some(0));
        assert_eq!(inner.find_vma(VirtAddr::new(0x8000)), Some(1));
        // Containment does not count.
        assert_eq!(inner.find_vma(VirtAddr::new(0x3000)), None);
        assert_eq!(inner.find_vma(VirtAddr::new(0x5000)), None);
    }

    #[test]
    fn test_leaf_flags() {
        let rw = leaf_flags(PteFlags::R | PteFlags::W);
        assert!(rw.contains(
            PteFlags::V | PteFlags::U | PteFlags::A | PteFlags::D | PteFlags::R | PteFlags::W
        ));

        let rx = leaf_flags(PteFlags::R | PteFlags::X);
        assert!(rx.contains(PteFlags::V | PteFlags::U | PteFlags::A));
        assert!(!rx.contains(PteFlags::D));
        assert!(!rx.contains(PteFlags::W));
    }
}
