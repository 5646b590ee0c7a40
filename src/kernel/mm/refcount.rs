// src/kernel/mm/refcount.rs
//! Reference counts for shared user page frames.
//!
//! One 8-bit counter per DRAM frame. A frame with count zero belongs to the
//! frame allocator's free list; a frame with count `n >= 1` is named by
//! exactly `n` user PTEs across all live address spaces. The last decrement
//! returns the frame to the allocator.
//!
//! Counters are atomic so two harts resolving CoW faults on the same frame
//! through different address spaces never race the read-modify-write.

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use super::addr::{PhysAddr, PGSIZE};
use super::frame;
use super::memlayout::NFRAMES;

/// The frame refcount table.
///
/// Sized for all of managed DRAM; the `base`/`nframes` pair is set once at
/// boot (or at test setup) and selects the slice actually in use.
pub struct RefcountTable {
    base: AtomicUsize,
    nframes: AtomicUsize,
    counts: [AtomicU8; NFRAMES],
}

impl RefcountTable {
    /// Create a table with every count zero and no managed range.
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU8 = AtomicU8::new(0);
        Self {
            base: AtomicUsize::new(0),
            nframes: AtomicUsize::new(0),
            counts: [ZERO; NFRAMES],
        }
    }

    /// Set the managed range. Called once, before any count changes.
    pub fn init(&self, base: PhysAddr, nframes: usize) {
        assert!(base.is_page_aligned());
        assert!(nframes <= NFRAMES, "refcount table too small for range");
        assert_eq!(
            self.nframes.load(Ordering::Acquire),
            0,
            "refcount table already initialized"
        );
        self.base.store(base.as_usize(), Ordering::Release);
        self.nframes.store(nframes, Ordering::Release);
    }

    /// Frame index of `pa`, panicking on unaligned or out-of-range input.
    #[inline]
    fn index(&self, pa: PhysAddr) -> usize {
        assert!(pa.is_page_aligned(), "refcount: unaligned {}", pa);
        let base = self.base.load(Ordering::Acquire);
        let nframes = self.nframes.load(Ordering::Acquire);
        let idx = (pa.as_usize().wrapping_sub(base)) / PGSIZE;
        assert!(idx < nframes, "refcount: {} outside managed range", pa);
        idx
    }

    /// Increment the count for `pa`, returning the updated value.
    ///
    /// Saturation means more than 255 PTEs name one frame; that cannot
    /// happen in supported workloads, so it is treated as a kernel bug.
    pub fn inc(&self, pa: PhysAddr) -> u8 {
        let old = self.counts[self.index(pa)].fetch_add(1, Ordering::AcqRel);
        if old == u8::MAX {
            panic!("refcount: saturated at {}", pa);
        }
        old + 1
    }

    /// Decrement the count for `pa`, returning the updated value.
    ///
    /// Decrementing a zero count is a kernel bug.
    pub fn dec(&self, pa: PhysAddr) -> u8 {
        let old = self.counts[self.index(pa)].fetch_sub(1, Ordering::AcqRel);
        if old == 0 {
            panic!("refcount: underflow at {}", pa);
        }
        old - 1
    }

    /// Read the count for `pa`.
    pub fn get(&self, pa: PhysAddr) -> u8 {
        self.counts[self.index(pa)].load(Ordering::Acquire)
    }
}

/// The system refcount table, covering the frame allocator's range.
pub static REFCOUNTS: RefcountTable = RefcountTable::new();

/// Increment the share count of `pa`; returns the updated count.
#[inline]
pub fn refcount_inc(pa: PhysAddr) -> u8 {
    REFCOUNTS.inc(pa)
}

/// Drop one share of `pa`; returns the updated count.
///
/// On the transition to zero the frame goes back to the page allocator —
/// this is the single reclamation point for user frames.
pub fn refcount_dec(pa: PhysAddr) -> u8 {
    let new = REFCOUNTS.dec(pa);
    if new == 0 {
        frame::free_page(pa);
    }
    new
}

/// Read the share count of `pa`.
#[inline]
pub fn refcount_get(pa: PhysAddr) -> u8 {
    REFCOUNTS.get(pa)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inc_dec_get() {
        let table = Box::new(RefcountTable::new());
        let base = PhysAddr::new(0x8000_0000);
        table.init(base, 16);

        let pa = base + 3 * PGSIZE;
        assert_eq!(table.get(pa), 0);
        assert_eq!(table.inc(pa), 1);
        assert_eq!(table.inc(pa), 2);
        assert_eq!(table.get(pa), 2);
        assert_eq!(table.dec(pa), 1);
        assert_eq!(table.dec(pa), 0);
        assert_eq!(table.get(pa), 0);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn test_underflow_panics() {
        let table = Box::new(RefcountTable::new());
        let base = PhysAddr::new(0x8000_0000);
        table.init(base, 4);
        table.dec(base);
    }

    #[test]
    #[should_panic(expected = "saturated")]
    fn test_saturation_panics() {
        let table = Box::new(RefcountTable::new());
        let base = PhysAddr::new(0x8000_0000);
        table.init(base, 4);
        for _ in 0..=u8::MAX {
            table.inc(base);
        }
    }

    #[test]
    #[should_panic(expected = "unaligned")]
    fn test_unaligned_rejected() {
        let table = Box::new(RefcountTable::new());
        table.init(PhysAddr::new(0x8000_0000), 4);
        table.get(PhysAddr::new(0x8000_0123));
    }

    #[test]
    #[should_panic(expected = "outside managed range")]
    fn test_out_of_range_rejected() {
        let table = Box::new(RefcountTable::new());
        table.init(PhysAddr::new(0x8000_0000), 4);
        table.get(PhysAddr::new(0x8000_0000 + 4 * PGSIZE));
    }
}
