// src/kernel/mm/page_table.rs
//! Sv39 page tables: entries, the walker, and table teardown.
//!
//! A page table is a 4 KiB page holding 512 entries. Translation walks
//! three levels, root (level 2) down to the leaf (level 0). Intermediate
//! entries carry V only; leaf entries carry V plus a non-empty R/W/X set.

use bitflags::bitflags;

use super::addr::{PhysAddr, VirtAddr};
use super::frame;
use super::memlayout::is_walkable_va;

bitflags! {
    /// Sv39 page-table entry flags.
    pub struct PteFlags: u64 {
        /// Entry is valid.
        const V = 1 << 0;
        /// Readable.
        const R = 1 << 1;
        /// Writable.
        const W = 1 << 2;
        /// Executable.
        const X = 1 << 3;
        /// Accessible from U-mode.
        const U = 1 << 4;
        /// Global mapping.
        const G = 1 << 5;
        /// Accessed.
        const A = 1 << 6;
        /// Dirty.
        const D = 1 << 7;
        /// Software (RSW) bit: frame is shared, break on write.
        ///
        /// The hardware W bit is always clear while COW is set; the fault
        /// resolver turns COW back into W once the writer owns the frame.
        const COW = 1 << 8;
    }
}

impl PteFlags {
    /// Leaf entries have at least one of R/W/X; intermediate entries none.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }
}

/// Number of entries per table page.
pub const PT_ENTRIES: usize = 512;

/// Mask of the flag bits within a PTE (V..D plus the two RSW bits).
const PTE_FLAG_MASK: u64 = 0x3ff;

/// A single 64-bit page-table entry.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(u64);

impl Pte {
    /// The invalid (zero) entry.
    #[inline]
    pub const fn invalid() -> Self {
        Self(0)
    }

    /// Build an entry naming `pa` with `flags`.
    #[inline]
    pub fn new(pa: PhysAddr, flags: PteFlags) -> Self {
        debug_assert!(pa.is_page_aligned());
        Self(((pa.as_usize() as u64 >> 12) << 10) | flags.bits())
    }

    /// Raw bits.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// V bit set?
    #[inline]
    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    /// U bit set?
    #[inline]
    pub fn is_user(self) -> bool {
        self.flags().contains(PteFlags::U)
    }

    /// Flag bits of this entry.
    #[inline]
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & PTE_FLAG_MASK)
    }

    /// Physical frame named by this entry.
    #[inline]
    pub fn pa(self) -> PhysAddr {
        PhysAddr::new(((self.0 >> 10) << 12) as usize)
    }

    /// Overwrite with `pa` and `flags`.
    #[inline]
    pub fn set(&mut self, pa: PhysAddr, flags: PteFlags) {
        *self = Self::new(pa, flags);
    }

    /// Replace only the flag bits, keeping the frame number.
    #[inline]
    pub fn set_flags(&mut self, flags: PteFlags) {
        self.0 = (self.0 & !PTE_FLAG_MASK) | flags.bits();
    }

    /// Reset to the invalid entry.
    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// One page of page-table entries.
#[repr(C, align(4096))]
pub struct PageTable {
    /// The 512 entries of this table page.
    pub entries: [Pte; PT_ENTRIES],
}

/// Allocate a zeroed page-table page.
pub fn alloc_table() -> Option<PhysAddr> {
    frame::alloc_zeroed_page()
}

/// Return the address of the leaf PTE for `va` under `root`, creating
/// intermediate table pages when `alloc` is set.
///
/// The returned entry may be invalid; the caller inspects it. `None` means
/// the VA is out of range, an intermediate level is missing (with `alloc`
/// false), or a table page could not be allocated.
///
/// # Safety
///
/// `root` must be the root of a live Sv39 table reachable through the
/// direct map, and the caller must have exclusive access to the tree (the
/// owning MM lock) for the lifetime of the returned pointer.
pub unsafe fn walk_raw(root: PhysAddr, va: VirtAddr, alloc: bool) -> Option<*mut Pte> {
    if !is_walkable_va(va) {
        return None;
    }

    let mut table = root;
    for level in (1..=2).rev() {
        // SAFETY: `table` is a live table page per the caller's contract
        // (root) or by construction (entries we just followed/allocated).
        let pte = unsafe { &mut (*table.as_mut_ptr::<PageTable>()).entries[va.vpn(level)] };
        if pte.is_valid() {
            debug_assert!(!pte.flags().is_leaf(), "walk: leaf at level {}", level);
            table = pte.pa();
        } else {
            if !alloc {
                return None;
            }
            let next = alloc_table()?;
            pte.set(next, PteFlags::V);
            table = next;
        }
    }
    // SAFETY: as above; level 0 was reached through valid entries.
    let leaf = unsafe { &mut (*table.as_mut_ptr::<PageTable>()).entries[va.vpn(0)] };
    Some(leaf as *mut Pte)
}

/// Free every table page of the tree rooted at `root`, recursively.
///
/// Leaf frames are not touched: user frames are released through the VMA
/// teardown path (refcount decrements) before this runs, and the remaining
/// leaves (trampoline, trapframe) name kernel-owned frames.
///
/// # Safety
///
/// `root` must be the root of a table tree no hart can still have loaded
/// in `satp`, owned exclusively by the caller.
pub unsafe fn free_pagetable(root: PhysAddr) {
    for i in 0..PT_ENTRIES {
        // SAFETY: `root` is a live, exclusively owned table page.
        let pte = unsafe { &mut (*root.as_mut_ptr::<PageTable>()).entries[i] };
        if pte.is_valid() && !pte.flags().is_leaf() {
            // SAFETY: intermediate entries point at table pages owned by
            // this tree.
            unsafe {
                free_pagetable(pte.pa());
            }
            pte.clear();
        }
    }
    frame::free_page(root);
}

/// Dump the table tree rooted at `root` over the debug output.
pub fn print_page_table(root: PhysAddr) {
    crate::debug_println!("page table {}", root);
    print_level(root, 2);
}

fn print_level(table: PhysAddr, level: usize) {
    for i in 0..PT_ENTRIES {
        // SAFETY: called on live table pages only; reads are benign.
        let pte = unsafe { (*table.as_ptr::<PageTable>()).entries[i] };
        if !pte.is_valid() {
            continue;
        }
        let indent = match level {
            2 => "..",
            1 => ".. ..",
            _ => ".. .. ..",
        };
        crate::debug_println!(
            "{}{}: pte {:#x} pa {} {:?}",
            indent,
            i,
            pte.bits(),
            pte.pa(),
            pte.flags()
        );
        if !pte.flags().is_leaf() && level > 0 {
            print_level(pte.pa(), level - 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pte_roundtrip() {
        let pa = PhysAddr::new(0x8123_4000);
        let flags = PteFlags::V | PteFlags::R | PteFlags::W | PteFlags::U;
        let pte = Pte::new(pa, flags);
        assert_eq!(pte.pa(), pa);
        assert_eq!(pte.flags(), flags);
        assert!(pte.is_valid());
        assert!(pte.is_user());
        assert!(pte.flags().is_leaf());
    }

    #[test]
    fn test_intermediate_entries_are_not_leaves() {
        let pte = Pte::new(PhysAddr::new(0x8000_1000), PteFlags::V);
        assert!(pte.is_valid());
        assert!(!pte.flags().is_leaf());
        assert!(!pte.is_user());
    }

    #[test]
    fn test_set_flags_keeps_frame() {
        let pa = PhysAddr::new(0x8000_2000);
        let mut pte = Pte::new(pa, PteFlags::V | PteFlags::R | PteFlags::W | PteFlags::U);

        // The CoW transition: drop W, set COW.
        let mut f = pte.flags();
        f.remove(PteFlags::W);
        f.insert(PteFlags::COW);
        pte.set_flags(f);

        assert_eq!(pte.pa(), pa);
        assert!(pte.flags().contains(PteFlags::COW));
        assert!(!pte.flags().contains(PteFlags::W));
        assert!(pte.flags().is_leaf());
    }

    #[test]
    fn test_cow_bit_is_rsw() {
        // Bit 8 is the first software bit in the Sv39 PTE format; the
        // hardware must ignore it.
        assert_eq!(PteFlags::COW.bits(), 1 << 8);
    }

    #[test]
    fn test_clear() {
        let mut pte = Pte::new(PhysAddr::new(0x8000_3000), PteFlags::V | PteFlags::R);
        pte.clear();
        assert_eq!(pte, Pte::invalid());
        assert!(!pte.is_valid());
    }
}
