// src/kernel/mm/kvm.rs
//! The kernel's own page table (riscv64 only).
//!
//! A direct map of everything the kernel touches: the UART window, kernel
//! text (R|X), kernel data plus the managed DRAM (R|W), and the trampoline
//! page at its fixed high address. Built once at boot, activated on the
//! boot hart, never changed afterwards.

use spin::Once;

use super::addr::{PhysAddr, VirtAddr, PGSIZE};
use super::memlayout::{PHYS_TOP, TRAMPOLINE, UART0};
use super::page_table::{self, PteFlags};

static KERNEL_ROOT: Once<PhysAddr> = Once::new();

extern "C" {
    // Provided by linker.ld.
    fn stext();
    fn etext();
}

/// Root of the kernel page table. Panics before [`init`].
pub fn kernel_root() -> PhysAddr {
    *KERNEL_ROOT.get().expect("kernel page table not built")
}

/// Build the kernel page table and switch this hart onto it.
pub fn init() {
    let root = make_kernel_table();
    KERNEL_ROOT.call_once(|| root);
    // SAFETY: the table direct-maps all kernel text and data, so the
    // executing code stays mapped across the switch.
    unsafe {
        crate::arch::riscv64::activate_root(root);
    }
    crate::debug_println!("[kvm] kernel page table at {}", root);
}

fn make_kernel_table() -> PhysAddr {
    let root = page_table::alloc_table().expect("no frame for kernel page table");

    let text_start = stext as usize;
    let text_end = etext as usize;

    // UART registers.
    kvm_map(
        root,
        VirtAddr::new(UART0),
        PhysAddr::new(UART0),
        PGSIZE,
        PteFlags::R | PteFlags::W,
    );

    // Kernel text, executable and read-only.
    kvm_map(
        root,
        VirtAddr::new(text_start),
        PhysAddr::new(text_start),
        text_end - text_start,
        PteFlags::R | PteFlags::X,
    );

    // Kernel data and every frame of managed DRAM.
    kvm_map(
        root,
        VirtAddr::new(text_end),
        PhysAddr::new(text_end),
        PHYS_TOP - text_end,
        PteFlags::R | PteFlags::W,
    );

    // The trampoline, at the top of the virtual address space.
    kvm_map(
        root,
        TRAMPOLINE,
        crate::arch::riscv64::trampoline_pa(),
        PGSIZE,
        PteFlags::R | PteFlags::X,
    );

    root
}

/// Install a direct-style mapping into the kernel table. Boot only; panics
/// on failure because a kernel that cannot map itself cannot continue.
fn kvm_map(root: PhysAddr, va: VirtAddr, pa: PhysAddr, size: usize, prot: PteFlags) {
    assert!(va.is_page_aligned() && pa.is_page_aligned());
    assert!(size > 0, "kvm_map: empty range");

    let pages = (size + PGSIZE - 1) / PGSIZE;
    for i in 0..pages {
        let va = va + i * PGSIZE;
        let pa = pa + i * PGSIZE;
        // SAFETY: boot is single-threaded and `root` is the table being
        // built right here.
        let pte = unsafe {
            page_table::walk_raw(root, va, true)
                .map(|p| &mut *p)
                .expect("kvm_map: walk failed")
        };
        assert!(!pte.is_valid(), "kvm_map: remap at {}", va);
        let mut flags = prot | PteFlags::V | PteFlags::A;
        if prot.contains(PteFlags::W) {
            flags |= PteFlags::D;
        }
        pte.set(pa, flags);
    }
}
