// src/kernel/loader.rs
//! Flat-binary user program loader.
//!
//! User programs are position-dependent flat binaries linked at
//! [`USER_CODE_BASE`](crate::kernel::mm::memlayout::USER_CODE_BASE). The
//! first `ro_size` bytes (text + rodata) are mapped R|X, the remainder
//! R|W; a separate stack region sits just below the trapframe. The heap
//! begins at the first page past the loaded image and grows via sbrk.
//!
//! The image bytes are copied in through the kernel direct map, so the
//! user-side W^X split does not get in the way of loading.

use crate::kernel::core::{ErrorKind, KernelError, KernelResult};
use crate::kernel::mm::addr::{VirtAddr, PGSIZE};
use crate::kernel::mm::memlayout::{USER_CODE_BASE, USER_STACK_SIZE, USER_STACK_TOP};
use crate::kernel::mm::{Mm, PteFlags};

/// Result of loading a user image.
#[derive(Debug, Clone, Copy)]
pub struct LoadedProgram {
    /// Entry point (start of the image).
    pub entry: VirtAddr,
    /// Initial user stack pointer.
    pub stack_top: VirtAddr,
    /// First heap address for sbrk.
    pub heap_start: VirtAddr,
}

/// Map a flat binary into `mm` and return its layout.
///
/// `ro_size` is the page-aligned byte count of the read-only prefix
/// (text + rodata); bytes past it are mapped writable for data.
pub fn load_flat_binary(mm: &Mm, binary: &[u8], ro_size: usize) -> KernelResult<LoadedProgram> {
    if binary.is_empty() || ro_size == 0 || ro_size % PGSIZE != 0 || ro_size > page_ceil(binary.len()) {
        return Err(KernelError::with_context(
            ErrorKind::InvalidArgument,
            "malformed user image",
        ));
    }

    let code_start = USER_CODE_BASE;
    let code_end = code_start + ro_size;
    let image_end = code_start + page_ceil(binary.len());

    {
        let mut inner = mm.lock();
        inner.map_pages(code_start, code_end, PteFlags::R | PteFlags::X)?;
        if image_end > code_end {
            if let Err(e) = inner.map_pages(code_end, image_end, PteFlags::R | PteFlags::W) {
                inner.free_vmas();
                return Err(e);
            }
        }

        // Copy the image through the direct map; the frames are fresh and
        // zeroed, so the tail of the last page stays zero.
        let mut offset = 0usize;
        while offset < binary.len() {
            let va = code_start + offset;
            let pa = inner
                .walkaddr(va.page_round_down())
                .expect("freshly mapped page vanished");
            let n = core::cmp::min(PGSIZE, binary.len() - offset);
            // SAFETY: `pa` is a frame this call just mapped; the copy stays
            // within the page.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    binary.as_ptr().add(offset),
                    pa.as_mut_ptr::<u8>(),
                    n,
                );
            }
            offset += n;
        }

        // The user stack, just below the trapframe page.
        let stack_bottom = USER_STACK_TOP - USER_STACK_SIZE;
        if let Err(e) = inner.map_pages(stack_bottom, USER_STACK_TOP, PteFlags::R | PteFlags::W) {
            inner.free_vmas();
            return Err(e);
        }
    }

    crate::debug_println!(
        "[loader] image: {} bytes at {} ({} read-only)",
        binary.len(),
        code_start,
        ro_size
    );

    Ok(LoadedProgram {
        entry: code_start,
        stack_top: USER_STACK_TOP,
        heap_start: image_end,
    })
}

#[inline]
fn page_ceil(n: usize) -> usize {
    (n + PGSIZE - 1) & !(PGSIZE - 1)
}
