// src/kernel/mm/uaccess.rs
//! Kernel access to user memory.
//!
//! Kernel-originated writes must observe the same sharing semantics as
//! user stores: a syscall writing into a CoW page breaks the share exactly
//! like a trapped store would, so a process that fills its heap through a
//! syscall is indistinguishable from one that stores directly.
//!
//! The MM lock is taken and released once per touched page, never across
//! the whole transfer.

use core::cmp;
use core::ptr;

use super::addr::{PhysAddr, VirtAddr, PGSIZE};
use super::mm::{Mm, MmInner};
use super::page_fault::{self, PageFaultError};
use super::page_table::PteFlags;
use super::strbuf::{self, StrBuf};
use crate::kernel::core::{ErrorKind, KernelError, KernelResult, MemoryError};

impl From<PageFaultError> for KernelError {
    fn from(e: PageFaultError) -> Self {
        match e {
            PageFaultError::InvalidAccess => MemoryError::InvalidAddress.into(),
            PageFaultError::AccessViolation => MemoryError::PermissionDenied.into(),
            PageFaultError::OutOfMemory => MemoryError::OutOfMemory.into(),
        }
    }
}

/// Resolve `page_va` to a frame the kernel may write through.
///
/// Performs the CoW break if the page is shared; fails with
/// `PermissionDenied` on genuinely read-only pages.
fn writable_page(inner: &mut MmInner, page_va: VirtAddr) -> KernelResult<PhysAddr> {
    let pte = match inner.walk(page_va, false) {
        Some(p) if p.is_valid() && p.is_user() => *p,
        _ => return Err(MemoryError::InvalidAddress.into()),
    };
    let flags = pte.flags();
    if flags.contains(PteFlags::W) {
        return Ok(pte.pa());
    }
    if flags.contains(PteFlags::COW) {
        let pa = page_fault::resolve_locked(inner, page_va, true)?;
        return Ok(pa);
    }
    Err(MemoryError::PermissionDenied.into())
}

/// Resolve `page_va` to a frame the kernel may read from.
fn readable_page(inner: &mut MmInner, page_va: VirtAddr) -> KernelResult<PhysAddr> {
    let pte = match inner.walk(page_va, false) {
        Some(p) if p.is_valid() && p.is_user() => *p,
        _ => return Err(MemoryError::InvalidAddress.into()),
    };
    if !pte.flags().contains(PteFlags::R) {
        return Err(MemoryError::PermissionDenied.into());
    }
    Ok(pte.pa())
}

/// Copy `src` into user memory at `dst`, honoring CoW.
pub fn copy_to_user(mm: &Mm, dst: VirtAddr, src: &[u8]) -> KernelResult<()> {
    let mut copied = 0usize;
    let mut va = dst;
    while copied < src.len() {
        let page = va.page_round_down();
        let n = cmp::min(PGSIZE - va.page_offset(), src.len() - copied);
        {
            let mut inner = mm.lock();
            let pa = writable_page(&mut inner, page)?;
            // SAFETY: `pa` names a live writable user frame resolved under
            // the MM lock; the write stays within this one page.
            unsafe {
                let dst_ptr = (pa + va.page_offset()).as_mut_ptr::<u8>();
                ptr::copy_nonoverlapping(src.as_ptr().add(copied), dst_ptr, n);
            }
        }
        va += n;
        copied += n;
    }
    Ok(())
}

/// Copy user memory at `src` into `dst`.
pub fn copy_from_user(mm: &Mm, src: VirtAddr, dst: &mut [u8]) -> KernelResult<()> {
    let mut copied = 0usize;
    let mut va = src;
    while copied < dst.len() {
        let page = va.page_round_down();
        let n = cmp::min(PGSIZE - va.page_offset(), dst.len() - copied);
        {
            let mut inner = mm.lock();
            let pa = readable_page(&mut inner, page)?;
            // SAFETY: `pa` names a live readable user frame resolved under
            // the MM lock; the read stays within this one page.
            unsafe {
                let src_ptr = (pa + va.page_offset()).as_ptr::<u8>();
                ptr::copy_nonoverlapping(src_ptr, dst.as_mut_ptr().add(copied), n);
            }
        }
        va += n;
        copied += n;
    }
    Ok(())
}

/// Copy a NUL-terminated string from user memory into a pooled buffer.
///
/// Fails with `InvalidArgument` if no terminator appears within the buffer
/// capacity, and with `ResourceUnavailable` if the pool is empty.
pub fn copy_string_from_user(mm: &Mm, src: VirtAddr) -> KernelResult<StrBuf> {
    let mut buf = strbuf::alloc()
        .ok_or_else(|| KernelError::with_context(ErrorKind::ResourceUnavailable, "strbuf pool"))?;

    let mut len = 0usize;
    let mut va = src;
    'outer: while len < buf.capacity() {
        let page = va.page_round_down();
        let n = cmp::min(PGSIZE - va.page_offset(), buf.capacity() - len);
        {
            let mut inner = mm.lock();
            let pa = readable_page(&mut inner, page)?;
            for i in 0..n {
                // SAFETY: in-page read of a live user frame under the lock.
                let byte = unsafe { *(pa + va.page_offset() + i).as_ptr::<u8>() };
                if byte == 0 {
                    buf.set_len(len);
                    break 'outer;
                }
                buf.as_mut_slice()[len] = byte;
                len += 1;
            }
        }
        if len == buf.capacity() {
            return Err(KernelError::with_context(
                ErrorKind::InvalidArgument,
                "user string too long",
            ));
        }
        va += n;
    }
    Ok(buf)
}
