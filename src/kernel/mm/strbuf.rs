// src/kernel/mm/strbuf.rs
//! Fixed pool of kernel string buffers.
//!
//! Syscalls that pull variable-length data out of user memory (string
//! arguments, console writes) stage it in one of these buffers instead of
//! hitting the byte heap. The pool has a fixed population; `available()`
//! backs the `GET_NRSTRBUF` test selector.

use core::cell::UnsafeCell;
use core::ops::Deref;

use spin::Mutex;

/// Capacity of one buffer.
pub const STRBUF_LEN: usize = 256;

/// Number of buffers in the pool.
pub const NSTRBUF: usize = 64;

struct Buffers(UnsafeCell<[[u8; STRBUF_LEN]; NSTRBUF]>);

// SAFETY: a buffer slot is only ever reachable through the unique StrBuf
// holding its index; the free-list mutex serializes slot hand-over.
unsafe impl Sync for Buffers {}

static BUFFERS: Buffers = Buffers(UnsafeCell::new([[0; STRBUF_LEN]; NSTRBUF]));

struct FreeList {
    free: [usize; NSTRBUF],
    nfree: usize,
}

const fn full_free_list() -> [usize; NSTRBUF] {
    let mut a = [0usize; NSTRBUF];
    let mut i = 0;
    while i < NSTRBUF {
        a[i] = i;
        i += 1;
    }
    a
}

static POOL: Mutex<FreeList> = Mutex::new(FreeList {
    free: full_free_list(),
    nfree: NSTRBUF,
});

/// Number of buffers currently available.
pub fn available() -> usize {
    POOL.lock().nfree
}

/// Take a buffer from the pool, or `None` when exhausted.
pub fn alloc() -> Option<StrBuf> {
    let mut pool = POOL.lock();
    if pool.nfree == 0 {
        return None;
    }
    pool.nfree -= 1;
    let idx = pool.free[pool.nfree];
    Some(StrBuf { idx, len: 0 })
}

fn release(idx: usize) {
    let mut pool = POOL.lock();
    debug_assert!(pool.nfree < NSTRBUF, "strbuf: double release");
    let slot = pool.nfree;
    pool.free[slot] = idx;
    pool.nfree += 1;
}

/// An owned pool buffer; returns to the pool on drop.
pub struct StrBuf {
    idx: usize,
    len: usize,
}

impl StrBuf {
    /// Buffer capacity in bytes.
    #[inline]
    pub const fn capacity(&self) -> usize {
        STRBUF_LEN
    }

    /// Current length.
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether no bytes have been stored.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the number of valid bytes (after filling via `as_mut_slice`).
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= STRBUF_LEN);
        self.len = len;
    }

    /// The full backing storage, for filling.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `self.idx` was handed out by the pool to this StrBuf
        // alone, so the slot is exclusively ours until drop.
        unsafe { &mut (*BUFFERS.0.get())[self.idx] }
    }

    /// The valid bytes.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: as in `as_mut_slice`; shared reborrow of our own slot.
        unsafe { &(&(*BUFFERS.0.get())[self.idx])[..self.len] }
    }
}

impl Deref for StrBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl Drop for StrBuf {
    fn drop(&mut self) {
        release(self.idx);
    }
}
