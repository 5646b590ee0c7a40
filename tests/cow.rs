//! End-to-end tests of the virtual-memory subsystem on the host.
//!
//! The frame allocator and refcount table are process-global, so every
//! test serializes on one lock and the arena is installed exactly once.
//! "User" accesses are simulated the way the hardware would behave: a
//! store first consults the PTE and goes through the fault resolver when
//! the page is not writable.

use std::alloc::Layout;
use std::sync::{Mutex, MutexGuard, Once, PoisonError};

use tiny_rv64::kernel::mm::addr::{PhysAddr, VirtAddr, PGSIZE};
use tiny_rv64::kernel::mm::memlayout::{TRAMPOLINE, TRAPFRAME};
use tiny_rv64::kernel::mm::page_fault::{page_fault_resolve, PageFaultError};
use tiny_rv64::kernel::mm::page_table::PteFlags;
use tiny_rv64::kernel::mm::refcount::{refcount_dec, refcount_get, refcount_inc};
use tiny_rv64::kernel::mm::uaccess::{copy_from_user, copy_string_from_user, copy_to_user};
use tiny_rv64::kernel::loader::load_flat_binary;
use tiny_rv64::kernel::mm::memlayout::{USER_CODE_BASE, USER_STACK_SIZE, USER_STACK_TOP};
use tiny_rv64::kernel::mm::{self, frame, print_page_table, Mm};
use tiny_rv64::kernel::core::{ErrorKind, MemoryError};

const ARENA_PAGES: usize = 512;

static INIT: Once = Once::new();
static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serialize tests and install the arena on first use.
fn setup() -> MutexGuard<'static, ()> {
    INIT.call_once(|| {
        let layout = Layout::from_size_align(ARENA_PAGES * PGSIZE, PGSIZE).unwrap();
        // Leaked: the VM subsystem owns this memory for the process
        // lifetime, exactly like DRAM.
        let base = unsafe { std::alloc::alloc(layout) } as usize;
        assert!(base != 0);
        unsafe {
            mm::init(
                PhysAddr::new(base),
                PhysAddr::new(base + ARENA_PAGES * PGSIZE),
            )
            .expect("arena init");
        }
    });
    TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An address space plus the kernel-owned frames backing its fixed
/// mappings; returns everything on drop.
struct TestMm {
    mm: Option<std::sync::Arc<Mm>>,
    trampoline: PhysAddr,
    trapframe: PhysAddr,
}

impl TestMm {
    fn create() -> Self {
        let trampoline = frame::alloc_zeroed_page().expect("no frame for trampoline");
        let trapframe = frame::alloc_zeroed_page().expect("no frame for trapframe");
        let mm = Mm::create(trampoline, trapframe).expect("mm create");
        Self {
            mm: Some(mm),
            trampoline,
            trapframe,
        }
    }

    fn fork(&self) -> Self {
        let trapframe = frame::alloc_zeroed_page().expect("no frame for child trapframe");
        let mm = self
            .mm()
            .fork_cow(self.trampoline, trapframe)
            .expect("fork_cow");
        Self {
            mm: Some(mm),
            trampoline: PhysAddr::zero(),
            trapframe,
        }
    }

    fn mm(&self) -> &std::sync::Arc<Mm> {
        self.mm.as_ref().unwrap()
    }
}

impl Drop for TestMm {
    fn drop(&mut self) {
        self.mm.take();
        frame::free_page(self.trapframe);
        if self.trampoline != PhysAddr::zero() {
            frame::free_page(self.trampoline);
        }
    }
}

/// Simulated user store: write through the PTE if writable, otherwise
/// take the fault path first (exactly what the hardware + trap layer do).
fn user_store_u32(mm: &Mm, va: VirtAddr, val: u32) -> Result<(), PageFaultError> {
    let writable = {
        let mut inner = mm.lock();
        let pte = inner.walk(va.page_round_down(), false);
        match pte {
            Some(p) if p.is_valid() && p.is_user() => p.flags().contains(PteFlags::W),
            _ => false,
        }
    };
    if !writable {
        page_fault_resolve(mm, va, true)?;
    }
    let pa = mm.lock().user_addr(va).expect("resolved page vanished");
    unsafe { (pa.as_usize() as *mut u32).write_unaligned(val) };
    Ok(())
}

/// Simulated user load.
fn user_load_u32(mm: &Mm, va: VirtAddr) -> u32 {
    let pa = mm.lock().user_addr(va).expect("page not mapped");
    unsafe { (pa.as_usize() as *const u32).read_unaligned() }
}

fn rw() -> PteFlags {
    PteFlags::R | PteFlags::W
}

#[test]
fn test_map_pages_and_destroy() {
    let _g = setup();
    let before = frame::free_pages();
    {
        let env = TestMm::create();
        let start = VirtAddr::new(0x10000);
        let end = VirtAddr::new(0x10000 + 4 * PGSIZE);
        env.mm().lock().map_pages(start, end, rw()).unwrap();

        // Every page is mapped, user-visible, refcount one, and zeroed.
        let mut inner = env.mm().lock();
        for i in 0..4 {
            let va = start + i * PGSIZE;
            let pa = inner.walkaddr(va).expect("mapped page");
            assert_eq!(refcount_get(pa), 1);
            assert_eq!(unsafe { (pa.as_usize() as *const u64).read() }, 0);
        }
        drop(inner);

        user_store_u32(env.mm(), start + 5, 0xabcd).unwrap();
        assert_eq!(user_load_u32(env.mm(), start + 5), 0xabcd);

        // The dump walks the whole tree; on the host it goes to the stub
        // debug sink, so this only checks that it terminates.
        print_page_table(env.mm().lock().root());
    }
    assert_eq!(frame::free_pages(), before, "destroy leaked frames");
}

#[test]
fn test_loader_maps_flat_binary() {
    let _g = setup();
    let before = frame::free_pages();
    {
        let env = TestMm::create();

        // Two read-only pages of "code", half a page of "data".
        let mut image = vec![0u8; 2 * PGSIZE + PGSIZE / 2];
        for (i, b) in image.iter_mut().enumerate() {
            *b = (i % 249) as u8;
        }
        let loaded = load_flat_binary(env.mm(), &image, 2 * PGSIZE).unwrap();

        assert_eq!(loaded.entry, USER_CODE_BASE);
        assert_eq!(loaded.stack_top, USER_STACK_TOP);
        assert_eq!(loaded.heap_start, USER_CODE_BASE + 3 * PGSIZE);

        // Image bytes landed, tail of the last page is zero.
        let mut back = vec![0u8; image.len()];
        copy_from_user(env.mm(), USER_CODE_BASE, &mut back).unwrap();
        assert_eq!(back, image);
        let mut tail = [0xffu8; 16];
        copy_from_user(env.mm(), USER_CODE_BASE + image.len(), &mut tail).unwrap();
        assert!(tail.iter().all(|&b| b == 0));

        // W^X: stores into the code pages are fatal, the data page and the
        // stack are writable.
        assert_eq!(
            user_store_u32(env.mm(), USER_CODE_BASE + 8, 1).unwrap_err(),
            PageFaultError::AccessViolation
        );
        user_store_u32(env.mm(), USER_CODE_BASE + 2 * PGSIZE, 5).unwrap();
        user_store_u32(env.mm(), USER_STACK_TOP - 8, 6).unwrap();
        let stack_bottom = USER_STACK_TOP - USER_STACK_SIZE;
        assert!(env.mm().lock().find_vma(stack_bottom).is_some());
    }
    assert_eq!(frame::free_pages(), before);
}

#[test]
fn test_adjacent_ranges_map_overlap_rejected() {
    let _g = setup();
    let before = frame::free_pages();
    {
        let env = TestMm::create();
        let a = VirtAddr::new(0x20000);
        let b = VirtAddr::new(0x20000 + 2 * PGSIZE);
        let c = VirtAddr::new(0x20000 + 4 * PGSIZE);

        // [a,b) and [b,c) are adjacent, not overlapping.
        env.mm().lock().map_pages(a, b, rw()).unwrap();
        env.mm().lock().map_pages(b, c, rw()).unwrap();

        // Any strict intersection is rejected without state change.
        let err = env
            .mm()
            .lock()
            .map_pages(a + PGSIZE, c + PGSIZE, rw())
            .unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Memory(MemoryError::Overlap));
    }
    assert_eq!(frame::free_pages(), before);
}

#[test]
fn test_map_rollback_on_oom() {
    let _g = setup();
    let before = frame::free_pages();
    {
        let env = TestMm::create();

        // Hold every remaining frame except a handful.
        let mut hostages = Vec::new();
        while frame::free_pages() > 3 {
            hostages.push(frame::alloc_page().unwrap());
        }

        let start = VirtAddr::new(0x30000);
        let end = VirtAddr::new(0x30000 + 16 * PGSIZE);
        let err = env.mm().lock().map_pages(start, end, rw()).unwrap_err();
        assert!(err.is_out_of_memory());

        // The partial mapping was unwound.
        assert!(env.mm().lock().walkaddr(start).is_none());
        assert!(env.mm().lock().find_vma(start).is_none());

        for pa in hostages {
            frame::free_page(pa);
        }
    }
    assert_eq!(frame::free_pages(), before);
}

#[test]
fn test_fork_shares_frames() {
    let _g = setup();
    let before = frame::free_pages();
    {
        let parent = TestMm::create();
        let start = VirtAddr::new(0x40000);
        let pages = 8;
        let end = start + pages * PGSIZE;
        parent.mm().lock().map_pages(start, end, rw()).unwrap();
        for i in 0..pages {
            user_store_u32(parent.mm(), start + i * PGSIZE, 0x1000 + i as u32).unwrap();
        }

        let child = parent.fork();

        // Same frames on both sides, refcount two, both sides read-only
        // with the COW tag; the data arrived without any copying.
        for i in 0..pages {
            let va = start + i * PGSIZE;
            let (ppa, pflags) = {
                let mut inner = parent.mm().lock();
                let pte = inner.walk(va, false).unwrap();
                (pte.pa(), pte.flags())
            };
            let (cpa, cflags) = {
                let mut inner = child.mm().lock();
                let pte = inner.walk(va, false).unwrap();
                (pte.pa(), pte.flags())
            };
            assert_eq!(ppa, cpa, "fork must share the frame");
            assert_eq!(refcount_get(ppa), 2);
            for flags in [pflags, cflags] {
                assert!(!flags.contains(PteFlags::W));
                assert!(flags.contains(PteFlags::COW));
                assert!(flags.contains(PteFlags::R));
            }
            assert_eq!(user_load_u32(child.mm(), va), 0x1000 + i as u32);
        }

        // The child VMA mirrors the parent's bounds and flags.
        let child_inner = child.mm().lock();
        let idx = child_inner.find_vma(start).expect("mirror vma");
        assert_eq!(child_inner.vma(idx).end(), end);
        assert_eq!(child_inner.vma(idx).flags(), rw());
    }
    assert_eq!(frame::free_pages(), before);
}

#[test]
fn test_cow_break_on_shared_frame() {
    let _g = setup();
    let before = frame::free_pages();
    {
        let parent = TestMm::create();
        let va = VirtAddr::new(0x50000);
        parent
            .mm()
            .lock()
            .map_pages(va, va + PGSIZE, rw())
            .unwrap();
        user_store_u32(parent.mm(), va, 111).unwrap();

        let child = parent.fork();
        let shared_pa = parent.mm().lock().walkaddr(va).unwrap();
        assert_eq!(refcount_get(shared_pa), 2);

        // Parent writes: it moves onto a private copy; the child keeps
        // the original frame and its contents.
        user_store_u32(parent.mm(), va, 222).unwrap();

        let parent_pa = parent.mm().lock().walkaddr(va).unwrap();
        let child_pa = child.mm().lock().walkaddr(va).unwrap();
        assert_ne!(parent_pa, child_pa);
        assert_eq!(child_pa, shared_pa);
        assert_eq!(refcount_get(parent_pa), 1);
        assert_eq!(refcount_get(child_pa), 1);
        assert_eq!(user_load_u32(parent.mm(), va), 222);
        assert_eq!(user_load_u32(child.mm(), va), 111);

        // The writer's PTE is writable again, COW cleared.
        let mut inner = parent.mm().lock();
        let flags = inner.walk(va, false).unwrap().flags();
        assert!(flags.contains(PteFlags::W));
        assert!(!flags.contains(PteFlags::COW));
    }
    assert_eq!(frame::free_pages(), before);
}

#[test]
fn test_cow_break_sole_sharer_reuses_frame() {
    let _g = setup();
    let before = frame::free_pages();
    {
        let parent = TestMm::create();
        let va = VirtAddr::new(0x60000);
        parent
            .mm()
            .lock()
            .map_pages(va, va + PGSIZE, rw())
            .unwrap();
        user_store_u32(parent.mm(), va, 7).unwrap();

        let old_pa = parent.mm().lock().walkaddr(va).unwrap();
        let child = parent.fork();
        drop(child);

        // The child is gone; the parent's PTE is still COW-tagged with
        // refcount one. The next store reclaims the frame in place: no
        // allocation, same physical page, writability restored lazily.
        assert_eq!(refcount_get(old_pa), 1);
        let free_before_store = frame::free_pages();
        user_store_u32(parent.mm(), va, 8).unwrap();
        assert_eq!(frame::free_pages(), free_before_store);
        assert_eq!(parent.mm().lock().walkaddr(va).unwrap(), old_pa);
        assert_eq!(user_load_u32(parent.mm(), va), 8);
    }
    assert_eq!(frame::free_pages(), before);
}

#[test]
fn test_read_only_stays_read_only() {
    let _g = setup();
    let before = frame::free_pages();
    {
        let parent = TestMm::create();
        let va = VirtAddr::new(0x70000);
        parent
            .mm()
            .lock()
            .map_pages(va, va + PGSIZE, PteFlags::R | PteFlags::X)
            .unwrap();

        // Not CoW, just read-only: a store is fatal before the fork...
        assert_eq!(
            user_store_u32(parent.mm(), va, 1).unwrap_err(),
            PageFaultError::AccessViolation
        );

        // ...and on both sides after it.
        let child = parent.fork();
        assert_eq!(
            user_store_u32(parent.mm(), va, 1).unwrap_err(),
            PageFaultError::AccessViolation
        );
        assert_eq!(
            user_store_u32(child.mm(), va, 1).unwrap_err(),
            PageFaultError::AccessViolation
        );

        // The kernel write path refuses as well.
        let err = copy_to_user(child.mm(), va, &[0u8; 4]).unwrap_err();
        assert_eq!(
            *err.kind(),
            ErrorKind::Memory(MemoryError::PermissionDenied)
        );
    }
    assert_eq!(frame::free_pages(), before);
}

#[test]
fn test_fault_on_unmapped_is_fatal() {
    let _g = setup();
    let env = TestMm::create();
    assert_eq!(
        page_fault_resolve(env.mm(), VirtAddr::new(0x123456), true).unwrap_err(),
        PageFaultError::InvalidAccess
    );
    // The fixed kernel-owned mappings are not user-accessible.
    assert_eq!(
        page_fault_resolve(env.mm(), TRAPFRAME, true).unwrap_err(),
        PageFaultError::InvalidAccess
    );
    assert!(env.mm().lock().walkaddr(TRAMPOLINE).is_none());
}

#[test]
fn test_spurious_fault_is_benign() {
    let _g = setup();
    let env = TestMm::create();
    let va = VirtAddr::new(0x80000);
    env.mm().lock().map_pages(va, va + PGSIZE, rw()).unwrap();
    user_store_u32(env.mm(), va, 1).unwrap();
    // Already writable: the "fault" was resolved concurrently.
    assert!(page_fault_resolve(env.mm(), va, true).is_ok());
}

#[test]
fn test_copy_to_user_roundtrip_and_cow() {
    let _g = setup();
    let before = frame::free_pages();
    {
        let parent = TestMm::create();
        let start = VirtAddr::new(0x90000);
        parent
            .mm()
            .lock()
            .map_pages(start, start + 2 * PGSIZE, rw())
            .unwrap();

        // Unaligned, page-straddling transfer.
        let data: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
        let dst = start + PGSIZE - 100;
        copy_to_user(parent.mm(), dst, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        copy_from_user(parent.mm(), dst, &mut back).unwrap();
        assert_eq!(back, data);

        // After a fork, a kernel write breaks the share exactly like a
        // trapped store: the child's view is unchanged.
        let child = parent.fork();
        let shared_pa = child.mm().lock().walkaddr(start).unwrap();
        copy_to_user(parent.mm(), start, &0xdead_beefu32.to_ne_bytes()).unwrap();
        assert_eq!(user_load_u32(parent.mm(), start), 0xdead_beef);
        assert_ne!(user_load_u32(child.mm(), start), 0xdead_beef);
        assert_eq!(child.mm().lock().walkaddr(start).unwrap(), shared_pa);
        assert_eq!(refcount_get(shared_pa), 1);

        // copy_to_user(x); copy_from_user() == x on the CoW'd side too.
        let mut word = [0u8; 4];
        copy_from_user(parent.mm(), start, &mut word).unwrap();
        assert_eq!(u32::from_ne_bytes(word), 0xdead_beef);

        // Writes to unmapped user memory are rejected.
        let err = copy_to_user(parent.mm(), VirtAddr::new(0xdddd0000), &[1]).unwrap_err();
        assert_eq!(
            *err.kind(),
            ErrorKind::Memory(MemoryError::InvalidAddress)
        );
    }
    assert_eq!(frame::free_pages(), before);
}

#[test]
fn test_copy_string_from_user() {
    let _g = setup();
    let env = TestMm::create();
    let start = VirtAddr::new(0xa0000);
    env.mm()
        .lock()
        .map_pages(start, start + 2 * PGSIZE, rw())
        .unwrap();

    // Place a NUL-terminated string across the page boundary.
    let s = b"copy-on-write kernels share until written\0";
    let va = start + PGSIZE - 16;
    copy_to_user(env.mm(), va, s).unwrap();

    let buf = copy_string_from_user(env.mm(), va).unwrap();
    assert_eq!(buf.as_bytes(), &s[..s.len() - 1]);
}

#[test]
fn test_heap_growth_single_page() {
    let _g = setup();
    let before = frame::free_pages();
    {
        let env = TestMm::create();
        let heap = VirtAddr::new(0xb0000);
        env.mm()
            .lock()
            .map_pages(heap, heap + 2 * PGSIZE, rw())
            .unwrap();
        user_store_u32(env.mm(), heap, 42).unwrap();

        let idx = env.mm().lock().find_vma(heap).unwrap();
        let free_before_growth = frame::free_pages();
        env.mm()
            .lock()
            .remap(idx, heap, heap + 3 * PGSIZE, rw())
            .unwrap();

        // Exactly one new frame, refcount one, existing pages untouched.
        assert_eq!(free_before_growth - frame::free_pages(), 1);
        let new_pa = env.mm().lock().walkaddr(heap + 2 * PGSIZE).unwrap();
        assert_eq!(refcount_get(new_pa), 1);
        assert_eq!(user_load_u32(env.mm(), heap), 42);
        assert_eq!(env.mm().lock().vma(idx).end(), heap + 3 * PGSIZE);

        // Growth into another VMA is refused.
        env.mm()
            .lock()
            .map_pages(heap + 4 * PGSIZE, heap + 5 * PGSIZE, rw())
            .unwrap();
        let err = env
            .mm()
            .lock()
            .remap(idx, heap, heap + 5 * PGSIZE, rw())
            .unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Memory(MemoryError::Overlap));
    }
    assert_eq!(frame::free_pages(), before);
}

#[test]
fn test_fork_under_memory_pressure() {
    let _g = setup();
    let before = frame::free_pages();
    {
        let parent = TestMm::create();

        // A heap bigger than half the arena: one eager copy could not fit,
        // let alone ten.
        let pages = 300;
        let heap = VirtAddr::new(0x100000);
        parent
            .mm()
            .lock()
            .map_pages(heap, heap + pages * PGSIZE, rw())
            .unwrap();
        for i in 0..pages {
            user_store_u32(parent.mm(), heap + i * PGSIZE, i as u32).unwrap();
        }
        assert!(frame::free_pages() < pages);

        // Ten live CoW forks of the memory-heavy process.
        let children: Vec<TestMm> = (0..10).map(|_| parent.fork()).collect();
        for (n, child) in children.iter().enumerate() {
            let pa = child.mm().lock().walkaddr(heap).unwrap();
            assert_eq!(refcount_get(pa), 11, "parent plus ten children share");
            assert_eq!(user_load_u32(child.mm(), heap + n * PGSIZE), n as u32);
        }

        // One child writes; only that child pays for a private page.
        user_store_u32(children[3].mm(), heap, 0x77).unwrap();
        assert_eq!(user_load_u32(children[3].mm(), heap), 0x77);
        assert_eq!(user_load_u32(parent.mm(), heap), 0);
        assert_eq!(
            refcount_get(parent.mm().lock().walkaddr(heap).unwrap()),
            10
        );
    }
    assert_eq!(frame::free_pages(), before, "pressure scenario leaked");
}

#[test]
fn test_refcount_zero_transition_frees() {
    let _g = setup();
    let pa = frame::alloc_page().unwrap();
    let free_before = frame::free_pages();

    assert_eq!(refcount_inc(pa), 1);
    assert_eq!(refcount_inc(pa), 2);
    assert_eq!(refcount_dec(pa), 1);
    assert_eq!(frame::free_pages(), free_before, "frame freed too early");
    assert_eq!(refcount_dec(pa), 0);
    assert_eq!(
        frame::free_pages(),
        free_before + 1,
        "zero transition must free the frame"
    );
}

#[test]
fn test_user_addr_preserves_offset() {
    let _g = setup();
    let env = TestMm::create();
    let va = VirtAddr::new(0xc0000);
    env.mm().lock().map_pages(va, va + PGSIZE, rw()).unwrap();

    let page_pa = env.mm().lock().walkaddr(va).unwrap();
    let offset_pa = env.mm().lock().user_addr(va + 0x123).unwrap();
    assert_eq!(offset_pa, page_pa + 0x123);
    assert!(env.mm().lock().user_addr(VirtAddr::new(0xee0000)).is_none());
}
