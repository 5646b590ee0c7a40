//! Copy-on-write fork test program.
//!
//! Exercises the kernel's CoW machinery from user space: shared reads
//! after fork, private copies on write (from both sides, in opposing
//! orders), kernel-originated writes through the `COPY_TO_USER` test
//! syscall, read-only pages staying read-only, fork under memory
//! pressure, and frame-leak checks around every scenario.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use libuser::{ktest, println, process};

const PGSIZE: usize = 4096;
/// u32 slots per page.
const STRIDE: usize = PGSIZE / 4;
/// Heap size used by the write/read scenarios.
const HEAP_PAGES: usize = 50;

#[no_mangle]
#[link_section = ".text.entry"]
pub extern "C" fn _start() -> ! {
    println!("cowtest: starting");

    run_test(false, pressure_test, "fork under pressure");
    run_test(true, share_test, "share and write");
    run_test(true, kernel_write_test, "kernel write and read-only");

    println!("cowtest: all tests passed");
    process::exit(0);
}

fn free_pages() -> i64 {
    ktest::free_pages()
}

/// Run one test in a child process; optionally verify that reaping the
/// child returns the free-frame count to its starting value.
fn run_test(check_leak: bool, f: fn() -> i32, name: &str) {
    let nfree = free_pages();

    let pid = process::fork();
    assert!(pid >= 0, "fork should not fail here");
    if pid == 0 {
        process::exit(f());
    }

    let mut status = -1;
    assert_eq!(process::wait(pid, &mut status), pid);
    if status != 0 {
        println!("-> {} - failed (status {})", name, status);
        process::exit(1);
    }

    if check_leak {
        println!("-> {} - check whether you leak any page", name);
        let now = free_pages();
        if now != nfree {
            println!(
                "-> {} - failed: free pages {} after, {} before",
                name, now, nfree
            );
            process::exit(1);
        }
    }
    println!("-> {} - passed", name);
}

/// Allocate the test heap and fill every page with `value`.
fn fill_heap(heap: *mut u32, value: u32) {
    for i in 0..HEAP_PAGES {
        // SAFETY: the heap was sbrk'd by the caller; one u32 per page.
        unsafe { heap.add(i * STRIDE).write_volatile(value) };
    }
}

fn check_heap(heap: *const u32, expect: u32) {
    for i in 0..HEAP_PAGES {
        // SAFETY: in-bounds read of the sbrk'd heap.
        let got = unsafe { heap.add(i * STRIDE).read_volatile() };
        assert!(got == expect, "heap check failed");
    }
}

/// Fork + read, fork + child write, fork + both write in opposing orders.
fn share_test() -> i32 {
    let heap = process::sbrk((HEAP_PAGES * PGSIZE) as i64);
    assert!(heap > 0, "sbrk failed");
    let heap = heap as *mut u32;

    let parent_pid = process::getpid() as u32;
    fill_heap(heap, parent_pid);
    println!(" -> allocated {} pages, filled with pid", HEAP_PAGES);

    // Case 1: the child only reads; every page stays shared.
    println!(" -> CoW fork, child read");
    let pid = process::fork();
    assert!(pid >= 0, "fork should not fail here");
    if pid == 0 {
        check_heap(heap, parent_pid);
        process::exit(0);
    }
    let mut status = -1;
    assert!(process::wait(pid, &mut status) == pid);
    assert!(status == 0, "child should exit cleanly");

    // Case 2: the child writes while the parent keeps its view.
    fill_heap(heap, parent_pid);
    println!(" -> CoW fork, child write");
    let pid = process::fork();
    assert!(pid >= 0, "fork should not fail here");
    if pid == 0 {
        let child_pid = process::getpid() as u32;
        for i in 0..HEAP_PAGES {
            // SAFETY: in-bounds access of the shared heap.
            unsafe {
                let p = heap.add(i * STRIDE);
                assert!(p.read_volatile() == parent_pid);
                p.write_volatile(child_pid);
            }
            process::yield_now(); // interleave with the parent
        }
        check_heap(heap, child_pid);
        process::exit(0);
    }
    let mut status = -1;
    assert!(process::wait(pid, &mut status) == pid);
    assert!(status == 0, "child should exit cleanly");
    check_heap(heap, parent_pid);

    // Case 3: both sides write, the parent in reverse order.
    fill_heap(heap, parent_pid);
    println!(" -> CoW fork, child and parent write");
    let pid = process::fork();
    assert!(pid >= 0, "fork should not fail here");
    if pid == 0 {
        let child_pid = process::getpid() as u32;
        for i in 0..HEAP_PAGES {
            // SAFETY: in-bounds access of the shared heap.
            unsafe {
                let p = heap.add(i * STRIDE);
                assert!(p.read_volatile() == parent_pid);
                p.write_volatile(child_pid);
            }
            process::yield_now();
        }
        check_heap(heap, child_pid);
        process::exit(0);
    }
    for i in (0..HEAP_PAGES).rev() {
        // SAFETY: in-bounds access of the shared heap.
        unsafe {
            let p = heap.add(i * STRIDE);
            assert!(p.read_volatile() == parent_pid);
            p.write_volatile(0xdead_beef);
        }
        process::yield_now();
    }
    let mut status = -1;
    assert!(process::wait(pid, &mut status) == pid);
    assert!(status == 0, "child should exit cleanly");
    check_heap(heap, 0xdead_beef);

    0
}

/// The same interleaved-write scenario, but every store goes through the
/// kernel's copy_to_user path; then the read-only check.
fn kernel_write_test() -> i32 {
    let heap = process::sbrk((HEAP_PAGES * PGSIZE) as i64);
    assert!(heap > 0, "sbrk failed");
    let heap = heap as *mut u32;

    let parent_pid = process::getpid() as u32;
    fill_heap(heap, parent_pid);

    println!(" -> CoW fork, copy_to_user should also do CoW");
    let pid = process::fork();
    assert!(pid >= 0, "fork should not fail here");
    if pid == 0 {
        let child_pid = process::getpid() as u32;
        for i in 0..HEAP_PAGES {
            let p = unsafe { heap.add(i * STRIDE) };
            // SAFETY: in-bounds read of the shared heap.
            assert!(unsafe { p.read_volatile() } == parent_pid);
            assert!(ktest::copy_to_user(p, child_pid) == 0);
            process::yield_now();
        }
        check_heap(heap, child_pid);
        process::exit(0);
    }
    for i in (0..HEAP_PAGES).rev() {
        let p = unsafe { heap.add(i * STRIDE) };
        // SAFETY: in-bounds read of the shared heap.
        assert!(unsafe { p.read_volatile() } == parent_pid);
        assert!(ktest::copy_to_user(p, 0xdead_beef) == 0);
        process::yield_now();
    }
    let mut status = -1;
    assert!(process::wait(pid, &mut status) == pid);
    assert!(status == 0, "child should exit cleanly");
    check_heap(heap, 0xdead_beef);

    // Read-only stays read-only across fork: a store into the code/rodata
    // image must kill the writer, not resolve to a private copy.
    println!(" -> CoW fork, read-only remains read-only");
    let pstr = "hello world";
    let pid = process::fork();
    assert!(pid >= 0, "fork should not fail here");
    if pid == 0 {
        let p = pstr.as_ptr() as *mut u8;
        // SAFETY: deliberately invalid store; the kernel must kill us.
        unsafe { p.write_volatile(b'X') };
        process::exit(0); // never reached
    }
    let mut status = 0;
    assert!(process::wait(pid, &mut status) == pid);
    assert!(status != 0, "child should be killed by the kernel");

    while process::wait_any() > 0 {}
    0
}

/// CoW fork must succeed (repeatedly) when free memory is smaller than
/// the heap an eager copy would duplicate.
fn pressure_test() -> i32 {
    let initial_free = free_pages();
    println!("setup: initial free pages: {}", initial_free);

    // Expand the heap until it is comfortably larger than what remains
    // free; an eager fork would now be impossible.
    let mut heap_pages = 0usize;
    loop {
        let brk = process::sbrk((16 * PGSIZE) as i64);
        assert!(brk > 0, "sbrk failed during setup");
        heap_pages += 16;
        let nfree = free_pages() as usize;
        if heap_pages >= nfree + 20 {
            println!(
                "setup: heap {} pages, free {} pages",
                heap_pages, nfree
            );
            break;
        }
    }

    println!(" -> free pages now below heap size; trying CoW fork");
    let pid = process::fork();
    assert!(pid >= 0, "CoW fork must succeed under pressure");
    if pid == 0 {
        for _ in 0..10 {
            process::yield_now();
        }
        println!(" -> child alive under pressure");
        process::exit(104);
    }
    let mut status = -1;
    assert!(process::wait(pid, &mut status) == pid);
    assert!(status == 104, "child should exit with 104");
    println!(" -> single fork passed");

    // Ten live forks of the same memory-heavy process: only true sharing
    // makes this fit.
    let mut pids = [0i64; 10];
    for (i, slot) in pids.iter_mut().enumerate() {
        let pid = process::fork();
        assert!(pid >= 0, "fork {} must succeed under pressure", i);
        if pid == 0 {
            loop {
                process::yield_now();
            }
        }
        *slot = pid;
        println!(" -> multiple fork {}: pid {}, free pages {}", i, pid, free_pages());
    }
    for &pid in pids.iter() {
        assert!(process::kill(pid) == 0);
        let mut status = 0;
        assert!(process::wait(pid, &mut status) == pid);
        assert!(status == -1, "killed child should report -1");
    }

    while process::wait_any() > 0 {}
    0
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("cowtest: panic: {}", info);
    process::exit(1);
}
