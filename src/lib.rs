// src/lib.rs
//! tiny_rv64 — a minimal riscv64 teaching kernel built around copy-on-write
//! user virtual memory.
//!
//! The crate doubles as a hosted library: everything outside `arch/riscv64`
//! and the boot glue is architecture-neutral, so the whole VM subsystem
//! (frames, refcounts, page tables, address spaces, CoW fork, fault
//! resolution) builds and runs under `cargo test` on any host, backed by a
//! static memory arena instead of DRAM.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod arch;
pub mod kernel;
pub mod serial;

use crate::arch::{ArchCpu, Cpu};

/// Global kernel heap (riscv64 builds; hosted builds use std's allocator).
#[cfg(target_arch = "riscv64")]
#[global_allocator]
static ALLOCATOR: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

#[cfg(target_arch = "riscv64")]
static mut KERNEL_HEAP: [u8; kernel::mm::memlayout::KERNEL_HEAP_SIZE] =
    [0; kernel::mm::memlayout::KERNEL_HEAP_SIZE];

/// Initialize the kernel byte heap backing `alloc`.
///
/// # Safety
///
/// Must be called exactly once, before the first allocation.
#[cfg(target_arch = "riscv64")]
pub unsafe fn init_heap() {
    let start = core::ptr::addr_of_mut!(KERNEL_HEAP) as *mut u8;
    // SAFETY: the heap array is static, unaliased, and handed over once.
    unsafe {
        ALLOCATOR
            .lock()
            .init(start, kernel::mm::memlayout::KERNEL_HEAP_SIZE);
    }
}

/// console_print! macro - user-facing console output
#[macro_export]
macro_rules! console_print {
    ($($arg:tt)*) => {{
        $crate::kernel::driver::write_console(format_args!($($arg)*));
    }};
}

/// console_println! macro - user-facing console output with newline
#[macro_export]
macro_rules! console_println {
    () => ($crate::console_print!("\n"));
    ($($arg:tt)*) => ($crate::console_print!("{}\n", format_args!($($arg)*)));
}

/// debug_print! macro - debug-only output (serial port)
#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {{
        $crate::kernel::driver::write_debug(format_args!($($arg)*));
    }};
}

/// debug_println! macro - debug-only output with newline
#[macro_export]
macro_rules! debug_println {
    () => ($crate::debug_print!("\n"));
    ($($arg:tt)*) => ($crate::debug_print!("{}\n", format_args!($($arg)*)));
}

/// Halt loop
#[inline]
pub fn hlt_loop() -> ! {
    loop {
        ArchCpu::halt();
    }
}

/// Kernel panic handler: dump and park the hart.
#[cfg(all(target_arch = "riscv64", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    ArchCpu::disable_interrupts();
    debug_println!("\n[panic] {}", info);
    hlt_loop();
}
