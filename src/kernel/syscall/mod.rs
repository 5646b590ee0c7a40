// src/kernel/syscall/mod.rs
//! System call implementation module
//!
//! This module provides the actual implementations of system calls
//! and the dispatch mechanism. Arguments arrive in `a0..a5`, the number in
//! `a7`, and the result goes back in `a0` (negative values are errors).

pub mod ktest;

use crate::kernel::core::{ErrorKind, KernelError, MemoryError, TaskError};
use crate::kernel::mm::memlayout::MAXVA;
use crate::kernel::mm::{copy_to_user, strbuf, uaccess, VirtAddr};
use crate::kernel::process::{self, ProcessId};
use crate::kernel::process::trapframe::TrapFrame;

/// Maximum length for sys_write (1MB)
const MAX_WRITE_LEN: u64 = 1024 * 1024;

/// System call numbers.
pub const SYS_WRITE: u64 = 0;
pub const SYS_EXIT: u64 = 2;
pub const SYS_GETPID: u64 = 3;
pub const SYS_FORK: u64 = 6;
pub const SYS_WAIT: u64 = 8;
pub const SYS_SBRK: u64 = 12;
pub const SYS_YIELD: u64 = 13;
pub const SYS_KILL: u64 = 14;
pub const SYS_KTEST: u64 = 15;

/// System call result type
pub type SyscallResult = i64;

/// Success code
pub const SUCCESS: SyscallResult = 0;

/// Error codes (Linux-compatible)
pub const EPERM: SyscallResult = -1; // Operation not permitted
pub const ESRCH: SyscallResult = -3; // No such process
pub const EAGAIN: SyscallResult = -11; // Try again
pub const ENOMEM: SyscallResult = -12; // Out of memory
pub const EFAULT: SyscallResult = -14; // Bad address (invalid pointer)
pub const EINVAL: SyscallResult = -22; // Invalid argument
pub const ENOSYS: SyscallResult = -38; // Function not implemented
pub const ECHILD: SyscallResult = -10; // No child processes

/// Translate a kernel error into its errno.
pub fn errno(e: &KernelError) -> SyscallResult {
    match e.kind() {
        ErrorKind::Memory(MemoryError::OutOfMemory) => ENOMEM,
        ErrorKind::Memory(MemoryError::PermissionDenied) => EPERM,
        ErrorKind::Memory(_) => EFAULT,
        ErrorKind::Task(TaskError::NotFound) => ESRCH,
        ErrorKind::Task(TaskError::NoChild) => ECHILD,
        ErrorKind::Task(TaskError::TableFull) => EAGAIN,
        ErrorKind::InvalidArgument => EINVAL,
        ErrorKind::ResourceUnavailable => EAGAIN,
        _ => ENOSYS,
    }
}

/// Check if an address is in user space
#[inline]
fn is_user_address(addr: u64) -> bool {
    (addr as usize) < MAXVA
}

/// Check if a memory range is in user space
#[inline]
fn is_user_range(addr: u64, len: u64) -> bool {
    match addr.checked_add(len) {
        Some(end) => is_user_address(addr) && is_user_address(end.saturating_sub(1)),
        None => false,
    }
}

/// Dispatch the syscall recorded in `tf` and store its result.
pub fn dispatch(tf: &mut TrapFrame) {
    let num = tf.syscall_number();
    let args = tf.syscall_args();
    tf.advance_pc();

    #[cfg(feature = "syscall_trace")]
    crate::debug_println!("[syscall] num={} args={:x?}", num, args);

    let ret = handle(num, args);
    tf.set_return_value(ret as u64);
}

/// Run one system call.
pub fn handle(num: u64, args: [u64; 6]) -> SyscallResult {
    match num {
        SYS_WRITE => sys_write(args[0], args[1], args[2]),
        SYS_EXIT => sys_exit(args[0] as i64),
        SYS_GETPID => sys_getpid(),
        SYS_FORK => sys_fork(),
        SYS_WAIT => sys_wait(args[0] as i64, args[1]),
        SYS_SBRK => sys_sbrk(args[0] as i64),
        SYS_YIELD => sys_yield(),
        SYS_KILL => sys_kill(args[0] as i64),
        SYS_KTEST => ktest::ktest_syscall(args),
        _ => {
            crate::debug_println!("[syscall] unknown syscall {}", num);
            ENOSYS
        }
    }
}

/// sys_write - write `len` bytes at user address `buf` to the console.
///
/// Only fd 1 (stdout) exists on this machine.
fn sys_write(fd: u64, buf: u64, len: u64) -> SyscallResult {
    if fd != 1 {
        return EINVAL;
    }
    if buf == 0 || !is_user_address(buf) {
        crate::debug_println!("[syscall] sys_write: invalid buffer address {:#x}", buf);
        return EFAULT;
    }
    if len > MAX_WRITE_LEN {
        crate::debug_println!("[syscall] sys_write: length too large ({})", len);
        return EINVAL;
    }
    if !is_user_range(buf, len) {
        crate::debug_println!("[syscall] sys_write: buffer range leaves user space");
        return EFAULT;
    }

    let mm = match process::current_mm() {
        Some(mm) => mm,
        None => return ESRCH,
    };

    // Stage through a pooled buffer chunk by chunk.
    let mut chunk = match strbuf::alloc() {
        Some(b) => b,
        None => return EAGAIN,
    };
    let mut written = 0u64;
    while written < len {
        let n = core::cmp::min((len - written) as usize, chunk.capacity());
        let slice = &mut chunk.as_mut_slice()[..n];
        if let Err(e) = uaccess::copy_from_user(
            &mm,
            VirtAddr::new((buf + written) as usize),
            slice,
        ) {
            return errno(&e);
        }
        crate::kernel::driver::console_write_bytes(slice);
        written += n as u64;
    }
    written as SyscallResult
}

/// sys_exit - exit the current process with `status`.
fn sys_exit(status: i64) -> SyscallResult {
    process::exit_current(status as i32);
    // The trap layer notices the zombie state and never returns to user
    // mode; the value below is never observed.
    SUCCESS
}

/// sys_getpid - pid of the calling process.
fn sys_getpid() -> SyscallResult {
    match process::current_pid() {
        Some(pid) => pid.as_u64() as SyscallResult,
        None => ESRCH,
    }
}

/// sys_fork - clone the calling process with a CoW address space.
fn sys_fork() -> SyscallResult {
    match process::fork() {
        Ok(pid) => pid.as_u64() as SyscallResult,
        Err(e) => {
            crate::debug_println!("[syscall] fork failed: {}", e);
            errno(&e)
        }
    }
}

/// sys_wait - reap a child; pid < 0 waits for any child.
///
/// On success the child's exit status is stored through `status_ptr`
/// (unless null) via the CoW-aware kernel write path.
fn sys_wait(pid: i64, status_ptr: u64) -> SyscallResult {
    let target = if pid < 0 {
        None
    } else {
        Some(ProcessId::from_raw(pid as u64))
    };

    loop {
        match process::wait(target) {
            Ok(Some((child, status))) => {
                if status_ptr != 0 {
                    let mm = match process::current_mm() {
                        Some(mm) => mm,
                        None => return ESRCH,
                    };
                    let bytes = (status as i32).to_ne_bytes();
                    if let Err(e) = copy_to_user(&mm, VirtAddr::new(status_ptr as usize), &bytes)
                    {
                        return errno(&e);
                    }
                }
                return child.as_u64() as SyscallResult;
            }
            Ok(None) => {
                // A child exists but has not exited yet.
                #[cfg(target_arch = "riscv64")]
                process::yield_now();
                #[cfg(not(target_arch = "riscv64"))]
                return EAGAIN;
            }
            Err(e) => return errno(&e),
        }
    }
}

/// sys_sbrk - grow the heap; returns the previous break.
fn sys_sbrk(delta: i64) -> SyscallResult {
    match process::sbrk(delta as isize) {
        Ok(old_brk) => old_brk.as_usize() as SyscallResult,
        Err(e) => errno(&e),
    }
}

/// sys_yield - give up the CPU.
fn sys_yield() -> SyscallResult {
    #[cfg(target_arch = "riscv64")]
    process::yield_now();
    SUCCESS
}

/// sys_kill - ask `pid` to exit.
fn sys_kill(pid: i64) -> SyscallResult {
    if pid <= 0 {
        return EINVAL;
    }
    match process::kill(ProcessId::from_raw(pid as u64)) {
        Ok(()) => SUCCESS,
        Err(e) => errno(&e),
    }
}
