//! Process control helpers.

use crate::syscall;

/// Exit the current process.
pub fn exit(code: i32) -> ! {
    syscall::exit(code)
}

/// Pid of the calling process.
pub fn getpid() -> i64 {
    syscall::getpid()
}

/// Fork; returns 0 in the child, the child pid in the parent, negative on
/// error.
pub fn fork() -> i64 {
    syscall::fork()
}

/// Wait for the child `pid` (or any child when negative); returns the
/// reaped pid and stores the exit status.
pub fn wait(pid: i64, status: &mut i32) -> i64 {
    syscall::wait(pid, Some(status))
}

/// Reap any child, discarding its status.
pub fn wait_any() -> i64 {
    syscall::wait(-1, None)
}

/// Grow the heap by `delta` bytes; returns the old break or a negative
/// error.
pub fn sbrk(delta: i64) -> i64 {
    syscall::sbrk(delta)
}

/// Give up the CPU.
pub fn yield_now() {
    let _ = syscall::yield_now();
}

/// Ask `pid` to exit.
pub fn kill(pid: i64) -> i64 {
    syscall::kill(pid)
}
