// src/kernel/process/mod.rs
//! Process management.
//!
//! A fixed-size table of processes behind one spin lock. Each process owns
//! its address space (`Arc<Mm>`), its trapframe frame, and a kernel stack.
//! Scheduling is cooperative and single-hart: the kernel never preempts
//! itself, so short windows where the table lock is dropped around memory
//! operations cannot race another hart.
//!
//! A process that exits keeps its address space until the parent reaps it
//! with `wait`; only the reap drops the `Arc<Mm>` and returns the pages.

pub mod switch;
pub mod trapframe;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::kernel::core::{KernelError, KernelResult, MemoryError, TaskError};
use crate::kernel::mm::addr::{PhysAddr, VirtAddr};
use crate::kernel::mm::{frame, Mm, PteFlags};
use self::switch::Context;
use self::trapframe::TrapFrame;

/// Maximum number of processes.
pub const NPROC: usize = 16;

/// Kernel stack size per process (16 KiB).
pub const KSTACK_SIZE: usize = 16 * 1024;

/// Process identifier.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    /// Wrap a raw pid value (syscall boundary).
    #[inline]
    pub const fn from_raw(pid: u64) -> Self {
        Self(pid)
    }

    /// Raw pid value.
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Runnable, waiting for the scheduler.
    Ready,
    /// Currently executing.
    Running,
    /// Exited; waiting for the parent to reap it.
    Zombie,
}

/// A process control block.
pub struct Process {
    pid: ProcessId,
    parent: Option<ProcessId>,
    state: ProcessState,
    killed: bool,
    exit_code: i32,
    mm: Option<Arc<Mm>>,
    trapframe: Option<PhysAddr>,
    kernel_stack: Option<Box<[u8]>>,
    context: Context,
    heap_start: VirtAddr,
    brk: VirtAddr,
}

impl Process {
    /// Process id.
    #[inline]
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Parent pid, if any.
    #[inline]
    pub fn parent(&self) -> Option<ProcessId> {
        self.parent
    }

    /// Lifecycle state.
    #[inline]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Exit status (valid once the process is a zombie).
    #[inline]
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Whether a kill is pending.
    #[inline]
    pub fn killed(&self) -> bool {
        self.killed
    }

    /// The address space.
    pub fn mm(&self) -> Option<Arc<Mm>> {
        self.mm.clone()
    }

    /// Physical address of the trapframe frame.
    #[inline]
    pub fn trapframe_pa(&self) -> Option<PhysAddr> {
        self.trapframe
    }

    /// Top of this process's kernel stack.
    pub fn kernel_stack_top(&self) -> usize {
        self.kernel_stack
            .as_ref()
            .map(|s| s.as_ptr() as usize + s.len())
            .expect("process has no kernel stack")
    }

    /// Mutable view of the trapframe through the direct map.
    ///
    /// # Safety
    ///
    /// The caller must be the only path touching this trapframe (the
    /// process must not be running in user mode on another hart).
    pub unsafe fn trapframe_mut(&mut self) -> &mut TrapFrame {
        let pa = self.trapframe.expect("process has no trapframe");
        // SAFETY: the frame is live for the process lifetime; exclusivity
        // is the caller's contract.
        unsafe { &mut *pa.as_mut_ptr::<TrapFrame>() }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // The Arc<Mm> and the kernel stack free themselves; the trapframe
        // frame was allocated raw and goes back by hand.
        if let Some(pa) = self.trapframe.take() {
            frame::free_page(pa);
        }
    }
}

/// The process table.
pub struct ProcessTable {
    slots: Vec<Option<Process>>,
    current: Option<usize>,
    next_pid: u64,
}

impl ProcessTable {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(NPROC);
        slots.resize_with(NPROC, || None);
        Self {
            slots,
            current: None,
            next_pid: 1,
        }
    }

    /// Allocate the next pid.
    pub fn alloc_pid(&mut self) -> ProcessId {
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// The currently running process.
    pub fn current(&self) -> Option<&Process> {
        self.current.and_then(|i| self.slots[i].as_ref())
    }

    /// The currently running process, mutably.
    pub fn current_mut(&mut self) -> Option<&mut Process> {
        let idx = self.current?;
        self.slots[idx].as_mut()
    }

    /// Look a process up by pid.
    pub fn find_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|p| p.pid == pid)
    }

    /// Insert a process into a free slot.
    pub fn add(&mut self, proc: Process) -> KernelResult<usize> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(proc);
                return Ok(i);
            }
        }
        Err(TaskError::TableFull.into())
    }

    /// Number of live processes.
    pub fn live_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

lazy_static! {
    /// The system process table.
    pub static ref PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());
}

/// Pid of the current process, if any.
pub fn current_pid() -> Option<ProcessId> {
    PROCESS_TABLE.lock().current().map(|p| p.pid)
}

/// Address space of the current process, if any.
pub fn current_mm() -> Option<Arc<Mm>> {
    PROCESS_TABLE.lock().current().and_then(|p| p.mm.clone())
}

/// Create a process around a freshly built address space.
///
/// `entry` and `user_sp` seed the trapframe; `heap_start` records where
/// sbrk growth begins. The caller hands over ownership of `trapframe` (a
/// dedicated frame already mapped into `mm`).
pub fn spawn(
    mm: Arc<Mm>,
    trapframe: PhysAddr,
    entry: VirtAddr,
    user_sp: VirtAddr,
    heap_start: VirtAddr,
) -> KernelResult<ProcessId> {
    let kernel_stack = alloc_kernel_stack();

    let mut table = PROCESS_TABLE.lock();
    let pid = table.alloc_pid();
    let mut proc = Process {
        pid,
        parent: None,
        state: ProcessState::Ready,
        killed: false,
        exit_code: 0,
        mm: Some(mm),
        trapframe: Some(trapframe),
        kernel_stack: Some(kernel_stack),
        context: Context::zeroed(),
        heap_start,
        brk: heap_start,
    };

    // SAFETY: the process is not running yet; nobody else sees the frame.
    unsafe {
        let tf = proc.trapframe_mut();
        tf.epc = entry.as_usize() as u64;
        tf.sp = user_sp.as_usize() as u64;
    }
    setup_context(&mut proc);

    table.add(proc)?;
    crate::debug_println!("[process] created pid={}", pid.as_u64());
    Ok(pid)
}

/// Fork the current process with a copy-on-write address space.
///
/// Returns the child pid; the child's trapframe is a copy of the parent's
/// with `a0` forced to zero, so it resumes from the same `ecall` with the
/// fork return value of a child.
pub fn fork() -> KernelResult<ProcessId> {
    let (parent_pid, parent_mm, parent_tf, heap_start, brk) = {
        let table = PROCESS_TABLE.lock();
        let cur = table
            .current()
            .ok_or_else(|| KernelError::from(TaskError::NotFound))?;
        (
            cur.pid,
            cur.mm.clone().expect("current process has no mm"),
            cur.trapframe.expect("current process has no trapframe"),
            cur.heap_start,
            cur.brk,
        )
    };

    let child_tf = frame::alloc_zeroed_page().ok_or(MemoryError::OutOfMemory)?;
    let child_mm = match parent_mm.fork_cow(crate::arch::trampoline_pa(), child_tf) {
        Ok(mm) => mm,
        Err(e) => {
            frame::free_page(child_tf);
            return Err(e);
        }
    };

    // SAFETY: the parent is in the kernel (this very call) and the child
    // does not run yet, so both frames are quiescent.
    unsafe {
        let src = &*parent_tf.as_ptr::<TrapFrame>();
        let dst = &mut *child_tf.as_mut_ptr::<TrapFrame>();
        *dst = *src;
        dst.a0 = 0;
    }

    let kernel_stack = alloc_kernel_stack();

    let mut table = PROCESS_TABLE.lock();
    let pid = table.alloc_pid();
    let mut proc = Process {
        pid,
        parent: Some(parent_pid),
        state: ProcessState::Ready,
        killed: false,
        exit_code: 0,
        mm: Some(child_mm),
        trapframe: Some(child_tf),
        kernel_stack: Some(kernel_stack),
        context: Context::zeroed(),
        heap_start,
        brk,
    };
    setup_context(&mut proc);
    table.add(proc)?;

    crate::debug_println!(
        "[process] forked pid={} -> pid={}",
        parent_pid.as_u64(),
        pid.as_u64()
    );
    Ok(pid)
}

/// Turn the current process into a zombie with `status`.
///
/// Its pages stay allocated until the parent reaps it.
pub fn exit_current(status: i32) {
    let mut table = PROCESS_TABLE.lock();
    if let Some(p) = table.current_mut() {
        p.state = ProcessState::Zombie;
        p.exit_code = status;
        crate::debug_println!(
            "[process] pid={} exited with {}",
            p.pid.as_u64(),
            status
        );
    }
}

/// Kill the current process with a non-zero status (fatal fault path).
pub fn kill_current(status: i32) {
    debug_assert!(status != 0);
    exit_current(status);
}

/// Apply a pending kill to the current process and report whether it is
/// dead (zombie) and must not return to user mode.
pub fn current_is_dead() -> bool {
    let mut table = PROCESS_TABLE.lock();
    match table.current_mut() {
        Some(p) => {
            if p.killed && p.state != ProcessState::Zombie {
                p.state = ProcessState::Zombie;
                p.exit_code = -1;
                crate::debug_println!("[process] pid={} killed", p.pid.as_u64());
            }
            p.state == ProcessState::Zombie
        }
        None => true,
    }
}

/// Mark `pid` as killed; it exits the next time it crosses the kernel.
pub fn kill(pid: ProcessId) -> KernelResult<()> {
    let mut table = PROCESS_TABLE.lock();
    match table.find_mut(pid) {
        Some(p) => {
            p.killed = true;
            Ok(())
        }
        None => Err(TaskError::NotFound.into()),
    }
}

/// Reap one zombie child.
///
/// `target` of `None` waits for any child. Returns `Ok(Some((pid, status)))`
/// after a reap, `Ok(None)` if a matching child exists but has not exited
/// yet (the caller yields and retries), and `Err(NoChild)` otherwise.
pub fn wait(target: Option<ProcessId>) -> KernelResult<Option<(ProcessId, i32)>> {
    let mut table = PROCESS_TABLE.lock();
    let me = table
        .current()
        .ok_or_else(|| KernelError::from(TaskError::NotFound))?
        .pid;

    let mut have_child = false;
    let mut zombie_idx = None;
    for (i, slot) in table.slots.iter().enumerate() {
        if let Some(p) = slot {
            if p.parent != Some(me) {
                continue;
            }
            if let Some(t) = target {
                if p.pid != t {
                    continue;
                }
            }
            have_child = true;
            if p.state == ProcessState::Zombie {
                zombie_idx = Some(i);
                break;
            }
        }
    }

    match zombie_idx {
        Some(i) => {
            let p = table.slots[i].take().expect("zombie slot emptied");
            let result = (p.pid, p.exit_code);
            drop(table);
            // Dropping the process frees the trapframe frame, the kernel
            // stack, and (through the Arc) the whole address space.
            drop(p);
            crate::debug_println!(
                "[process] reaped pid={} status={}",
                result.0.as_u64(),
                result.1
            );
            Ok(Some(result))
        }
        None if have_child => Ok(None),
        None => Err(TaskError::NoChild.into()),
    }
}

/// Grow the current process's heap by `delta` bytes; returns the old break.
///
/// The heap only ever grows; negative deltas are rejected. Newly covered
/// pages arrive zeroed with refcount one.
pub fn sbrk(delta: isize) -> KernelResult<VirtAddr> {
    let (mm, heap_start, old_brk) = {
        let table = PROCESS_TABLE.lock();
        let cur = table
            .current()
            .ok_or_else(|| KernelError::from(TaskError::NotFound))?;
        (
            cur.mm.clone().expect("current process has no mm"),
            cur.heap_start,
            cur.brk,
        )
    };

    if delta == 0 {
        return Ok(old_brk);
    }
    if delta < 0 {
        return Err(KernelError::with_context(
            crate::kernel::core::ErrorKind::InvalidArgument,
            "heap never shrinks",
        ));
    }

    let new_brk = old_brk + delta as usize;
    let old_end = old_brk.page_round_up();
    let new_end = new_brk.page_round_up();

    if new_end > old_end {
        let prot = PteFlags::R | PteFlags::W;
        let mut inner = mm.lock();
        match inner.find_vma(heap_start) {
            Some(idx) => inner.remap(idx, heap_start, new_end, prot)?,
            None => inner.map_pages(heap_start, new_end, prot)?,
        }
    }

    let mut table = PROCESS_TABLE.lock();
    if let Some(cur) = table.current_mut() {
        cur.brk = new_brk;
    }
    Ok(old_brk)
}

fn alloc_kernel_stack() -> Box<[u8]> {
    let mut stack = Vec::with_capacity(KSTACK_SIZE);
    stack.resize(KSTACK_SIZE, 0);
    stack.into_boxed_slice()
}

#[cfg(target_arch = "riscv64")]
fn setup_context(proc: &mut Process) {
    let stack_top = proc
        .kernel_stack
        .as_ref()
        .map(|s| s.as_ptr() as usize + KSTACK_SIZE)
        .expect("process has no kernel stack");
    proc.context = Context::zeroed();
    proc.context.ra = crate::arch::riscv64::trap::forkret as usize as u64;
    proc.context.sp = stack_top as u64;
}

#[cfg(not(target_arch = "riscv64"))]
fn setup_context(_proc: &mut Process) {}

// ---------------------------------------------------------------------------
// Scheduler (riscv64 only): cooperative round robin on a single hart.
// ---------------------------------------------------------------------------

#[cfg(target_arch = "riscv64")]
mod sched {
    use core::cell::UnsafeCell;

    use super::*;

    struct SchedulerContext(UnsafeCell<Context>);

    // SAFETY: single hart; the scheduler context is only touched from the
    // scheduler loop and `swtch` call sites with interrupts disabled.
    unsafe impl Sync for SchedulerContext {}

    static SCHEDULER_CTX: SchedulerContext = SchedulerContext(UnsafeCell::new(Context::zeroed()));

    /// Run processes forever.
    pub fn scheduler() -> ! {
        loop {
            let mut target = None;
            {
                let mut table = PROCESS_TABLE.lock();
                let t = &mut *table;
                let n = t.slots.len();
                let start = t.current.map(|c| c + 1).unwrap_or(0);
                for off in 0..n {
                    let i = (start + off) % n;
                    if let Some(p) = t.slots[i].as_mut() {
                        if p.state == ProcessState::Ready {
                            p.state = ProcessState::Running;
                            t.current = Some(i);
                            target = Some(&mut p.context as *mut Context);
                            break;
                        }
                    }
                }
            }

            match target {
                Some(ctx) => {
                    // SAFETY: single hart, table lock released, and the
                    // process context stays alive while it runs.
                    unsafe {
                        switch::swtch(SCHEDULER_CTX.0.get(), ctx);
                    }
                    // Back from the process; clear `current` unless it is
                    // still the running one (yield keeps it Ready).
                    let mut table = PROCESS_TABLE.lock();
                    if let Some(i) = table.current {
                        if table.slots[i].is_none()
                            || table.slots[i].as_ref().map(|p| p.state)
                                == Some(ProcessState::Zombie)
                        {
                            table.current = None;
                        }
                    }
                }
                None => {
                    use crate::arch::Cpu;
                    crate::arch::ArchCpu::halt();
                }
            }
        }
    }

    /// Give up the CPU; the scheduler picks the next runnable process.
    pub fn yield_now() {
        let ctx = {
            let mut table = PROCESS_TABLE.lock();
            match table.current_mut() {
                Some(p) if p.state == ProcessState::Running => {
                    p.state = ProcessState::Ready;
                    &mut p.context as *mut Context
                }
                Some(p) => &mut p.context as *mut Context,
                None => return,
            }
        };
        // SAFETY: single hart; the slot outlives the switch because reaping
        // only happens from a running process, and this one is parked.
        unsafe {
            switch::swtch(ctx, SCHEDULER_CTX.0.get());
        }
    }
}

#[cfg(target_arch = "riscv64")]
pub use self::sched::{scheduler, yield_now};
