// src/kernel/process/trapframe.rs
//! The per-process trapframe.
//!
//! One dedicated frame per process, mapped R|W at the fixed
//! [`TRAPFRAME`](crate::kernel::mm::memlayout::TRAPFRAME) virtual address.
//! The trampoline saves user registers here on trap entry and reloads them
//! on return; the first five fields stash the kernel environment the
//! trampoline needs before the page-table switch.
//!
//! Field order is load-bearing: the trampoline addresses this struct with
//! hard-coded offsets.

/// Saved user state plus the kernel re-entry environment.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    /// 0: kernel page table (satp value).
    pub kernel_satp: u64,
    /// 8: top of this process's kernel stack.
    pub kernel_sp: u64,
    /// 16: address of `usertrap`.
    pub kernel_trap: u64,
    /// 24: saved user program counter.
    pub epc: u64,
    /// 32: saved kernel tp (hart id).
    pub kernel_hartid: u64,
    /// 40
    pub ra: u64,
    /// 48
    pub sp: u64,
    /// 56
    pub gp: u64,
    /// 64
    pub tp: u64,
    /// 72
    pub t0: u64,
    /// 80
    pub t1: u64,
    /// 88
    pub t2: u64,
    /// 96
    pub s0: u64,
    /// 104
    pub s1: u64,
    /// 112
    pub a0: u64,
    /// 120
    pub a1: u64,
    /// 128
    pub a2: u64,
    /// 136
    pub a3: u64,
    /// 144
    pub a4: u64,
    /// 152
    pub a5: u64,
    /// 160
    pub a6: u64,
    /// 168
    pub a7: u64,
    /// 176
    pub s2: u64,
    /// 184
    pub s3: u64,
    /// 192
    pub s4: u64,
    /// 200
    pub s5: u64,
    /// 208
    pub s6: u64,
    /// 216
    pub s7: u64,
    /// 224
    pub s8: u64,
    /// 232
    pub s9: u64,
    /// 240
    pub s10: u64,
    /// 248
    pub s11: u64,
    /// 256
    pub t3: u64,
    /// 264
    pub t4: u64,
    /// 272
    pub t5: u64,
    /// 280
    pub t6: u64,
}

impl TrapFrame {
    /// Syscall number (a7 by the RISC-V convention).
    #[inline]
    pub fn syscall_number(&self) -> u64 {
        self.a7
    }

    /// The six syscall argument registers.
    #[inline]
    pub fn syscall_args(&self) -> [u64; 6] {
        [self.a0, self.a1, self.a2, self.a3, self.a4, self.a5]
    }

    /// Store the syscall return value.
    #[inline]
    pub fn set_return_value(&mut self, val: u64) {
        self.a0 = val;
    }

    /// Step past the `ecall` instruction.
    #[inline]
    pub fn advance_pc(&mut self) {
        self.epc += 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn test_trampoline_offsets() {
        // The trampoline assembly addresses the frame by these offsets.
        assert_eq!(memoffset(|tf: &TrapFrame| &tf.kernel_satp), 0);
        assert_eq!(memoffset(|tf: &TrapFrame| &tf.kernel_sp), 8);
        assert_eq!(memoffset(|tf: &TrapFrame| &tf.kernel_trap), 16);
        assert_eq!(memoffset(|tf: &TrapFrame| &tf.epc), 24);
        assert_eq!(memoffset(|tf: &TrapFrame| &tf.kernel_hartid), 32);
        assert_eq!(memoffset(|tf: &TrapFrame| &tf.ra), 40);
        assert_eq!(memoffset(|tf: &TrapFrame| &tf.a0), 112);
        assert_eq!(memoffset(|tf: &TrapFrame| &tf.a7), 168);
        assert_eq!(memoffset(|tf: &TrapFrame| &tf.t6), 280);
        assert_eq!(size_of::<TrapFrame>(), 288);
    }

    fn memoffset<F: Fn(&TrapFrame) -> &u64>(f: F) -> usize {
        let tf = TrapFrame {
            kernel_satp: 0,
            kernel_sp: 0,
            kernel_trap: 0,
            epc: 0,
            kernel_hartid: 0,
            ra: 0,
            sp: 0,
            gp: 0,
            tp: 0,
            t0: 0,
            t1: 0,
            t2: 0,
            s0: 0,
            s1: 0,
            a0: 0,
            a1: 0,
            a2: 0,
            a3: 0,
            a4: 0,
            a5: 0,
            a6: 0,
            a7: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
            t3: 0,
            t4: 0,
            t5: 0,
            t6: 0,
        };
        (f(&tf) as *const u64 as usize) - (&tf as *const TrapFrame as usize)
    }
}
