//! Process system calls.

use crate::proc::{ChildFn, KernelCtx};
use crate::vm::{self, RegionKind, UVAddr};

impl KernelCtx<'_> {
    /// fork(): the child shares the parent's pages copy-on-write and its
    /// open files by reference; `child` is its resumed execution.
    pub fn sys_fork(&self, child: ChildFn) -> i32 {
        self.trap_boundary();
        match self.kernel().procs().fork(self, child) {
            Ok(pid) => pid,
            Err(()) => -1,
        }
    }

    /// wait(): reap a zombie child, sleeping until one exists.
    pub fn sys_wait(&self) -> i32 {
        self.trap_boundary();
        match self.kernel().procs().wait(self) {
            Ok(pid) => pid,
            Err(()) => -1,
        }
    }

    /// exit(status): never returns.
    pub fn sys_exit(&self, status: i32) -> ! {
        self.exit(status)
    }

    /// kill(pid).
    pub fn sys_kill(&self, pid: i32) -> i32 {
        self.trap_boundary();
        match self.kernel().procs().kill(pid) {
            Ok(()) => 0,
            Err(()) => -1,
        }
    }

    /// getpid().
    pub fn sys_getpid(&self) -> i32 {
        self.trap_boundary();
        self.pid()
    }

    /// sbrk(n): grows the heap by `n` bytes and returns the old break.
    pub fn sys_sbrk(&self, n: usize) -> isize {
        self.trap_boundary();
        let kernel = self.kernel();
        // SAFETY: short-lived.
        let old = unsafe { (*self.vspace_ptr()).region(RegionKind::Heap).top() };
        if n > 0 {
            // SAFETY: no reference into the vspace is live across the call.
            let grown = unsafe {
                vm::add_map(
                    self.vspace_ptr(),
                    kernel,
                    self,
                    RegionKind::Heap,
                    old,
                    n,
                    true,
                    true,
                    true,
                )
            };
            if grown.is_err() {
                return -1;
            }
            // SAFETY: short-lived.
            unsafe {
                let vs = &mut *self.vspace_ptr();
                vs.region_mut(RegionKind::Heap).size += n;
                vs.invalidate();
            }
        }
        old as isize
    }

    /// sleep(n): waits for `n` timer ticks, waking early only when killed.
    pub fn sys_sleep(&self, n: u64) -> i32 {
        self.trap_boundary();
        match self.kernel().ticks().sleep_for(n, self) {
            Ok(()) => 0,
            Err(()) => -1,
        }
    }

    /// sysinfo(info): page and disk counters, for observing COW, swap,
    /// and stack growth from user programs.
    pub fn sys_sysinfo(&self, info: UVAddr) -> i32 {
        self.trap_boundary();
        if !self.user_range_ok(info, core::mem::size_of::<crate::kernel::SysInfo>()) {
            return -1;
        }
        let si = self.kernel().sysinfo();
        match self.copy_out_obj(info, &si) {
            Ok(()) => 0,
            Err(()) => -1,
        }
    }
}
