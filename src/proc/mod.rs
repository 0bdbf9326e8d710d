//! Processes and the hosted context-switch primitive.
//!
//! One kernel thread per process, plus the CPU's scheduler loop. `swtch`
//! hands the CPU between two `Context`s as a strict park/unpark pair, so
//! at most one kernel thread runs at a time. The process-table lock is
//! passed through `swtch` exactly as in xv6: the scheduler acquires it,
//! the resumed process releases it, and a process acquires it again
//! before switching back.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crate::param::{MAXPROCNAME, NOFILE};
use crate::vm::Vspace;

mod kernel_ctx;
mod procs;
mod wait_channel;

pub use kernel_ctx::*;
pub use procs::*;
pub use wait_channel::*;

pub type Pid = i32;

/// The child half of `fork`: since a host thread cannot be snapshotted,
/// the child's resumed execution is a closure. The kernel-side semantics
/// of fork (COW address-space copy, trapframe duplication, fd refcounts)
/// are unchanged.
pub type ChildFn = Box<dyn for<'a> FnOnce(&KernelCtx<'a>) -> i32 + Send>;

/// Unwind payload carried by `KernelCtx::exit`.
pub(crate) struct ProcExit(pub i32);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[allow(non_camel_case_types)]
pub enum Procstate {
    UNUSED,
    EMBRYO,
    SLEEPING,
    RUNNABLE,
    RUNNING,
    ZOMBIE,
}

impl Procstate {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Procstate::UNUSED => "unused",
            Procstate::EMBRYO => "embryo",
            Procstate::SLEEPING => "sleep ",
            Procstate::RUNNABLE => "runble",
            Procstate::RUNNING => "run   ",
            Procstate::ZOMBIE => "zombie",
        }
    }
}

/// Saved user-visible registers. `exec` fills these per the entry ABI
/// (`rip = entry`, `rdi = argc`, `rsi = &argv[0]`, `rsp = &argv[0] - 8`);
/// `fork` duplicates them with `rax = 0` in the child.
#[derive(Copy, Clone, Default, Debug)]
pub struct Trapframe {
    pub rip: usize,
    pub rsp: usize,
    pub rdi: usize,
    pub rsi: usize,
    pub rax: usize,
}

/// A parked execution, resumable exactly once per `resume`.
pub(crate) struct Context {
    run: Mutex<bool>,
    cv: Condvar,
}

impl Context {
    pub fn new() -> Self {
        Self {
            run: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Marks this context runnable and wakes its thread.
    pub fn resume(&self) {
        let mut run = self.run.lock().unwrap();
        *run = true;
        self.cv.notify_one();
    }

    /// Parks the calling thread until `resume`.
    pub fn wait(&self) {
        let mut run = self.run.lock().unwrap();
        while !*run {
            run = self.cv.wait(run).unwrap();
        }
        *run = false;
    }
}

/// Hand the CPU from `from` to `to`. Returns when someone resumes `from`.
pub(crate) fn swtch(from: &Context, to: &Context) {
    to.resume();
    from.wait();
}

/// One logical CPU.
pub(crate) struct Cpu {
    pub context: Context,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            context: Context::new(),
        }
    }
}

/// Fields guarded by the process-table lock.
pub(crate) struct ProcInfo {
    pub state: Procstate,
    pub pid: Pid,
    /// Index of the parent in the process table.
    pub parent: Option<usize>,
    /// If nonzero, sleeping on this channel token.
    pub chan: usize,
    /// Exit status to be returned to the parent's wait.
    pub xstate: i32,
}

/// Fields private to the process. Accessed by the owning thread while
/// RUNNING, or by the parent while the slot is EMBRYO (setup) or ZOMBIE
/// (reap), or by the VM layer rewriting VPIs while the owner is parked.
/// The one-thread-at-a-time handoff makes these accesses exclusive.
pub(crate) struct ProcData {
    pub name: [u8; MAXPROCNAME],
    pub vspace: Vspace,
    pub tf: Trapframe,
    /// Open files: indices into the global open-file table.
    pub files: [Option<usize>; NOFILE],
}

impl ProcData {
    pub fn new() -> Self {
        Self {
            name: [0; MAXPROCNAME],
            vspace: Vspace::new(),
            tf: Trapframe::default(),
            files: [None; NOFILE],
        }
    }
}

/// Per-process state.
pub struct Proc {
    pub(crate) info: UnsafeCell<ProcInfo>,
    pub(crate) data: UnsafeCell<ProcData>,
    pub(crate) context: Context,
    killed: AtomicBool,
}

// SAFETY: info is guarded by the process-table lock; data follows the
// ownership discipline documented on ProcData.
unsafe impl Sync for Proc {}
unsafe impl Send for Proc {}

impl Proc {
    pub(crate) fn new() -> Self {
        Self {
            info: UnsafeCell::new(ProcInfo {
                state: Procstate::UNUSED,
                pid: 0,
                parent: None,
                chan: 0,
                xstate: 0,
            }),
            data: UnsafeCell::new(ProcData::new()),
            context: Context::new(),
            killed: AtomicBool::new(false),
        }
    }

    /// Flag the process; it exits at its next trap boundary or wait check.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub(crate) fn clear_killed(&self) {
        self.killed.store(false, Ordering::Release);
    }

    /// Sleep/wakeup rendezvous token for waiting on this process.
    pub(crate) fn chan_token(&self) -> usize {
        self as *const _ as usize
    }
}
