use core::sync::atomic::{AtomicI32, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use array_macro::array;
use itertools::izip;

use super::{
    swtch, ChildFn, KernelCtx, Proc, ProcExit, ProcInfo, Procstate::*, Pid, Trapframe,
};
use crate::kernel::Kernel;
use crate::kprintln;
use crate::lock::{RawSpinLock, Waitable};
use crate::param::{MAXPROCNAME, NOFILE, NPROC};
use crate::vm::Vspace;

/// Index of the initial process in the table.
pub(crate) const INITPROC: usize = 0;

/// The process table and scheduler.
pub struct Procs {
    /// The process-table lock. Its ownership crosses threads through
    /// `swtch`: the scheduler acquires it, the resumed process releases
    /// it, and vice versa on the way back.
    lock: RawSpinLock,

    pool: Box<[Proc; NPROC]>,

    nextpid: AtomicI32,
}

impl Procs {
    pub(crate) fn new() -> Self {
        Self {
            lock: RawSpinLock::new("ptable"),
            pool: Box::new(array![_ => Proc::new(); NPROC]),
            nextpid: AtomicI32::new(1),
        }
    }

    pub(crate) fn get(&self, idx: usize) -> &Proc {
        &self.pool[idx]
    }

    /// # Safety
    ///
    /// The process-table lock must be held.
    #[allow(clippy::mut_from_ref)]
    unsafe fn info_mut(&self, idx: usize) -> &mut ProcInfo {
        unsafe { &mut *self.pool[idx].info.get() }
    }

    fn allocpid(&self) -> Pid {
        self.nextpid.fetch_add(1, Ordering::Relaxed)
    }

    /// Claims an UNUSED slot and moves it to EMBRYO.
    fn alloc(&self) -> Result<usize, ()> {
        self.lock.acquire();
        for i in 0..NPROC {
            // SAFETY: the lock is held.
            let info = unsafe { self.info_mut(i) };
            if info.state == UNUSED {
                info.state = EMBRYO;
                info.pid = self.allocpid();
                info.parent = None;
                info.chan = 0;
                info.xstate = 0;
                self.lock.release();
                return Ok(i);
            }
        }
        self.lock.release();
        Err(())
    }

    /// Spawns the host thread backing process `idx`. The thread parks until
    /// the scheduler first switches to it, releases the process-table lock
    /// (forkret), runs `body`, and funnels every way out through the exit
    /// path.
    fn spawn_thread(&self, kernel: &Arc<Kernel>, idx: usize, body: ChildFn) {
        let kernel = Arc::clone(kernel);
        let _ = std::thread::Builder::new()
            .name(format!("proc{}", idx))
            .spawn(move || {
                kernel.procs().pool[idx].context.wait();
                // First return from swtch: the scheduler handed us the
                // process-table lock.
                kernel.procs().lock.release();

                let ctx = KernelCtx::new(&kernel, idx);
                let status = match panic::catch_unwind(AssertUnwindSafe(|| body(&ctx))) {
                    Ok(status) => status,
                    Err(payload) => match payload.downcast::<ProcExit>() {
                        Ok(exit) => exit.0,
                        Err(other) => {
                            // A genuine panic in kernel or program code:
                            // report it and fold it into an error exit so
                            // the rest of the machine keeps running.
                            let msg = other
                                .downcast_ref::<&str>()
                                .copied()
                                .map(String::from)
                                .or_else(|| other.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "unknown panic".into());
                            kprintln!(&kernel, "proc {}: panic: {}", idx, msg);
                            -1
                        }
                    },
                };
                kernel.procs().exit_epilogue(status, &ctx);
            })
            .expect("procs: spawn");
    }

    /// Sets up the first user process; `body` typically initializes the
    /// file system and execs the first program.
    pub(crate) fn spawn_init(&self, kernel: &Arc<Kernel>, body: ChildFn) {
        let idx = self.alloc().expect("spawn_init: proc table full");
        assert_eq!(idx, INITPROC, "spawn_init: not first");

        // SAFETY: the slot is EMBRYO; only this thread touches it.
        let data = unsafe { &mut *self.pool[idx].data.get() };
        let name = b"init";
        data.name[..name.len()].copy_from_slice(name);

        self.lock.acquire();
        // SAFETY: the lock is held.
        unsafe { self.info_mut(idx).state = RUNNABLE };
        self.lock.release();

        self.spawn_thread(kernel, idx, body);
    }

    /// Creates a new process copying the caller: COW address space, same
    /// trapframe with `rax = 0`, shared file descriptors. The child's
    /// resumed execution is `body`.
    pub(crate) fn fork(&self, ctx: &KernelCtx<'_>, body: ChildFn) -> Result<Pid, ()> {
        let kernel = ctx.kernel();
        let me = ctx.proc_idx();
        let child = self.alloc()?;

        // Shallow-copy the address space; both sides become COW.
        let mut child_vs = Vspace::new();
        // SAFETY: our own vspace; the child slot is EMBRYO and private.
        unsafe {
            crate::vm::shallow_copy(&mut child_vs, &mut *ctx.vspace_ptr(), kernel);
            (*ctx.vspace_ptr()).invalidate();
        }

        // SAFETY: the child is EMBRYO; only we touch its data.
        let cdata = unsafe { &mut *self.pool[child].data.get() };
        // SAFETY: our own data, read-only here.
        let pdata = unsafe { &*ctx.data_ptr() };

        cdata.vspace = child_vs;
        cdata.tf = Trapframe {
            rax: 0,
            ..pdata.tf
        };
        cdata.name = pdata.name;

        // Increment reference counts on inherited open files.
        for (cf, pf) in izip!(cdata.files.iter_mut(), pdata.files.iter()) {
            *cf = *pf;
            if let Some(gfd) = pf {
                kernel.ftable().dup_slot(*gfd);
            }
        }

        self.lock.acquire();
        let pid;
        // SAFETY: the lock is held.
        unsafe {
            let info = self.info_mut(child);
            info.parent = Some(me);
            info.state = RUNNABLE;
            pid = info.pid;
        }
        self.lock.release();

        self.spawn_thread(ctx.kernel_arc(), child, body);
        Ok(pid)
    }

    /// Waits for a child to exit, reaps it, and returns its pid.
    /// Returns Err if the caller has no children.
    pub(crate) fn wait(&self, ctx: &KernelCtx<'_>) -> Result<Pid, ()> {
        let kernel = ctx.kernel();
        let me = ctx.proc_idx();
        self.lock.acquire();
        loop {
            let mut havekids = false;
            for i in 0..NPROC {
                // SAFETY: the lock is held.
                let info = unsafe { self.info_mut(i) };
                if info.parent != Some(me) || info.state == UNUSED {
                    continue;
                }
                havekids = true;
                if info.state == ZOMBIE {
                    let pid = info.pid;
                    // Reap: free the child's address space and clear the
                    // slot. The child's thread has already ended.
                    // SAFETY: no thread owns a ZOMBIE's data.
                    let data = unsafe { &mut *self.pool[i].data.get() };
                    let vs = core::mem::replace(&mut data.vspace, Vspace::new());
                    vs.free(kernel);
                    data.name = [0; MAXPROCNAME];
                    data.tf = Trapframe::default();
                    data.files = [None; NOFILE];
                    info.state = UNUSED;
                    info.pid = 0;
                    info.parent = None;
                    info.chan = 0;
                    info.xstate = 0;
                    self.pool[i].clear_killed();
                    self.lock.release();
                    return Ok(pid);
                }
            }

            if !havekids || ctx.proc().killed() {
                self.lock.release();
                return Err(());
            }

            // Sleep on ourselves, holding the process-table lock across
            // the switch so no wakeup can be missed.
            // SAFETY: the lock is held.
            unsafe {
                let info = self.info_mut(me);
                info.chan = self.pool[me].chan_token();
                info.state = SLEEPING;
            }
            self.sched(ctx);
            // SAFETY: the lock is held again.
            unsafe { self.info_mut(me).chan = 0 };
        }
    }

    /// The single exit path, run by the process's own thread as its last
    /// act: close files, reparent children to init, wake the parent, mark
    /// ZOMBIE, and hand the CPU back for good.
    pub(crate) fn exit_epilogue(&self, status: i32, ctx: &KernelCtx<'_>) {
        let kernel = ctx.kernel();
        let me = ctx.proc_idx();

        // Close all open files.
        // SAFETY: our own data.
        let data = unsafe { &mut *ctx.data_ptr() };
        for fd in 0..NOFILE {
            if let Some(gfd) = data.files[fd].take() {
                kernel.ftable().close(kernel, gfd);
            }
        }

        self.lock.acquire();

        // Pass abandoned children to init, waking it if it waits.
        let mut orphaned = false;
        for i in 0..NPROC {
            // SAFETY: the lock is held.
            let info = unsafe { self.info_mut(i) };
            if info.parent == Some(me) && info.state != UNUSED {
                info.parent = Some(INITPROC);
                orphaned = true;
            }
        }
        if orphaned {
            self.wakeup1(self.pool[INITPROC].chan_token());
        }

        // SAFETY: the lock is held.
        let parent = unsafe { self.info_mut(me).parent };
        if let Some(p) = parent {
            self.wakeup1(self.pool[p].chan_token());
        }

        // SAFETY: the lock is held.
        unsafe {
            let info = self.info_mut(me);
            info.xstate = status;
            info.state = ZOMBIE;
        }

        // Jump into the scheduler, never to return: resume the CPU but do
        // not wait on our own context. The process-table lock passes to
        // the scheduler.
        kernel.cpu().context.resume();
    }

    /// Kills the process with the given pid. The victim won't exit until
    /// it reaches its next trap boundary or sleep/wake check.
    pub fn kill(&self, pid: Pid) -> Result<(), ()> {
        self.lock.acquire();
        for i in 0..NPROC {
            // SAFETY: the lock is held.
            let info = unsafe { self.info_mut(i) };
            if info.state != UNUSED && info.pid == pid {
                self.pool[i].kill();
                if info.state == SLEEPING {
                    info.state = RUNNABLE;
                }
                self.lock.release();
                return Ok(());
            }
        }
        self.lock.release();
        Err(())
    }

    /// Switch to the scheduler. The process-table lock must be held; it is
    /// held again when this returns.
    fn sched(&self, ctx: &KernelCtx<'_>) {
        debug_assert!(self.lock.holding(), "sched ptable lock");
        swtch(
            &self.pool[ctx.proc_idx()].context,
            &ctx.kernel().cpu().context,
        );
    }

    /// Give up the CPU for one scheduling round.
    pub(crate) fn yield_now(&self, ctx: &KernelCtx<'_>) {
        self.lock.acquire();
        // SAFETY: the lock is held.
        unsafe { self.info_mut(ctx.proc_idx()).state = RUNNABLE };
        self.sched(ctx);
        self.lock.release();
    }

    /// Atomically releases `guard`'s lock and sleeps on `chan`.
    /// Reacquires the lock when awakened.
    pub(crate) fn sleep<G: Waitable>(&self, chan: usize, guard: &mut G, ctx: &KernelCtx<'_>) {
        let me = ctx.proc_idx();

        // Must hold the process-table lock in order to change state and
        // then call sched. Once it is held, no wakeup can be missed
        // (wakeup runs with the same lock held), so it is safe to release
        // the condition lock.
        self.lock.acquire();
        // SAFETY: paired with raw_acquire below; the guarded data is not
        // touched in between.
        unsafe { guard.raw_release() };

        // SAFETY: the lock is held.
        unsafe {
            let info = self.info_mut(me);
            info.chan = chan;
            info.state = SLEEPING;
        }
        self.sched(ctx);

        // SAFETY: the lock is held again after sched.
        unsafe { self.info_mut(me).chan = 0 };
        self.lock.release();

        // SAFETY: paired with raw_release above.
        unsafe { guard.raw_acquire() };
    }

    /// Wakes up all processes sleeping on `chan`.
    pub(crate) fn wakeup(&self, chan: usize) {
        self.lock.acquire();
        self.wakeup1(chan);
        self.lock.release();
    }

    /// Caller must hold the process-table lock.
    fn wakeup1(&self, chan: usize) {
        for i in 0..NPROC {
            // SAFETY: the lock is held.
            let info = unsafe { self.info_mut(i) };
            if info.state == SLEEPING && info.chan == chan {
                info.state = RUNNABLE;
            }
        }
    }

    /// The CPU's scheduler loop. Round-robins over the table, switching to
    /// each RUNNABLE process; one timer tick per trip around the table.
    /// Returns the initial process's exit status once it has exited.
    pub(crate) fn scheduler(&self, kernel: &Kernel) -> i32 {
        let cpu = kernel.cpu();
        let mut idle_passes: u64 = 0;
        loop {
            let mut ran = false;
            self.lock.acquire();
            for i in 0..NPROC {
                // SAFETY: the lock is held.
                let runnable = unsafe { self.info_mut(i).state == RUNNABLE };
                if runnable {
                    // Switch to the chosen process. It is the process's
                    // job to release the process-table lock and then
                    // reacquire it before switching back.
                    // SAFETY: the lock is held.
                    unsafe { self.info_mut(i).state = RUNNING };
                    swtch(&cpu.context, &self.pool[i].context);
                    ran = true;
                }
            }
            // SAFETY: the lock is held.
            let init_done = unsafe {
                let info = self.info_mut(INITPROC);
                (info.state == ZOMBIE).then(|| info.xstate)
            };
            self.lock.release();

            if let Some(status) = init_done {
                return status;
            }

            // The timer: one tick per trip; wakes sleepers on the ticks
            // channel.
            kernel.ticks().tick(kernel);

            idle_passes = if ran { 0 } else { idle_passes + 1 };
            assert!(
                idle_passes < 5_000_000,
                "scheduler: no runnable processes (deadlock?)"
            );
        }
    }

    /// Rewrites every VPI in every address space mapping `va`→frame `ppn`
    /// to point at swap slot `spn`, invalidating affected page tables.
    pub(crate) fn retarget_to_swap(&self, va: usize, ppn: usize, spn: usize) {
        self.retarget(va, |vpi| {
            if vpi.present && vpi.ppn == ppn {
                vpi.present = false;
                vpi.ppn = 0;
                vpi.swapped = true;
                vpi.spn = spn;
                true
            } else {
                false
            }
        });
    }

    /// Rewrites every VPI mapping `va`→slot `spn` to frame `ppn`.
    pub(crate) fn retarget_to_mem(&self, va: usize, spn: usize, ppn: usize) {
        self.retarget(va, |vpi| {
            if vpi.swapped && vpi.spn == spn {
                vpi.swapped = false;
                vpi.spn = 0;
                vpi.present = true;
                vpi.ppn = ppn;
                true
            } else {
                false
            }
        });
    }

    fn retarget<F: FnMut(&mut crate::vm::Vpi) -> bool>(&self, va: usize, mut f: F) {
        self.lock.acquire();
        for i in 0..NPROC {
            // SAFETY: the lock is held.
            let state = unsafe { self.info_mut(i).state };
            if state == UNUSED || state == EMBRYO {
                continue;
            }
            // SAFETY: the owning thread is parked (one CPU), and the
            // caller holds no reference into any vspace.
            let vs = unsafe { &mut (*self.pool[i].data.get()).vspace };
            if let Some(vpi) = vs.lookup_vpi_mut(va) {
                if vpi.used && f(vpi) {
                    vs.invalidate();
                }
            }
        }
        self.lock.release();
    }

    /// Reads and clears the hardware accessed bit of every mapping of
    /// (`va`, frame `ppn`); true if any was set. The eviction clock uses
    /// this to skip recently used frames.
    pub(crate) fn any_accessed(&self, va: usize, ppn: usize) -> bool {
        let mut accessed = false;
        self.lock.acquire();
        for i in 0..NPROC {
            // SAFETY: the lock is held.
            let state = unsafe { self.info_mut(i).state };
            if state == UNUSED || state == EMBRYO {
                continue;
            }
            // SAFETY: as in retarget.
            let vs = unsafe { &mut (*self.pool[i].data.get()).vspace };
            let maps = vs
                .lookup_vpi(va)
                .map_or(false, |v| v.used && v.present && v.ppn == ppn);
            if maps && vs.was_accessed(va) {
                accessed = true;
            }
        }
        self.lock.release();
        accessed
    }

    /// Runs `f` over every live process's address space. Test aid for the
    /// refcount-conservation invariants.
    pub(crate) fn audit_vspaces<F: FnMut(&Vspace)>(&self, mut f: F) {
        self.lock.acquire();
        for i in 0..NPROC {
            // SAFETY: the lock is held.
            let state = unsafe { self.info_mut(i).state };
            if state == UNUSED || state == EMBRYO {
                continue;
            }
            // SAFETY: as in retarget.
            let vs = unsafe { &(*self.pool[i].data.get()).vspace };
            f(vs);
        }
        self.lock.release();
    }

    /// Print a process listing for debugging. Takes no locks so it can be
    /// used on a wedged machine.
    pub fn dump(&self, kernel: &Kernel) {
        for i in 0..NPROC {
            // SAFETY: racy by design; values are only printed.
            let info = unsafe { &*self.pool[i].info.get() };
            if info.state == UNUSED {
                continue;
            }
            let data = unsafe { &*self.pool[i].data.get() };
            let len = data
                .name
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(data.name.len());
            kprintln!(
                kernel,
                "{} {} {}",
                info.pid,
                info.state.as_str(),
                core::str::from_utf8(&data.name[..len]).unwrap_or("???")
            );
        }
    }
}
