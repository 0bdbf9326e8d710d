//! The kernel: one value owning every subsystem, so tests can instantiate
//! a fresh machine image per run. Threads share it through an `Arc`; no
//! global state exists.

use core::fmt;
use core::fmt::Write as _;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use zerocopy::{AsBytes, FromBytes};

use crate::bio::Bcache;
use crate::console::{console_read, console_write, Printer, CONSOLE};
use crate::disk::MemDisk;
use crate::exec;
use crate::file::{Devsw, FileTable};
use crate::fs::FileSystem;
use crate::fs::Itable;
use crate::kalloc::Kmem;
use crate::lock::SpinLock;
use crate::param::{NDEV, NFRAME_DEFAULT, NSWAPSLOT};
use crate::proc::{Cpu, KernelCtx, Procs, WaitChannel};
use crate::swap::Swap;

/// The code of a user program: the hosted stand-in for the text an ELF's
/// entry point would run. Registered under the program's path.
pub type UserFn = fn(&KernelCtx<'_>) -> i32;

/// The timer: one tick per scheduler trip around the process table.
pub struct Ticks {
    count: SpinLock<u64>,
    chan: WaitChannel,
}

impl Ticks {
    fn new() -> Self {
        Self {
            count: SpinLock::new("time", 0),
            chan: WaitChannel::new(),
        }
    }

    pub fn now(&self) -> u64 {
        *self.count.lock()
    }

    pub(crate) fn tick(&self, kernel: &Kernel) {
        *self.count.lock() += 1;
        self.chan.wakeup(kernel);
    }

    /// Sleeps until `n` ticks have elapsed; Err when killed meanwhile.
    pub(crate) fn sleep_for(&self, n: u64, ctx: &KernelCtx<'_>) -> Result<(), ()> {
        let mut count = self.count.lock();
        let start = *count;
        while *count - start < n {
            if ctx.killed() {
                return Err(());
            }
            self.chan.sleep(&mut count, ctx);
        }
        Ok(())
    }
}

/// Counters observable from user programs via the sysinfo call.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug, AsBytes, FromBytes)]
pub struct SysInfo {
    pub pages_in_use: u64,
    pub pages_in_swap: u64,
    pub num_disk_reads: u64,
    pub free_pages: u64,
}

pub struct Kernel {
    disk: MemDisk,
    bcache: Bcache,
    kmem: Kmem,
    swap: Swap,
    fs: FileSystem,
    itable: Itable,
    ftable: FileTable,
    procs: Procs,
    cpu: Cpu,
    ticks: Ticks,
    devsw: [Option<Devsw>; NDEV],
    printer: SpinLock<Printer>,
    programs: Vec<(String, UserFn)>,
    running: AtomicBool,
}

impl Kernel {
    /// A machine with the default frame pool.
    pub fn new(disk: MemDisk, programs: &[(&str, UserFn)]) -> Arc<Self> {
        Self::with_frames(disk, NFRAME_DEFAULT, programs)
    }

    /// A machine with `nframes` physical pages. Small pools force the
    /// allocator into its eviction path.
    pub fn with_frames(disk: MemDisk, nframes: usize, programs: &[(&str, UserFn)]) -> Arc<Self> {
        let mut devsw = [None; NDEV];
        devsw[CONSOLE as usize] = Some(Devsw {
            read: Some(console_read as crate::file::DevFn),
            write: Some(console_write as crate::file::DevFn),
        });
        Arc::new(Self {
            disk,
            bcache: Bcache::new(),
            kmem: Kmem::new(nframes),
            swap: Swap::new(),
            fs: FileSystem::new(),
            itable: Itable::new(),
            ftable: FileTable::new(),
            procs: Procs::new(),
            cpu: Cpu::new(),
            ticks: Ticks::new(),
            devsw,
            printer: SpinLock::new("printer", Printer::new()),
            programs: programs
                .iter()
                .map(|(p, f)| (String::from(*p), *f))
                .collect(),
            running: AtomicBool::new(false),
        })
    }

    pub(crate) fn disk(&self) -> &MemDisk {
        &self.disk
    }

    pub(crate) fn bcache(&self) -> &Bcache {
        &self.bcache
    }

    pub(crate) fn kmem(&self) -> &Kmem {
        &self.kmem
    }

    pub(crate) fn swap(&self) -> &Swap {
        &self.swap
    }

    pub(crate) fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub(crate) fn itable(&self) -> &Itable {
        &self.itable
    }

    pub(crate) fn ftable(&self) -> &FileTable {
        &self.ftable
    }

    pub(crate) fn procs(&self) -> &Procs {
        &self.procs
    }

    pub(crate) fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn ticks(&self) -> &Ticks {
        &self.ticks
    }

    /// The block device, for snapshotting and counters from tests.
    pub fn disk_ref(&self) -> &MemDisk {
        &self.disk
    }

    pub(crate) fn devsw(&self, devid: i16) -> Option<Devsw> {
        if devid < 0 || devid as usize >= NDEV {
            return None;
        }
        self.devsw[devid as usize]
    }

    pub(crate) fn lookup_program(&self, path: &str) -> Option<UserFn> {
        self.programs
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, f)| *f)
    }

    /// Prints with the kernel printer; use via `kprint!`/`kprintln!`.
    pub fn printer_write_fmt(&self, args: fmt::Arguments<'_>) {
        let mut printer = self.printer.lock();
        let _ = printer.write_fmt(args);
    }

    /// Boots the machine and runs `path` with `argv` as the initial
    /// process: the first process initializes the file system (running
    /// log recovery) and execs the program. Returns its exit status once
    /// everything it did not orphan has been reaped or parked.
    pub fn run(self: &Arc<Self>, path: &str, argv: &[&str]) -> i32 {
        assert!(
            !self.running.swap(true, Ordering::SeqCst),
            "kernel: already ran"
        );
        let path: String = path.into();
        let args: Vec<Vec<u8>> = argv.iter().map(|a| a.as_bytes().to_vec()).collect();
        self.procs.spawn_init(
            self,
            Box::new(move |ctx: &KernelCtx<'_>| {
                // File system initialization must run in the context of a
                // regular process (it can sleep), so it cannot happen in
                // the constructor.
                ctx.kernel().fs().init(ctx.kernel(), ctx);
                let argrefs: Vec<&[u8]> = args.iter().map(|a| &a[..]).collect();
                match exec::kexec(ctx, &path, &argrefs) {
                    Ok(ufn) => ufn(ctx),
                    Err(()) => -1,
                }
            }),
        );
        self.procs.scheduler(self)
    }

    pub fn sysinfo(&self) -> SysInfo {
        let (free_pages, pages_in_use) = self.kmem.stats();
        SysInfo {
            pages_in_use: pages_in_use as u64,
            pages_in_swap: self.swap.pages_in_swap() as u64,
            num_disk_reads: self.disk.num_reads(),
            free_pages: free_pages as u64,
        }
    }

    /// Asserts the conservation invariants: every used VPI is resident
    /// xor swapped, and the per-frame and per-slot refcounts equal the
    /// number of VPIs naming them across all live processes.
    pub fn check_invariants(&self) {
        let mut frame_refs = vec![0u32; self.kmem.nframes()];
        let mut slot_refs = vec![0u32; NSWAPSLOT];
        self.procs.audit_vspaces(|vs| {
            vs.audit(|va, vpi| {
                assert!(
                    vpi.present ^ vpi.swapped,
                    "vpi {:#x}: present xor swapped",
                    va
                );
                if vpi.present {
                    frame_refs[vpi.ppn] += 1;
                } else {
                    slot_refs[vpi.spn] += 1;
                }
            });
        });
        for (ppn, &mapped) in frame_refs.iter().enumerate() {
            if mapped > 0 {
                assert_eq!(
                    self.kmem.refcount(ppn),
                    mapped,
                    "frame {}: refcount vs mappings",
                    ppn
                );
            }
        }
        self.swap.audit(|spn, refcount| {
            assert_eq!(
                refcount, slot_refs[spn],
                "swap slot {}: refcount vs mappings",
                spn
            );
        });
    }
}
