//! Support functions for system calls that involve file descriptors.
//!
//! The global open-file table holds fixed, refcounted slots; a process's
//! fd array stores indices into it, so `dup` and `fork` share slots and
//! the file offset that lives inside them. A slot is a `Disk | Pipe` sum
//! behind one read/write interface; device inodes route through the
//! device function table.

use std::sync::Arc;

use array_macro::array;

use crate::fcntl::OpenFlags;
use crate::fs::{self, Path, Stat};
use crate::kernel::Kernel;
use crate::lock::SpinLock;
use crate::param::{BSIZE, LOGSIZE, NFILE};
use crate::pipe::Pipe;
use crate::proc::KernelCtx;
use crate::vm::UVAddr;

/// Maps a device id to device functions.
#[derive(Copy, Clone)]
pub struct Devsw {
    pub read: Option<DevFn>,
    pub write: Option<DevFn>,
}

pub type DevFn = fn(&KernelCtx<'_>, UVAddr, usize) -> Result<usize, ()>;

#[derive(Clone)]
pub(crate) enum FileKind {
    None,
    Disk {
        /// Inode cache slot; the table holds one cache reference.
        ino: usize,
        /// The shared offset: every fd naming this slot advances it.
        off: u32,
        mode: OpenFlags,
    },
    Pipe {
        pipe: Arc<Pipe>,
        writable: bool,
    },
}

struct FileSlot {
    refcnt: u32,
    kind: FileKind,
}

/// The global open-file table.
pub struct FileTable {
    slots: SpinLock<Box<[FileSlot; NFILE]>>,
}

impl FileTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: SpinLock::new(
                "ftable",
                Box::new(array![_ => FileSlot { refcnt: 0, kind: FileKind::None }; NFILE]),
            ),
        }
    }

    /// Allocates a slot with refcount 1.
    pub(crate) fn alloc(&self, kind: FileKind) -> Result<usize, ()> {
        let mut slots = self.slots.lock();
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.refcnt == 0 {
                slot.refcnt = 1;
                slot.kind = kind;
                return Ok(i);
            }
        }
        Err(())
    }

    /// One more fd names this slot (dup or fork).
    pub(crate) fn dup_slot(&self, gfd: usize) {
        let mut slots = self.slots.lock();
        assert!(slots[gfd].refcnt > 0, "ftable: dup of free slot");
        slots[gfd].refcnt += 1;
    }

    /// Drops one reference; the last one releases the inode or closes the
    /// pipe end (freeing the pipe once both ends are gone).
    pub(crate) fn close(&self, kernel: &Kernel, gfd: usize) {
        let last = {
            let mut slots = self.slots.lock();
            assert!(slots[gfd].refcnt > 0, "ftable: close of free slot");
            slots[gfd].refcnt -= 1;
            if slots[gfd].refcnt == 0 {
                Some(core::mem::replace(&mut slots[gfd].kind, FileKind::None))
            } else {
                None
            }
        };
        match last {
            Some(FileKind::Disk { ino, .. }) => kernel.itable().irelease(ino),
            Some(FileKind::Pipe { pipe, writable }) => {
                pipe.close_end(writable, kernel);
                // Dropping the Arc frees the buffer once both ends and
                // all duplicated fds are gone.
            }
            Some(FileKind::None) | None => {}
        }
    }

    pub(crate) fn describe(&self, gfd: usize) -> Result<FileKind, ()> {
        let slots = self.slots.lock();
        if slots[gfd].refcnt == 0 {
            return Err(());
        }
        Ok(slots[gfd].kind.clone())
    }

    /// The shared offset of a disk slot.
    pub(crate) fn offset(&self, gfd: usize) -> Result<u32, ()> {
        let slots = self.slots.lock();
        match slots[gfd].kind {
            FileKind::Disk { off, .. } => Ok(off),
            _ => Err(()),
        }
    }

    /// Advances the shared offset; it only grows.
    pub(crate) fn advance(&self, gfd: usize, n: u32) {
        let mut slots = self.slots.lock();
        if let FileKind::Disk { ref mut off, .. } = slots[gfd].kind {
            *off += n;
        }
    }
}

/// How many bytes one disk write stages at most, so a transaction stays
/// well under the log's 40-block budget (data blocks, bitmap blocks, and
/// inode-file blocks included).
pub(crate) const MAX_WRITE: usize = (LOGSIZE / 2 - 4) * BSIZE;

/// Opens (or creates) `path`, binding a fresh fd to a fresh table slot
/// with offset 0.
pub(crate) fn fileopen(ctx: &KernelCtx<'_>, path: &[u8], mode: OpenFlags) -> Result<i32, ()> {
    let kernel = ctx.kernel();
    if !mode.valid() {
        return Err(());
    }
    let path = Path::new(path);
    let ino = match fs::namei(kernel, ctx, &path) {
        Ok(ino) => ino,
        Err(()) => {
            if !mode.creates() {
                return Err(());
            }
            fs::create(kernel, ctx, &path)?
        }
    };

    let gfd = match kernel.ftable().alloc(FileKind::Disk { ino, off: 0, mode }) {
        Ok(gfd) => gfd,
        Err(()) => {
            kernel.itable().irelease(ino);
            return Err(());
        }
    };
    match ctx.fd_alloc(gfd) {
        Ok(fd) => Ok(fd),
        Err(()) => {
            kernel.ftable().close(kernel, gfd);
            Err(())
        }
    }
}

/// Duplicates `fd` onto a fresh descriptor naming the same table slot.
pub(crate) fn filedup(ctx: &KernelCtx<'_>, fd: i32) -> Result<i32, ()> {
    let kernel = ctx.kernel();
    let gfd = ctx.fd_get(fd)?;
    kernel.ftable().dup_slot(gfd);
    match ctx.fd_alloc(gfd) {
        Ok(nfd) => Ok(nfd),
        Err(()) => {
            kernel.ftable().close(kernel, gfd);
            Err(())
        }
    }
}

/// Closes `fd`.
pub(crate) fn fileclose(ctx: &KernelCtx<'_>, fd: i32) -> Result<(), ()> {
    let gfd = ctx.fd_clear(fd)?;
    ctx.kernel().ftable().close(ctx.kernel(), gfd);
    Ok(())
}

/// Reads from `fd` into user memory.
pub(crate) fn fileread(ctx: &KernelCtx<'_>, fd: i32, dst: UVAddr, n: usize) -> Result<usize, ()> {
    let kernel = ctx.kernel();
    let gfd = ctx.fd_get(fd)?;
    match kernel.ftable().describe(gfd)? {
        FileKind::Disk { ino, mode, .. } => {
            if !mode.readable() {
                return Err(());
            }
            fs::read_file(kernel, ctx, ino, gfd, dst, n as u32)
        }
        FileKind::Pipe { pipe, writable } => {
            if writable {
                return Err(());
            }
            pipe.read(ctx, dst, n)
        }
        FileKind::None => Err(()),
    }
}

/// Writes user memory to `fd`, chunked so each transaction fits the log.
pub(crate) fn filewrite(ctx: &KernelCtx<'_>, fd: i32, src: UVAddr, n: usize) -> Result<usize, ()> {
    let kernel = ctx.kernel();
    let gfd = ctx.fd_get(fd)?;
    match kernel.ftable().describe(gfd)? {
        FileKind::Disk { ino, mode, .. } => {
            if !mode.writable() {
                return Err(());
            }
            let mut done = 0;
            while done < n {
                let m = (n - done).min(MAX_WRITE);
                let r = fs::write_file(kernel, ctx, ino, gfd, src.add(done), m as u32)?;
                done += r;
                if r < m {
                    break;
                }
            }
            Ok(done)
        }
        FileKind::Pipe { pipe, writable } => {
            if !writable {
                return Err(());
            }
            pipe.write(ctx, src, n)
        }
        FileKind::None => Err(()),
    }
}

/// Copies stat information for a disk file out to user memory.
pub(crate) fn filestat(ctx: &KernelCtx<'_>, fd: i32, dst: UVAddr) -> Result<(), ()> {
    let kernel = ctx.kernel();
    let gfd = ctx.fd_get(fd)?;
    match kernel.ftable().describe(gfd)? {
        FileKind::Disk { ino, .. } => {
            let st: Stat = fs::stat_disk(kernel, ctx, ino);
            ctx.copy_out_obj(dst, &st)
        }
        _ => Err(()),
    }
}

/// Creates a pipe; returns (read fd, write fd).
pub(crate) fn filepipe(ctx: &KernelCtx<'_>) -> Result<(i32, i32), ()> {
    ctx.allocate_pipe()
}
