//! Pipes.
//!
//! A ring of 2048 bytes with unbounded `front`/`tail` counters (indices
//! wrap modulo the buffer size; `0 <= tail - front <= 2048` always).
//! Readers sleep while the pipe is empty and the write end open; writers
//! sleep while it is full and the read end open. Closing one end wakes
//! the peer; once both ends close, the last file-table reference frees
//! the buffer.
//!
//! User-memory copies are staged outside the pipe spinlock: a hosted copy
//! can fault into swap I/O, which is a suspension point, and spinlocks
//! must never be held across one.

use std::sync::Arc;

use scopeguard::ScopeGuard;

use crate::file::FileKind;
use crate::kernel::Kernel;
use crate::lock::SpinLock;
use crate::proc::{KernelCtx, WaitChannel};
use crate::vm::UVAddr;

pub(crate) const PIPESIZE: usize = 2048;

struct PipeInner {
    data: [u8; PIPESIZE],

    /// Count of bytes consumed; wraps modulo PIPESIZE on use.
    front: u32,

    /// Count of bytes produced.
    tail: u32,

    /// Read end is still open.
    readopen: bool,

    /// Write end is still open.
    writeopen: bool,

    /// Global file-table slots of the two ends.
    read_fd: usize,
    write_fd: usize,
}

impl PipeInner {
    fn buffered(&self) -> usize {
        let n = self.tail.wrapping_sub(self.front) as usize;
        debug_assert!(n <= PIPESIZE, "pipe: ring invariant");
        n
    }
}

pub struct Pipe {
    inner: SpinLock<PipeInner>,

    /// WaitChannel saying there are unread bytes.
    read_waitchannel: WaitChannel,

    /// WaitChannel saying there is free space.
    write_waitchannel: WaitChannel,
}

impl Pipe {
    fn new() -> Self {
        Self {
            inner: SpinLock::new("pipe", PipeInner {
                data: [0; PIPESIZE],
                front: 0,
                tail: 0,
                readopen: true,
                writeopen: true,
                read_fd: 0,
                write_fd: 0,
            }),
            read_waitchannel: WaitChannel::new(),
            write_waitchannel: WaitChannel::new(),
        }
    }

    /// Reads up to `n` bytes into user memory at `dst`. Sleeps while the
    /// pipe is empty and a writer remains; returns 0 at end of file.
    pub(crate) fn read(&self, ctx: &KernelCtx<'_>, dst: UVAddr, n: usize) -> Result<usize, ()> {
        let mut staged = [0u8; PIPESIZE];
        let count = {
            let mut inner = self.inner.lock();
            loop {
                if ctx.proc().killed() {
                    return Err(());
                }
                let avail = inner.buffered();
                if avail == 0 {
                    if !inner.writeopen {
                        break 0;
                    }
                    self.write_waitchannel.wakeup(ctx.kernel());
                    self.read_waitchannel.sleep(&mut inner, ctx);
                    continue;
                }
                let take = avail.min(n);
                for slot in staged.iter_mut().take(take) {
                    *slot = inner.data[inner.front as usize % PIPESIZE];
                    inner.front = inner.front.wrapping_add(1);
                }
                break take;
            }
        };
        self.write_waitchannel.wakeup(ctx.kernel());
        if count > 0 {
            ctx.copy_out(dst, &staged[..count])?;
        }
        Ok(count)
    }

    /// Writes `n` bytes from user memory at `src`. Sleeps while the pipe
    /// is full and a reader remains; errors once the read end closes.
    pub(crate) fn write(&self, ctx: &KernelCtx<'_>, src: UVAddr, n: usize) -> Result<usize, ()> {
        let mut written = 0;
        let mut staged = [0u8; PIPESIZE];
        while written < n {
            let chunk = (n - written).min(PIPESIZE);
            ctx.copy_in(src.add(written), &mut staged[..chunk])?;

            let mut inner = self.inner.lock();
            let mut done = 0;
            while done < chunk {
                if !inner.readopen || ctx.proc().killed() {
                    return Err(());
                }
                let space = PIPESIZE - inner.buffered();
                if space == 0 {
                    self.read_waitchannel.wakeup(ctx.kernel());
                    self.write_waitchannel.sleep(&mut inner, ctx);
                    continue;
                }
                let m = space.min(chunk - done);
                for &b in staged[done..done + m].iter() {
                    let at = inner.tail as usize % PIPESIZE;
                    inner.data[at] = b;
                    inner.tail = inner.tail.wrapping_add(1);
                }
                done += m;
            }
            drop(inner);
            self.read_waitchannel.wakeup(ctx.kernel());
            written += chunk;
        }
        Ok(written)
    }

    /// Closes one end, waking the peer.
    pub(crate) fn close_end(&self, writable: bool, kernel: &Kernel) {
        let mut inner = self.inner.lock();
        if writable {
            inner.writeopen = false;
            drop(inner);
            self.read_waitchannel.wakeup(kernel);
        } else {
            inner.readopen = false;
            drop(inner);
            self.write_waitchannel.wakeup(kernel);
        }
    }
}

impl KernelCtx<'_> {
    /// Creates a pipe and binds its read and write ends to two fresh file
    /// descriptors, returned as (read, write).
    pub(crate) fn allocate_pipe(&self) -> Result<(i32, i32), ()> {
        let kernel = self.kernel();
        let pipe = Arc::new(Pipe::new());

        let gfd0 = kernel.ftable().alloc(FileKind::Pipe {
            pipe: Arc::clone(&pipe),
            writable: false,
        })?;
        let gfd0 = scopeguard::guard(gfd0, |g| kernel.ftable().close(kernel, g));
        let gfd1 = kernel.ftable().alloc(FileKind::Pipe {
            pipe: Arc::clone(&pipe),
            writable: true,
        })?;
        let gfd1 = scopeguard::guard(gfd1, |g| kernel.ftable().close(kernel, g));

        {
            let mut inner = pipe.inner.lock();
            inner.read_fd = *gfd0;
            inner.write_fd = *gfd1;
        }

        let fd0 = self.fd_alloc(*gfd0)?;
        let fd0 = scopeguard::guard(fd0, |fd| {
            let _ = self.fd_clear(fd);
        });
        let fd1 = self.fd_alloc(*gfd1)?;

        ScopeGuard::into_inner(gfd0);
        ScopeGuard::into_inner(gfd1);
        Ok((ScopeGuard::into_inner(fd0), fd1))
    }
}
