//! The write-ahead log.
//!
//! One commit block at `logstart`, followed by up to 40 payload blocks.
//! During a transaction, callers stage dirty blocks with `write` instead
//! of writing them in place. `commit` then (a) writes each staged block
//! to its reserved log slot, (b) writes the commit block carrying the
//! destination block numbers with `commit_flag = 1` — the single block
//! write that makes the transaction durable — and (c) runs the install
//! pass, which copies every logged block to its destination and zeroes
//! the commit block. On boot `recover` runs the same pass: a set flag
//! means a committed-but-uninstalled transaction, which is replayed;
//! otherwise nothing happens. Replay is idempotent, so a crash at any
//! point leaves the transaction either entirely present or entirely
//! absent.
//!
//! Repeated writes to one block within a transaction coalesce by
//! destination block number, the last staged contents winning, so a
//! transaction never occupies more than 40 payload slots.

use core::convert::TryInto;

use arrayvec::ArrayVec;
use static_assertions::const_assert;

use crate::bio::Buf;
use crate::kernel::Kernel;
use crate::lock::SleepLock;
use crate::param::{BSIZE, LOGSIZE, ROOTDEV};
use crate::proc::KernelCtx;

const_assert!(4 * (LOGSIZE + 2) <= BSIZE);

/// The on-disk commit block: destination block numbers, the commit flag,
/// and the payload count, all little endian.
pub(crate) struct CommitBlock {
    pub dst_blocknos: [u32; LOGSIZE],
    pub commit_flag: u32,
    pub size: u32,
}

impl CommitBlock {
    fn empty() -> Self {
        Self {
            dst_blocknos: [0; LOGSIZE],
            commit_flag: 0,
            size: 0,
        }
    }

    fn read(block: &[u8; BSIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes(block[i * 4..i * 4 + 4].try_into().unwrap());
        let mut dst_blocknos = [0u32; LOGSIZE];
        for (i, d) in dst_blocknos.iter_mut().enumerate() {
            *d = word(i);
        }
        Self {
            dst_blocknos,
            commit_flag: word(LOGSIZE),
            size: word(LOGSIZE + 1),
        }
    }

    fn write(&self, block: &mut [u8; BSIZE]) {
        block.fill(0);
        for (i, d) in self.dst_blocknos.iter().enumerate() {
            block[i * 4..i * 4 + 4].copy_from_slice(&d.to_le_bytes());
        }
        block[LOGSIZE * 4..LOGSIZE * 4 + 4].copy_from_slice(&self.commit_flag.to_le_bytes());
        block[(LOGSIZE + 1) * 4..(LOGSIZE + 1) * 4 + 4].copy_from_slice(&self.size.to_le_bytes());
    }
}

struct LogRec {
    blockno: u32,
    data: [u8; BSIZE],
}

struct LogInner {
    staged: ArrayVec<LogRec, LOGSIZE>,
}

pub struct Log {
    inner: SleepLock<LogInner>,
}

impl Log {
    pub(crate) fn new() -> Self {
        Self {
            inner: SleepLock::new("log", LogInner {
                staged: ArrayVec::new(),
            }),
        }
    }

    /// Stages `buf`'s contents for the current transaction and marks the
    /// buffer dirty. Replaces `Buf::write`; a typical use is:
    ///
    ///   let mut bp = kernel.bcache().read(...);
    ///   // modify bp.data_mut()
    ///   kernel.fs().log.write(ctx, &mut bp);
    ///   drop(bp);
    pub(crate) fn write(&self, ctx: &KernelCtx<'_>, buf: &mut Buf<'_>) {
        let mut inner = self.inner.lock(ctx);
        let blockno = buf.blockno();
        if let Some(rec) = inner.staged.iter_mut().find(|r| r.blockno == blockno) {
            rec.data = *buf.data();
        } else {
            assert!(inner.staged.len() < LOGSIZE, "log: too big a transaction");
            inner.staged.push(LogRec {
                blockno,
                data: *buf.data(),
            });
        }
        buf.set_dirty();
    }

    /// Commits the staged transaction and installs it.
    pub(crate) fn commit(&self, kernel: &Kernel, ctx: &KernelCtx<'_>) {
        let mut inner = self.inner.lock(ctx);
        if inner.staged.is_empty() {
            return;
        }
        let sb = kernel.fs().sb();

        // Write the staged blocks to their log slots.
        let mut cb = CommitBlock::empty();
        for (i, rec) in inner.staged.iter().enumerate() {
            cb.dst_blocknos[i] = rec.blockno;
            cb.size += 1;
            let mut buf = kernel
                .bcache()
                .read(ROOTDEV, sb.logstart + 1 + i as u32, ctx);
            *buf.data_mut() = rec.data;
            buf.write();
        }
        inner.staged.clear();

        // Write the commit block: the atomicity point.
        cb.commit_flag = 1;
        let mut buf = kernel.bcache().read(ROOTDEV, sb.logstart, ctx);
        cb.write(buf.data_mut());
        buf.write();
        drop(buf);

        self.install(kernel, ctx);
    }

    /// Replays a committed transaction, if any, and clears the commit
    /// block. Runs at boot and after every commit; idempotent.
    pub(crate) fn recover(&self, kernel: &Kernel, ctx: &KernelCtx<'_>) {
        let _inner = self.inner.lock(ctx);
        self.install(kernel, ctx);
    }

    /// Throws away the staged transaction after a failed operation. The
    /// staged blocks were modified in the cache but never reached disk,
    /// so their cache entries are dropped too.
    pub(crate) fn abort(&self, kernel: &Kernel, ctx: &KernelCtx<'_>) {
        let mut inner = self.inner.lock(ctx);
        for rec in inner.staged.drain(..) {
            kernel.bcache().invalidate(ROOTDEV, rec.blockno);
        }
    }

    fn install(&self, kernel: &Kernel, ctx: &KernelCtx<'_>) {
        let sb = kernel.fs().sb();
        let cb = {
            let buf = kernel.bcache().read(ROOTDEV, sb.logstart, ctx);
            CommitBlock::read(buf.data())
        };
        if cb.commit_flag == 0 {
            return;
        }

        // Copy each logged block to its destination.
        for i in 0..cb.size as usize {
            let data = {
                let src = kernel
                    .bcache()
                    .read(ROOTDEV, sb.logstart + 1 + i as u32, ctx);
                *src.data()
            };
            let mut dst = kernel.bcache().read(ROOTDEV, cb.dst_blocknos[i], ctx);
            *dst.data_mut() = data;
            dst.write();
        }

        // Erase the transaction.
        let mut buf = kernel.bcache().read(ROOTDEV, sb.logstart, ctx);
        buf.data_mut().fill(0);
        buf.write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_block_round_trips() {
        let mut cb = CommitBlock::empty();
        cb.dst_blocknos[0] = 17;
        cb.dst_blocknos[39] = 4242;
        cb.commit_flag = 1;
        cb.size = 2;
        let mut block = [0u8; BSIZE];
        cb.write(&mut block);
        let back = CommitBlock::read(&block);
        assert_eq!(back.dst_blocknos[0], 17);
        assert_eq!(back.dst_blocknos[39], 4242);
        assert_eq!(back.commit_flag, 1);
        assert_eq!(back.size, 2);
        // A zeroed block reads as no transaction.
        let clear = CommitBlock::read(&[0u8; BSIZE]);
        assert_eq!(clear.commit_flag, 0);
    }
}
