//! Buffer cache.
//!
//! The buffer cache is a fixed pool of buf structures holding cached
//! copies of disk block contents. Caching disk blocks in memory reduces
//! the number of disk reads and also provides a synchronization point for
//! blocks used by multiple processes.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call `read`.
//! * After changing buffer data, call `Buf::write` to write it to disk,
//!   or `Log::write` to stage it in the current transaction.
//! * Dropping the `Buf` releases it; do not keep buffers longer than
//!   necessary.
//!
//! Writes are synchronous to the device when `Buf::write` is called; the
//! cache never writes back dirty buffers on release. The log layer decides
//! when blocks reach the disk.

use array_macro::array;

use crate::lock::{SleepLock, SleepLockGuard, SpinLock};
use crate::param::{BSIZE, NBUF};
use crate::proc::KernelCtx;

// Block data is frequently viewed as u32/u64 on-disk records, so keep the
// backing array 8-byte aligned.
#[repr(align(8))]
pub struct BufData {
    pub inner: [u8; BSIZE],
}

pub struct BufInner {
    /// Has data been read from disk?
    valid: bool,

    /// Staged in the log and not yet installed?
    dirty: bool,

    data: BufData,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: false,
            dirty: false,
            data: BufData { inner: [0; BSIZE] },
        }
    }
}

pub struct BufEntry {
    inner: SleepLock<BufInner>,
}

impl BufEntry {
    const fn new() -> Self {
        Self {
            inner: SleepLock::new("buffer", BufInner::new()),
        }
    }
}

#[derive(Copy, Clone)]
struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: u32,
    last_use: u64,
}

struct BcacheCtl {
    meta: [BufMeta; NBUF],
    ticks: u64,
}

pub struct Bcache {
    ctl: SpinLock<BcacheCtl>,
    bufs: [BufEntry; NBUF],
}

impl Bcache {
    pub fn new() -> Self {
        Self {
            ctl: SpinLock::new(
                "bcache",
                BcacheCtl {
                    // u32::MAX never names a real block, so fresh slots
                    // cannot alias a lookup.
                    meta: [BufMeta {
                        dev: 0,
                        blockno: u32::MAX,
                        refcnt: 0,
                        last_use: 0,
                    }; NBUF],
                    ticks: 0,
                },
            ),
            bufs: array![_ => BufEntry::new(); NBUF],
        }
    }

    /// Looks up a cached slot for (dev, blockno), or recycles the least
    /// recently used unreferenced one. Bumps the slot's refcount.
    fn get(&self, dev: u32, blockno: u32) -> usize {
        let mut ctl = self.ctl.lock();

        for (i, m) in ctl.meta.iter_mut().enumerate() {
            if m.dev == dev && m.blockno == blockno {
                m.refcnt += 1;
                return i;
            }
        }

        // Recycle the least recently used unreferenced buffer.
        let mut victim = None;
        for (i, m) in ctl.meta.iter().enumerate() {
            if m.refcnt == 0 && victim.map_or(true, |(_, lu)| m.last_use < lu) {
                victim = Some((i, m.last_use));
            }
        }
        let (i, _) = victim.expect("bget: no buffers");
        ctl.meta[i] = BufMeta {
            dev,
            blockno,
            refcnt: 1,
            last_use: 0,
        };
        // SAFETY: refcnt was 0, so no Buf handle exists and the sleep-lock
        // is free; the ctl spinlock serializes this reset.
        unsafe {
            let inner = &mut *self.bufs[i].inner.get_mut_raw();
            inner.valid = false;
            inner.dirty = false;
        }
        i
    }

    /// Drops an unreferenced cache entry so the next read refetches from
    /// disk. Used when an aborted transaction leaves a cached block
    /// modified but never written.
    pub(crate) fn invalidate(&self, dev: u32, blockno: u32) {
        let ctl = self.ctl.lock();
        for (i, m) in ctl.meta.iter().enumerate() {
            if m.dev == dev && m.blockno == blockno {
                assert_eq!(m.refcnt, 0, "bcache: invalidate in use");
                // SAFETY: refcnt is 0 and the ctl lock serializes this.
                unsafe { (*self.bufs[i].inner.get_mut_raw()).valid = false };
                break;
            }
        }
    }

    fn release_slot(&self, idx: usize) {
        let mut ctl = self.ctl.lock();
        ctl.ticks += 1;
        let t = ctl.ticks;
        let m = &mut ctl.meta[idx];
        assert!(m.refcnt > 0, "brelse");
        m.refcnt -= 1;
        m.last_use = t;
    }

    /// Returns a locked buf with the contents of the indicated block.
    pub fn read<'s>(&'s self, dev: u32, blockno: u32, ctx: &KernelCtx<'s>) -> Buf<'s> {
        let idx = self.get(dev, blockno);
        let mut guard = self.bufs[idx].inner.lock(ctx);
        if !guard.valid {
            ctx.kernel().disk().read(blockno, &mut guard.data.inner);
            guard.valid = true;
        }
        Buf {
            bcache: self,
            kernel: ctx.kernel(),
            idx,
            blockno,
            guard: Some(guard),
        }
    }
}

/// A locked buffer. Dropping it unlocks the buffer and returns the slot to
/// the LRU pool.
pub struct Buf<'s> {
    bcache: &'s Bcache,
    kernel: &'s crate::kernel::Kernel,
    idx: usize,
    blockno: u32,
    guard: Option<SleepLockGuard<'s, BufInner>>,
}

impl Buf<'_> {
    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn data(&self) -> &[u8; BSIZE] {
        &self.guard.as_ref().unwrap().data.inner
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.guard.as_mut().unwrap().data.inner
    }

    /// Writes the buffer's contents to disk, synchronously.
    pub fn write(&mut self) {
        let blockno = self.blockno;
        let guard = self.guard.as_mut().unwrap();
        self.kernel.disk().write(blockno, &guard.data.inner);
        guard.dirty = false;
    }

    /// Marks the buffer dirty; the log will install it at commit.
    pub fn set_dirty(&mut self) {
        self.guard.as_mut().unwrap().dirty = true;
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.bcache.release_slot(self.idx);
    }
}
