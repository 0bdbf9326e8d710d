//! The block device of the hosted machine.
//!
//! A `MemDisk` stands in for the IDE/virtio driver: a vector of 512-byte
//! blocks with read/write counters and a crash fail-point. Reads and
//! writes complete synchronously, so the driver never sleeps; callers
//! still serialize access through the buffer cache's per-buffer locks.
//!
//! Crash testing: `fail_writes_after(n)` lets the next `n` writes through
//! and silently drops the rest, modeling power loss mid-sequence. A test
//! then takes `snapshot()` and boots a fresh kernel on the image to
//! exercise recovery.

use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::lock::SpinLock;
use crate::param::BSIZE;

pub type Block = [u8; BSIZE];

pub struct MemDisk {
    blocks: SpinLock<Vec<Block>>,
    nreads: AtomicU64,
    nwrites: AtomicU64,
    /// Remaining writes before the simulated crash; negative means no limit.
    write_budget: AtomicI64,
}

impl MemDisk {
    /// Builds a disk from a raw image, padding with zero blocks up to
    /// `nblocks` if the image is shorter.
    pub fn new(image: &[u8], nblocks: usize) -> Self {
        assert!(image.len() % BSIZE == 0, "MemDisk: ragged image");
        let mut blocks = vec![[0u8; BSIZE]; nblocks.max(image.len() / BSIZE)];
        for (i, chunk) in image.chunks_exact(BSIZE).enumerate() {
            blocks[i].copy_from_slice(chunk);
        }
        Self {
            blocks: SpinLock::new("memdisk", blocks),
            nreads: AtomicU64::new(0),
            nwrites: AtomicU64::new(0),
            write_budget: AtomicI64::new(-1),
        }
    }

    pub fn nblocks(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn read(&self, blockno: u32, dst: &mut Block) {
        let blocks = self.blocks.lock();
        *dst = blocks[blockno as usize];
        drop(blocks);
        let _ = self.nreads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write(&self, blockno: u32, src: &Block) {
        // A write past the fail-point is lost, as if the machine died.
        let budget = self.write_budget.load(Ordering::Relaxed);
        if budget >= 0 {
            if budget == 0 {
                return;
            }
            let _ = self.write_budget.fetch_sub(1, Ordering::Relaxed);
        }
        let mut blocks = self.blocks.lock();
        blocks[blockno as usize] = *src;
        drop(blocks);
        let _ = self.nwrites.fetch_add(1, Ordering::Relaxed);
    }

    /// Lets `n` more writes through, then drops the rest.
    pub fn fail_writes_after(&self, n: u64) {
        self.write_budget.store(n as i64, Ordering::Relaxed);
    }

    /// Clears the fail-point.
    pub fn heal(&self) {
        self.write_budget.store(-1, Ordering::Relaxed);
    }

    /// The surviving image, as a fresh kernel would see it after reboot.
    pub fn snapshot(&self) -> Vec<u8> {
        let blocks = self.blocks.lock();
        let mut out = Vec::with_capacity(blocks.len() * BSIZE);
        for b in blocks.iter() {
            out.extend_from_slice(b);
        }
        out
    }

    pub fn num_reads(&self) -> u64 {
        self.nreads.load(Ordering::Relaxed)
    }

    pub fn num_writes(&self) -> u64 {
        self.nwrites.load(Ordering::Relaxed)
    }
}
