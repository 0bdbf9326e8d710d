//! The swap manager.
//!
//! A bitmap of 2048 slots over the swap region; slot `s` occupies the 8
//! device blocks `swapstart + 8s .. swapstart + 8s + 7`. Each slot carries
//! the same ownership descriptor as a frame (`user`, `va`, `refcount`), so
//! eviction moves a frame's identity into a slot and swap-in moves it
//! back. Swap I/O goes through the buffer cache but bypasses the log, and
//! is serialized by a global sleep-lock.

use core::sync::atomic::{AtomicU32, Ordering};

use bitmaps::Bitmap;

use crate::kernel::Kernel;
use crate::lock::{SleepLock, SpinLock};
use crate::param::{BLOCKS_PER_PAGE, BSIZE, NSWAPSLOT, ROOTDEV};
use crate::proc::KernelCtx;

#[derive(Copy, Clone)]
pub(crate) struct SlotMeta {
    pub available: bool,
    pub user: bool,
    pub va: usize,
    pub refcount: u32,
}

pub struct SwapSlot {
    info: SpinLock<SlotMeta>,
}

impl SwapSlot {
    fn new() -> Self {
        Self {
            info: SpinLock::new("swap_slot", SlotMeta {
                available: true,
                user: false,
                va: 0,
                refcount: 0,
            }),
        }
    }
}

/// Slots per bitmap bank (the widest map the bitmap type supports).
const BANK: usize = 1024;

struct SwapCtl {
    bitmap: [Bitmap<BANK>; NSWAPSLOT / BANK],
    pages_in_swap: usize,
}

impl SwapCtl {
    fn first_free(&self) -> Option<usize> {
        for (b, bank) in self.bitmap.iter().enumerate() {
            if let Some(i) = bank.first_false_index() {
                return Some(b * BANK + i);
            }
        }
        None
    }

    fn set(&mut self, spn: usize, used: bool) {
        let _ = self.bitmap[spn / BANK].set(spn % BANK, used);
    }
}

pub struct Swap {
    slots: Box<[SwapSlot]>,
    ctl: SpinLock<SwapCtl>,

    /// Serializes swap disk I/O.
    io: SleepLock<()>,

    /// First block of the swap region, from the superblock.
    base: AtomicU32,
}

impl Swap {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NSWAPSLOT);
        for _ in 0..NSWAPSLOT {
            slots.push(SwapSlot::new());
        }
        Self {
            slots: slots.into_boxed_slice(),
            ctl: SpinLock::new("swap", SwapCtl {
                bitmap: Default::default(),
                pages_in_swap: 0,
            }),
            io: SleepLock::new("swap_io", ()),
            base: AtomicU32::new(0),
        }
    }

    pub(crate) fn set_base(&self, swapstart: u32) {
        self.base.store(swapstart, Ordering::Relaxed);
    }

    fn block_of(&self, spn: usize, i: usize) -> u32 {
        let base = self.base.load(Ordering::Relaxed);
        assert!(base != 0, "swap: not initialized");
        base + (spn * BLOCKS_PER_PAGE + i) as u32
    }

    /// Claims a free slot from the bitmap.
    pub(crate) fn alloc_slot(&self) -> Result<usize, ()> {
        let mut ctl = self.ctl.lock();
        let spn = ctl.first_free().ok_or(())?;
        ctl.set(spn, true);
        drop(ctl);
        *self.slots[spn].info.lock() = SlotMeta {
            available: false,
            user: false,
            va: 0,
            refcount: 0,
        };
        Ok(spn)
    }

    pub(crate) fn set_meta(&self, spn: usize, user: bool, va: usize, refcount: u32) {
        let mut info = self.slots[spn].info.lock();
        info.user = user;
        info.va = va;
        info.refcount = refcount;
    }

    pub(crate) fn meta(&self, spn: usize) -> SlotMeta {
        *self.slots[spn].info.lock()
    }

    pub(crate) fn incref(&self, spn: usize) {
        self.slots[spn].info.lock().refcount += 1;
    }

    /// Drops one reference to a slot holding a swapped-out page; the last
    /// reference releases the slot and its page leaves the swap count.
    pub(crate) fn release_ref(&self, spn: usize) {
        let mut info = self.slots[spn].info.lock();
        if info.refcount <= 1 {
            *info = SlotMeta {
                available: true,
                user: false,
                va: 0,
                refcount: 0,
            };
            drop(info);
            let mut ctl = self.ctl.lock();
            ctl.set(spn, false);
            ctl.pages_in_swap -= 1;
        } else {
            info.refcount -= 1;
        }
    }

    /// Releases a slot whose contents (and references) moved back into a
    /// frame on swap-in. The swap count was adjusted by `read_page`.
    pub(crate) fn release_slot(&self, spn: usize) {
        *self.slots[spn].info.lock() = SlotMeta {
            available: true,
            user: false,
            va: 0,
            refcount: 0,
        };
        self.ctl.lock().set(spn, false);
    }

    /// Writes frame `ppn` into slot `spn`: 8 block writes through the
    /// cache, not journaled.
    pub(crate) fn write_page(&self, kernel: &Kernel, ctx: &KernelCtx<'_>, spn: usize, ppn: usize) {
        let io = self.io.lock(ctx);
        for i in 0..BLOCKS_PER_PAGE {
            let mut buf = kernel.bcache().read(ROOTDEV, self.block_of(spn, i), ctx);
            kernel
                .kmem()
                .read_frame(ppn, i * BSIZE, &mut buf.data_mut()[..]);
            buf.write();
        }
        drop(io);
        self.ctl.lock().pages_in_swap += 1;
    }

    /// Reads slot `spn` into frame `ppn` on swap-in; the page leaves the
    /// swap count.
    pub(crate) fn read_page(&self, kernel: &Kernel, ctx: &KernelCtx<'_>, spn: usize, ppn: usize) {
        self.read_page_copy(kernel, ctx, spn, ppn);
        self.ctl.lock().pages_in_swap -= 1;
    }

    /// Reads slot `spn` into frame `ppn` without releasing anything; used
    /// when duplicating a swapped page into a fresh resident copy.
    pub(crate) fn read_page_copy(
        &self,
        kernel: &Kernel,
        ctx: &KernelCtx<'_>,
        spn: usize,
        ppn: usize,
    ) {
        let _io = self.io.lock(ctx);
        for i in 0..BLOCKS_PER_PAGE {
            let buf = kernel.bcache().read(ROOTDEV, self.block_of(spn, i), ctx);
            kernel.kmem().write_frame(ppn, i * BSIZE, &buf.data()[..]);
        }
    }

    pub fn pages_in_swap(&self) -> usize {
        self.ctl.lock().pages_in_swap
    }

    /// Slot refcount audit hook for the conservation invariants.
    pub(crate) fn audit<F: FnMut(usize, u32)>(&self, mut f: F) {
        for (spn, slot) in self.slots.iter().enumerate() {
            let info = slot.info.lock();
            if !info.available {
                f(spn, info.refcount);
            }
        }
    }
}
