//! Physical page-frame allocator.
//!
//! One descriptor per frame: `{available, user, va, refcount}` behind a
//! per-frame spinlock, plus the pool counters. `refcount == 0` iff the
//! frame is available; the refcount counts every virtual mapping of the
//! frame across all processes, so COW sharing is a refcount bump and
//! `free` drops one reference, erasing the frame only at zero.
//!
//! When the free pool drops below the low-water mark, `alloc` first
//! evicts: pick a swap slot, choose a victim with a clock scan that skips
//! (and clears) recently accessed frames, write the victim out through
//! the buffer cache (bypassing the log), move all its references to the
//! slot, and free it.

use core::cell::UnsafeCell;

use crate::kernel::Kernel;
use crate::lock::SpinLock;
use crate::param::{KALLOC_LOW_WATER, PGSIZE};
use crate::proc::KernelCtx;

struct FrameInfo {
    available: bool,
    user: bool,
    va: usize,
    refcount: u32,
}

#[repr(align(8))]
struct PageBuf([u8; PGSIZE]);

pub struct Frame {
    info: SpinLock<FrameInfo>,
    data: UnsafeCell<PageBuf>,
}

// SAFETY: page contents are accessed only by the running kernel thread
// (one CPU) under the conventions documented on the data helpers.
unsafe impl Sync for Frame {}
unsafe impl Send for Frame {}

impl Frame {
    fn new() -> Self {
        Self {
            info: SpinLock::new("frame", FrameInfo {
                available: true,
                user: false,
                va: 0,
                refcount: 0,
            }),
            data: UnsafeCell::new(PageBuf([0; PGSIZE])),
        }
    }
}

struct KmemCtl {
    free_pages: usize,
    pages_in_use: usize,
    evict_cursor: usize,
}

pub struct Kmem {
    frames: Box<[Frame]>,
    ctl: SpinLock<KmemCtl>,
}

impl Kmem {
    pub fn new(nframes: usize) -> Self {
        let mut frames = Vec::with_capacity(nframes);
        for _ in 0..nframes {
            frames.push(Frame::new());
        }
        Self {
            frames: frames.into_boxed_slice(),
            ctl: SpinLock::new("kmem", KmemCtl {
                free_pages: nframes,
                pages_in_use: 0,
                evict_cursor: 0,
            }),
        }
    }

    pub fn nframes(&self) -> usize {
        self.frames.len()
    }

    /// Returns a zeroed page frame with refcount 1. Evicts to swap while
    /// the free pool sits below the low-water mark.
    pub fn alloc(&self, kernel: &Kernel, ctx: &KernelCtx<'_>) -> Result<usize, ()> {
        loop {
            let free = self.ctl.lock().free_pages;
            if free >= KALLOC_LOW_WATER {
                break;
            }
            if !self.evict(kernel, ctx) {
                break;
            }
        }

        for (i, frame) in self.frames.iter().enumerate() {
            let mut info = frame.info.lock();
            if info.available {
                info.available = false;
                info.user = false;
                info.va = 0;
                info.refcount = 1;
                drop(info);
                self.zero_frame(i);
                let mut ctl = self.ctl.lock();
                ctl.free_pages -= 1;
                ctl.pages_in_use += 1;
                return Ok(i);
            }
        }
        Err(())
    }

    /// Drops one reference; the last reference scrubs the frame and marks
    /// it available.
    pub fn free(&self, ppn: usize) {
        let mut info = self.frames[ppn].info.lock();
        if info.refcount <= 1 {
            info.available = true;
            info.user = false;
            info.va = 0;
            info.refcount = 0;
            drop(info);
            // Fill with junk to catch dangling refs.
            self.fill_frame(ppn, 2);
            let mut ctl = self.ctl.lock();
            ctl.free_pages += 1;
            ctl.pages_in_use -= 1;
        } else {
            info.refcount -= 1;
        }
    }

    pub fn incref(&self, ppn: usize) {
        self.frames[ppn].info.lock().refcount += 1;
    }

    pub fn refcount(&self, ppn: usize) -> u32 {
        self.frames[ppn].info.lock().refcount
    }

    /// Records that the frame backs user memory at `va`; makes it visible
    /// to the eviction clock.
    pub fn mark_user(&self, ppn: usize, va: usize) {
        let mut info = self.frames[ppn].info.lock();
        info.user = true;
        info.va = va;
    }

    /// Adopts a swap slot's ownership into this frame on swap-in.
    pub fn adopt(&self, ppn: usize, user: bool, va: usize, refcount: u32) {
        let mut info = self.frames[ppn].info.lock();
        info.user = user;
        info.va = va;
        info.refcount = refcount;
    }

    pub fn stats(&self) -> (usize, usize) {
        let ctl = self.ctl.lock();
        (ctl.free_pages, ctl.pages_in_use)
    }

    /// Picks a victim with the clock hand, writes it to a fresh swap
    /// slot, and frees it. False if no slot or no evictable frame exists.
    fn evict(&self, kernel: &Kernel, ctx: &KernelCtx<'_>) -> bool {
        let n = self.frames.len();
        let start = self.ctl.lock().evict_cursor;

        // Two trips: the first may only be clearing accessed bits.
        let mut victim = None;
        for k in 1..=2 * n {
            let i = (start + k) % n;
            let va = {
                let info = self.frames[i].info.lock();
                if info.available || !info.user {
                    continue;
                }
                info.va
            };
            if kernel.procs().any_accessed(va, i) {
                continue;
            }
            victim = Some((i, va));
            break;
        }
        let (i, va) = match victim {
            Some(v) => v,
            None => return false,
        };

        let spn = match kernel.swap().alloc_slot() {
            Ok(s) => s,
            Err(()) => return false,
        };

        // Move the frame's identity and references to the slot.
        let (user, refcount) = {
            let info = self.frames[i].info.lock();
            (info.user, info.refcount)
        };
        kernel.swap().set_meta(spn, user, va, refcount);

        // Copy the page to disk; swap data is not journaled.
        kernel.swap().write_page(kernel, ctx, spn, i);

        // All references now live in the slot; free the frame outright.
        self.frames[i].info.lock().refcount = 1;
        self.free(i);

        // Rewrite every VPI mapping this frame and invalidate.
        kernel.procs().retarget_to_swap(va, i, spn);

        self.ctl.lock().evict_cursor = i;
        true
    }

    // Frame contents. The single-CPU handoff makes these exclusive: only
    // the running kernel thread touches page data, and no caller keeps a
    // slice across a suspension point.

    pub(crate) fn write_frame(&self, ppn: usize, off: usize, src: &[u8]) {
        debug_assert!(off + src.len() <= PGSIZE);
        // SAFETY: see above.
        let data = unsafe { &mut *self.frames[ppn].data.get() };
        data.0[off..off + src.len()].copy_from_slice(src);
    }

    pub(crate) fn read_frame(&self, ppn: usize, off: usize, dst: &mut [u8]) {
        debug_assert!(off + dst.len() <= PGSIZE);
        // SAFETY: see above.
        let data = unsafe { &*self.frames[ppn].data.get() };
        dst.copy_from_slice(&data.0[off..off + dst.len()]);
    }

    pub(crate) fn copy_frame(&self, dst: usize, src: usize) {
        debug_assert_ne!(dst, src);
        // SAFETY: see above; dst and src are distinct frames.
        unsafe {
            let s = &*self.frames[src].data.get();
            let d = &mut *self.frames[dst].data.get();
            d.0.copy_from_slice(&s.0);
        }
    }

    pub(crate) fn zero_frame(&self, ppn: usize) {
        self.fill_frame(ppn, 0);
    }

    fn fill_frame(&self, ppn: usize, byte: u8) {
        // SAFETY: see above.
        let data = unsafe { &mut *self.frames[ppn].data.get() };
        data.0.fill(byte);
    }
}
