//! Page-fault routing.
//!
//! A faulting access resolves, in order: swap-in of a swapped page, COW
//! break of a shared frame (copy when other references remain, promote in
//! place when this is the last one), on-demand user-stack growth within
//! the window below 2 GiB, and otherwise a kill. The handler runs with no
//! locks held beyond those it explicitly takes on the victim descriptors.

use crate::param::{PGSIZE, SZ_2G, USTACK_PAGES};
use crate::proc::KernelCtx;
use crate::vm::{self, pgrounddown, RegionKind};

/// Resolves a fault at `va`. Ok means the access should be retried;
/// Err means the process has been marked killed.
pub(crate) fn page_fault(ctx: &KernelCtx<'_>, va: usize, write: bool) -> Result<(), ()> {
    let kernel = ctx.kernel();
    let va_page = pgrounddown(va);

    // SAFETY: short-lived snapshot of our own VPI.
    let vpi = unsafe { (*ctx.vspace_ptr()).lookup_vpi(va).copied() };

    if let Some(v) = vpi.filter(|v| v.used) {
        if !v.present && v.swapped {
            // Bring the page back from swap: the new frame adopts the
            // slot's ownership, every VPI naming the slot is retargeted,
            // and the slot is released.
            let spn = v.spn;
            let ppn = kernel.kmem().alloc(kernel, ctx)?;
            let meta = kernel.swap().meta(spn);
            kernel.kmem().adopt(ppn, meta.user, meta.va, meta.refcount);
            kernel.swap().read_page(kernel, ctx, spn, ppn);
            kernel.procs().retarget_to_mem(meta.va, spn, ppn);
            kernel.swap().release_slot(spn);
            return Ok(());
        }

        if v.present && v.cow {
            if !write {
                // A read of a resident COW page never faults; if we are
                // here the translation disagreed with the VPI.
                ctx.proc().kill();
                return Err(());
            }
            if kernel.kmem().refcount(v.ppn) > 1 {
                // Shared: copy to a private frame and retarget this VPI.
                let new = kernel.kmem().alloc(kernel, ctx)?;
                // The allocation may have evicted the shared frame under
                // us; if the VPI moved, drop the new frame and retry the
                // whole fault.
                // SAFETY: short-lived snapshot.
                let cur = unsafe { (*ctx.vspace_ptr()).lookup_vpi(va).copied() };
                match cur {
                    Some(c) if c.used && c.present && c.ppn == v.ppn => {}
                    _ => {
                        kernel.kmem().free(new);
                        return Ok(());
                    }
                }
                kernel.kmem().copy_frame(new, v.ppn);
                kernel.kmem().mark_user(new, va_page);
                // SAFETY: short-lived; no allocation below this point.
                unsafe {
                    let vs = &mut *ctx.vspace_ptr();
                    let vpi = vs.lookup_vpi_mut(va).ok_or(())?;
                    vpi.ppn = new;
                    vpi.writable = true;
                    vpi.cow = false;
                    vpi.swapped = false;
                    vs.invalidate();
                }
                kernel.kmem().free(v.ppn);
                return Ok(());
            } else {
                // Last reference: promote in place.
                // SAFETY: short-lived.
                unsafe {
                    let vs = &mut *ctx.vspace_ptr();
                    let vpi = vs.lookup_vpi_mut(va).ok_or(())?;
                    vpi.writable = true;
                    vpi.cow = false;
                    vs.invalidate();
                }
                return Ok(());
            }
        }
    }

    // On-demand stack growth within the window below the stack top.
    if va >= SZ_2G - USTACK_PAGES * PGSIZE && va < SZ_2G && growustack(ctx, va).is_ok() {
        return Ok(());
    }

    // Assume the process misbehaved.
    ctx.proc().kill();
    Err(())
}

/// Grows the user stack down one page at a time until it covers `va`,
/// up to the cap.
pub(crate) fn growustack(ctx: &KernelCtx<'_>, va: usize) -> Result<(), ()> {
    let kernel = ctx.kernel();
    loop {
        let bot = {
            // SAFETY: short-lived.
            let vs = unsafe { &*ctx.vspace_ptr() };
            let stack = vs.region(RegionKind::Stack);
            if va >= stack.bot() {
                return Ok(());
            }
            if stack.size >= USTACK_PAGES * PGSIZE {
                return Err(());
            }
            stack.bot()
        };
        // SAFETY: no reference into the vspace is live across the call.
        let _ = unsafe {
            vm::add_map(
                ctx.vspace_ptr(),
                kernel,
                ctx,
                RegionKind::Stack,
                bot - PGSIZE,
                PGSIZE,
                true,
                true,
                true,
            )?
        };
        // SAFETY: short-lived.
        unsafe {
            let vs = &mut *ctx.vspace_ptr();
            vs.region_mut(RegionKind::Stack).size += PGSIZE;
            vs.invalidate();
        }
    }
}
