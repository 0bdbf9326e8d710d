use std::sync::Arc;

use zerocopy::{AsBytes, FromBytes};

use super::{Proc, ProcData, ProcExit, Pid, Trapframe};
use crate::kernel::Kernel;
use crate::param::{PGSIZE, SZ_2G};
use crate::trap;
use crate::vm::{UVAddr, Vspace};

/// The kernel context of the current process: the receiver for syscalls
/// and for all user-memory traffic. One exists per process thread.
pub struct KernelCtx<'a> {
    kernel: &'a Arc<Kernel>,
    idx: usize,
}

impl<'a> KernelCtx<'a> {
    pub(crate) fn new(kernel: &'a Arc<Kernel>, idx: usize) -> Self {
        Self { kernel, idx }
    }

    pub fn kernel(&self) -> &'a Kernel {
        self.kernel
    }

    pub(crate) fn kernel_arc(&self) -> &'a Arc<Kernel> {
        self.kernel
    }

    pub(crate) fn proc(&self) -> &'a Proc {
        self.kernel().procs().get(self.idx)
    }

    pub(crate) fn proc_idx(&self) -> usize {
        self.idx
    }

    pub fn pid(&self) -> Pid {
        // SAFETY: a process's pid is stable for the lifetime of its thread.
        unsafe { (*self.proc().info.get()).pid }
    }

    pub fn killed(&self) -> bool {
        self.proc().killed()
    }

    /// The current process's private data.
    ///
    /// Returned as a raw pointer: accesses must be short-lived, and none
    /// may be live across a frame allocation or suspension point, since
    /// eviction rewrites VPIs through the process table.
    pub(crate) fn data_ptr(&self) -> *mut ProcData {
        self.proc().data.get()
    }

    pub(crate) fn vspace_ptr(&self) -> *mut Vspace {
        // SAFETY: only projecting a field address.
        unsafe { &mut (*self.data_ptr()).vspace as *mut Vspace }
    }

    pub fn trapframe(&self) -> Trapframe {
        // SAFETY: our own data; Trapframe is Copy.
        unsafe { (*self.data_ptr()).tf }
    }

    /// Terminates the current process with `status`. Unwinds to the
    /// process thread's exit path; never returns.
    pub fn exit(&self, status: i32) -> ! {
        std::panic::resume_unwind(Box::new(ProcExit(status)))
    }

    /// The trap boundary: observe a pending kill, then give other
    /// processes a scheduling round (the hosted stand-in for timer
    /// preemption of user code). Every syscall passes through here.
    pub(crate) fn trap_boundary(&self) {
        if self.killed() {
            self.exit(-1);
        }
        self.kernel().procs().yield_now(self);
    }

    /// Translates `va` for an access, faulting as needed (swap-in, COW
    /// break, stack growth). Returns the frame and offset within it.
    fn resolve(&self, va: usize, write: bool) -> Result<(usize, usize), ()> {
        if va >= SZ_2G {
            return Err(());
        }
        // A fault may leave a second one to take (swap-in of a COW page,
        // then the COW break), so retry a bounded number of times.
        for _ in 0..4 {
            // SAFETY: short-lived access to our own vspace.
            let hit = unsafe { (*self.vspace_ptr()).pgtbl_translate(va, write) };
            if let Some(ppn) = hit {
                return Ok((ppn, va % PGSIZE));
            }
            trap::page_fault(self, va, write)?;
        }
        Err(())
    }

    /// Copies `src` into the current address space at `va`. This is the
    /// kernel's only path into user memory, so COW breaks, swap-ins, and
    /// stack growth all happen here exactly as for a user-mode store.
    pub fn copy_out(&self, va: UVAddr, src: &[u8]) -> Result<(), ()> {
        let mut va = va.value();
        let mut src = src;
        while !src.is_empty() {
            let (ppn, off) = self.resolve(va, true)?;
            let n = core::cmp::min(src.len(), PGSIZE - off);
            self.kernel().kmem().write_frame(ppn, off, &src[..n]);
            src = &src[n..];
            va += n;
        }
        Ok(())
    }

    /// Copies from the current address space at `va` into `dst`.
    pub fn copy_in(&self, va: UVAddr, dst: &mut [u8]) -> Result<(), ()> {
        let mut va = va.value();
        let mut dst = dst;
        while !dst.is_empty() {
            let (ppn, off) = self.resolve(va, false)?;
            let n = core::cmp::min(dst.len(), PGSIZE - off);
            self.kernel().kmem().read_frame(ppn, off, &mut dst[..n]);
            let rest = dst;
            dst = &mut rest[n..];
            va += n;
        }
        Ok(())
    }

    /// Fetches a NUL-terminated string of at most `max` bytes (excluding
    /// the NUL) from user memory. The range is validated page by page, so
    /// an unterminated or stray pointer fails the syscall instead of
    /// killing the process.
    pub fn copy_in_str(&self, va: UVAddr, max: usize) -> Result<Vec<u8>, ()> {
        let mut out = Vec::new();
        let mut va = va.value();
        loop {
            if !self.user_range_ok(UVAddr::new(va), 1) {
                return Err(());
            }
            let (ppn, off) = self.resolve(va, false)?;
            let n = PGSIZE - off;
            let mut chunk = vec![0u8; core::cmp::min(n, max + 1 - out.len())];
            self.kernel().kmem().read_frame(ppn, off, &mut chunk);
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
            if out.len() > max {
                return Err(());
            }
            va += n;
        }
    }

    /// Copies a typed record out to user memory.
    pub fn copy_out_obj<T: AsBytes>(&self, va: UVAddr, obj: &T) -> Result<(), ()> {
        self.copy_out(va, obj.as_bytes())
    }

    /// Copies a typed record in from user memory.
    pub fn copy_in_obj<T: AsBytes + FromBytes + Default>(&self, va: UVAddr) -> Result<T, ()> {
        let mut obj = T::default();
        self.copy_in(va, obj.as_bytes_mut())?;
        Ok(obj)
    }

    /// Whether `[va, va+len)` lies within the mapped regions of the
    /// current address space. Syscalls use this to reject bad user
    /// pointers before any side effect.
    pub(crate) fn user_range_ok(&self, va: UVAddr, len: usize) -> bool {
        // SAFETY: short-lived access to our own vspace.
        unsafe { (*self.vspace_ptr()).contains_range(va.value(), len) }
    }

    pub(crate) fn fd_alloc(&self, gfd: usize) -> Result<i32, ()> {
        // SAFETY: our own data.
        let data = unsafe { &mut *self.data_ptr() };
        for (fd, slot) in data.files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(gfd);
                return Ok(fd as i32);
            }
        }
        Err(())
    }

    pub(crate) fn fd_get(&self, fd: i32) -> Result<usize, ()> {
        if fd < 0 || fd as usize >= crate::param::NOFILE {
            return Err(());
        }
        // SAFETY: our own data.
        let data = unsafe { &*self.data_ptr() };
        data.files[fd as usize].ok_or(())
    }

    pub(crate) fn fd_clear(&self, fd: i32) -> Result<usize, ()> {
        if fd < 0 || fd as usize >= crate::param::NOFILE {
            return Err(());
        }
        // SAFETY: our own data.
        let data = unsafe { &mut *self.data_ptr() };
        data.files[fd as usize].take().ok_or(())
    }
}
