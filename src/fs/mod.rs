//! File system implementation. Five layers:
//! * Blocks: an allocator handing out 8-block groups from the free bitmap.
//! * Log: crash recovery via the commit block (`log.rs`).
//! * Files: inode cache, extent-mapped reading and writing, metadata.
//! * Directories: the root directory's list of entries.
//! * Names: `/`-rooted paths resolving to an inode or its parent.
//!
//! Inodes live in the inode file, a single file whose contents are every
//! on-disk inode, indexed by inum; inum 0 is the inode file itself and
//! inum 1 the root directory. A file's data sits in up to 7 extents, each
//! one 8-block group from the bitmap. Writes go through the log; the
//! updated inode entry is rewritten after each write and the transaction
//! committed. There is no unlink, so disk blocks are never freed.

use core::sync::atomic::{AtomicUsize, Ordering};

use array_macro::array;
use core::cell::UnsafeCell;
use zerocopy::{AsBytes, FromBytes};

mod log;
mod path;
mod stat;
mod superblock;

pub(crate) use self::log::Log;
pub(crate) use path::{FileName, Path};
pub use stat::{Stat, T_DEV, T_DIR, T_FILE};
pub(crate) use superblock::Superblock;

use crate::kernel::Kernel;
use crate::lock::{SleepLock, SleepLockGuard, SpinLock};
use crate::param::{BSIZE, DIRSIZ, EXTENT_BLOCKS, INODEFILEINO, NEXTENT, NINODE, ROOTDEV, ROOTINO};
use crate::proc::KernelCtx;
use crate::vm::UVAddr;

/// A contiguous run of data blocks.
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct Extent {
    pub start: u32,
    pub nblocks: u32,
}

/// On-disk inode structure.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub(crate) struct Dinode {
    pub typ: i16,
    pub devid: i16,
    pub size: u32,
    pub data: [Extent; NEXTENT],
}

impl Default for Dinode {
    fn default() -> Self {
        Self {
            typ: 0,
            devid: 0,
            size: 0,
            data: [Extent::default(); NEXTENT],
        }
    }
}

pub(crate) const DINODE_SIZE: usize = core::mem::size_of::<Dinode>();
static_assertions::const_assert_eq!(DINODE_SIZE, 64);

/// Byte offset of inode `inum` in the inode file.
pub(crate) const fn inode_off(inum: u16) -> u32 {
    inum as u32 * DINODE_SIZE as u32
}

/// Largest file the extent array can map.
pub(crate) const MAX_FILE_BYTES: u32 = (NEXTENT as u32) * EXTENT_BLOCKS * BSIZE as u32;

/// A directory entry.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub(crate) struct Dirent {
    pub inum: u16,
    pub name: [u8; DIRSIZ],
}

impl Default for Dirent {
    fn default() -> Self {
        Self {
            inum: 0,
            name: [0; DIRSIZ],
        }
    }
}

static_assertions::const_assert_eq!(core::mem::size_of::<Dirent>(), 16);

impl Dirent {
    pub fn set_name(&mut self, name: &FileName) {
        let bytes = name.as_bytes();
        self.name = [0; DIRSIZ];
        self.name[..bytes.len()].copy_from_slice(bytes);
    }

    fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(DIRSIZ);
        &self.name[..len]
    }
}

/// Reads a typed on-disk record from the head of `bytes`.
pub(crate) fn read_obj<T: AsBytes + FromBytes + Default>(bytes: &[u8]) -> T {
    let mut val = T::default();
    let n = core::mem::size_of::<T>();
    val.as_bytes_mut().copy_from_slice(&bytes[..n]);
    val
}

/// Writes a typed on-disk record at the head of `bytes`.
pub(crate) fn write_obj<T: AsBytes>(bytes: &mut [u8], val: &T) {
    let n = core::mem::size_of::<T>();
    bytes[..n].copy_from_slice(val.as_bytes());
}

/// In-memory copy of an inode's disk half.
#[derive(Copy, Clone)]
pub(crate) struct InodeInner {
    pub typ: i16,
    pub devid: i16,
    pub size: u32,
    pub data: [Extent; NEXTENT],
}

impl InodeInner {
    const fn empty() -> Self {
        Self {
            typ: 0,
            devid: 0,
            size: 0,
            data: [Extent { start: 0, nblocks: 0 }; NEXTENT],
        }
    }

    fn from_dinode(d: &Dinode) -> Self {
        Self {
            typ: d.typ,
            devid: d.devid,
            size: d.size,
            data: d.data,
        }
    }

    pub fn dinode(&self) -> Dinode {
        Dinode {
            typ: self.typ,
            devid: self.devid,
            size: self.size,
            data: self.data,
        }
    }

    /// Sum of the extents' capacities.
    pub fn capacity(&self) -> u32 {
        self.data.iter().map(|e| e.nblocks * BSIZE as u32).sum()
    }
}

/// The device block and in-block offset holding byte `pos`.
fn block_of(extents: &[Extent; NEXTENT], pos: usize) -> Option<(u32, usize)> {
    let mut prefix = 0usize;
    for e in extents.iter() {
        let cap = e.nblocks as usize * BSIZE;
        if pos < prefix + cap {
            let rel = pos - prefix;
            return Some((e.start + (rel / BSIZE) as u32, rel % BSIZE));
        }
        prefix += cap;
    }
    None
}

struct IMeta {
    refcnt: u32,
    dev: u32,
    inum: u16,
}

struct ISlot {
    /// Guarded by the inode-cache lock.
    meta: UnsafeCell<IMeta>,
    inner: SleepLock<InodeInner>,
}

// SAFETY: meta is guarded by Itable.lock; inner by its sleep-lock.
unsafe impl Sync for ISlot {}
unsafe impl Send for ISlot {}

impl ISlot {
    fn new() -> Self {
        Self {
            meta: UnsafeCell::new(IMeta {
                refcnt: 0,
                dev: 0,
                inum: 0,
            }),
            inner: SleepLock::new("inode", InodeInner::empty()),
        }
    }
}

/// The in-memory inode cache.
pub struct Itable {
    lock: SpinLock<()>,
    slots: Box<[ISlot; NINODE]>,
    /// The inode file's in-memory inode, locked before any per-inode lock.
    inodefile: SleepLock<InodeInner>,
    /// Cache slot of the pinned root directory.
    root: AtomicUsize,
}

impl Itable {
    pub(crate) fn new() -> Self {
        Self {
            lock: SpinLock::new("icache", ()),
            slots: Box::new(array![_ => ISlot::new(); NINODE]),
            inodefile: SleepLock::new("inodefile", InodeInner::empty()),
            root: AtomicUsize::new(usize::MAX),
        }
    }

    /// Loads the inode file's inode from disk and pins the root directory.
    /// Called once at boot, after log recovery.
    pub(crate) fn init(&self, kernel: &Kernel, ctx: &KernelCtx<'_>) {
        let sb = kernel.fs().sb();
        let di: Dinode = {
            let buf = kernel.bcache().read(ROOTDEV, sb.inodestart, ctx);
            read_obj(&buf.data()[..])
        };
        assert!(di.typ != 0, "fs: no inode file");
        {
            let mut g = self.inodefile.lock(ctx);
            *g = InodeInner::from_dinode(&di);
        }
        let root = self
            .iget(kernel, ROOTDEV, ROOTINO, ctx)
            .expect("fs: no root directory");
        self.root.store(root, Ordering::Relaxed);
    }

    fn lock_inodefile<'s>(&'s self, ctx: &KernelCtx<'s>) -> InodeGuard<'s> {
        InodeGuard {
            guard: self.inodefile.lock(ctx),
            dev: ROOTDEV,
            inum: INODEFILEINO,
        }
    }

    fn read_dinode(&self, inum: u16, ctx: &KernelCtx<'_>) -> Result<Dinode, ()> {
        let mut inofile = self.lock_inodefile(ctx);
        let mut di = Dinode::default();
        let n = inofile.read_kernel(di.as_bytes_mut(), inode_off(inum), ctx)?;
        if n != DINODE_SIZE {
            return Err(());
        }
        Ok(di)
    }

    /// Finds the inode (dev, inum), loading it from disk into a cache
    /// slot if necessary, and takes a reference.
    pub(crate) fn iget(
        &self,
        kernel: &Kernel,
        dev: u32,
        inum: u16,
        ctx: &KernelCtx<'_>,
    ) -> Result<usize, ()> {
        let claimed = {
            let _g = self.lock.lock();
            let mut empty = None;
            let mut hit = None;
            for i in 0..NINODE {
                // SAFETY: the cache lock is held.
                let m = unsafe { &mut *self.slots[i].meta.get() };
                if m.refcnt > 0 && m.dev == dev && m.inum == inum {
                    m.refcnt += 1;
                    hit = Some(i);
                    break;
                }
                if empty.is_none() && m.refcnt == 0 {
                    empty = Some(i);
                }
            }
            if let Some(i) = hit {
                return Ok(i);
            }
            let i = empty.ok_or(())?;
            // SAFETY: the cache lock is held.
            let m = unsafe { &mut *self.slots[i].meta.get() };
            *m = IMeta {
                refcnt: 1,
                dev,
                inum,
            };
            i
        };

        let di = match self.read_dinode(inum, ctx) {
            Ok(di) => di,
            Err(()) => {
                self.irelease(claimed);
                return Err(());
            }
        };
        assert!(di.typ != 0, "iget: no type");
        let mut g = self.slots[claimed].inner.lock(ctx);
        *g = InodeInner::from_dinode(&di);
        drop(g);
        Ok(claimed)
    }

    /// Increments the reference count; returns the slot for the
    /// `let ip = itable.idup(ip)` idiom.
    pub(crate) fn idup(&self, idx: usize) -> usize {
        let _g = self.lock.lock();
        // SAFETY: the cache lock is held.
        unsafe { (*self.slots[idx].meta.get()).refcnt += 1 };
        idx
    }

    /// Drops an in-memory reference; the last one makes the slot
    /// recyclable.
    pub(crate) fn irelease(&self, idx: usize) {
        let _g = self.lock.lock();
        // SAFETY: the cache lock is held.
        let m = unsafe { &mut *self.slots[idx].meta.get() };
        if m.refcnt == 1 {
            // The cached copy is no longer trustworthy once recycled.
            // SAFETY: we hold the last reference, so no guard exists.
            unsafe { (*self.slots[idx].inner.get_mut_raw()).typ = 0 };
        }
        m.refcnt -= 1;
    }

    pub(crate) fn ident(&self, idx: usize) -> (u32, u16) {
        let _g = self.lock.lock();
        // SAFETY: the cache lock is held.
        let m = unsafe { &*self.slots[idx].meta.get() };
        (m.dev, m.inum)
    }

    /// The pinned root directory, with a fresh reference.
    pub(crate) fn idup_root(&self) -> usize {
        let root = self.root.load(Ordering::Relaxed);
        assert!(root != usize::MAX, "fs: not initialized");
        self.idup(root)
    }

    /// Locks an inode for reading or writing its disk half.
    pub(crate) fn lock<'s>(&'s self, idx: usize, ctx: &KernelCtx<'s>) -> InodeGuard<'s> {
        let (dev, inum) = self.ident(idx);
        InodeGuard {
            guard: self.slots[idx].inner.lock(ctx),
            dev,
            inum,
        }
    }
}

/// A locked inode.
pub(crate) struct InodeGuard<'s> {
    guard: SleepLockGuard<'s, InodeInner>,
    dev: u32,
    inum: u16,
}

impl core::ops::Deref for InodeGuard<'_> {
    type Target = InodeInner;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl core::ops::DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl InodeGuard<'_> {
    pub(crate) fn inum(&self) -> u16 {
        self.inum
    }

    pub(crate) fn stat(&self) -> Stat {
        Stat::new(self.dev, self.inum as u32, self.typ, self.size)
    }

    /// Reads up to `dst.len()` bytes at `off` into kernel memory.
    /// Returns the byte count, which is short at end of file.
    pub(crate) fn read_kernel(
        &mut self,
        dst: &mut [u8],
        off: u32,
        ctx: &KernelCtx<'_>,
    ) -> Result<usize, ()> {
        let kernel = ctx.kernel();
        if off > self.size {
            return Err(());
        }
        let n = dst.len().min((self.size - off) as usize);
        let mut tot = 0;
        while tot < n {
            let pos = off as usize + tot;
            let (bno, boff) = block_of(&self.data, pos).ok_or(())?;
            let m = (n - tot).min(BSIZE - boff);
            let buf = kernel.bcache().read(self.dev, bno, ctx);
            dst[tot..tot + m].copy_from_slice(&buf.data()[boff..boff + m]);
            tot += m;
        }
        Ok(n)
    }

    /// Reads a typed record at `off`; errors on a short read.
    pub(crate) fn read_obj<T: AsBytes + FromBytes + Default>(
        &mut self,
        off: u32,
        ctx: &KernelCtx<'_>,
    ) -> Result<T, ()> {
        let mut val = T::default();
        let n = self.read_kernel(val.as_bytes_mut(), off, ctx)?;
        if n != core::mem::size_of::<T>() {
            return Err(());
        }
        Ok(val)
    }

    /// Reads up to `n` bytes at `off` into user memory at `dst`.
    pub(crate) fn read_user(
        &mut self,
        ctx: &KernelCtx<'_>,
        dst: UVAddr,
        off: u32,
        n: u32,
    ) -> Result<usize, ()> {
        let kernel = ctx.kernel();
        if off > self.size {
            return Err(());
        }
        let n = (n.min(self.size - off)) as usize;
        let mut tot = 0;
        while tot < n {
            let pos = off as usize + tot;
            let (bno, boff) = block_of(&self.data, pos).ok_or(())?;
            let m = (n - tot).min(BSIZE - boff);
            let mut tmp = [0u8; BSIZE];
            {
                let buf = kernel.bcache().read(self.dev, bno, ctx);
                tmp[..m].copy_from_slice(&buf.data()[boff..boff + m]);
            }
            // The buffer is released before the copy-out, which may fault
            // into swap I/O.
            ctx.copy_out(dst.add(tot), &tmp[..m])?;
            tot += m;
        }
        Ok(n)
    }

    /// Stages a write of `src` at `off` into the current transaction,
    /// allocating fresh 8-block groups when the write extends past the
    /// mapped capacity. The caller commits (or aborts).
    pub(crate) fn write_kernel(
        &mut self,
        src: &[u8],
        off: u32,
        ctx: &KernelCtx<'_>,
    ) -> Result<usize, ()> {
        let kernel = ctx.kernel();
        let n = src.len() as u32;
        let end = off.checked_add(n).ok_or(())?;
        if end > MAX_FILE_BYTES {
            return Err(());
        }

        // Grab groups from the free bitmap until the extents cover `end`,
        // one extent per group.
        while self.capacity() < end {
            if !self.data.iter().any(|e| e.nblocks == 0) {
                return Err(());
            }
            let start = balloc_group(kernel, ctx)?;
            let slot = self.data.iter_mut().find(|e| e.nblocks == 0).unwrap();
            *slot = Extent {
                start,
                nblocks: EXTENT_BLOCKS,
            };
        }

        let mut tot = 0;
        while tot < src.len() {
            let pos = off as usize + tot;
            let (bno, boff) = block_of(&self.data, pos).ok_or(())?;
            let m = (src.len() - tot).min(BSIZE - boff);
            let mut buf = kernel.bcache().read(self.dev, bno, ctx);
            buf.data_mut()[boff..boff + m].copy_from_slice(&src[tot..tot + m]);
            kernel.fs().log.write(ctx, &mut buf);
            tot += m;
        }

        if end > self.size {
            self.size = end;
        }
        Ok(src.len())
    }

    /// Stages a write of `n` bytes from user memory at `src`.
    pub(crate) fn write_user(
        &mut self,
        ctx: &KernelCtx<'_>,
        src: UVAddr,
        off: u32,
        n: u32,
    ) -> Result<usize, ()> {
        let mut tot = 0usize;
        while tot < n as usize {
            let m = (n as usize - tot).min(BSIZE);
            let mut tmp = [0u8; BSIZE];
            // Copy in first: the fault paths must not run under buffer
            // locks.
            ctx.copy_in(src.add(tot), &mut tmp[..m])?;
            let _ = self.write_kernel(&tmp[..m], off + tot as u32, ctx)?;
            tot += m;
        }
        Ok(n as usize)
    }
}

/// Claims a free 8-block group from the bitmap, scanning backward from
/// the last bitmap block; a zero byte marks a free group. The bitmap
/// update is staged in the current transaction. Returns the group's
/// first block.
fn balloc_group(kernel: &Kernel, ctx: &KernelCtx<'_>) -> Result<u32, ()> {
    let sb = kernel.fs().sb();
    for bb in (sb.bmapstart..sb.inodestart).rev() {
        let mut buf = kernel.bcache().read(ROOTDEV, bb, ctx);
        for j in (0..BSIZE).rev() {
            if buf.data()[j] == 0x00 {
                buf.data_mut()[j] = 0xFF;
                kernel.fs().log.write(ctx, &mut buf);
                let group = (bb - sb.bmapstart) * BSIZE as u32 + j as u32;
                return Ok(sb.inodestart + group * EXTENT_BLOCKS);
            }
        }
    }
    Err(())
}

/// Rewrites inode `inum`'s entry in the inode file from `inner`, staged
/// into the current transaction.
fn write_dinode(
    inofile: &mut InodeGuard<'_>,
    inum: u16,
    inner: &InodeInner,
    ctx: &KernelCtx<'_>,
) -> Result<(), ()> {
    let di = inner.dinode();
    let _ = inofile.write_kernel(di.as_bytes(), inode_off(inum), ctx)?;
    Ok(())
}

/// Looks for `name` in directory `dp`. Returns the entry's inum.
fn dirlookup(
    dp: &mut InodeGuard<'_>,
    kernel: &Kernel,
    name: &FileName,
    ctx: &KernelCtx<'_>,
) -> Result<Option<u16>, ()> {
    assert_eq!(dp.typ, T_DIR, "dirlookup not DIR");
    let mut off = 0;
    while off < dp.size {
        let de: Dirent = dp.read_obj(off, ctx)?;
        if de.inum != 0 && de.name_bytes() == name.as_bytes() {
            return Ok(Some(de.inum));
        }
        off += core::mem::size_of::<Dirent>() as u32;
    }
    Ok(None)
}

/// Resolves `path` to a referenced inode slot.
pub(crate) fn namei(kernel: &Kernel, ctx: &KernelCtx<'_>, path: &Path<'_>) -> Result<usize, ()> {
    let itable = kernel.itable();
    let mut cur = itable.idup_root();
    for name in path.elements() {
        let found = {
            let mut dp = itable.lock(cur, ctx);
            if dp.typ != T_DIR {
                None
            } else {
                dirlookup(&mut dp, kernel, &name, ctx)?
            }
        };
        match found {
            Some(inum) => {
                let next = itable.iget(kernel, ROOTDEV, inum, ctx);
                itable.irelease(cur);
                cur = next?;
            }
            None => {
                itable.irelease(cur);
                return Err(());
            }
        }
    }
    Ok(cur)
}

/// Resolves `path` to its parent directory and final element.
pub(crate) fn nameiparent(
    kernel: &Kernel,
    ctx: &KernelCtx<'_>,
    path: &Path<'_>,
) -> Result<(usize, FileName), ()> {
    let itable = kernel.itable();
    let mut elems = path.elements();
    let mut last = match elems.next() {
        Some(e) => e,
        None => return Err(()),
    };
    let mut cur = itable.idup_root();
    for next in elems {
        let found = {
            let mut dp = itable.lock(cur, ctx);
            if dp.typ != T_DIR {
                None
            } else {
                dirlookup(&mut dp, kernel, &last, ctx)?
            }
        };
        match found {
            Some(inum) => {
                let n = itable.iget(kernel, ROOTDEV, inum, ctx);
                itable.irelease(cur);
                cur = n?;
                last = next;
            }
            None => {
                itable.irelease(cur);
                return Err(());
            }
        }
    }
    Ok((cur, last))
}

/// Creates a regular file at `path`: appends a fresh inode to the inode
/// file and a directory entry to the parent, in one transaction. Returns
/// the new inode, referenced.
pub(crate) fn create(kernel: &Kernel, ctx: &KernelCtx<'_>, path: &Path<'_>) -> Result<usize, ()> {
    let itable = kernel.itable();
    let fsys = kernel.fs();
    let (parent, name) = nameiparent(kernel, ctx, path)?;

    let created = (|| -> Result<u16, ()> {
        let mut inofile = itable.lock_inodefile(ctx);

        // Append the new on-disk inode.
        let inum = (inofile.size as usize / DINODE_SIZE) as u16;
        let di = Dinode {
            typ: T_FILE,
            devid: 0,
            size: 0,
            data: [Extent::default(); NEXTENT],
        };
        let off = inofile.size;
        let _ = inofile.write_kernel(di.as_bytes(), off, ctx)?;

        // Append the directory entry.
        let mut de = Dirent::default();
        de.inum = inum;
        de.set_name(&name);
        let mut dp = itable.lock(parent, ctx);
        let doff = dp.size;
        let _ = dp.write_kernel(de.as_bytes(), doff, ctx)?;
        let dsnap = *dp;
        let dinum = dp.inum();
        drop(dp);

        // Rewrite the parent's entry, then the inode file's own entry
        // (its size, and possibly extents, changed).
        write_dinode(&mut inofile, dinum, &dsnap, ctx)?;
        let self_snap = *inofile;
        write_dinode(&mut inofile, INODEFILEINO, &self_snap, ctx)?;
        Ok(inum)
    })();

    itable.irelease(parent);
    let inum = match created {
        Ok(inum) => inum,
        Err(()) => {
            fsys.log.abort(kernel, ctx);
            return Err(());
        }
    };
    fsys.log.commit(kernel, ctx);

    itable.iget(kernel, ROOTDEV, inum, ctx)
}

/// Reads from an open disk file into user memory. The shared offset in
/// the file's global slot is read and advanced under the inode's lock, so
/// readers of one slot serialize. Device inodes route through the device
/// table.
pub(crate) fn read_file(
    kernel: &Kernel,
    ctx: &KernelCtx<'_>,
    idx: usize,
    gfd: usize,
    dst: UVAddr,
    n: u32,
) -> Result<usize, ()> {
    let itable = kernel.itable();
    let mut ip = itable.lock(idx, ctx);
    if ip.typ == T_DEV {
        let devid = ip.devid;
        drop(ip);
        let dev = kernel.devsw(devid).ok_or(())?;
        let read = dev.read.ok_or(())?;
        let r = read(ctx, dst, n as usize)?;
        kernel.ftable().advance(gfd, r as u32);
        return Ok(r);
    }
    let off = kernel.ftable().offset(gfd)?;
    if off >= ip.size && n > 0 {
        // End of file.
        return Ok(0);
    }
    let r = ip.read_user(ctx, dst, off, n)?;
    kernel.ftable().advance(gfd, r as u32);
    Ok(r)
}

/// Writes user memory to an open disk file at its shared offset, rewrites
/// the file's inode-file entry, and commits — one transaction per call.
/// Device inodes route through the device table.
pub(crate) fn write_file(
    kernel: &Kernel,
    ctx: &KernelCtx<'_>,
    idx: usize,
    gfd: usize,
    src: UVAddr,
    n: u32,
) -> Result<usize, ()> {
    let itable = kernel.itable();
    let fsys = kernel.fs();

    // The inode file's lock comes first: the dinode rewrite below needs
    // it, and the lock order puts it before any per-inode lock.
    let mut inofile = itable.lock_inodefile(ctx);
    let mut ip = itable.lock(idx, ctx);
    if ip.typ == T_DEV {
        let devid = ip.devid;
        drop(ip);
        drop(inofile);
        let dev = kernel.devsw(devid).ok_or(())?;
        let write = dev.write.ok_or(())?;
        let r = write(ctx, src, n as usize)?;
        kernel.ftable().advance(gfd, r as u32);
        return Ok(r);
    }

    let res = kernel.ftable().offset(gfd).and_then(|off| {
        let r = ip.write_user(ctx, src, off, n)?;
        kernel.ftable().advance(gfd, r as u32);
        Ok(r)
    });
    let snap = *ip;
    let inum = ip.inum();
    drop(ip);

    let res = res.and_then(|r| {
        if inum != INODEFILEINO {
            write_dinode(&mut inofile, inum, &snap, ctx)?;
        }
        Ok(r)
    });
    drop(inofile);

    match res {
        Ok(r) => {
            fsys.log.commit(kernel, ctx);
            Ok(r)
        }
        Err(()) => {
            fsys.log.abort(kernel, ctx);
            Err(())
        }
    }
}

/// Copies stat information out of a disk inode.
pub(crate) fn stat_disk(kernel: &Kernel, ctx: &KernelCtx<'_>, idx: usize) -> Stat {
    let ip = kernel.itable().lock(idx, ctx);
    ip.stat()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extents(list: &[(u32, u32)]) -> [Extent; NEXTENT] {
        let mut data = [Extent::default(); NEXTENT];
        for (i, &(start, nblocks)) in list.iter().enumerate() {
            data[i] = Extent { start, nblocks };
        }
        data
    }

    #[test]
    fn extent_addressing() {
        // Two groups: blocks 100..107 and 900..907.
        let data = extents(&[(100, 8), (900, 8)]);
        assert_eq!(block_of(&data, 0), Some((100, 0)));
        assert_eq!(block_of(&data, 511), Some((100, 511)));
        assert_eq!(block_of(&data, 512), Some((101, 0)));
        assert_eq!(block_of(&data, 8 * 512 - 1), Some((107, 511)));
        // The first byte past the first extent lands in the second.
        assert_eq!(block_of(&data, 8 * 512), Some((900, 0)));
        assert_eq!(block_of(&data, 8 * 512 + 513), Some((901, 1)));
        assert_eq!(block_of(&data, 16 * 512), None);
    }

    #[test]
    fn capacity_sums_extents() {
        let inner = InodeInner {
            typ: T_FILE,
            devid: 0,
            size: 0,
            data: extents(&[(10, 8), (50, 8), (90, 8)]),
        };
        assert_eq!(inner.capacity(), 3 * 8 * 512);
        assert_eq!(MAX_FILE_BYTES, 7 * 8 * 512);
    }

    #[test]
    fn dirent_names() {
        let mut de = Dirent::default();
        de.set_name(&FileName::from_bytes(b"notes.txt"));
        assert_eq!(de.name_bytes(), b"notes.txt");
        de.set_name(&FileName::from_bytes(b"exactly14chars"));
        assert_eq!(de.name_bytes(), b"exactly14chars");
        assert_eq!(de.name_bytes().len(), DIRSIZ);
    }

    #[test]
    fn dinode_round_trips_through_bytes() {
        use zerocopy::AsBytes;
        let di = Dinode {
            typ: T_FILE,
            devid: 0,
            size: 4242,
            data: extents(&[(11, 8)]),
        };
        let back: Dinode = read_obj(di.as_bytes());
        assert_eq!(back.typ, T_FILE);
        assert_eq!(back.size, 4242);
        assert_eq!(back.data[0].start, 11);
        assert_eq!(back.data[6].nblocks, 0);
    }
}

/// The file system: the superblock once read, and the log.
pub struct FileSystem {
    sb: SpinLock<Option<Superblock>>,
    pub(crate) log: Log,
}

impl FileSystem {
    pub(crate) fn new() -> Self {
        Self {
            sb: SpinLock::new("fs", None),
            log: Log::new(),
        }
    }

    pub(crate) fn sb(&self) -> Superblock {
        self.sb.lock().expect("fs: superblock not read")
    }

    /// Boot-time initialization: read the superblock, replay the log if a
    /// committed transaction survived the crash, then load the inode file
    /// and root directory. Runs in the context of the first process.
    pub(crate) fn init(&self, kernel: &Kernel, ctx: &KernelCtx<'_>) {
        let sb: Superblock = {
            let buf = kernel.bcache().read(ROOTDEV, 1, ctx);
            read_obj(&buf.data()[..])
        };
        assert!(sb.size > 0, "fs: bad superblock");
        *self.sb.lock() = Some(sb);
        kernel.swap().set_base(sb.swapstart);
        self.log.recover(kernel, ctx);
        kernel.itable().init(kernel, ctx);
    }
}
