//! Virtual address spaces.
//!
//! A `Vspace` is the kernel's software view of a user address space:
//! three regions (CODE and HEAP growing up, USTACK growing down from
//! 2 GiB), each holding per-page `Vpi` records in a chained list of
//! fixed-capacity nodes. The hardware page table is simulated as a map
//! from virtual page number to a PTE word carrying present/writable/user/
//! accessed bits; `invalidate` recomputes it from the VPIs, preserving
//! the accessed bit, which the eviction clock reads and clears.
//!
//! A VPI is in exactly one of three states: resident (`present`), on swap
//! (`swapped`), or unused. `cow` marks a shared read-only mapping that is
//! broken by the fault handler on first write.

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::fs::InodeGuard;
use crate::kernel::Kernel;
use crate::param::{PGSIZE, SZ_2G};
use crate::proc::KernelCtx;

/// A user virtual address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct UVAddr(usize);

impl UVAddr {
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    pub const fn value(self) -> usize {
        self.0
    }

    pub const fn add(self, n: usize) -> Self {
        Self(self.0 + n)
    }
}

pub const fn pgroundup(v: usize) -> usize {
    (v + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(v: usize) -> usize {
    v & !(PGSIZE - 1)
}

bitflags! {
    /// Simulated hardware PTE permission bits.
    pub struct PteFlags: u8 {
        const P = 1 << 0;
        const W = 1 << 1;
        const U = 1 << 2;
        const A = 1 << 3;
    }
}

#[derive(Copy, Clone)]
struct HwPte {
    ppn: usize,
    flags: PteFlags,
}

/// The simulated hardware page table: vpn -> PTE.
pub(crate) struct PageTable {
    map: BTreeMap<usize, HwPte>,
}

impl PageTable {
    fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Hardware address translation for an access. A hit sets the
    /// accessed bit; a permission miss is a page fault.
    fn translate(&mut self, va: usize, write: bool) -> Option<usize> {
        let pte = self.map.get_mut(&(va >> 12))?;
        if !pte.flags.contains(PteFlags::P | PteFlags::U) {
            return None;
        }
        if write && !pte.flags.contains(PteFlags::W) {
            return None;
        }
        pte.flags.insert(PteFlags::A);
        Some(pte.ppn)
    }

    /// Reads and clears the accessed bit of the PTE for `va`.
    fn was_accessed(&mut self, va: usize) -> bool {
        match self.map.get_mut(&(va >> 12)) {
            Some(pte) if pte.flags.contains(PteFlags::P) => {
                let a = pte.flags.contains(PteFlags::A);
                pte.flags.remove(PteFlags::A);
                a
            }
            _ => false,
        }
    }
}

/// Per-page virtual page info: the kernel's software page-table entry.
#[derive(Copy, Clone, Default)]
pub struct Vpi {
    pub used: bool,
    pub present: bool,
    pub writable: bool,
    pub cow: bool,
    pub swapped: bool,
    /// Frame number, valid when present.
    pub ppn: usize,
    /// Swap slot number, valid when swapped.
    pub spn: usize,
}

/// VPIs per chain node.
pub(crate) const VPI_PER_NODE: usize = PGSIZE / core::mem::size_of::<Vpi>() - 1;

struct VpiNode {
    infos: [Vpi; VPI_PER_NODE],
    next: Option<Box<VpiNode>>,
}

impl VpiNode {
    fn new() -> Box<Self> {
        Box::new(Self {
            infos: [Vpi::default(); VPI_PER_NODE],
            next: None,
        })
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) enum VrDir {
    Up,
    Down,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum RegionKind {
    Code,
    Heap,
    Stack,
}

pub(crate) const NREGIONS: usize = 3;
const REGION_KINDS: [RegionKind; NREGIONS] = [RegionKind::Code, RegionKind::Heap, RegionKind::Stack];

pub(crate) struct VRegion {
    dir: VrDir,
    pub va_base: usize,
    pub size: usize,
    pages: Option<Box<VpiNode>>,
}

impl VRegion {
    fn new(dir: VrDir) -> Self {
        Self {
            dir,
            va_base: 0,
            size: 0,
            pages: None,
        }
    }

    /// Lowest mapped address.
    pub fn bot(&self) -> usize {
        match self.dir {
            VrDir::Up => self.va_base,
            VrDir::Down => self.va_base - self.size,
        }
    }

    /// One past the highest mapped address.
    pub fn top(&self) -> usize {
        match self.dir {
            VrDir::Up => self.va_base + self.size,
            VrDir::Down => self.va_base,
        }
    }

    fn contains(&self, va: usize, len: usize) -> bool {
        va >= self.bot() && va.checked_add(len).map_or(false, |end| end <= self.top())
    }

    /// Index into the chained VPI table for `va`.
    fn idx(&self, va: usize) -> usize {
        match self.dir {
            VrDir::Up => (va - self.va_base) >> 12,
            VrDir::Down => (self.va_base - 1 - va) >> 12,
        }
    }

    /// Virtual page base address for chain index `i`.
    fn va_of(&self, i: usize) -> usize {
        match self.dir {
            VrDir::Up => self.va_base + i * PGSIZE,
            VrDir::Down => self.va_base - (i + 1) * PGSIZE,
        }
    }

    /// The VPI for `va`, allocating chain nodes as needed.
    fn vpi_ensure(&mut self, va: usize) -> &mut Vpi {
        let mut idx = self.idx(va);
        if self.pages.is_none() {
            self.pages = Some(VpiNode::new());
        }
        let mut node = self.pages.as_mut().unwrap();
        while idx >= VPI_PER_NODE {
            if node.next.is_none() {
                node.next = Some(VpiNode::new());
            }
            node = node.next.as_mut().unwrap();
            idx -= VPI_PER_NODE;
        }
        &mut node.infos[idx]
    }

    fn lookup(&self, va: usize) -> Option<&Vpi> {
        let mut idx = self.idx(va);
        let mut node = self.pages.as_ref()?;
        while idx >= VPI_PER_NODE {
            node = node.next.as_ref()?;
            idx -= VPI_PER_NODE;
        }
        Some(&node.infos[idx])
    }

    fn lookup_mut(&mut self, va: usize) -> Option<&mut Vpi> {
        let mut idx = self.idx(va);
        let mut node = self.pages.as_mut()?;
        while idx >= VPI_PER_NODE {
            node = node.next.as_mut()?;
            idx -= VPI_PER_NODE;
        }
        Some(&mut node.infos[idx])
    }

    /// Walks every chain entry in index order with its page address.
    fn for_each<F: FnMut(usize, &Vpi)>(&self, mut f: F) {
        let mut base = 0;
        let mut node = self.pages.as_deref();
        while let Some(n) = node {
            for (i, vpi) in n.infos.iter().enumerate() {
                f(self.va_of(base + i), vpi);
            }
            base += VPI_PER_NODE;
            node = n.next.as_deref();
        }
    }

    fn for_each_mut<F: FnMut(usize, &mut Vpi)>(&mut self, mut f: F) {
        let dir = self.dir;
        let va_base = self.va_base;
        let va_of = |i: usize| match dir {
            VrDir::Up => va_base + i * PGSIZE,
            VrDir::Down => va_base - (i + 1) * PGSIZE,
        };
        let mut base = 0;
        let mut node = self.pages.as_deref_mut();
        while let Some(n) = node {
            for (i, vpi) in n.infos.iter_mut().enumerate() {
                f(va_of(base + i), vpi);
            }
            base += VPI_PER_NODE;
            node = n.next.as_deref_mut();
        }
    }
}

/// A user address space.
pub struct Vspace {
    pub(crate) regions: [VRegion; NREGIONS],
    pgtbl: PageTable,
}

impl Vspace {
    pub fn new() -> Self {
        Self {
            regions: [
                VRegion::new(VrDir::Up),
                VRegion::new(VrDir::Up),
                VRegion::new(VrDir::Down),
            ],
            pgtbl: PageTable::new(),
        }
    }

    pub(crate) fn region(&self, rk: RegionKind) -> &VRegion {
        &self.regions[rk as usize]
    }

    pub(crate) fn region_mut(&mut self, rk: RegionKind) -> &mut VRegion {
        &mut self.regions[rk as usize]
    }

    /// The region containing `va`, if any.
    pub(crate) fn va_region(&self, va: usize) -> Option<RegionKind> {
        REGION_KINDS
            .iter()
            .copied()
            .find(|&rk| self.region(rk).size > 0 && self.region(rk).contains(va, 1))
    }

    /// The VPI covering `va`, whether or not the page lies inside the
    /// region's current size (the chain may extend past it).
    pub(crate) fn lookup_vpi(&self, va: usize) -> Option<&Vpi> {
        let rk = self.va_region(va)?;
        self.region(rk).lookup(va)
    }

    pub(crate) fn lookup_vpi_mut(&mut self, va: usize) -> Option<&mut Vpi> {
        let rk = self.va_region(va)?;
        self.region_mut(rk).lookup_mut(va)
    }

    /// Hardware translation for an access; sets the accessed bit on a hit.
    pub(crate) fn pgtbl_translate(&mut self, va: usize, write: bool) -> Option<usize> {
        self.pgtbl.translate(va, write)
    }

    /// Reads and clears the hardware accessed bit for `va`.
    pub(crate) fn was_accessed(&mut self, va: usize) -> bool {
        self.pgtbl.was_accessed(va)
    }

    /// Whether `[va, va+len)` lies within one mapped region.
    pub(crate) fn contains_range(&self, va: usize, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        REGION_KINDS
            .iter()
            .any(|&rk| self.region(rk).size > 0 && self.region(rk).contains(va, len))
    }

    /// Recomputes the hardware page table from the VPIs. Must be called
    /// after any change that affects the mappings. The hardware accessed
    /// bit of a still-present page survives the recomputation.
    pub(crate) fn invalidate(&mut self) {
        let pgtbl = &mut self.pgtbl;
        for region in self.regions.iter() {
            region.for_each(|va, vpi| {
                let vpn = va >> 12;
                let accessed = pgtbl
                    .map
                    .remove(&vpn)
                    .map_or(false, |pte| vpi.used && pte.flags.contains(PteFlags::A));
                if vpi.used && vpi.present {
                    let mut flags = PteFlags::P | PteFlags::U;
                    if vpi.writable {
                        flags.insert(PteFlags::W);
                    }
                    if accessed {
                        flags.insert(PteFlags::A);
                    }
                    let _ = pgtbl.map.insert(vpn, HwPte { ppn: vpi.ppn, flags });
                }
            });
        }
    }

    /// Writes `data` at `va`, walking VPIs directly. Works on an address
    /// space that is not currently installed; the pages must already be
    /// mapped present and writable.
    pub(crate) fn write_to_va(&mut self, kernel: &Kernel, va: usize, data: &[u8]) -> Result<(), ()> {
        let mut va = va;
        let mut data = data;
        while !data.is_empty() {
            let n = core::cmp::min(data.len(), PGSIZE - va % PGSIZE);
            let rk = self.va_region(va).ok_or(())?;
            let vpi = self.region(rk).lookup(va).ok_or(())?;
            if !vpi.used || !vpi.present || !vpi.writable {
                return Err(());
            }
            kernel.kmem().write_frame(vpi.ppn, va % PGSIZE, &data[..n]);
            data = &data[n..];
            va += n;
        }
        Ok(())
    }

    /// Marks every resident frame as user-owned at its mapping address.
    /// Called once an address space is installed into a live process;
    /// until then its frames are invisible to the eviction clock.
    pub(crate) fn mark_user_frames(&self, kernel: &Kernel) {
        for region in self.regions.iter() {
            region.for_each(|va, vpi| {
                if vpi.used && vpi.present {
                    kernel.kmem().mark_user(vpi.ppn, va);
                }
            });
        }
    }

    /// Releases every frame reference and swap-slot reference this address
    /// space holds. The space must be reinitialized before reuse.
    pub(crate) fn free(self, kernel: &Kernel) {
        for region in self.regions.iter() {
            region.for_each(|_va, vpi| {
                if vpi.used {
                    if vpi.swapped {
                        kernel.swap().release_ref(vpi.spn);
                    } else if vpi.present {
                        kernel.kmem().free(vpi.ppn);
                    }
                }
            });
        }
    }

    /// Walks every used VPI; test aid for the conservation invariants.
    pub(crate) fn audit<F: FnMut(usize, &Vpi)>(&self, mut f: F) {
        for region in self.regions.iter() {
            region.for_each(|va, vpi| {
                if vpi.used {
                    f(va, vpi);
                }
            });
        }
    }
}

/// Maps blank (newly allocated, zeroed) pages covering `[from_va,
/// from_va+sz)`. Does not invalidate; callers do.
///
/// Raw-pointer receiver: frame allocation may evict, and eviction
/// rewrites VPIs through the process table, so no Rust reference into any
/// vspace may be live across the `alloc` call.
///
/// # Safety
///
/// `vs` must point to a valid `Vspace` and no reference into it may be
/// held by the caller.
pub(crate) unsafe fn add_map(
    vs: *mut Vspace,
    kernel: &Kernel,
    ctx: &KernelCtx<'_>,
    rk: RegionKind,
    from_va: usize,
    sz: usize,
    present: bool,
    writable: bool,
    user: bool,
) -> Result<usize, ()> {
    if from_va.checked_add(sz).map_or(true, |end| end > SZ_2G) {
        return Err(());
    }
    if sz == 0 {
        return Ok(0);
    }
    let mut a = pgroundup(from_va);
    while a < from_va + sz {
        let ppn = kernel.kmem().alloc(kernel, ctx)?;
        if user {
            kernel.kmem().mark_user(ppn, a);
        }
        // SAFETY: short-lived; no other reference into *vs is live.
        let vsr = unsafe { &mut *vs };
        let vpi = vsr.region_mut(rk).vpi_ensure(a);
        debug_assert!(!vpi.used, "add_map: page already mapped");
        *vpi = Vpi {
            used: true,
            present,
            writable,
            cow: false,
            swapped: false,
            ppn,
            spn: 0,
        };
        a += PGSIZE;
    }
    Ok(sz)
}

/// Unmaps and frees the pages in `(from_va - sz, from_va]`, mirroring the
/// downward walk of the region teardown. Does not invalidate.
pub(crate) fn del_map(
    vs: &mut Vspace,
    kernel: &Kernel,
    rk: RegionKind,
    from_va: usize,
    sz: usize,
) -> Result<usize, ()> {
    if sz == 0 {
        return Ok(0);
    }
    let mut a = pgrounddown(from_va);
    while a > from_va.checked_sub(sz).ok_or(())? {
        let vpi = vs.region_mut(rk).lookup_mut(a).ok_or(())?;
        assert!(vpi.used, "del_map: address isn't assigned");
        if vpi.swapped {
            kernel.swap().release_ref(vpi.spn);
        } else if vpi.present {
            kernel.kmem().free(vpi.ppn);
        }
        *vpi = Vpi::default();
        a -= PGSIZE;
    }
    Ok(sz)
}

/// Clones `src` into `dst` sharing the underlying frames and swap slots:
/// every used VPI on *both* sides becomes `cow = 1, writable = 0`, and the
/// frame or slot refcount is bumped. Invalidates `dst`; the caller
/// invalidates `src`.
pub(crate) fn shallow_copy(dst: &mut Vspace, src: &mut Vspace, kernel: &Kernel) {
    for (d, s) in dst.regions.iter_mut().zip(src.regions.iter_mut()) {
        d.va_base = s.va_base;
        d.size = s.size;
        d.pages = None;
        s.for_each_mut(|va, svpi| {
            if !svpi.used {
                return;
            }
            svpi.cow = true;
            svpi.writable = false;
            if svpi.swapped {
                kernel.swap().incref(svpi.spn);
            } else {
                kernel.kmem().incref(svpi.ppn);
            }
            *d.vpi_ensure(va) = *svpi;
        });
    }
    dst.invalidate();
}

/// Copies `src` into `dst` with disjoint, fully resident pages: same
/// addresses and contents, but a write to one side is invisible to the
/// other. Pages of `src` that live on swap are read back from the swap
/// region. Invalidates `dst`.
pub(crate) fn deep_copy(
    dst: &mut Vspace,
    kernel: &Kernel,
    ctx: &KernelCtx<'_>,
    src: *const Vspace,
) -> Result<(), ()> {
    for rk in REGION_KINDS.iter().copied() {
        // SAFETY: short-lived; geometry fields are stable.
        let (va_base, size) = {
            let s = unsafe { &*src };
            (s.region(rk).va_base, s.region(rk).size)
        };
        {
            let d = dst.region_mut(rk);
            d.va_base = va_base;
            d.size = size;
            d.pages = None;
        }
        let npages = size / PGSIZE;
        for i in 0..npages {
            // Allocate first: eviction inside `alloc` may rewrite the
            // source VPI, so it is (re)read afterwards.
            let va = {
                let s = unsafe { &*src };
                s.region(rk).va_of(i)
            };
            let svpi = {
                let s = unsafe { &*src };
                match s.region(rk).lookup(va) {
                    Some(v) if v.used => *v,
                    _ => continue,
                }
            };
            let ppn = kernel.kmem().alloc(kernel, ctx)?;
            let svpi = {
                let s = unsafe { &*src };
                *s.region(rk).lookup(va).unwrap()
            };
            if svpi.present {
                kernel.kmem().copy_frame(ppn, svpi.ppn);
            } else if svpi.swapped {
                kernel.swap().read_page_copy(kernel, ctx, svpi.spn, ppn);
            }
            *dst.region_mut(rk).vpi_ensure(va) = Vpi {
                used: true,
                present: true,
                writable: svpi.writable || svpi.cow,
                cow: false,
                swapped: false,
                ppn,
                spn: 0,
            };
        }
    }
    dst.invalidate();
    Ok(())
}

/// Loads an ELF image from `ip` into the CODE region of `vs` and places
/// the HEAP region just past it. Returns the entry point. Does not
/// invalidate; the space is expected to change more before install.
pub(crate) fn load_elf(
    vs: &mut Vspace,
    ip: &mut InodeGuard<'_>,
    ctx: &KernelCtx<'_>,
) -> Result<usize, ()> {
    let kernel = ctx.kernel();
    let elf: crate::elf::ElfHdr = ip.read_obj(0, ctx)?;
    if !elf.is_valid() {
        return Err(());
    }

    vs.region_mut(RegionKind::Code).va_base = 0;
    let mut end: usize = 0;

    for i in 0..elf.phnum as usize {
        let off = elf.phoff as usize + i * core::mem::size_of::<crate::elf::ProgHdr>();
        let ph: crate::elf::ProgHdr = ip.read_obj(off as u32, ctx)?;
        if !ph.is_prog_load() {
            continue;
        }
        if ph.memsz < ph.filesz || ph.vaddr % PGSIZE as u64 != 0 {
            return Err(());
        }
        let top = ph
            .vaddr
            .checked_add(ph.memsz)
            .filter(|&t| t <= SZ_2G as u64)
            .ok_or(())? as usize;
        if top > end {
            // SAFETY: no reference into *vs is live across the call.
            let _ = unsafe {
                add_map(
                    vs as *mut Vspace,
                    kernel,
                    ctx,
                    RegionKind::Code,
                    end,
                    top - end,
                    true,
                    true,
                    false,
                )?
            };
            end = top;
        }

        // Copy segment bytes into the freshly mapped pages.
        let mut remaining = ph.filesz as usize;
        let mut va = ph.vaddr as usize;
        let mut foff = ph.off as u32;
        let mut page = [0u8; PGSIZE];
        while remaining > 0 {
            let n = core::cmp::min(remaining, PGSIZE - va % PGSIZE);
            if ip.read_kernel(&mut page[..n], foff, ctx)? != n {
                return Err(());
            }
            let vpi = vs.region(RegionKind::Code).lookup(va).ok_or(())?;
            kernel.kmem().write_frame(vpi.ppn, va % PGSIZE, &page[..n]);
            remaining -= n;
            va += n;
            foff += n as u32;
        }
    }

    vs.region_mut(RegionKind::Code).size = pgroundup(end);
    let heap = vs.region_mut(RegionKind::Heap);
    heap.va_base = pgroundup(end);
    heap.size = 0;
    Ok(elf.entry as usize)
}

/// Maps the initial user stack page at the top of the address space and
/// invalidates, leaving `vs` ready to install.
pub(crate) fn init_stack(vs: &mut Vspace, ctx: &KernelCtx<'_>) -> Result<(), ()> {
    let kernel = ctx.kernel();
    {
        let stack = vs.region_mut(RegionKind::Stack);
        stack.va_base = SZ_2G;
        stack.size = PGSIZE;
    }
    // SAFETY: no reference into *vs is live across the call.
    let _ = unsafe {
        add_map(
            vs as *mut Vspace,
            kernel,
            ctx,
            RegionKind::Stack,
            SZ_2G - PGSIZE,
            PGSIZE,
            true,
            true,
            false,
        )?
    };
    vs.invalidate();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vpi_chain_indexing() {
        let mut r = VRegion::new(VrDir::Up);
        r.va_base = 0;
        r.size = (VPI_PER_NODE + 5) * PGSIZE;
        let far = (VPI_PER_NODE + 3) * PGSIZE;
        r.vpi_ensure(far).ppn = 7;
        assert_eq!(r.lookup(far).unwrap().ppn, 7);
        assert_eq!(r.idx(far), VPI_PER_NODE + 3);
        assert!(r.lookup((2 * VPI_PER_NODE + 1) * PGSIZE).is_none());
    }

    #[test]
    fn stack_indexing_grows_down() {
        let mut r = VRegion::new(VrDir::Down);
        r.va_base = SZ_2G;
        r.size = 3 * PGSIZE;
        assert_eq!(r.idx(SZ_2G - PGSIZE), 0);
        assert_eq!(r.idx(SZ_2G - 1), 0);
        assert_eq!(r.idx(SZ_2G - 3 * PGSIZE), 2);
        assert_eq!(r.va_of(0), SZ_2G - PGSIZE);
        assert_eq!(r.bot(), SZ_2G - 3 * PGSIZE);
        assert_eq!(r.top(), SZ_2G);
        assert!(r.contains(SZ_2G - 1, 1));
        assert!(!r.contains(SZ_2G, 1));
    }

    #[test]
    fn deep_copy_equals_shallow_copy_plus_touch() {
        fn prog(ctx: &KernelCtx<'_>) -> i32 {
            let kernel = ctx.kernel();
            const PAGES: usize = 8;
            let old = ctx.sys_sbrk(PAGES * PGSIZE);
            assert!(old >= 0);
            let base = old as usize;
            for i in 0..PAGES {
                ctx.copy_out(UVAddr::new(base + i * PGSIZE), &[i as u8 + 1; 16])
                    .unwrap();
            }

            // A deep copy is private and resident from the start.
            let mut deep = Vspace::new();
            deep_copy(&mut deep, kernel, ctx, ctx.vspace_ptr()).unwrap();

            // A shallow copy shares frames; writes through the live side
            // then break the sharing page by page.
            let mut shadow = Vspace::new();
            // SAFETY: our own vspace, no allocation inside.
            unsafe {
                shallow_copy(&mut shadow, &mut *ctx.vspace_ptr(), kernel);
                (*ctx.vspace_ptr()).invalidate();
            }
            for i in 0..PAGES {
                ctx.copy_out(UVAddr::new(base + i * PGSIZE), &[0xBB; 16])
                    .unwrap();
            }

            // The shadow kept the originals: exactly what deep_copy holds.
            for i in 0..PAGES {
                let va = base + i * PGSIZE;
                let dv = *deep.lookup_vpi(va).unwrap();
                let sv = *shadow.lookup_vpi(va).unwrap();
                assert!(dv.present && sv.present);
                assert_ne!(dv.ppn, sv.ppn);
                let mut a = [0u8; 16];
                let mut b = [0u8; 16];
                kernel.kmem().read_frame(dv.ppn, 0, &mut a);
                kernel.kmem().read_frame(sv.ppn, 0, &mut b);
                assert_eq!(a, b);
                assert_eq!(a, [i as u8 + 1; 16]);
            }

            // Tear down two pages explicitly, then the rest wholesale.
            let top = shadow.region(RegionKind::Heap).top();
            del_map(&mut shadow, kernel, RegionKind::Heap, top - 1, 2 * PGSIZE).unwrap();
            shadow.invalidate();
            shadow.free(kernel);
            deep.free(kernel);
            0
        }

        let image = crate::mkfs::ImageBuilder::new().program("/vmcopy").build();
        let kernel = crate::kernel::Kernel::new(
            crate::disk::MemDisk::new(&image, 0),
            &[("/vmcopy", prog as crate::kernel::UserFn)],
        );
        assert_eq!(kernel.run("/vmcopy", &[]), 0);
        kernel.check_invariants();
    }

    #[test]
    fn region_lookup_picks_the_right_region() {
        let mut vs = Vspace::new();
        vs.region_mut(RegionKind::Code).va_base = 0;
        vs.region_mut(RegionKind::Code).size = 2 * PGSIZE;
        vs.region_mut(RegionKind::Heap).va_base = 2 * PGSIZE;
        vs.region_mut(RegionKind::Heap).size = PGSIZE;
        vs.region_mut(RegionKind::Stack).va_base = SZ_2G;
        vs.region_mut(RegionKind::Stack).size = PGSIZE;
        assert_eq!(vs.va_region(0), Some(RegionKind::Code));
        assert_eq!(vs.va_region(2 * PGSIZE), Some(RegionKind::Heap));
        assert_eq!(vs.va_region(SZ_2G - 10), Some(RegionKind::Stack));
        assert_eq!(vs.va_region(4 * PGSIZE), None);
        assert!(vs.contains_range(0, 2 * PGSIZE));
        assert!(!vs.contains_range(PGSIZE, 2 * PGSIZE));
    }
}
