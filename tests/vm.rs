//! Virtual-memory scenarios: COW fork accounting, swap under a small
//! frame pool, and on-demand stack growth.

mod common;

use core::convert::TryInto;

use common::*;
use xk64::{ImageBuilder, KernelCtx, SysInfo, UVAddr, PGSIZE, SZ_2G};

fn sysinfo(ctx: &KernelCtx<'_>) -> SysInfo {
    let va = ubuf(ctx);
    assert_eq!(ctx.sys_sysinfo(va), 0);
    let bytes = uread(ctx, va, core::mem::size_of::<SysInfo>());
    let word = |i: usize| u64::from_le_bytes(bytes[i * 8..(i + 1) * 8].try_into().unwrap());
    SysInfo {
        pages_in_use: word(0),
        pages_in_swap: word(1),
        num_disk_reads: word(2),
        free_pages: word(3),
    }
}

fn occupied(si: &SysInfo) -> u64 {
    si.pages_in_use + si.pages_in_swap
}

/// Fork over a 200-page region: the child costs far fewer than 200 pages
/// until it writes, reads stay cheap, and writing every page finally
/// materializes private copies.
fn cowfork(ctx: &KernelCtx<'_>) -> i32 {
    const PAGES: usize = 200;
    let base = scratch(ctx, PAGES * PGSIZE).value();
    for i in 0..PAGES {
        let marker = (i as u64).to_le_bytes();
        ctx.copy_out(UVAddr::new(base + i * PGSIZE), &marker).unwrap();
    }
    let before = sysinfo(ctx);

    let pid = ctx.sys_fork(Box::new(move |ctx: &KernelCtx<'_>| {
        let after_fork = sysinfo(ctx);
        assert!(
            occupied(&after_fork) < occupied(&before) + 100,
            "fork copied pages eagerly: {} -> {}",
            occupied(&before),
            occupied(&after_fork)
        );

        // Reading every page must not break the sharing.
        for i in 0..PAGES {
            let bytes = uread(ctx, UVAddr::new(base + i * PGSIZE), 8);
            assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), i as u64);
        }
        let after_read = sysinfo(ctx);
        assert!(occupied(&after_read) < occupied(&before) + 100);

        // Writing every page does.
        for i in 0..PAGES {
            let marker = (i as u64 + 7).to_le_bytes();
            ctx.copy_out(UVAddr::new(base + i * PGSIZE), &marker).unwrap();
        }
        let after_write = sysinfo(ctx);
        assert!(
            occupied(&after_write) >= occupied(&before) + 100,
            "writes did not copy: {} -> {}",
            occupied(&before),
            occupied(&after_write)
        );

        // And the copies are private.
        for i in 0..PAGES {
            let bytes = uread(ctx, UVAddr::new(base + i * PGSIZE), 8);
            assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), i as u64 + 7);
        }
        0
    }));
    assert!(pid > 0);
    assert_eq!(ctx.sys_wait(), pid);

    // The parent still sees its own values.
    for i in 0..PAGES {
        let bytes = uread(ctx, UVAddr::new(base + i * PGSIZE), 8);
        assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), i as u64);
    }
    0
}

#[test]
fn cow_fork_page_accounting() {
    let image = ImageBuilder::new().program("/cowfork").build();
    let kernel = boot(image, &[("/cowfork", cowfork)]);
    assert_eq!(kernel.run("/cowfork", &[]), 0);
    kernel.check_invariants();
}

/// Allocate 1200 pages on a 512-frame machine, stamping page `i` with
/// `i`: the pool must spill to swap, and every page must read back
/// through swap-in with its stamp intact.
fn swapper(ctx: &KernelCtx<'_>) -> i32 {
    const PAGES: usize = 1200;
    let start = ctx.sys_sbrk(0);
    assert!(start >= 0);
    let base = start as usize;

    for i in 0..PAGES {
        let a = ctx.sys_sbrk(PGSIZE);
        assert!(a >= 0, "out of memory at page {}", i);
        let marker = (i as u64).to_le_bytes();
        ctx.copy_out(UVAddr::new(base + i * PGSIZE), &marker).unwrap();
    }

    let info1 = sysinfo(ctx);
    assert!(
        info1.pages_in_swap > 0,
        "1200 pages on 512 frames never swapped"
    );

    for i in 0..PAGES {
        let bytes = uread(ctx, UVAddr::new(base + i * PGSIZE), 8);
        assert_eq!(
            u64::from_le_bytes(bytes.try_into().unwrap()),
            i as u64,
            "page {} corrupted across swap",
            i
        );
    }

    let info2 = sysinfo(ctx);
    assert!(
        info2.num_disk_reads > info1.num_disk_reads,
        "checking every page incurred no disk reads"
    );
    0
}

#[test]
fn swap_preserves_page_contents() {
    let image = ImageBuilder::new().program("/swapper").build();
    let kernel = boot_with_frames(image, 512, &[("/swapper", swapper)]);
    assert_eq!(kernel.run("/swapper", &[]), 0);
    kernel.check_invariants();
}

/// The stack grows on demand below its top, up to ten pages; outside the
/// window the process is killed.
fn growstack(ctx: &KernelCtx<'_>) -> i32 {
    // Deep touch within the window: grows page by page down to the cap.
    let deep = SZ_2G - 10 * PGSIZE;
    ctx.copy_out(UVAddr::new(deep), b"bottom").unwrap();
    assert_eq!(uread(ctx, UVAddr::new(deep), 6), b"bottom");

    // Values written near the top are still there.
    let near = SZ_2G - PGSIZE + 100;
    ctx.copy_out(UVAddr::new(near), b"top").unwrap();
    assert_eq!(uread(ctx, UVAddr::new(near), 3), b"top");

    // Below the window: the child is killed, not the system.
    let pid = ctx.sys_fork(Box::new(move |ctx: &KernelCtx<'_>| {
        let bad = SZ_2G - 11 * PGSIZE;
        assert!(ctx.copy_out(UVAddr::new(bad), b"x").is_err());
        assert!(ctx.killed(), "unresolvable fault did not kill");
        ctx.sys_exit(-1)
    }));
    assert!(pid > 0);
    assert_eq!(ctx.sys_wait(), pid);
    0
}

#[test]
fn stack_grows_to_its_cap() {
    let image = ImageBuilder::new().program("/growstack").build();
    let kernel = boot(image, &[("/growstack", growstack)]);
    assert_eq!(kernel.run("/growstack", &[]), 0);
    kernel.check_invariants();
}

/// A COW region survives eviction: fork over pages, push them to swap by
/// allocating past the pool, then have the child write them (swap-in then
/// COW break).
fn cowswap(ctx: &KernelCtx<'_>) -> i32 {
    const SHARED: usize = 50;
    let base = scratch(ctx, SHARED * PGSIZE).value();
    for i in 0..SHARED {
        ctx.copy_out(UVAddr::new(base + i * PGSIZE), &[i as u8; 8]).unwrap();
    }

    let pid = ctx.sys_fork(Box::new(move |ctx: &KernelCtx<'_>| {
        // Push the shared pages out by thrashing the pool.
        const FILLER: usize = 600;
        let fill = scratch(ctx, FILLER * PGSIZE).value();
        for i in 0..FILLER {
            ctx.copy_out(UVAddr::new(fill + i * PGSIZE), &[0xAB; 8]).unwrap();
        }
        let si = sysinfo(ctx);
        assert!(si.pages_in_swap > 0);

        // Now write the shared pages: swap-in plus COW break per page.
        for i in 0..SHARED {
            let got = uread(ctx, UVAddr::new(base + i * PGSIZE), 8);
            assert_eq!(got, vec![i as u8; 8]);
            ctx.copy_out(UVAddr::new(base + i * PGSIZE), &[0xEE; 8]).unwrap();
        }
        0
    }));
    assert!(pid > 0);
    assert_eq!(ctx.sys_wait(), pid);

    // The parent's values survived the child's writes.
    for i in 0..SHARED {
        let got = uread(ctx, UVAddr::new(base + i * PGSIZE), 8);
        assert_eq!(got, vec![i as u8; 8], "parent page {} clobbered", i);
    }
    0
}

#[test]
fn cow_pages_survive_eviction() {
    let image = ImageBuilder::new().program("/cowswap").build();
    let kernel = boot_with_frames(image, 512, &[("/cowswap", cowswap)]);
    assert_eq!(kernel.run("/cowswap", &[]), 0);
    kernel.check_invariants();
}

/// sbrk returns the old break and refuses growth past the address-space
/// limit.
fn sbrktest(ctx: &KernelCtx<'_>) -> i32 {
    let a = ctx.sys_sbrk(0);
    let b = ctx.sys_sbrk(PGSIZE);
    assert_eq!(a, b);
    let c = ctx.sys_sbrk(0);
    assert_eq!(c, b + PGSIZE as isize);
    assert_eq!(ctx.sys_sbrk(usize::MAX / 2), -1);
    0
}

#[test]
fn sbrk_behaves() {
    let image = ImageBuilder::new().program("/sbrktest").build();
    let kernel = boot(image, &[("/sbrktest", sbrktest)]);
    assert_eq!(kernel.run("/sbrktest", &[]), 0);
}
