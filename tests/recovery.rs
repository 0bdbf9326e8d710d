//! Crash safety: commit-block recovery across reboots, a crash-point
//! sweep over every prefix of the write sequence, and replay idempotence.

mod common;

use common::*;
use xk64::{ImageBuilder, KernelCtx, MemDisk, Kernel, UserFn};

const RDONLY: i32 = 0;
const CREATE_RDWR: i32 = 0x202;

const LINE: &[u8] = b"data written before the crash\n";

/// Creates /small.txt and writes the line, in two transactions.
fn writer(ctx: &KernelCtx<'_>) -> i32 {
    let path = ustr(ctx, "/small.txt");
    let fd = ctx.sys_open(path, CREATE_RDWR);
    assert!(fd >= 0);
    let buf = ubuf(ctx);
    ctx.copy_out(buf, LINE).unwrap();
    assert_eq!(ctx.sys_write(fd, buf, LINE.len() as i32), LINE.len() as i32);
    assert_eq!(ctx.sys_close(fd), 0);
    0
}

/// Classifies the post-recovery state of /small.txt:
/// 0 = absent, 1 = created empty, 2 = full line. Anything else panics.
fn checker(ctx: &KernelCtx<'_>) -> i32 {
    let path = ustr(ctx, "/small.txt");
    let fd = ctx.sys_open(path, RDONLY);
    if fd < 0 {
        return 0;
    }
    let buf = ubuf(ctx);
    let r = ctx.sys_read(fd, buf, 4096);
    assert!(r >= 0);
    if r == 0 {
        return 1;
    }
    assert_eq!(r as usize, LINE.len(), "torn write survived recovery");
    assert_eq!(uread(ctx, buf, r as usize), LINE, "garbled write survived");
    2
}

fn image() -> Vec<u8> {
    ImageBuilder::new()
        .program("/writer")
        .program("/checker")
        .build()
}

fn programs() -> Vec<(&'static str, UserFn)> {
    vec![("/writer", writer as UserFn), ("/checker", checker as UserFn)]
}

/// A clean write survives a reboot.
#[test]
fn reboot_keeps_committed_data() {
    let kernel = boot(image(), &programs());
    assert_eq!(kernel.run("/writer", &[]), 0);
    let disk = kernel.disk_ref().snapshot();

    let kernel2 = boot(disk, &programs());
    assert_eq!(kernel2.run("/checker", &[]), 2);
}

/// Crash after every possible prefix of the disk-write sequence; after
/// recovery the file is whole, empty, or absent -- never torn.
#[test]
fn crash_sweep_is_atomic() {
    // Measure the clean run's write count first.
    let kernel = boot(image(), &programs());
    assert_eq!(kernel.run("/writer", &[]), 0);
    let total_writes = kernel.disk_ref().num_writes();
    assert!(total_writes > 0);

    let mut outcomes = [0u32; 3];
    for crash_at in 0..=total_writes {
        let kernel = boot(image(), &programs());
        kernel.disk_ref().fail_writes_after(crash_at);
        // The workload does not notice the dying disk.
        assert_eq!(kernel.run("/writer", &[]), 0);

        let survived = kernel.disk_ref().snapshot();
        let kernel2 = boot(survived, &programs());
        let state = kernel2.run("/checker", &[]);
        assert!(
            (0..=2).contains(&state),
            "crash at write {} left an inconsistent disk",
            crash_at
        );
        outcomes[state as usize] += 1;
    }
    // The sweep must reach the final state at its far end, and the early
    // crashes must leave the file absent.
    assert!(outcomes[0] > 0, "no crash point left the file absent");
    assert!(outcomes[2] > 0, "no crash point preserved the full write");
}

/// Running recovery twice equals running it once: the rebooted disk is
/// bit-identical after a second reboot.
#[test]
fn recovery_is_idempotent() {
    // Crash mid-sequence so recovery has real work on the next boot.
    let kernel = boot(image(), &programs());
    assert_eq!(kernel.run("/writer", &[]), 0);
    let total = kernel.disk_ref().num_writes();

    let kernel = boot(image(), &programs());
    kernel.disk_ref().fail_writes_after(total.saturating_sub(2));
    assert_eq!(kernel.run("/writer", &[]), 0);
    let crashed = kernel.disk_ref().snapshot();

    // First reboot: recovery runs (possibly replaying a commit).
    let k1 = boot(crashed, &programs());
    assert_eq!(k1.run("/checker", &[]) >= 0, true);
    let once = k1.disk_ref().snapshot();

    // Second reboot: recovery must be a no-op.
    let k2 = boot(once.clone(), &programs());
    assert!(k2.run("/checker", &[]) >= 0);
    let twice = k2.disk_ref().snapshot();

    assert_eq!(once, twice, "recovery was not idempotent");
}

/// Direct use of the in-memory disk used by the suites above.
#[test]
fn memdisk_snapshot_and_failpoint() {
    let disk = MemDisk::new(&[], 8);
    let block = [7u8; 512];
    disk.write(3, &block);
    assert_eq!(disk.num_writes(), 1);
    disk.fail_writes_after(0);
    disk.write(4, &block);
    let snap = disk.snapshot();
    assert_eq!(&snap[3 * 512..4 * 512], &block[..]);
    assert!(snap[4 * 512..5 * 512].iter().all(|&b| b == 0));
    let _ = Kernel::new(MemDisk::new(&snap, 0), &[]);
}
