//! End-to-end process, pipe, and file-descriptor scenarios.

mod common;

use core::convert::TryInto;

use common::*;
use xk64::{ImageBuilder, KernelCtx, Stat, UVAddr, PGSIZE};

const RDONLY: i32 = 0;
const RDWR: i32 = 0x2;
const CREATE_RDWR: i32 = 0x202;

/// Parent pipes to a forked child: the child writes 5 chunks of 95 bytes
/// of an incrementing counter, the parent reads with doubling chunk sizes
/// and expects the 475-byte sequence, then end of file.
fn pipe_ping(ctx: &KernelCtx<'_>) -> i32 {
    let fds_va = ubuf(ctx);
    assert_eq!(ctx.sys_pipe(fds_va), 0);
    let (rfd, wfd) = read_fd_pair(ctx, fds_va);

    let pid = ctx.sys_fork(Box::new(move |ctx: &KernelCtx<'_>| {
        assert_eq!(ctx.sys_close(rfd), 0);
        let buf = ubuf(ctx);
        for round in 0..5usize {
            let chunk: Vec<u8> = (0..95).map(|j| ((round * 95 + j) % 256) as u8).collect();
            ctx.copy_out(buf, &chunk).unwrap();
            assert_eq!(ctx.sys_write(wfd, buf, 95), 95);
        }
        assert_eq!(ctx.sys_close(wfd), 0);
        0
    }));
    assert!(pid > 0);
    assert_eq!(ctx.sys_close(wfd), 0);

    let buf = ubuf(ctx);
    let mut got = Vec::new();
    let mut chunk: i32 = 1;
    while got.len() < 475 {
        let r = ctx.sys_read(rfd, buf, chunk);
        assert!(r >= 0, "pipe read failed");
        if r == 0 {
            break;
        }
        got.extend(uread(ctx, buf, r as usize));
        chunk = (chunk * 2).min(PGSIZE as i32);
    }
    assert_eq!(got.len(), 475);
    for (i, b) in got.iter().enumerate() {
        assert_eq!(*b, (i % 256) as u8, "byte {} out of order", i);
    }

    // Writer gone: end of file.
    assert_eq!(ctx.sys_read(rfd, buf, 16), 0);
    assert_eq!(ctx.sys_wait(), pid);
    assert_eq!(ctx.sys_close(rfd), 0);
    0
}

#[test]
fn pipe_ping_sequences_475_bytes() {
    let image = ImageBuilder::new().program("/pipeping").build();
    let kernel = boot(image, &[("/pipeping", pipe_ping)]);
    assert_eq!(kernel.run("/pipeping", &[]), 0);
    kernel.check_invariants();
}

/// A forked child and its parent share one open-file slot, so the child's
/// 10-byte read advances the offset the parent reads at; a dup'd fd does
/// the same.
fn dup_offset(ctx: &KernelCtx<'_>) -> i32 {
    let path = ustr(ctx, "/share.txt");
    let fd = ctx.sys_open(path, RDONLY);
    assert!(fd >= 0);

    let pid = ctx.sys_fork(Box::new(move |ctx: &KernelCtx<'_>| {
        let buf = ubuf(ctx);
        assert_eq!(ctx.sys_read(fd, buf, 10), 10);
        assert_eq!(uread(ctx, buf, 10), b"cccccccccc");
        0
    }));
    assert!(pid > 0);
    assert_eq!(ctx.sys_wait(), pid);

    // The child consumed the first half.
    let buf = ubuf(ctx);
    assert_eq!(ctx.sys_read(fd, buf, 10), 10);
    assert_eq!(uread(ctx, buf, 10), b"ppppppppp\n");
    assert_eq!(ctx.sys_close(fd), 0);

    // dup shares the offset the same way.
    let fd = ctx.sys_open(path, RDONLY);
    let fd2 = ctx.sys_dup(fd);
    assert!(fd2 >= 0 && fd2 != fd);
    assert_eq!(ctx.sys_read(fd, buf, 10), 10);
    assert_eq!(ctx.sys_read(fd2, buf, 10), 10);
    assert_eq!(uread(ctx, buf, 10), b"ppppppppp\n");
    // Both ends of the pair are exhausted now.
    assert_eq!(ctx.sys_read(fd, buf, 1), 0);
    assert_eq!(ctx.sys_close(fd), 0);
    assert_eq!(ctx.sys_close(fd2), 0);
    0
}

#[test]
fn dup_and_fork_share_the_offset() {
    let mut content = Vec::new();
    content.extend_from_slice(b"cccccccccc");
    content.extend_from_slice(b"ppppppppp\n");
    let image = ImageBuilder::new()
        .program("/dupoffset")
        .file("/share.txt", &content)
        .build();
    let kernel = boot(image, &[("/dupoffset", dup_offset)]);
    assert_eq!(kernel.run("/dupoffset", &[]), 0);
    kernel.check_invariants();
}

/// Four children concurrently create a file each and write 12 chunks of
/// 500 bytes of their own digit; the parent reads the 6000 bytes back.
fn fourfiles(ctx: &KernelCtx<'_>) -> i32 {
    let names = ["/f0", "/f1", "/f2", "/f3"];
    let mut pids = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let name = *name;
        let pid = ctx.sys_fork(Box::new(move |ctx: &KernelCtx<'_>| {
            let path = ustr(ctx, name);
            let fd = ctx.sys_open(path, CREATE_RDWR);
            assert!(fd >= 0, "create {} failed", name);
            let buf = ubuf(ctx);
            let chunk = vec![b'0' + i as u8; 500];
            ctx.copy_out(buf, &chunk).unwrap();
            for _ in 0..12 {
                assert_eq!(ctx.sys_write(fd, buf, 500), 500);
            }
            assert_eq!(ctx.sys_close(fd), 0);
            0
        }));
        assert!(pid > 0);
        pids.push(pid);
    }
    for _ in 0..4 {
        assert!(ctx.sys_wait() > 0);
    }

    for (i, name) in names.iter().enumerate() {
        let path = ustr(ctx, name);
        let fd = ctx.sys_open(path, RDONLY);
        assert!(fd >= 0, "open {} failed", name);

        let st_va = ubuf(ctx);
        assert_eq!(ctx.sys_fstat(fd, st_va), 0);
        let st_bytes = uread(ctx, st_va, core::mem::size_of::<Stat>());
        let size = u32::from_le_bytes(st_bytes[12..16].try_into().unwrap());
        assert_eq!(size, 6000, "{} has wrong size", name);

        let buf = ubuf(ctx);
        let mut total = 0;
        loop {
            let r = ctx.sys_read(fd, buf, 1000);
            assert!(r >= 0);
            if r == 0 {
                break;
            }
            for b in uread(ctx, buf, r as usize) {
                assert_eq!(b, b'0' + i as u8, "{} corrupted", name);
            }
            total += r;
        }
        assert_eq!(total, 6000);
        assert_eq!(ctx.sys_close(fd), 0);
    }
    0
}

#[test]
fn four_concurrent_writers() {
    let image = ImageBuilder::new().program("/fourfiles").build();
    let kernel = boot(image, &[("/fourfiles", fourfiles)]);
    assert_eq!(kernel.run("/fourfiles", &[]), 0);
    kernel.check_invariants();
}

/// The exec entry ABI: rdi = argc, rsi = &argv[0], rsp = &argv[0] - 8,
/// argv a null-terminated vector of pointers to NUL-terminated strings.
fn echoargs(ctx: &KernelCtx<'_>) -> i32 {
    let tf = ctx.trapframe();
    assert_eq!(tf.rdi, 2, "argc");
    assert_eq!(tf.rsp, tf.rsi - 8, "rsp below argv");

    let mut seen = Vec::new();
    for i in 0..=tf.rdi {
        let ptr_bytes = uread(ctx, UVAddr::new(tf.rsi + i * 8), 8);
        let ptr = u64::from_le_bytes(ptr_bytes.try_into().unwrap()) as usize;
        if i == tf.rdi {
            assert_eq!(ptr, 0, "argv not null-terminated");
            break;
        }
        let mut s = Vec::new();
        let mut at = ptr;
        loop {
            let b = uread(ctx, UVAddr::new(at), 1)[0];
            if b == 0 {
                break;
            }
            s.push(b);
            at += 1;
        }
        seen.push(s);
    }
    assert_eq!(seen, vec![b"alpha".to_vec(), b"beta".to_vec()]);
    0
}

#[test]
fn exec_argv_abi() {
    let image = ImageBuilder::new().program("/echoargs").build();
    let kernel = boot(image, &[("/echoargs", echoargs)]);
    assert_eq!(kernel.run("/echoargs", &["alpha", "beta"]), 0);
}

/// exec() from a running program replaces the image; a failed exec
/// returns -1 and the old program continues.
fn execer(ctx: &KernelCtx<'_>) -> i32 {
    let path = ustr(ctx, "/echoargs");
    // argv: ["alpha", "beta", null]
    let a0 = ustr(ctx, "alpha");
    let a1 = ustr(ctx, "beta");
    let vec_va = ubuf(ctx);
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(a0.value() as u64).to_le_bytes());
    bytes.extend_from_slice(&(a1.value() as u64).to_le_bytes());
    bytes.extend_from_slice(&0u64.to_le_bytes());
    ctx.copy_out(vec_va, &bytes).unwrap();

    // A missing program fails without destroying this image.
    let missing = ustr(ctx, "/nosuch");
    assert_eq!(ctx.sys_exec(missing, vec_va), -1);

    let pid = ctx.sys_fork(Box::new(move |ctx: &KernelCtx<'_>| {
        ctx.sys_exec(path, vec_va)
        // Unreachable on success; the exec'd program's status is the
        // child's exit status.
    }));
    assert!(pid > 0);
    assert_eq!(ctx.sys_wait(), pid);
    0
}

#[test]
fn exec_replaces_and_fails_cleanly() {
    let image = ImageBuilder::new()
        .program("/execer")
        .program("/echoargs")
        .build();
    let kernel = boot(image, &[("/execer", execer), ("/echoargs", echoargs)]);
    assert_eq!(kernel.run("/execer", &[]), 0);
    kernel.check_invariants();
}

/// Uniform -1 errors: bad fds, bad modes, absent files, non-positive
/// lengths, permission mismatches, fstat on a pipe.
fn errorcases(ctx: &KernelCtx<'_>) -> i32 {
    let buf = ubuf(ctx);
    assert_eq!(ctx.sys_read(-1, buf, 1), -1);
    assert_eq!(ctx.sys_read(99, buf, 1), -1);
    assert_eq!(ctx.sys_write(7, buf, 1), -1);
    assert_eq!(ctx.sys_close(3), -1);
    assert_eq!(ctx.sys_dup(5), -1);

    let path = ustr(ctx, "/absent.txt");
    assert_eq!(ctx.sys_open(path, RDONLY), -1);
    // O_CREATE composes only with RDWR.
    assert_eq!(ctx.sys_open(path, 0x200 | 0x1), -1);
    assert_eq!(ctx.sys_open(path, 0x777), -1);

    let share = ustr(ctx, "/share.txt");
    let fd = ctx.sys_open(share, RDONLY);
    assert!(fd >= 0);
    assert_eq!(ctx.sys_write(fd, buf, 4), -1);
    assert_eq!(ctx.sys_read(fd, buf, 0), -1);
    assert_eq!(ctx.sys_read(fd, buf, -4), -1);
    assert_eq!(ctx.sys_close(fd), 0);

    let wr = ctx.sys_open(share, 0x1);
    assert!(wr >= 0);
    assert_eq!(ctx.sys_read(wr, buf, 4), -1);
    assert_eq!(ctx.sys_close(wr), 0);

    // A bad user pointer fails before side effects.
    let bogus = UVAddr::new(0x7000_0000);
    assert_eq!(ctx.sys_read(0, bogus, 4), -1);
    assert_eq!(ctx.sys_open(bogus, RDWR), -1);

    // fstat works on disk files only.
    let fds_va = ubuf(ctx);
    assert_eq!(ctx.sys_pipe(fds_va), 0);
    let (rfd, wfd) = read_fd_pair(ctx, fds_va);
    assert_eq!(ctx.sys_fstat(rfd, buf), -1);
    assert_eq!(ctx.sys_close(rfd), 0);
    assert_eq!(ctx.sys_close(wfd), 0);

    // wait with no children.
    assert_eq!(ctx.sys_wait(), -1);
    assert_eq!(ctx.sys_kill(424242), -1);
    0
}

#[test]
fn uniform_error_returns() {
    let image = ImageBuilder::new()
        .program("/errorcases")
        .file("/share.txt", b"ccccccccccppppppppp\n")
        .build();
    let kernel = boot(image, &[("/errorcases", errorcases)]);
    assert_eq!(kernel.run("/errorcases", &[]), 0);
    kernel.check_invariants();
}

/// Writes to a device file route through the device table (the console),
/// and kill terminates a looping child.
fn misc(ctx: &KernelCtx<'_>) -> i32 {
    let con = ustr(ctx, "/console");
    let fd = ctx.sys_open(con, RDWR);
    assert!(fd >= 0);
    let buf = ubuf(ctx);
    ctx.copy_out(buf, b"console device says hi\n").unwrap();
    assert_eq!(ctx.sys_write(fd, buf, 23), 23);
    // Console reads are end of file on this machine.
    assert_eq!(ctx.sys_read(fd, buf, 8), 0);
    assert_eq!(ctx.sys_close(fd), 0);

    // getpid is stable; sleep waits for the clock.
    let pid = ctx.sys_getpid();
    assert!(pid > 0);
    let before = ctx.kernel().ticks().now();
    assert_eq!(ctx.sys_sleep(3), 0);
    assert!(ctx.kernel().ticks().now() >= before + 3);

    // kill: the victim exits at its next trap boundary.
    let child = ctx.sys_fork(Box::new(move |ctx: &KernelCtx<'_>| {
        loop {
            let _ = ctx.sys_sleep(1);
            if ctx.killed() {
                // The boundary inside the next syscall will finish it,
                // but be explicit.
                ctx.sys_exit(-1);
            }
        }
    }));
    assert!(child > 0);
    assert_eq!(ctx.sys_sleep(2), 0);
    assert_eq!(ctx.sys_kill(child), 0);
    assert_eq!(ctx.sys_wait(), child);
    0
}

#[test]
fn devices_sleep_and_kill() {
    let image = ImageBuilder::new()
        .program("/misc")
        .device("/console", 1)
        .build();
    let kernel = boot(image, &[("/misc", misc)]);
    assert_eq!(kernel.run("/misc", &[]), 0);
    kernel.check_invariants();
}
