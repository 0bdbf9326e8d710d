//! Shared helpers for the end-to-end suites: build an image, boot a
//! kernel, and move data across the user-memory boundary the way a
//! program's loads and stores would.

use core::convert::TryInto;
use std::sync::Arc;

use xk64::{Kernel, KernelCtx, MemDisk, UVAddr, UserFn, PGSIZE};

pub fn boot(image: Vec<u8>, programs: &[(&str, UserFn)]) -> Arc<Kernel> {
    Kernel::new(MemDisk::new(&image, 0), programs)
}

pub fn boot_with_frames(
    image: Vec<u8>,
    nframes: usize,
    programs: &[(&str, UserFn)],
) -> Arc<Kernel> {
    Kernel::with_frames(MemDisk::new(&image, 0), nframes, programs)
}

/// Grows the heap and returns the base of the fresh range.
pub fn scratch(ctx: &KernelCtx<'_>, bytes: usize) -> UVAddr {
    let old = ctx.sys_sbrk(bytes);
    assert!(old >= 0, "sbrk failed");
    UVAddr::new(old as usize)
}

/// Places a NUL-terminated string in user memory and returns its address.
pub fn ustr(ctx: &KernelCtx<'_>, s: &str) -> UVAddr {
    let va = scratch(ctx, s.len() + 1);
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    ctx.copy_out(va, &bytes).unwrap();
    va
}

/// Reads `n` bytes of user memory.
pub fn uread(ctx: &KernelCtx<'_>, va: UVAddr, n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    ctx.copy_in(va, &mut out).unwrap();
    out
}

/// A page-sized user buffer.
pub fn ubuf(ctx: &KernelCtx<'_>) -> UVAddr {
    scratch(ctx, PGSIZE)
}

/// The two descriptors sys_pipe wrote to user memory.
pub fn read_fd_pair(ctx: &KernelCtx<'_>, va: UVAddr) -> (i32, i32) {
    let bytes = uread(ctx, va, 8);
    (
        i32::from_le_bytes(bytes[..4].try_into().unwrap()),
        i32::from_le_bytes(bytes[4..].try_into().unwrap()),
    )
}
