//! exec: replace the current image with a program loaded from the file
//! system.
//!
//! Builds a fresh address space (ELF segments, one stack page at the top),
//! lays out the argument strings and the argv pointer vector on the new
//! stack, points the trapframe at the entry ABI (`rip = entry`,
//! `rdi = argc`, `rsi = &argv[0]`, `rsp = &argv[0] - 8`), and only then
//! swaps the new image in and frees the old one. On any failure the old
//! image is untouched and the caller sees -1.
//!
//! The hosted machine cannot jump to the loaded code, so the program's
//! behavior comes from the kernel's registry: the path names a host
//! function which runs against the freshly built image, reading its
//! arguments back out of simulated user memory.

use core::mem;

use scopeguard::ScopeGuard;

use crate::fs::{self, Path};
use crate::kernel::UserFn;
use crate::param::{MAXARG, SZ_2G};
use crate::proc::{KernelCtx, Trapframe};
use crate::vm::{self, Vspace};

/// Loads `path` with arguments `argv` (NUL-free byte strings). On success
/// the current process runs the new image; the returned function is its
/// code.
pub(crate) fn kexec(
    ctx: &KernelCtx<'_>,
    path: &str,
    argv: &[&[u8]],
) -> Result<UserFn, ()> {
    let kernel = ctx.kernel();
    if argv.len() > MAXARG {
        return Err(());
    }

    // Resolve the program's code up front; an image we cannot run must
    // not destroy the current one.
    let ufn = kernel.lookup_program(path).ok_or(())?;

    let ino = fs::namei(kernel, ctx, &Path::new(path.as_bytes()))?;
    let ino = scopeguard::guard(ino, |i| kernel.itable().irelease(i));

    let mut temp = Vspace::new();
    let entry = {
        let mut ip = kernel.itable().lock(*ino, ctx);
        match vm::load_elf(&mut temp, &mut ip, ctx) {
            Ok(entry) => entry,
            Err(()) => {
                drop(ip);
                temp.free(kernel);
                return Err(());
            }
        }
    };

    // From here on, failures free the half-built image.
    let mut temp = scopeguard::guard(temp, |t| t.free(kernel));

    vm::init_stack(&mut *temp, ctx)?;

    // Argument strings go at the top of the stack, 8-byte aligned, each
    // NUL-terminated; below them the pointer vector with a trailing null
    // and one slot of (never used) return pc.
    let mut ustack = [0usize; MAXARG + 2];
    let mut sp = SZ_2G;
    for (i, arg) in argv.iter().enumerate() {
        if arg.contains(&0) {
            return Err(());
        }
        sp -= (arg.len() + 1 + 7) / 8 * 8;
        temp.write_to_va(kernel, sp, arg)?;
        temp.write_to_va(kernel, sp + arg.len(), &[0])?;
        ustack[1 + i] = sp;
    }
    ustack[0] = 0;
    ustack[1 + argv.len()] = 0;

    let vec_len = 2 + argv.len();
    sp -= vec_len * 8;
    let mut vec_bytes = [0u8; (MAXARG + 2) * 8];
    for (i, p) in ustack[..vec_len].iter().enumerate() {
        vec_bytes[i * 8..(i + 1) * 8].copy_from_slice(&p.to_le_bytes());
    }
    temp.write_to_va(kernel, sp, &vec_bytes[..vec_len * 8])?;

    // Commit to the new image.
    let temp = ScopeGuard::into_inner(temp);
    // SAFETY: our own data; the old image is replaced wholesale.
    let old = unsafe {
        let data = &mut *ctx.data_ptr();
        data.tf = Trapframe {
            rip: entry,
            rdi: argv.len(),
            rsi: sp + 8,
            rsp: sp,
            rax: 0,
        };
        let name = path.as_bytes();
        let base = name.iter().rposition(|&c| c == b'/').map_or(0, |i| i + 1);
        let short = &name[base..];
        let len = short.len().min(data.name.len());
        data.name = [0; crate::param::MAXPROCNAME];
        data.name[..len].copy_from_slice(&short[..len]);
        mem::replace(&mut data.vspace, temp)
    };
    old.free(kernel);
    // Now that the image belongs to a live process, its frames join the
    // eviction pool.
    // SAFETY: short-lived.
    unsafe { (*ctx.vspace_ptr()).mark_user_frames(kernel) };

    Ok(ufn)
}
