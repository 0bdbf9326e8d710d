//! File-system system calls. Mostly argument checking, since we don't
//! trust user pointers, and calls into file.rs and fs. Every call passes
//! the trap boundary first: a pending kill ends the process, and the CPU
//! is offered to the other runnable processes.

use cstr_core::CStr;

use crate::fcntl::OpenFlags;
use crate::file;
use crate::param::{MAXARG, MAXPATH};
use crate::proc::KernelCtx;
use crate::vm::UVAddr;

impl KernelCtx<'_> {
    /// Fetches a NUL-terminated user string as bytes.
    fn fetch_str(&self, va: UVAddr) -> Result<Vec<u8>, ()> {
        let mut bytes = self.copy_in_str(va, MAXPATH)?;
        bytes.push(0);
        let cstr = CStr::from_bytes_with_nul(&bytes).map_err(|_| ())?;
        Ok(cstr.to_bytes().to_vec())
    }

    /// open(path, mode): resolves or creates the file, binds a fresh fd.
    pub fn sys_open(&self, path: UVAddr, mode: i32) -> i32 {
        self.trap_boundary();
        let res = (|| {
            let flags = OpenFlags::from_bits(mode).ok_or(())?;
            let path = self.fetch_str(path)?;
            file::fileopen(self, &path, flags)
        })();
        res.unwrap_or(-1)
    }

    /// close(fd).
    pub fn sys_close(&self, fd: i32) -> i32 {
        self.trap_boundary();
        match file::fileclose(self, fd) {
            Ok(()) => 0,
            Err(()) => -1,
        }
    }

    /// read(fd, buf, n).
    pub fn sys_read(&self, fd: i32, buf: UVAddr, n: i32) -> i32 {
        self.trap_boundary();
        if n <= 0 || !self.user_range_ok(buf, n as usize) {
            return -1;
        }
        match file::fileread(self, fd, buf, n as usize) {
            Ok(r) => r as i32,
            Err(()) => -1,
        }
    }

    /// write(fd, buf, n).
    pub fn sys_write(&self, fd: i32, buf: UVAddr, n: i32) -> i32 {
        self.trap_boundary();
        if n <= 0 || !self.user_range_ok(buf, n as usize) {
            return -1;
        }
        match file::filewrite(self, fd, buf, n as usize) {
            Ok(r) => r as i32,
            Err(()) => -1,
        }
    }

    /// dup(fd): a fresh descriptor sharing the same open-file slot (and
    /// thus the same offset).
    pub fn sys_dup(&self, fd: i32) -> i32 {
        self.trap_boundary();
        file::filedup(self, fd).unwrap_or(-1)
    }

    /// fstat(fd, st).
    pub fn sys_fstat(&self, fd: i32, st: UVAddr) -> i32 {
        self.trap_boundary();
        if !self.user_range_ok(st, core::mem::size_of::<crate::fs::Stat>()) {
            return -1;
        }
        match file::filestat(self, fd, st) {
            Ok(()) => 0,
            Err(()) => -1,
        }
    }

    /// pipe(fds): creates a pipe and writes the two descriptors to user
    /// memory.
    pub fn sys_pipe(&self, fds: UVAddr) -> i32 {
        self.trap_boundary();
        if !self.user_range_ok(fds, 2 * core::mem::size_of::<i32>()) {
            return -1;
        }
        let (fd0, fd1) = match file::filepipe(self) {
            Ok(pair) => pair,
            Err(()) => return -1,
        };
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&fd0.to_le_bytes());
        bytes[4..].copy_from_slice(&fd1.to_le_bytes());
        if self.copy_out(fds, &bytes).is_err() {
            let _ = file::fileclose(self, fd0);
            let _ = file::fileclose(self, fd1);
            return -1;
        }
        0
    }

    /// exec(path, argv): on success the new program runs and this call
    /// never returns; on failure the old image continues and sees -1.
    pub fn sys_exec(&self, path: UVAddr, argv: UVAddr) -> i32 {
        self.trap_boundary();
        let prepared = (|| {
            let path = self.fetch_str(path)?;
            let path = String::from_utf8(path).map_err(|_| ())?;
            let mut args: Vec<Vec<u8>> = Vec::new();
            loop {
                let slot = argv.add(args.len() * 8);
                if !self.user_range_ok(slot, 8) {
                    return Err(());
                }
                let p: u64 = self.copy_in_obj(slot)?;
                if p == 0 {
                    break;
                }
                if args.len() == MAXARG {
                    return Err(());
                }
                args.push(self.fetch_str(UVAddr::new(p as usize))?);
            }
            Ok((path, args))
        })();
        let (path, args) = match prepared {
            Ok(p) => p,
            Err(()) => return -1,
        };
        let argrefs: Vec<&[u8]> = args.iter().map(|a| &a[..]).collect();
        match crate::exec::kexec(self, &path, &argrefs) {
            Ok(ufn) => {
                let code = ufn(self);
                self.exit(code)
            }
            Err(()) => -1,
        }
    }
}
