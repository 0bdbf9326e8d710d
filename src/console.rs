//! Kernel console output.
//!
//! A spinlocked printer is the kernel's only logging surface; the console
//! device (devid 1) routes `write` through it. There is no keyboard on
//! the hosted machine, so console reads return end of file.

use core::fmt;

use crate::proc::KernelCtx;
use crate::vm::UVAddr;

/// Console device id.
pub const CONSOLE: i16 = 1;

pub struct Printer;

impl Printer {
    pub const fn new() -> Self {
        Self
    }
}

impl fmt::Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        eprint!("{}", s);
        Ok(())
    }
}

/// print! to the kernel console: `kprint!(kernel, "...")`.
#[macro_export]
macro_rules! kprint {
    ($k:expr, $($arg:tt)*) => {
        $k.printer_write_fmt(format_args!($($arg)*))
    };
}

/// println! to the kernel console: `kprintln!(kernel, "...")`.
#[macro_export]
macro_rules! kprintln {
    ($k:expr) => {
        $crate::kprint!($k, "\n")
    };
    ($k:expr, $($arg:tt)*) => {
        $k.printer_write_fmt(format_args!("{}\n", format_args!($($arg)*)))
    };
}

/// The console device's write half: copy in from user memory, print.
pub(crate) fn console_write(ctx: &KernelCtx<'_>, src: UVAddr, n: usize) -> Result<usize, ()> {
    let mut bytes = vec![0u8; n];
    ctx.copy_in(src, &mut bytes)?;
    kprint!(ctx.kernel(), "{}", String::from_utf8_lossy(&bytes));
    Ok(n)
}

/// The console device's read half: always end of file.
pub(crate) fn console_read(_ctx: &KernelCtx<'_>, _dst: UVAddr, _n: usize) -> Result<usize, ()> {
    Ok(0)
}
