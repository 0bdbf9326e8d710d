//! xk64: a teaching-grade Unix kernel core, hosted for testing.
//!
//! The kernel implements copy-on-write fork, on-demand user-stack growth
//! and page swap over a frame table; a crash-safe extent-based file system
//! with a commit-block write-ahead log; and the process/IPC layer gluing
//! the two together (fork/exec/wait/exit/kill, pipes, file descriptors
//! with shared offsets).
//!
//! Hardware is replaced by an in-process seam so a fresh kernel image can
//! be instantiated per test: the block device is an in-memory disk, the
//! hardware page table is simulated per address space, and kernel threads
//! are host threads multiplexed by a strict one-at-a-time context handoff.

#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::result_unit_err)]

mod bio;
mod console;
mod disk;
mod elf;
mod exec;
mod fcntl;
mod file;
mod fs;
mod kalloc;
mod kernel;
mod lock;
mod mkfs;
mod param;
mod pipe;
mod proc;
mod swap;
mod sysfile;
mod sysproc;
mod trap;
mod vm;

pub use disk::MemDisk;
pub use fcntl::OpenFlags;
pub use file::{DevFn, Devsw};
pub use fs::{Stat, T_DEV, T_DIR, T_FILE};
pub use kernel::{Kernel, SysInfo, UserFn};
pub use mkfs::ImageBuilder;
pub use proc::{ChildFn, KernelCtx, Pid};
pub use vm::UVAddr;

pub use param::*;
