use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::param::BSIZE;

/// Disk layout:
/// [ boot block | super block | free bit map | inode file + data blocks |
///   swap region | commit block + log blocks ]
///
/// mkfs computes the super block and builds the initial file system. The
/// super block describes the layout:
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct Superblock {
    /// Size of file system image (blocks).
    pub size: u32,

    /// Number of allocatable blocks (inode file + data).
    pub nblocks: u32,

    /// Block number of the first free-map block.
    pub bmapstart: u32,

    /// Block number of the start of the inode file.
    pub inodestart: u32,

    /// Block number of the start of the swap region.
    pub swapstart: u32,

    /// Block number of the commit block; log payload follows it.
    pub logstart: u32,
}

const_assert!(core::mem::size_of::<Superblock>() <= BSIZE);
