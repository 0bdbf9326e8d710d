/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active i-nodes.
pub const NINODE: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Device number of file system root disk.
pub const ROOTDEV: u32 = 1;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Max length of a single exec argument (including NUL).
pub const MAXARGLEN: usize = 128;

/// Block size.
pub const BSIZE: usize = 512;

/// Page size.
pub const PGSIZE: usize = 4096;

/// Blocks per page; a swap slot is one page.
pub const BLOCKS_PER_PAGE: usize = PGSIZE / BSIZE;

/// Max data blocks in the on-disk log (payload, not counting the commit block).
pub const LOGSIZE: usize = 40;

/// Size of the disk block cache.
pub const NBUF: usize = 30;

/// Maximum file path name.
pub const MAXPATH: usize = 128;

/// Maximum length of process name.
pub const MAXPROCNAME: usize = 16;

/// Extents per inode.
pub const NEXTENT: usize = 7;

/// Blocks per allocation group; the free bitmap hands out whole groups.
pub const EXTENT_BLOCKS: u32 = 8;

/// Number of swap slots; each slot holds one page.
pub const NSWAPSLOT: usize = 2048;

/// Frame pool size of the default hosted machine.
pub const NFRAME_DEFAULT: usize = 512;

/// Free-frame low-water mark below which the allocator evicts to swap.
pub const KALLOC_LOW_WATER: usize = 10;

/// Top of the user address space; the stack grows down from here.
pub const SZ_2G: usize = 2 << 30;

/// User stack growth cap, in pages.
pub const USTACK_PAGES: usize = 10;

/// Inum of the inode-file itself.
pub const INODEFILEINO: u16 = 0;

/// Inum of the root directory.
pub const ROOTINO: u16 = 1;

/// Length of a directory entry name.
pub const DIRSIZ: usize = 14;
