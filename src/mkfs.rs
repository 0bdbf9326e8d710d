//! mkfs: builds an initial file system image in memory.
//!
//! Layout: block 0 boot, block 1 superblock, one bitmap block, then the
//! allocatable region (the inode file's groups first, then the root
//! directory's, then file data), the swap region, and the log (commit
//! block + payload). The inode file is inum 0 and describes itself; the
//! root directory is inum 1.
//!
//! Groups are handed out forward here; the runtime allocator scans the
//! bitmap backward, so a fresh image and a running kernel never collide
//! until the disk fills.

use zerocopy::AsBytes;

use crate::elf::{ElfHdr, ProgHdr, ELF_MAGIC, ELF_PROG_LOAD};
use crate::fs::{Dinode, Dirent, Extent, FileName, Path, Superblock, T_DEV, T_DIR, T_FILE};
use crate::param::{
    BSIZE, DIRSIZ, EXTENT_BLOCKS, LOGSIZE, NEXTENT, NSWAPSLOT, PGSIZE,
};

/// Allocatable blocks (inode file + data); exactly one bitmap block's
/// worth of groups.
const NBLOCKS: u32 = (BSIZE * 8) as u32;
const BMAPSTART: u32 = 2;
const INODESTART: u32 = 3;
const GROUP_BYTES: usize = EXTENT_BLOCKS as usize * BSIZE;
const DINODE_SIZE: usize = core::mem::size_of::<Dinode>();
const DIRENT_SIZE: usize = core::mem::size_of::<Dirent>();

/// Inodes the initial inode-file group can hold.
const NINODES_MAX: usize = GROUP_BYTES / DINODE_SIZE;

enum Entry {
    Data(Vec<u8>),
    Device(i16),
}

/// Builds a disk image holding the given files.
pub struct ImageBuilder {
    files: Vec<(String, Entry)>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self { files: Vec::new() }
    }

    /// A regular file with the given contents.
    pub fn file(mut self, path: &str, data: &[u8]) -> Self {
        self.files.push((path.into(), Entry::Data(data.to_vec())));
        self
    }

    /// A program: a small ELF image whose single segment carries the
    /// path string as payload. The code itself lives in the kernel's
    /// program registry under the same path.
    pub fn program(self, path: &str) -> Self {
        let elf = program_elf(path.as_bytes());
        self.file(path, &elf)
    }

    /// A device file.
    pub fn device(mut self, path: &str, devid: i16) -> Self {
        self.files.push((path.into(), Entry::Device(devid)));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let swapstart = INODESTART + NBLOCKS;
        let logstart = swapstart + (NSWAPSLOT * PGSIZE / BSIZE) as u32;
        let size = logstart + 1 + LOGSIZE as u32;

        let ninodes = 2 + self.files.len();
        assert!(ninodes <= NINODES_MAX, "mkfs: too many files");

        let mut image = vec![0u8; size as usize * BSIZE];
        let mut next_group: u32 = 0;
        let mut alloc_group = |image: &mut Vec<u8>| -> u32 {
            let g = next_group;
            next_group += 1;
            assert!(g < NBLOCKS / EXTENT_BLOCKS, "mkfs: image full");
            // One bitmap byte per group.
            image[BMAPSTART as usize * BSIZE + g as usize] = 0xFF;
            INODESTART + g * EXTENT_BLOCKS
        };

        // Group 0: the inode file. Group 1: the root directory.
        let inofile_start = alloc_group(&mut image);
        let root_start = alloc_group(&mut image);

        let mut dinodes: Vec<Dinode> = Vec::new();
        let extent0 = |start: u32| {
            let mut data = [Extent::default(); NEXTENT];
            data[0] = Extent {
                start,
                nblocks: EXTENT_BLOCKS,
            };
            data
        };
        dinodes.push(Dinode {
            typ: T_FILE,
            devid: 0,
            size: (ninodes * DINODE_SIZE) as u32,
            data: extent0(inofile_start),
        });
        dinodes.push(Dinode {
            typ: T_DIR,
            devid: 0,
            size: (self.files.len() * DIRENT_SIZE) as u32,
            data: extent0(root_start),
        });

        // File contents, one extent per group.
        for (_, entry) in self.files.iter() {
            match entry {
                Entry::Data(bytes) => {
                    assert!(
                        bytes.len() <= NEXTENT * GROUP_BYTES,
                        "mkfs: file too large"
                    );
                    let mut data = [Extent::default(); NEXTENT];
                    for (i, chunk) in bytes.chunks(GROUP_BYTES).enumerate() {
                        let start = alloc_group(&mut image);
                        data[i] = Extent {
                            start,
                            nblocks: EXTENT_BLOCKS,
                        };
                        let at = start as usize * BSIZE;
                        image[at..at + chunk.len()].copy_from_slice(chunk);
                    }
                    dinodes.push(Dinode {
                        typ: T_FILE,
                        devid: 0,
                        size: bytes.len() as u32,
                        data,
                    });
                }
                Entry::Device(devid) => {
                    dinodes.push(Dinode {
                        typ: T_DEV,
                        devid: *devid,
                        size: 0,
                        data: [Extent::default(); NEXTENT],
                    });
                }
            }
        }

        // The inode file's contents.
        for (inum, di) in dinodes.iter().enumerate() {
            let at = inofile_start as usize * BSIZE + inum * DINODE_SIZE;
            image[at..at + DINODE_SIZE].copy_from_slice(di.as_bytes());
        }

        // The root directory's entries, named by the final path element.
        for (i, (path, _)) in self.files.iter().enumerate() {
            let name = Path::new(path.as_bytes())
                .elements()
                .last()
                .unwrap_or_else(|| FileName::from_bytes(path.as_bytes()));
            let mut de = Dirent::default();
            de.inum = (2 + i) as u16;
            de.set_name(&name);
            let at = root_start as usize * BSIZE + i * DIRENT_SIZE;
            image[at..at + DIRENT_SIZE].copy_from_slice(de.as_bytes());
        }

        // The superblock.
        let sb = Superblock {
            size,
            nblocks: NBLOCKS,
            bmapstart: BMAPSTART,
            inodestart: INODESTART,
            swapstart,
            logstart,
        };
        let at = BSIZE;
        image[at..at + core::mem::size_of::<Superblock>()].copy_from_slice(sb.as_bytes());

        image
    }
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A minimal ELF64 image: one PT_LOAD segment at virtual address 0
/// carrying `payload`.
pub fn program_elf(payload: &[u8]) -> Vec<u8> {
    let ehsize = core::mem::size_of::<ElfHdr>();
    let phsize = core::mem::size_of::<ProgHdr>();
    let ehdr = ElfHdr {
        magic: ELF_MAGIC,
        elf: [0; 12],
        typ: 2,
        machine: 0x3e,
        version: 1,
        entry: 0,
        phoff: ehsize as u64,
        shoff: 0,
        flags: 0,
        ehsize: ehsize as u16,
        phentsize: phsize as u16,
        phnum: 1,
        shentsize: 0,
        shnum: 0,
        shstrndx: 0,
    };
    let ph = ProgHdr {
        typ: ELF_PROG_LOAD,
        flags: 0x5,
        off: (ehsize + phsize) as u64,
        vaddr: 0,
        paddr: 0,
        filesz: payload.len() as u64,
        memsz: payload.len() as u64,
        align: PGSIZE as u64,
    };
    let mut out = Vec::with_capacity(ehsize + phsize + payload.len());
    out.extend_from_slice(ehdr.as_bytes());
    out.extend_from_slice(ph.as_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::read_obj;

    #[test]
    fn layout() {
        let image = ImageBuilder::new().file("/a.txt", b"hello").build();
        let sb: Superblock = read_obj(&image[BSIZE..2 * BSIZE]);
        assert_eq!(sb.bmapstart, 2);
        assert_eq!(sb.inodestart, 3);
        assert_eq!(sb.nblocks, 4096);
        assert_eq!(sb.swapstart, 3 + 4096);
        assert_eq!(sb.logstart, sb.swapstart + 2048 * 8);
        assert_eq!(sb.size, sb.logstart + 41);
        assert_eq!(image.len(), sb.size as usize * BSIZE);

        // Inum 0 is the inode file, inum 1 the root directory.
        let at = 3 * BSIZE;
        let d0: Dinode = read_obj(&image[at..at + DINODE_SIZE]);
        assert_eq!(d0.typ, T_FILE);
        assert_eq!(d0.size, 3 * DINODE_SIZE as u32);
        assert_eq!(d0.data[0].start, 3);
        let d1: Dinode = read_obj(&image[at + DINODE_SIZE..at + 2 * DINODE_SIZE]);
        assert_eq!(d1.typ, T_DIR);
        assert_eq!(d1.size, DIRENT_SIZE as u32);

        // The root entry names the file.
        let root_at = d1.data[0].start as usize * BSIZE;
        let de: Dirent = read_obj(&image[root_at..root_at + DIRENT_SIZE]);
        assert_eq!(de.inum, 2);
        assert_eq!(&de.name[..5], b"a.txt");

        // Groups 0..3 (inode file, root, file data) are marked used.
        assert_eq!(&image[2 * BSIZE..2 * BSIZE + 3], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(image[2 * BSIZE + 3], 0);
    }

    #[test]
    fn program_images_parse() {
        let elf = program_elf(b"/prog");
        let hdr: ElfHdr = read_obj(&elf);
        assert!(hdr.is_valid());
        let ph: ProgHdr = read_obj(&elf[hdr.phoff as usize..]);
        assert!(ph.is_prog_load());
        assert_eq!(ph.filesz, 5);
        assert_eq!(ph.vaddr, 0);
    }
}
