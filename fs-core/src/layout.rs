//! On-disk layout definitions for flatfs
//!
//! ```text
//! block 0   superblock
//! block 1   inode table (102 records of 40 bytes)
//! block 2   root directory records (15 records of 272 bytes)
//! block 3.. one data block per file or directory
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::io::{Cursor, Read, Write};

use crate::blockdev::BLOCK_SIZE;
use crate::block_bitmap::FreeBitmap;
use crate::error::{FsError, Result};

/// Magic number for flatfs
pub const MAGIC: u64 = 0x2020_0406;
/// Current filesystem version
pub const VERSION: u64 = 1;

/// Block holding the superblock
pub const SUPERBLOCK_BLOCK: u64 = 0;
/// Block holding the inode table
pub const INODE_TABLE_BLOCK: u64 = 1;
/// Data block of the root directory
pub const ROOT_DIR_BLOCK: u64 = 2;
/// Inode number of the root directory
pub const ROOT_INODE: u64 = 1;
/// Data block of the welcome file written by the formatter
pub const WELCOME_BLOCK: u64 = 3;
/// First bitmap position the allocator looks at
pub const FIRST_ALLOCATABLE_BLOCK: u64 = 2;
/// Maximum number of live objects (and bitmap positions)
pub const MAX_OBJECTS: u64 = 64;

/// Longest file name, in bytes
pub const FILENAME_MAXLEN: usize = 255;

/// Bytes used by the encoded superblock fields
pub const SUPERBLOCK_SIZE: usize = 6 * 8;
/// Size of one inode record
pub const INODE_RECORD_SIZE: usize = 40;
/// Size of one directory record
pub const DIR_RECORD_SIZE: usize = 272;
/// Inode records that fit in the inode table block
pub const INODE_SLOTS: usize = BLOCK_SIZE / INODE_RECORD_SIZE;
/// Directory records that fit in one directory data block
pub const DIR_SLOTS: usize = BLOCK_SIZE / DIR_RECORD_SIZE;

/// File type mask
pub const S_IFMT: u32 = 0o170000;
/// Directory file type
pub const S_IFDIR: u32 = 0o040000;
/// Regular file type
pub const S_IFREG: u32 = 0o100000;
/// Default permission bits for new directories
pub const DEFAULT_DIR_PERM: u32 = 0o755;
/// Default permission bits for new files
pub const DEFAULT_FILE_PERM: u32 = 0o644;

const STATE_ALIVE: u64 = 1;
const STATE_REMOVED: u64 = 0;

/// Liveness flag shared by inode records and directory records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Liveness {
    Alive,
    /// Tombstone: the slot still occupies space but is logically gone
    Removed,
}

impl Liveness {
    fn from_raw(raw: u64) -> Result<Self> {
        match raw {
            STATE_ALIVE => Ok(Liveness::Alive),
            STATE_REMOVED => Ok(Liveness::Removed),
            other => Err(FsError::Corrupt(format!("unknown state flag {}", other))),
        }
    }

    fn to_raw(self) -> u64 {
        match self {
            Liveness::Alive => STATE_ALIVE,
            Liveness::Removed => STATE_REMOVED,
        }
    }

    /// Whether this is [`Liveness::Alive`]
    pub fn is_alive(self) -> bool {
        self == Liveness::Alive
    }
}

/// File type encoded in an inode's mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InodeKind {
    File,
    Directory,
}

impl InodeKind {
    /// Mode type bits for this kind
    pub fn mode_bits(self) -> u32 {
        match self {
            InodeKind::File => S_IFREG,
            InodeKind::Directory => S_IFDIR,
        }
    }

    fn default_perm(self) -> u32 {
        match self {
            InodeKind::File => DEFAULT_FILE_PERM,
            InodeKind::Directory => DEFAULT_DIR_PERM,
        }
    }
}

/// In-memory copy of block 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Superblock {
    pub version: u64,
    pub magic: u64,
    pub block_size: u64,
    /// Inode-table slots ever written, tombstones included
    pub inodes_count: u64,
    pub free_blocks: FreeBitmap,
    /// Inodes currently alive
    pub real_inodes_count: u64,
}

impl Superblock {
    /// Decode the superblock fields from the start of `block`
    pub fn read_from(block: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(block);
        Ok(Self {
            version: cursor.read_u64::<LittleEndian>()?,
            magic: cursor.read_u64::<LittleEndian>()?,
            block_size: cursor.read_u64::<LittleEndian>()?,
            inodes_count: cursor.read_u64::<LittleEndian>()?,
            free_blocks: FreeBitmap::from_raw(cursor.read_u64::<LittleEndian>()?),
            real_inodes_count: cursor.read_u64::<LittleEndian>()?,
        })
    }

    /// Encode into `block`, zeroing everything past the fields
    pub fn write_to(&self, block: &mut [u8]) -> Result<()> {
        block.fill(0);
        let mut cursor = Cursor::new(block);
        cursor.write_u64::<LittleEndian>(self.version)?;
        cursor.write_u64::<LittleEndian>(self.magic)?;
        cursor.write_u64::<LittleEndian>(self.block_size)?;
        cursor.write_u64::<LittleEndian>(self.inodes_count)?;
        cursor.write_u64::<LittleEndian>(self.free_blocks.raw())?;
        cursor.write_u64::<LittleEndian>(self.real_inodes_count)?;
        Ok(())
    }

    /// Check the format constants and counter bounds
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(FsError::BadMagic(self.magic));
        }
        if self.block_size != BLOCK_SIZE as u64 {
            return Err(FsError::BadBlockSize(self.block_size));
        }
        if self.version != VERSION {
            return Err(FsError::UnsupportedVersion(self.version));
        }
        if self.inodes_count > INODE_SLOTS as u64 {
            return Err(FsError::Corrupt(format!(
                "inodes_count {} exceeds the {} table slots",
                self.inodes_count, INODE_SLOTS
            )));
        }
        if self.real_inodes_count > self.inodes_count {
            return Err(FsError::Corrupt(format!(
                "real_inodes_count {} exceeds inodes_count {}",
                self.real_inodes_count, self.inodes_count
            )));
        }
        Ok(())
    }
}

/// One slot of the inode table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InodeRecord {
    pub mode: u32,
    pub inode_no: u64,
    pub data_block_number: u64,
    /// File size for regular files, live child count for directories
    pub payload: u64,
    pub state: Liveness,
}

impl InodeRecord {
    /// A fresh, empty, live record of the given kind
    pub fn new(kind: InodeKind, inode_no: u64, data_block_number: u64) -> Self {
        Self {
            mode: kind.mode_bits() | kind.default_perm(),
            inode_no,
            data_block_number,
            payload: 0,
            state: Liveness::Alive,
        }
    }

    /// File type, or `None` if the mode carries neither type bit
    pub fn kind(&self) -> Option<InodeKind> {
        match self.mode & S_IFMT {
            S_IFDIR => Some(InodeKind::Directory),
            S_IFREG => Some(InodeKind::File),
            _ => None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == Some(InodeKind::Directory)
    }

    pub fn is_file(&self) -> bool {
        self.kind() == Some(InodeKind::File)
    }

    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    /// Permission bits
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Byte length of a regular file
    pub fn file_size(&self) -> u64 {
        self.payload
    }

    /// Live entries of a directory
    pub fn children_count(&self) -> u64 {
        self.payload
    }

    /// Decode one record from a 40-byte slice
    pub fn read_from(slot: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(slot);
        let mode = cursor.read_u32::<LittleEndian>()?;
        let _pad = cursor.read_u32::<LittleEndian>()?;
        let inode_no = cursor.read_u64::<LittleEndian>()?;
        let data_block_number = cursor.read_u64::<LittleEndian>()?;
        let payload = cursor.read_u64::<LittleEndian>()?;
        let state = Liveness::from_raw(cursor.read_u64::<LittleEndian>()?)?;
        Ok(Self {
            mode,
            inode_no,
            data_block_number,
            payload,
            state,
        })
    }

    /// Encode into a 40-byte slice
    pub fn write_to(&self, slot: &mut [u8]) -> Result<()> {
        let mut cursor = Cursor::new(slot);
        cursor.write_u32::<LittleEndian>(self.mode)?;
        cursor.write_u32::<LittleEndian>(0)?;
        cursor.write_u64::<LittleEndian>(self.inode_no)?;
        cursor.write_u64::<LittleEndian>(self.data_block_number)?;
        cursor.write_u64::<LittleEndian>(self.payload)?;
        cursor.write_u64::<LittleEndian>(self.state.to_raw())?;
        Ok(())
    }
}

/// Byte range of inode slot `index` inside the inode table block
pub fn inode_slot_range(index: usize) -> std::ops::Range<usize> {
    let start = index * INODE_RECORD_SIZE;
    start..start + INODE_RECORD_SIZE
}

/// Byte range of directory record `index` inside a directory data block
pub fn dir_slot_range(index: usize) -> std::ops::Range<usize> {
    let start = index * DIR_RECORD_SIZE;
    start..start + DIR_RECORD_SIZE
}

/// One (name, inode, liveness) triple inside a directory data block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirRecord {
    pub name: String,
    pub inode_no: u64,
    pub state: Liveness,
}

impl DirRecord {
    /// A live record; `name` must already be validated
    pub fn new(name: &str, inode_no: u64) -> Self {
        Self {
            name: name.to_string(),
            inode_no,
            state: Liveness::Alive,
        }
    }

    /// Decode one record from a 272-byte slice
    pub fn read_from(slot: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(slot);
        let mut raw_name = [0u8; FILENAME_MAXLEN + 1];
        cursor.read_exact(&mut raw_name)?;
        let len = raw_name.iter().position(|&b| b == 0).unwrap_or(FILENAME_MAXLEN);
        let name = String::from_utf8_lossy(&raw_name[..len]).into_owned();
        let inode_no = cursor.read_u64::<LittleEndian>()?;
        let state = Liveness::from_raw(cursor.read_u64::<LittleEndian>()?)?;
        Ok(Self {
            name,
            inode_no,
            state,
        })
    }

    /// Encode into a 272-byte slice, NUL-padding the name
    pub fn write_to(&self, slot: &mut [u8]) -> Result<()> {
        let bytes = self.name.as_bytes();
        if bytes.len() > FILENAME_MAXLEN {
            return Err(FsError::NameTooLong(FILENAME_MAXLEN));
        }
        let mut raw_name = [0u8; FILENAME_MAXLEN + 1];
        raw_name[..bytes.len()].copy_from_slice(bytes);

        let mut cursor = Cursor::new(slot);
        cursor.write_all(&raw_name)?;
        cursor.write_u64::<LittleEndian>(self.inode_no)?;
        cursor.write_u64::<LittleEndian>(self.state.to_raw())?;
        Ok(())
    }
}

/// Reject names that cannot be stored as a single directory record
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(FsError::InvalidName);
    }
    if name.len() > FILENAME_MAXLEN {
        return Err(FsError::NameTooLong(FILENAME_MAXLEN));
    }
    Ok(())
}
