//! flatfs core - the metadata engine of a small fixed-layout filesystem
//!
//! A flatfs volume is a run of 4 KiB blocks: a superblock with a 64-bit
//! free-block bitmap, one block of inode records, and one data block per
//! file or directory. Directories hold a flat array of name records. Removed
//! inodes and directory records stay behind as tombstones.
//!
//! [`FlatFs`] is the entry point: mount a formatted [`BlockDevice`], then
//! create, look up, read, write, list, rename and remove objects.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod block_bitmap;
pub mod blockdev;
pub mod buffer;
pub mod cache;
pub mod check;
pub mod config;
pub mod directory;
pub mod error;
pub mod format;
pub mod fs;
#[cfg(feature = "fuse")]
pub mod fuse;
pub mod inode_table;
pub mod layout;
mod lock;
pub mod superblock;
mod walk;

pub use blockdev::{BlockDevice, BlockDeviceError, FileBackedBlockDevice, MemBlockDevice, BLOCK_SIZE};
pub use check::{check, CheckReport};
pub use config::{FormatOptions, FsConfig};
pub use directory::DirEntry;
pub use error::{FsError, Result};
pub use format::{create_image, format_device};
pub use fs::{DirContext, FlatFs, FsStats, OpenFile};
pub use layout::{InodeKind, InodeRecord, Liveness, Superblock, MAX_OBJECTS, ROOT_INODE};

