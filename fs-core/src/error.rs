//! Error types for the flatfs metadata engine

use thiserror::Error;

use crate::blockdev::BlockDeviceError;

/// Filesystem error type
#[derive(Error, Debug)]
pub enum FsError {
    /// Block device failure
    #[error("I/O error: {0}")]
    Io(#[from] BlockDeviceError),

    /// Superblock magic does not match
    #[error("Bad magic number: {0:#x}")]
    BadMagic(u64),
    /// Superblock block size does not match the format constant
    #[error("Unsupported block size: {0}")]
    BadBlockSize(u64),
    /// Superblock version is not understood
    #[error("Unsupported filesystem version: {0}")]
    UnsupportedVersion(u64),

    /// No free bit left in the free-block bitmap
    #[error("No free blocks")]
    OutOfSpace,
    /// The live object limit has been reached
    #[error("Too many filesystem objects (limit {0})")]
    TooManyObjects(u64),
    /// Every inode-table slot is in use
    #[error("Inode table is full")]
    InodeTableFull,
    /// Every record slot of a directory block is in use
    #[error("Directory {0} is full")]
    DirectoryFull(u64),
    /// A write would run past the single data block of a file
    #[error("File too large: {0} bytes exceeds one block")]
    FileTooLarge(u64),

    /// Name not present in the parent directory
    #[error("File not found")]
    NotFound,
    /// Name already present in the parent directory
    #[error("File already exists")]
    AlreadyExists,
    #[error("Not a directory")]
    NotADirectory,
    #[error("Is a directory")]
    IsADirectory,
    #[error("Directory not empty")]
    NotEmpty,
    /// Empty name, `.`/`..`, or a name containing `/` or NUL
    #[error("Invalid file name")]
    InvalidName,
    #[error("File name longer than {0} bytes")]
    NameTooLong(usize),
    /// Rename of a directory into itself or one of its descendants
    #[error("Cannot move a directory beneath itself")]
    InvalidMove,

    /// An update targeted an inode number with no live table slot
    #[error("Inode {0} has no live slot in the inode table")]
    InodeNotFound(u64),
    /// On-disk structures contradict each other
    #[error("Filesystem is corrupt: {0}")]
    Corrupt(String),

    #[error("Filesystem is mounted read-only")]
    ReadOnly,
    /// A lock wait was interrupted; the operation made no changes and may be retried
    #[error("Interrupted while waiting for a lock")]
    Interrupted,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl FsError {
    /// Whether the caller may simply retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, FsError::Interrupted)
    }

    /// Whether this is a capacity failure (no space, no slots, too many objects)
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            FsError::OutOfSpace
                | FsError::TooManyObjects(_)
                | FsError::InodeTableFull
                | FsError::DirectoryFull(_)
                | FsError::FileTooLarge(_)
        )
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::Io(BlockDeviceError::Io(err))
    }
}

/// Result type for filesystem operations
pub type Result<T> = std::result::Result<T, FsError>;
