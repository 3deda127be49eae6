//! flatfs formatter (mkfs)
//!
//! Lays down a fresh volume: superblock, an inode table holding the root
//! directory and one welcome file, the root's single directory record, and
//! the welcome file's data block.

use std::path::Path;

use crate::blockdev::{BlockDevice, FileBackedBlockDevice, BLOCK_SIZE};
use crate::block_bitmap::FreeBitmap;
use crate::config::FormatOptions;
use crate::error::{FsError, Result};
use crate::layout::{
    dir_slot_range, inode_slot_range, validate_name, DirRecord, InodeKind, InodeRecord,
    Superblock, INODE_TABLE_BLOCK, MAGIC, ROOT_DIR_BLOCK, ROOT_INODE, SUPERBLOCK_BLOCK, VERSION,
    WELCOME_BLOCK,
};

/// Blocks a volume needs at the very least
pub const MIN_BLOCKS: u64 = WELCOME_BLOCK + 1;

/// Inode number of the welcome file
pub const WELCOME_INODE: u64 = ROOT_INODE + 1;

/// Format `device` and return the superblock that was written
pub async fn format_device(device: &dyn BlockDevice, options: &FormatOptions) -> Result<Superblock> {
    validate_name(&options.welcome_name)?;
    let body = options.welcome_body.as_bytes();
    if body.len() > BLOCK_SIZE {
        return Err(FsError::FileTooLarge(body.len() as u64));
    }
    if device.is_read_only() {
        return Err(FsError::ReadOnly);
    }
    let block_count = device.block_count();
    if block_count < MIN_BLOCKS {
        return Err(FsError::InvalidArgument(format!(
            "device has {} blocks, at least {} are needed",
            block_count, MIN_BLOCKS
        )));
    }

    let superblock = Superblock {
        version: VERSION,
        magic: MAGIC,
        block_size: BLOCK_SIZE as u64,
        inodes_count: WELCOME_INODE,
        free_blocks: FreeBitmap::for_device(block_count, MIN_BLOCKS),
        real_inodes_count: WELCOME_INODE,
    };

    let mut root = InodeRecord::new(InodeKind::Directory, ROOT_INODE, ROOT_DIR_BLOCK);
    root.payload = 1;
    let mut welcome = InodeRecord::new(InodeKind::File, WELCOME_INODE, WELCOME_BLOCK);
    welcome.payload = body.len() as u64;

    let mut block = vec![0u8; BLOCK_SIZE];
    superblock.write_to(&mut block)?;
    device.write_block(SUPERBLOCK_BLOCK, &block).await?;
    log::debug!("FORMAT: superblock written");

    block.fill(0);
    root.write_to(&mut block[inode_slot_range(0)])?;
    welcome.write_to(&mut block[inode_slot_range(1)])?;
    device.write_block(INODE_TABLE_BLOCK, &block).await?;
    log::debug!("FORMAT: inode table written");

    block.fill(0);
    DirRecord::new(&options.welcome_name, WELCOME_INODE).write_to(&mut block[dir_slot_range(0)])?;
    device.write_block(ROOT_DIR_BLOCK, &block).await?;
    log::debug!("FORMAT: root directory written");

    block.fill(0);
    block[..body.len()].copy_from_slice(body);
    device.write_block(WELCOME_BLOCK, &block).await?;
    log::debug!("FORMAT: welcome file written");

    device.sync().await?;
    log::info!(
        "FORMAT: formatted {} blocks ({} free for data)",
        block_count,
        superblock.free_blocks.free_count()
    );
    Ok(superblock)
}

/// Create an image file of `blocks` blocks at `path` and format it
pub async fn create_image(
    path: impl AsRef<Path>,
    blocks: u64,
    options: &FormatOptions,
) -> Result<FileBackedBlockDevice> {
    if blocks < MIN_BLOCKS {
        return Err(FsError::InvalidArgument(format!(
            "image needs at least {} blocks, got {}",
            MIN_BLOCKS, blocks
        )));
    }
    let device = FileBackedBlockDevice::create(path.as_ref(), blocks * BLOCK_SIZE as u64).await?;
    format_device(&device, options).await?;
    Ok(device)
}
