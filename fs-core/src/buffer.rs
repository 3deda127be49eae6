//! Block store adapter: scoped acquisition of block buffers.
//!
//! A buffer is obtained with [`BlockStore::read_block`], mutated in memory,
//! flagged with [`BlockBuffer::mark_dirty`], written back synchronously with
//! [`BlockStore::sync`] and finally handed back with [`BlockStore::release`].
//! None of the metadata stores keep a buffer past the operation that read it.

use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::blockdev::{BlockDevice, BlockDeviceError, BLOCK_SIZE};
use crate::cache::BlockCache;
use crate::error::{FsError, Result};

/// One block's worth of bytes checked out of the store
pub struct BlockBuffer {
    number: u64,
    data: Box<[u8; BLOCK_SIZE]>,
    dirty: bool,
}

impl BlockBuffer {
    /// Block number this buffer was read from
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Read access to the block contents
    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    /// Write access to the block contents; call [`mark_dirty`](Self::mark_dirty) afterwards
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Flag the buffer as modified so the next sync writes it back
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Whether the buffer holds changes not yet written back
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl std::fmt::Debug for BlockBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockBuffer")
            .field("number", &self.number)
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// Adapter between the metadata engine and a [`BlockDevice`]
pub struct BlockStore {
    device: Arc<dyn BlockDevice>,
    cache: Option<BlockCache>,
    read_only: bool,
}

impl BlockStore {
    /// Wrap a device; `cache_capacity == 0` disables the block cache
    pub fn new(device: Arc<dyn BlockDevice>, cache_capacity: usize, read_only: bool) -> Self {
        let cache = NonZeroUsize::new(cache_capacity).map(|cap| BlockCache::new(device.clone(), cap));
        let read_only = read_only || device.is_read_only();
        Self {
            device,
            cache,
            read_only,
        }
    }

    /// The underlying device
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Number of blocks on the underlying device
    pub fn block_count(&self) -> u64 {
        self.device.block_count()
    }

    /// Whether mutations are refused
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Check out block `number`
    pub async fn read_block(&self, number: u64) -> Result<BlockBuffer> {
        let mut data = Box::new([0u8; BLOCK_SIZE]);
        match &self.cache {
            Some(cache) => cache.read_block(number, &mut data[..]).await?,
            None => self.device.read_block(number, &mut data[..]).await?,
        }
        log::trace!("BLOCKSTORE: read block {}", number);
        Ok(BlockBuffer {
            number,
            data,
            dirty: false,
        })
    }

    /// Check out a zero-filled buffer for block `number` without reading the device
    pub fn zeroed_block(&self, number: u64) -> Result<BlockBuffer> {
        if number >= self.block_count() {
            return Err(BlockDeviceError::InvalidBlockNumber(number).into());
        }
        Ok(BlockBuffer {
            number,
            data: Box::new([0u8; BLOCK_SIZE]),
            dirty: true,
        })
    }

    /// Write a dirty buffer back and wait until the device reports it stable
    pub async fn sync(&self, buffer: &mut BlockBuffer) -> Result<()> {
        if !buffer.dirty {
            return Ok(());
        }
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        match &self.cache {
            Some(cache) => cache.write_block(buffer.number, &buffer.data[..]).await?,
            None => self.device.write_block(buffer.number, &buffer.data[..]).await?,
        }
        self.device.sync().await?;
        buffer.dirty = false;
        log::debug!("BLOCKSTORE: synced block {}", buffer.number);
        Ok(())
    }

    /// Hand a buffer back. Unsynced changes are discarded.
    pub fn release(&self, buffer: BlockBuffer) {
        if buffer.dirty {
            log::warn!(
                "BLOCKSTORE: block {} released with unsynced changes, discarding them",
                buffer.number
            );
        }
        drop(buffer);
    }

    /// `mark_dirty` + `sync` + `release` in one step
    pub async fn commit(&self, mut buffer: BlockBuffer) -> Result<()> {
        buffer.mark_dirty();
        let result = self.sync(&mut buffer).await;
        if result.is_err() {
            // Nothing reached the device; drop silently
            buffer.dirty = false;
        }
        self.release(buffer);
        result
    }

    /// Flush the device and drop cached blocks
    pub async fn flush(&self) -> Result<()> {
        if !self.read_only {
            self.device.sync().await?;
        }
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        Ok(())
    }
}
