//! Write-through LRU block cache

use arrayref::array_ref;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::blockdev::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

/// A block cache that keeps recently used blocks in memory.
///
/// Writes always go to the device first; the cache only ever holds
/// blocks identical to what the device returned or accepted.
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    cache: Mutex<LruCache<u64, Box<[u8; BLOCK_SIZE]>>>,
}

impl BlockCache {
    /// Create a new block cache with the given capacity (in number of blocks)
    pub fn new(device: Arc<dyn BlockDevice>, capacity: NonZeroUsize) -> Self {
        Self {
            device,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Read a block from the cache or device
    pub async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(buf.len()));
        }

        {
            let mut cache = self.cache.lock();
            if let Some(block) = cache.get(&block_num) {
                buf.copy_from_slice(&block[..]);
                return Ok(());
            }
        }

        // The lock is never held across the device call
        self.device.read_block(block_num, buf).await?;
        let block = Box::new(*array_ref!(buf, 0, BLOCK_SIZE));
        self.cache.lock().put(block_num, block);
        Ok(())
    }

    /// Write a block to the device and refresh the cached copy
    pub async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(data.len()));
        }

        match self.device.write_block(block_num, data).await {
            Ok(()) => {
                let block = Box::new(*array_ref!(data, 0, BLOCK_SIZE));
                self.cache.lock().put(block_num, block);
                Ok(())
            }
            Err(e) => {
                // The device state is unknown now; force the next read through
                self.cache.lock().pop(&block_num);
                Err(e)
            }
        }
    }

    /// Whether a block is currently cached
    pub fn contains(&self, block_num: u64) -> bool {
        self.cache.lock().contains(&block_num)
    }

    /// Number of cached blocks
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Whether the cache holds no blocks
    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Drop every cached block
    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}
