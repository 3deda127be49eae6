//! RAM-backed block device, used for tests, benchmarks and scratch volumes

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::blockdev_trait::{check_request, BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

/// A block device that keeps every block in memory
#[derive(Debug)]
pub struct MemBlockDevice {
    data: RwLock<Vec<u8>>,
    block_count: u64,
    read_only: bool,
    closed: AtomicBool,
    writes: AtomicU64,
    syncs: AtomicU64,
}

impl MemBlockDevice {
    /// Create a zero-filled device with `block_count` blocks
    pub fn new(block_count: u64) -> Self {
        Self::from_bytes(vec![0u8; block_count as usize * BLOCK_SIZE], false)
    }

    /// Wrap an existing image; trailing bytes past the last whole block are ignored
    pub fn from_bytes(bytes: Vec<u8>, read_only: bool) -> Self {
        let block_count = (bytes.len() / BLOCK_SIZE) as u64;
        Self {
            data: RwLock::new(bytes),
            block_count,
            read_only,
            closed: AtomicBool::new(false),
            writes: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        }
    }

    /// Copy of the whole image
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Copy of a single block, bypassing the trait (for inspection in tests)
    pub fn block(&self, block_num: u64) -> Vec<u8> {
        let start = block_num as usize * BLOCK_SIZE;
        self.data.read()[start..start + BLOCK_SIZE].to_vec()
    }

    /// Number of `write_block` calls served so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of `sync` calls served so far
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(BlockDeviceError::DeviceClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BlockDevice for MemBlockDevice {
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        check_request(block_num, self.block_count, buf.len())?;
        let start = block_num as usize * BLOCK_SIZE;
        buf.copy_from_slice(&self.data.read()[start..start + BLOCK_SIZE]);
        Ok(())
    }

    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_request(block_num, self.block_count, data.len())?;
        let start = block_num as usize * BLOCK_SIZE;
        self.data.write()[start..start + BLOCK_SIZE].copy_from_slice(data);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    async fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            Err(BlockDeviceError::DeviceClosed)
        } else {
            Ok(())
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
