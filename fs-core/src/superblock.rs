//! Superblock manager: free-block allocation and global counters

use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::buffer::BlockStore;
use crate::error::{FsError, Result};
use crate::layout::{Superblock, SUPERBLOCK_BLOCK};
use crate::lock::Interrupt;

/// Owner of the in-memory superblock and its lock
pub struct SuperblockManager {
    store: Arc<BlockStore>,
    state: Mutex<Superblock>,
    interrupt: Arc<Interrupt>,
}

impl SuperblockManager {
    /// Read and validate block 0
    pub async fn load(store: Arc<BlockStore>, interrupt: Arc<Interrupt>) -> Result<Self> {
        let buffer = store.read_block(SUPERBLOCK_BLOCK).await?;
        let superblock = Superblock::read_from(buffer.data());
        store.release(buffer);
        let superblock = superblock?;
        superblock.validate()?;

        log::info!(
            "SUPERBLOCK: loaded (inodes_count={}, real_inodes_count={}, free={})",
            superblock.inodes_count,
            superblock.real_inodes_count,
            superblock.free_blocks.free_count()
        );

        Ok(Self {
            store,
            state: Mutex::new(superblock),
            interrupt,
        })
    }

    /// Take the superblock lock
    pub async fn lock(&self) -> Result<SuperblockGuard<'_>> {
        let superblock = self.interrupt.lock(&self.state, "superblock").await?;
        Ok(SuperblockGuard {
            store: &self.store,
            superblock,
        })
    }

    /// Copy of the current superblock, taken under the lock
    pub async fn snapshot(&self) -> Result<Superblock> {
        Ok(*self.lock().await?)
    }
}

/// Exclusive access to the superblock for one read-modify-persist sequence
pub struct SuperblockGuard<'a> {
    store: &'a BlockStore,
    superblock: MutexGuard<'a, Superblock>,
}

impl SuperblockGuard<'_> {
    /// Claim the first free block, persist the bitmap and return the block number
    pub async fn allocate_block(&mut self) -> Result<u64> {
        let block = match self.superblock.free_blocks.first_free() {
            Some(block) => block,
            None => {
                log::warn!("SUPERBLOCK: no free blocks left");
                return Err(FsError::OutOfSpace);
            }
        };

        let mut next = *self.superblock;
        next.free_blocks.mark_used(block);
        self.commit(next).await?;

        log::info!(
            "SUPERBLOCK: allocated block {} ({} free remaining)",
            block,
            next.free_blocks.free_count()
        );
        Ok(block)
    }

    /// Return `block` to the free pool in memory; the caller persists with [`save`](Self::save)
    pub fn free_block(&mut self, block: u64) {
        if self.superblock.free_blocks.mark_free(block) {
            log::info!("SUPERBLOCK: freed block {}", block);
        } else {
            log::error!("SUPERBLOCK: block {} freed while already free", block);
        }
    }

    /// Write the in-memory superblock to block 0 and wait for it to be stable
    pub async fn save(&mut self) -> Result<()> {
        let current = *self.superblock;
        Self::persist(self.store, &current).await
    }

    /// Persist `next` and adopt it only once it is on disk
    pub async fn commit(&mut self, next: Superblock) -> Result<()> {
        Self::persist(self.store, &next).await?;
        *self.superblock = next;
        Ok(())
    }

    async fn persist(store: &BlockStore, superblock: &Superblock) -> Result<()> {
        let mut buffer = store.read_block(SUPERBLOCK_BLOCK).await?;
        if let Err(e) = superblock.write_to(buffer.data_mut()) {
            store.release(buffer);
            return Err(e);
        }
        store.commit(buffer).await?;
        log::debug!(
            "SUPERBLOCK: saved (inodes_count={}, real_inodes_count={}, bitmap={:#x})",
            superblock.inodes_count,
            superblock.real_inodes_count,
            superblock.free_blocks.raw()
        );
        Ok(())
    }
}

impl std::ops::Deref for SuperblockGuard<'_> {
    type Target = Superblock;

    fn deref(&self) -> &Superblock {
        &self.superblock
    }
}

impl std::ops::DerefMut for SuperblockGuard<'_> {
    fn deref_mut(&mut self) -> &mut Superblock {
        &mut self.superblock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::{BlockDevice, MemBlockDevice};
    use crate::config::FormatOptions;
    use crate::format::format_device;
    use crate::layout::MAX_OBJECTS;

    async fn setup() -> (Arc<MemBlockDevice>, SuperblockManager) {
        let device = Arc::new(MemBlockDevice::new(MAX_OBJECTS));
        format_device(device.as_ref(), &FormatOptions::default())
            .await
            .unwrap();
        let store = Arc::new(BlockStore::new(device.clone(), 0, false));
        let manager = SuperblockManager::load(store, Arc::new(Interrupt::new()))
            .await
            .unwrap();
        (device, manager)
    }

    fn on_disk(device: &MemBlockDevice) -> Superblock {
        Superblock::read_from(&device.block(SUPERBLOCK_BLOCK)).unwrap()
    }

    #[tokio::test]
    async fn test_allocate_persists_bitmap() {
        let (device, manager) = setup().await;
        let mut sb = manager.lock().await.unwrap();

        let block = sb.allocate_block().await.unwrap();
        assert_eq!(block, 4);
        assert!(!sb.free_blocks.is_free(4));
        assert!(!on_disk(&device).free_blocks.is_free(4));
    }

    #[tokio::test]
    async fn test_free_then_save() {
        let (device, manager) = setup().await;
        let mut sb = manager.lock().await.unwrap();

        let block = sb.allocate_block().await.unwrap();
        sb.free_block(block);
        // Not durable until saved
        assert!(!on_disk(&device).free_blocks.is_free(block));
        sb.save().await.unwrap();
        assert!(on_disk(&device).free_blocks.is_free(block));
    }

    #[tokio::test]
    async fn test_out_of_space() {
        let (device, manager) = setup().await;
        let mut sb = manager.lock().await.unwrap();
        for _ in 4..MAX_OBJECTS {
            sb.allocate_block().await.unwrap();
        }
        let before = device.write_count();
        assert!(matches!(sb.allocate_block().await, Err(FsError::OutOfSpace)));
        assert_eq!(device.write_count(), before);
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_memory_unchanged() {
        let (device, manager) = setup().await;
        let mut sb = manager.lock().await.unwrap();
        let before = *sb;

        device.close().await.unwrap();
        assert!(sb.allocate_block().await.is_err());
        assert_eq!(*sb, before);
    }

    #[tokio::test]
    async fn test_rejects_foreign_image() {
        let device = Arc::new(MemBlockDevice::new(8));
        let store = Arc::new(BlockStore::new(device, 0, false));
        let result = SuperblockManager::load(store, Arc::new(Interrupt::new())).await;
        assert!(matches!(result, Err(FsError::BadMagic(0))));
    }
}
