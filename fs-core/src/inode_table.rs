//! Flat inode table stored in block 1
//!
//! Slots are appended and updated in place, never compacted. Removal only
//! flips a slot to [`Liveness::Removed`]; the tombstone keeps its inode number
//! and physical position.

use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::buffer::{BlockBuffer, BlockStore};
use crate::error::{FsError, Result};
use crate::layout::{
    inode_slot_range, InodeRecord, Liveness, Superblock, INODE_SLOTS, INODE_TABLE_BLOCK,
};
use crate::lock::Interrupt;
use crate::superblock::SuperblockGuard;
use crate::walk::walk;

/// The inode table and the lock serialising every change to it
pub struct InodeTable {
    store: Arc<BlockStore>,
    lock: Mutex<()>,
    interrupt: Arc<Interrupt>,
}

impl InodeTable {
    pub fn new(store: Arc<BlockStore>, interrupt: Arc<Interrupt>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
            interrupt,
        }
    }

    /// Take the inode-table lock. Directory records are only touched while it is held.
    pub async fn lock(&self) -> Result<InodeTableGuard<'_>> {
        let guard = self.interrupt.lock(&self.lock, "inode table").await?;
        Ok(InodeTableGuard {
            store: &self.store,
            _guard: guard,
        })
    }
}

/// Proof that the inode-table lock is held
pub struct InodeTableGuard<'a> {
    store: &'a BlockStore,
    _guard: MutexGuard<'a, ()>,
}

impl InodeTableGuard<'_> {
    async fn read_table(&self) -> Result<BlockBuffer> {
        self.store.read_block(INODE_TABLE_BLOCK).await
    }

    fn slot(buffer: &BlockBuffer, index: usize) -> Result<InodeRecord> {
        InodeRecord::read_from(&buffer.data()[inode_slot_range(index)])
    }

    fn used_slots(sb: &Superblock) -> usize {
        (sb.inodes_count as usize).min(INODE_SLOTS)
    }

    /// Every written slot, tombstones included, with its position
    pub async fn records(&self, sb: &Superblock) -> Result<Vec<(usize, InodeRecord)>> {
        let buffer = self.read_table().await?;
        let records = (0..Self::used_slots(sb))
            .map(|index| Self::slot(&buffer, index).map(|record| (index, record)))
            .collect::<Result<Vec<_>>>();
        self.store.release(buffer);
        records
    }

    /// First slot with `inode_no`, whatever its state
    pub async fn get_by_number(&self, sb: &Superblock, inode_no: u64) -> Result<Option<InodeRecord>> {
        Ok(self
            .records(sb)
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .find(|record| record.inode_no == inode_no))
    }

    /// The live slot with `inode_no`
    pub async fn get_alive(&self, sb: &Superblock, inode_no: u64) -> Result<Option<InodeRecord>> {
        Ok(self
            .records(sb)
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .find(|record| record.inode_no == inode_no && record.is_alive()))
    }

    fn find_append_slot(buffer: &BlockBuffer, sb: &Superblock) -> Result<Option<usize>> {
        let used = Self::used_slots(sb);
        let result = walk(INODE_SLOTS, sb.real_inodes_count, |index| {
            if index < used {
                Ok(Self::slot(buffer, index)?.state)
            } else {
                Ok(Liveness::Removed)
            }
        })?;
        Ok(result.append_at)
    }

    /// Where the next [`add`](Self::add) would write, without writing anything
    pub async fn append_slot(&self, sb: &Superblock) -> Result<usize> {
        let buffer = self.read_table().await?;
        let slot = Self::find_append_slot(&buffer, sb);
        self.store.release(buffer);
        slot?.ok_or(FsError::InodeTableFull)
    }

    /// Append a live record and bump both inode counters in the superblock
    pub async fn add(&mut self, sb: &mut SuperblockGuard<'_>, record: &InodeRecord) -> Result<usize> {
        let mut buffer = self.read_table().await?;
        let index = match Self::find_append_slot(&buffer, sb) {
            Ok(Some(index)) => index,
            Ok(None) => {
                self.store.release(buffer);
                return Err(FsError::InodeTableFull);
            }
            Err(e) => {
                self.store.release(buffer);
                return Err(e);
            }
        };

        let previous = buffer.data()[inode_slot_range(index)].to_vec();
        if let Err(e) = record.write_to(&mut buffer.data_mut()[inode_slot_range(index)]) {
            self.store.release(buffer);
            return Err(e);
        }
        self.store.commit(buffer).await?;

        let mut next = **sb;
        next.inodes_count = next.inodes_count.max(index as u64 + 1);
        next.real_inodes_count += 1;
        if let Err(e) = sb.commit(next).await {
            // The counters never covered the new slot; put its old bytes back
            if let Err(undo) = self.restore_slot(index, &previous).await {
                log::error!("INODE_TABLE: could not restore slot {}: {}", index, undo);
            }
            return Err(e);
        }

        log::debug!(
            "INODE_TABLE: inode {} written to slot {} (inodes_count={}, live={})",
            record.inode_no,
            index,
            next.inodes_count,
            next.real_inodes_count
        );
        Ok(index)
    }

    async fn restore_slot(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
        let mut buffer = self.read_table().await?;
        buffer.data_mut()[inode_slot_range(index)].copy_from_slice(bytes);
        self.store.commit(buffer).await?;
        log::warn!("INODE_TABLE: slot {} restored after a failed append", index);
        Ok(())
    }

    /// Overwrite the live slot holding `record.inode_no` with `record`
    pub async fn save_info(&mut self, sb: &Superblock, record: &InodeRecord) -> Result<()> {
        let mut buffer = self.read_table().await?;
        let mut target = None;
        for index in 0..Self::used_slots(sb) {
            match Self::slot(&buffer, index) {
                Ok(slot) if slot.is_alive() && slot.inode_no == record.inode_no => {
                    target = Some(index);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    self.store.release(buffer);
                    return Err(e);
                }
            }
        }

        let Some(index) = target else {
            self.store.release(buffer);
            log::error!("INODE_TABLE: no live slot for inode {}", record.inode_no);
            return Err(FsError::InodeNotFound(record.inode_no));
        };

        if let Err(e) = record.write_to(&mut buffer.data_mut()[inode_slot_range(index)]) {
            self.store.release(buffer);
            return Err(e);
        }
        self.store.commit(buffer).await?;
        log::debug!("INODE_TABLE: inode {} updated in slot {}", record.inode_no, index);
        Ok(())
    }
}
