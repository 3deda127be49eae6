//! Directory record store: the (name, inode, liveness) array inside a
//! directory's data block.
//!
//! There is no lock of its own; every call takes the inode-table guard,
//! shared for scans and exclusive for changes.

use serde::Serialize;
use std::sync::Arc;

use crate::buffer::{BlockBuffer, BlockStore};
use crate::error::{FsError, Result};
use crate::inode_table::InodeTableGuard;
use crate::layout::{dir_slot_range, DirRecord, InodeRecord, Liveness, DIR_SLOTS};
use crate::walk::{walk, LiveWalk};

/// A live directory record and where it sits in the block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub inode_no: u64,
    /// Physical record slot inside the directory block
    pub position: usize,
}

/// Access to directory record arrays
pub struct DirectoryStore {
    store: Arc<BlockStore>,
}

impl DirectoryStore {
    pub fn new(store: Arc<BlockStore>) -> Self {
        Self { store }
    }

    fn record(buffer: &BlockBuffer, position: usize) -> Result<DirRecord> {
        DirRecord::read_from(&buffer.data()[dir_slot_range(position)])
    }

    fn ensure_dir(dir: &InodeRecord) -> Result<()> {
        if dir.is_dir() {
            Ok(())
        } else {
            Err(FsError::NotADirectory)
        }
    }

    async fn scan(&self, dir: &InodeRecord) -> Result<(BlockBuffer, LiveWalk)> {
        Self::ensure_dir(dir)?;
        let buffer = self.store.read_block(dir.data_block_number).await?;
        let result = walk(DIR_SLOTS, dir.children_count(), |position| {
            Ok(Self::record(&buffer, position)?.state)
        });
        match result {
            Ok(result) => Ok((buffer, result)),
            Err(e) => {
                self.store.release(buffer);
                log::error!("DIR: directory {} is inconsistent: {}", dir.inode_no, e);
                Err(e)
            }
        }
    }

    fn live_entries(buffer: &BlockBuffer, result: &LiveWalk) -> Result<Vec<DirEntry>> {
        result
            .live
            .iter()
            .map(|&position| {
                Self::record(buffer, position).map(|record| DirEntry {
                    name: record.name,
                    inode_no: record.inode_no,
                    position,
                })
            })
            .collect()
    }

    /// Every live entry, in slot order
    pub async fn entries(&self, table: &InodeTableGuard<'_>, dir: &InodeRecord) -> Result<Vec<DirEntry>> {
        Ok(self.entries_with_end(table, dir).await?.0)
    }

    /// Live entries plus the number of physical slots the walk covered
    pub async fn entries_with_end(
        &self,
        _table: &InodeTableGuard<'_>,
        dir: &InodeRecord,
    ) -> Result<(Vec<DirEntry>, usize)> {
        let (buffer, result) = self.scan(dir).await?;
        let entries = Self::live_entries(&buffer, &result);
        self.store.release(buffer);
        Ok((entries?, result.scanned))
    }

    /// Every physical record slot of the directory, tombstones and unused slots included
    pub async fn raw_records(&self, _table: &InodeTableGuard<'_>, dir: &InodeRecord) -> Result<Vec<DirRecord>> {
        Self::ensure_dir(dir)?;
        let buffer = self.store.read_block(dir.data_block_number).await?;
        let records = (0..DIR_SLOTS)
            .map(|position| Self::record(&buffer, position))
            .collect::<Result<Vec<_>>>();
        self.store.release(buffer);
        records
    }

    /// Live entry named exactly `name`
    pub async fn find_entry(
        &self,
        table: &InodeTableGuard<'_>,
        dir: &InodeRecord,
        name: &str,
    ) -> Result<Option<DirEntry>> {
        let found = self
            .entries(table, dir)
            .await?
            .into_iter()
            .find(|entry| entry.name == name);
        log::debug!(
            "DIR: lookup {:?} in directory {}: {}",
            name,
            dir.inode_no,
            if found.is_some() { "hit" } else { "miss" }
        );
        Ok(found)
    }

    /// Slot the next [`add_entry`](Self::add_entry) would use
    pub async fn append_slot(&self, _table: &InodeTableGuard<'_>, dir: &InodeRecord) -> Result<usize> {
        let (buffer, result) = self.scan(dir).await?;
        self.store.release(buffer);
        result.append_at.ok_or(FsError::DirectoryFull(dir.inode_no))
    }

    /// Write a live record for `name` after the last live entry.
    ///
    /// The caller bumps and saves the directory's child count afterwards.
    pub async fn add_entry(
        &self,
        _table: &mut InodeTableGuard<'_>,
        dir: &InodeRecord,
        name: &str,
        inode_no: u64,
    ) -> Result<usize> {
        let (mut buffer, result) = self.scan(dir).await?;
        let Some(position) = result.append_at else {
            self.store.release(buffer);
            return Err(FsError::DirectoryFull(dir.inode_no));
        };

        let record = DirRecord::new(name, inode_no);
        if let Err(e) = record.write_to(&mut buffer.data_mut()[dir_slot_range(position)]) {
            self.store.release(buffer);
            return Err(e);
        }
        self.store.commit(buffer).await?;
        log::debug!(
            "DIR: added {:?} -> inode {} at slot {} of directory {}",
            name,
            inode_no,
            position,
            dir.inode_no
        );
        Ok(position)
    }

    /// Tombstone the live record for `inode_no`; returns false if there is none.
    ///
    /// `dir` must still carry the child count from before the removal.
    pub async fn remove_entry(
        &self,
        table: &mut InodeTableGuard<'_>,
        dir: &InodeRecord,
        inode_no: u64,
    ) -> Result<bool> {
        let entry = self
            .entries(table, dir)
            .await?
            .into_iter()
            .find(|entry| entry.inode_no == inode_no);
        match entry {
            Some(entry) => {
                self.tombstone_at(table, dir, entry.position).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Tombstone the record at `position`, which must be live
    pub async fn tombstone_at(
        &self,
        _table: &mut InodeTableGuard<'_>,
        dir: &InodeRecord,
        position: usize,
    ) -> Result<()> {
        self.set_state(dir, position, Liveness::Alive, Liveness::Removed)
            .await
    }

    /// Bring the tombstone at `position` back to life, undoing [`tombstone_at`](Self::tombstone_at)
    pub async fn revive_at(
        &self,
        _table: &mut InodeTableGuard<'_>,
        dir: &InodeRecord,
        position: usize,
    ) -> Result<()> {
        self.set_state(dir, position, Liveness::Removed, Liveness::Alive)
            .await
    }

    async fn set_state(
        &self,
        dir: &InodeRecord,
        position: usize,
        from: Liveness,
        to: Liveness,
    ) -> Result<()> {
        Self::ensure_dir(dir)?;
        if position >= DIR_SLOTS {
            return Err(FsError::InvalidArgument(format!(
                "directory slot {} out of range",
                position
            )));
        }
        let mut buffer = self.store.read_block(dir.data_block_number).await?;
        let mut record = match Self::record(&buffer, position) {
            Ok(record) if record.state == from => record,
            Ok(_) => {
                self.store.release(buffer);
                return Err(FsError::NotFound);
            }
            Err(e) => {
                self.store.release(buffer);
                return Err(e);
            }
        };

        record.state = to;
        if let Err(e) = record.write_to(&mut buffer.data_mut()[dir_slot_range(position)]) {
            self.store.release(buffer);
            return Err(e);
        }
        self.store.commit(buffer).await?;
        log::debug!(
            "DIR: {:?} at slot {} of directory {} is now {:?}",
            record.name,
            position,
            dir.inode_no,
            to
        );
        Ok(())
    }

    /// Rewrite the name of the live record at `position` in place
    pub async fn rename_at(
        &self,
        _table: &mut InodeTableGuard<'_>,
        dir: &InodeRecord,
        position: usize,
        new_name: &str,
    ) -> Result<()> {
        Self::ensure_dir(dir)?;
        let mut buffer = self.store.read_block(dir.data_block_number).await?;
        let mut record = match Self::record(&buffer, position) {
            Ok(record) if record.state.is_alive() => record,
            Ok(_) => {
                self.store.release(buffer);
                return Err(FsError::NotFound);
            }
            Err(e) => {
                self.store.release(buffer);
                return Err(e);
            }
        };

        record.name = new_name.to_string();
        if let Err(e) = record.write_to(&mut buffer.data_mut()[dir_slot_range(position)]) {
            self.store.release(buffer);
            return Err(e);
        }
        self.store.commit(buffer).await
    }
}
