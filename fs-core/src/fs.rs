//! Filesystem operations facade
//!
//! Every mutating operation takes the inode-table lock first and the
//! superblock lock second, and persists each changed block before the
//! locks are dropped.

use serde::Serialize;
use std::sync::Arc;

use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::buffer::BlockStore;
use crate::config::FsConfig;
use crate::directory::{DirEntry, DirectoryStore};
use crate::error::{FsError, Result};
use crate::inode_table::{InodeTable, InodeTableGuard};
use crate::layout::{
    validate_name, InodeKind, InodeRecord, Liveness, Superblock, INODE_SLOTS, MAX_OBJECTS,
    ROOT_INODE,
};
use crate::lock::Interrupt;
use crate::superblock::{SuperblockGuard, SuperblockManager};

/// Volume-wide counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsStats {
    pub block_size: u64,
    /// Blocks on the underlying device
    pub device_blocks: u64,
    /// Blocks the free-block bitmap can hand out right now
    pub free_blocks: u64,
    /// Inode-table slots ever written
    pub inodes_count: u64,
    pub live_inodes: u64,
    pub max_objects: u64,
    pub inode_slots: u64,
    pub read_only: bool,
}

/// Cursor over one open regular file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    ino: u64,
    pos: u64,
}

impl OpenFile {
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Current byte offset
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }
}

/// Directory listing position; [`FlatFs::iterate`] only emits from position 0
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirContext {
    pub pos: u64,
}

/// A mounted flatfs volume
pub struct FlatFs {
    store: Arc<BlockStore>,
    superblock: SuperblockManager,
    inodes: InodeTable,
    dirs: DirectoryStore,
    interrupt: Arc<Interrupt>,
}

impl FlatFs {
    /// Validate the format on `device` and load the root directory
    pub async fn mount(device: Arc<dyn BlockDevice>, config: FsConfig) -> Result<Self> {
        if device.block_size() != BLOCK_SIZE {
            return Err(FsError::BadBlockSize(device.block_size() as u64));
        }

        let store = Arc::new(BlockStore::new(device, config.cache_capacity, config.read_only));
        let interrupt = Arc::new(Interrupt::new());
        let superblock = SuperblockManager::load(store.clone(), interrupt.clone()).await?;
        let fs = Self {
            inodes: InodeTable::new(store.clone(), interrupt.clone()),
            dirs: DirectoryStore::new(store.clone()),
            superblock,
            store,
            interrupt,
        };

        {
            let table = fs.inodes.lock().await?;
            let sb = fs.superblock.snapshot().await?;
            match table.get_alive(&sb, ROOT_INODE).await? {
                Some(root) if root.is_dir() => {}
                Some(_) => return Err(FsError::Corrupt("root inode is not a directory".into())),
                None => return Err(FsError::Corrupt("root inode is missing".into())),
            }
        }

        log::info!(
            "FS: mounted ({} blocks, read_only={})",
            fs.store.block_count(),
            fs.store.is_read_only()
        );
        Ok(fs)
    }

    /// Flush and close the device
    pub async fn unmount(self) -> Result<()> {
        self.store.flush().await?;
        self.store.device().close().await?;
        log::info!("FS: unmounted");
        Ok(())
    }

    /// Inode number of the root directory
    pub fn root(&self) -> u64 {
        ROOT_INODE
    }

    pub fn is_read_only(&self) -> bool {
        self.store.is_read_only()
    }

    /// Fail every lock wait currently in progress with [`FsError::Interrupted`]
    pub fn interrupt_waiters(&self) {
        log::warn!("FS: interrupting lock waiters");
        self.interrupt.interrupt_waiters();
    }

    pub(crate) fn inode_table(&self) -> &InodeTable {
        &self.inodes
    }

    pub(crate) fn directories(&self) -> &DirectoryStore {
        &self.dirs
    }

    pub(crate) fn block_count(&self) -> u64 {
        self.store.block_count()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.store.is_read_only() {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    async fn alive(&self, table: &InodeTableGuard<'_>, sb: &Superblock, ino: u64) -> Result<InodeRecord> {
        table.get_alive(sb, ino).await?.ok_or(FsError::NotFound)
    }

    async fn directory(&self, table: &InodeTableGuard<'_>, sb: &Superblock, ino: u64) -> Result<InodeRecord> {
        let record = self.alive(table, sb, ino).await?;
        if record.is_dir() {
            Ok(record)
        } else {
            Err(FsError::NotADirectory)
        }
    }

    async fn entry_target(
        &self,
        table: &InodeTableGuard<'_>,
        sb: &Superblock,
        entry: &DirEntry,
    ) -> Result<InodeRecord> {
        table.get_alive(sb, entry.inode_no).await?.ok_or_else(|| {
            log::error!(
                "FS: entry {:?} points to inode {} which is not alive",
                entry.name,
                entry.inode_no
            );
            FsError::Corrupt(format!("dangling entry {:?} -> {}", entry.name, entry.inode_no))
        })
    }

    /// Copy of the superblock
    pub async fn superblock(&self) -> Result<Superblock> {
        self.superblock.snapshot().await
    }

    /// Every written inode-table slot, tombstones included
    pub async fn inode_records(&self) -> Result<Vec<(usize, InodeRecord)>> {
        let table = self.inodes.lock().await?;
        let sb = self.superblock.snapshot().await?;
        table.records(&sb).await
    }

    /// Create an empty regular file named `name` under directory `parent`
    pub async fn create(&self, parent: u64, name: &str) -> Result<InodeRecord> {
        self.create_object(parent, name, InodeKind::File).await
    }

    /// Create an empty directory named `name` under directory `parent`
    pub async fn mkdir(&self, parent: u64, name: &str) -> Result<InodeRecord> {
        self.create_object(parent, name, InodeKind::Directory).await
    }

    async fn create_object(&self, parent: u64, name: &str, kind: InodeKind) -> Result<InodeRecord> {
        self.ensure_writable()?;
        validate_name(name)?;

        let mut table = self.inodes.lock().await?;
        let mut sb = self.superblock.lock().await?;

        if sb.real_inodes_count >= MAX_OBJECTS {
            log::warn!("FS: object limit {} reached", MAX_OBJECTS);
            return Err(FsError::TooManyObjects(MAX_OBJECTS));
        }
        let mut parent_dir = self.directory(&table, &sb, parent).await?;
        if self.dirs.find_entry(&table, &parent_dir, name).await?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        // Nothing is written unless every store has room
        self.dirs.append_slot(&table, &parent_dir).await?;
        table.append_slot(&sb).await?;
        if sb.free_blocks.first_free().is_none() {
            return Err(FsError::OutOfSpace);
        }

        let block = sb.allocate_block().await?;
        let record = InodeRecord::new(kind, block - 1, block);
        let mut stage = CreateStage::BlockAllocated;
        if let Err(e) = self
            .link_object(&mut table, &mut sb, &mut parent_dir, name, &record, &mut stage)
            .await
        {
            log::warn!("FS: creating {:?} failed ({}); undoing {:?}", name, e, stage);
            if let Err(undo) = self
                .unwind_create(&mut table, &mut sb, &parent_dir, &record, stage)
                .await
            {
                log::error!("FS: could not undo partial create of {:?}: {}", name, undo);
            }
            return Err(e);
        }

        log::info!(
            "FS: created {:?} {:?} as inode {} (block {}) in directory {}",
            kind,
            name,
            record.inode_no,
            block,
            parent
        );
        Ok(record)
    }

    /// Zero the new block, record the inode and link it under `parent_dir`
    async fn link_object(
        &self,
        table: &mut InodeTableGuard<'_>,
        sb: &mut SuperblockGuard<'_>,
        parent_dir: &mut InodeRecord,
        name: &str,
        record: &InodeRecord,
        stage: &mut CreateStage,
    ) -> Result<()> {
        let block = self.store.zeroed_block(record.data_block_number)?;
        self.store.commit(block).await?;

        table.add(sb, record).await?;
        *stage = CreateStage::InodeAdded;

        let position = self
            .dirs
            .add_entry(table, parent_dir, name, record.inode_no)
            .await?;
        *stage = CreateStage::EntryAdded(position);

        let counted = InodeRecord {
            payload: parent_dir.payload + 1,
            ..*parent_dir
        };
        table.save_info(sb, &counted).await?;
        *parent_dir = counted;
        Ok(())
    }

    /// Roll a failed [`link_object`](Self::link_object) back to the state before the allocation
    async fn unwind_create(
        &self,
        table: &mut InodeTableGuard<'_>,
        sb: &mut SuperblockGuard<'_>,
        parent_dir: &InodeRecord,
        record: &InodeRecord,
        stage: CreateStage,
    ) -> Result<()> {
        if let CreateStage::EntryAdded(position) = stage {
            self.dirs.tombstone_at(table, parent_dir, position).await?;
        }
        if stage != CreateStage::BlockAllocated {
            let dead = InodeRecord {
                state: Liveness::Removed,
                ..*record
            };
            table.save_info(sb, &dead).await?;
            sb.real_inodes_count = decrement(sb.real_inodes_count, "real_inodes_count")?;
        }
        sb.free_block(record.data_block_number);
        sb.save().await
    }

    /// Inode named `name` in directory `parent`; `None` if there is no such entry
    pub async fn lookup(&self, parent: u64, name: &str) -> Result<Option<InodeRecord>> {
        validate_name(name)?;
        let table = self.inodes.lock().await?;
        let sb = self.superblock.snapshot().await?;

        let dir = self.directory(&table, &sb, parent).await?;
        match self.dirs.find_entry(&table, &dir, name).await? {
            Some(entry) => Ok(Some(self.entry_target(&table, &sb, &entry).await?)),
            None => Ok(None),
        }
    }

    /// Remove a regular file or an empty directory
    pub async fn unlink(&self, parent: u64, name: &str) -> Result<()> {
        self.remove(parent, name, false).await
    }

    /// Remove an empty directory
    pub async fn rmdir(&self, parent: u64, name: &str) -> Result<()> {
        self.remove(parent, name, true).await
    }

    async fn remove(&self, parent: u64, name: &str, dirs_only: bool) -> Result<()> {
        self.ensure_writable()?;
        validate_name(name)?;

        let mut table = self.inodes.lock().await?;
        let mut sb = self.superblock.lock().await?;

        let mut parent_dir = self.directory(&table, &sb, parent).await?;
        let entry = self
            .dirs
            .find_entry(&table, &parent_dir, name)
            .await?
            .ok_or(FsError::NotFound)?;
        let mut target = self.entry_target(&table, &sb, &entry).await?;
        if dirs_only && !target.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if target.is_dir() && target.children_count() > 0 {
            return Err(FsError::NotEmpty);
        }

        let live = decrement(sb.real_inodes_count, "real_inodes_count")?;
        parent_dir.payload = decrement(parent_dir.payload, "child count")?;

        // Tombstone at the position found above
        self.dirs
            .tombstone_at(&mut table, &parent_dir, entry.position)
            .await?;

        target.state = Liveness::Removed;
        table.save_info(&sb, &target).await?;
        table.save_info(&sb, &parent_dir).await?;

        sb.free_block(target.data_block_number);
        sb.real_inodes_count = live;
        sb.save().await?;

        log::info!(
            "FS: removed {:?} (inode {}) from directory {}",
            name,
            target.inode_no,
            parent
        );
        Ok(())
    }

    /// Move entry `name` of `parent` to `new_name` under `new_parent`
    pub async fn rename(&self, parent: u64, name: &str, new_parent: u64, new_name: &str) -> Result<()> {
        self.ensure_writable()?;
        validate_name(name)?;
        validate_name(new_name)?;

        let mut table = self.inodes.lock().await?;
        let sb = self.superblock.snapshot().await?;

        let mut src_dir = self.directory(&table, &sb, parent).await?;
        let entry = self
            .dirs
            .find_entry(&table, &src_dir, name)
            .await?
            .ok_or(FsError::NotFound)?;
        if parent == new_parent && name == new_name {
            return Ok(());
        }

        let mut dst_dir = if new_parent == parent {
            src_dir
        } else {
            self.directory(&table, &sb, new_parent).await?
        };
        if self.dirs.find_entry(&table, &dst_dir, new_name).await?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let moved = self.entry_target(&table, &sb, &entry).await?;
        if moved.is_dir() && self.contains(&table, &sb, &moved, new_parent).await? {
            return Err(FsError::InvalidMove);
        }

        if new_parent == parent {
            self.dirs
                .rename_at(&mut table, &src_dir, entry.position, new_name)
                .await?;
        } else {
            let mut stage = MoveStage::Started;
            if let Err(e) = self
                .move_entry(&mut table, &sb, &mut src_dir, &mut dst_dir, &entry, new_name, &mut stage)
                .await
            {
                log::warn!("FS: moving {:?} failed ({}); undoing {:?}", name, e, stage);
                if let Err(undo) = self
                    .unwind_move(&mut table, &sb, &src_dir, &dst_dir, &entry, stage)
                    .await
                {
                    log::error!("FS: could not undo partial move of {:?}: {}", name, undo);
                }
                return Err(e);
            }
        }

        log::info!(
            "FS: renamed {:?} in {} to {:?} in {}",
            name,
            parent,
            new_name,
            new_parent
        );
        Ok(())
    }

    /// Link `entry` into `dst_dir` as `new_name`, then detach it from `src_dir`
    async fn move_entry(
        &self,
        table: &mut InodeTableGuard<'_>,
        sb: &Superblock,
        src_dir: &mut InodeRecord,
        dst_dir: &mut InodeRecord,
        entry: &DirEntry,
        new_name: &str,
        stage: &mut MoveStage,
    ) -> Result<()> {
        let src_count = decrement(src_dir.payload, "child count")?;

        let position = self
            .dirs
            .add_entry(table, dst_dir, new_name, entry.inode_no)
            .await?;
        *stage = MoveStage::Added(position);

        dst_dir.payload += 1;
        table.save_info(sb, dst_dir).await?;
        *stage = MoveStage::Counted(position);

        self.dirs.tombstone_at(table, src_dir, entry.position).await?;
        *stage = MoveStage::Detached(position);

        src_dir.payload = src_count;
        table.save_info(sb, src_dir).await
    }

    /// Put both directories back the way they were before [`move_entry`](Self::move_entry)
    async fn unwind_move(
        &self,
        table: &mut InodeTableGuard<'_>,
        sb: &Superblock,
        src_dir: &InodeRecord,
        dst_dir: &InodeRecord,
        entry: &DirEntry,
        stage: MoveStage,
    ) -> Result<()> {
        let position = match stage {
            MoveStage::Started => return Ok(()),
            MoveStage::Added(position) => position,
            MoveStage::Counted(position) => position,
            MoveStage::Detached(position) => {
                self.dirs.revive_at(table, src_dir, entry.position).await?;
                position
            }
        };

        self.dirs.tombstone_at(table, dst_dir, position).await?;
        if !matches!(stage, MoveStage::Added(_)) {
            let dst_dir = InodeRecord {
                payload: decrement(dst_dir.payload, "child count")?,
                ..*dst_dir
            };
            table.save_info(sb, &dst_dir).await?;
        }
        Ok(())
    }

    /// Whether `ino` is `dir` itself or lives somewhere beneath it
    async fn contains(
        &self,
        table: &InodeTableGuard<'_>,
        sb: &Superblock,
        dir: &InodeRecord,
        ino: u64,
    ) -> Result<bool> {
        let mut pending = vec![*dir];
        while let Some(current) = pending.pop() {
            if current.inode_no == ino {
                return Ok(true);
            }
            for entry in self.dirs.entries(table, &current).await? {
                let child = self.entry_target(table, sb, &entry).await?;
                if child.is_dir() {
                    pending.push(child);
                }
            }
        }
        Ok(false)
    }

    /// Live inode `ino`
    pub async fn getattr(&self, ino: u64) -> Result<InodeRecord> {
        let table = self.inodes.lock().await?;
        let sb = self.superblock.snapshot().await?;
        self.alive(&table, &sb, ino).await
    }

    /// Open regular file `ino` with the cursor at 0
    pub async fn open(&self, ino: u64) -> Result<OpenFile> {
        let inode = self.getattr(ino).await?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }
        Ok(OpenFile { ino, pos: 0 })
    }

    /// Read from the cursor and advance it
    pub async fn read(&self, file: &mut OpenFile, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at(file.ino, file.pos, buf).await?;
        file.pos += n as u64;
        Ok(n)
    }

    /// Write at the cursor and advance it
    pub async fn write(&self, file: &mut OpenFile, data: &[u8]) -> Result<usize> {
        let n = self.write_at(file.ino, file.pos, data).await?;
        file.pos += n as u64;
        Ok(n)
    }

    /// Copy up to `buf.len()` bytes starting at `offset`. Returns 0 at or past end of file.
    pub async fn read_at(&self, ino: u64, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let table = self.inodes.lock().await?;
        let sb = self.superblock.snapshot().await?;
        let inode = self.alive(&table, &sb, ino).await?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }

        let size = inode.file_size().min(BLOCK_SIZE as u64);
        if offset >= size {
            return Ok(0);
        }
        let n = (size - offset).min(buf.len() as u64) as usize;
        let start = offset as usize;

        let block = self.store.read_block(inode.data_block_number).await?;
        buf[..n].copy_from_slice(&block.data()[start..start + n]);
        self.store.release(block);
        log::debug!("FS: read {} bytes at {} from inode {}", n, offset, ino);
        Ok(n)
    }

    /// Write `data` at `offset`; the file size becomes `offset + data.len()`
    pub async fn write_at(&self, ino: u64, offset: u64, data: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        let end = offset.saturating_add(data.len() as u64);
        if end > BLOCK_SIZE as u64 {
            return Err(FsError::FileTooLarge(end));
        }

        let mut table = self.inodes.lock().await?;
        let sb = self.superblock.snapshot().await?;
        let mut inode = self.alive(&table, &sb, ino).await?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }

        let old_size = inode.file_size().min(BLOCK_SIZE as u64);
        let mut block = self.store.read_block(inode.data_block_number).await?;
        if offset > old_size {
            // Bytes past the old end may still hold data from before a shrink
            block.data_mut()[old_size as usize..offset as usize].fill(0);
        }
        block.data_mut()[offset as usize..end as usize].copy_from_slice(data);
        self.store.commit(block).await?;

        inode.payload = end;
        table.save_info(&sb, &inode).await?;
        log::debug!("FS: wrote {} bytes at {} to inode {}", data.len(), offset, ino);
        Ok(data.len())
    }

    /// Set the size of regular file `ino`, zeroing the bytes between the old and new end
    pub async fn truncate(&self, ino: u64, size: u64) -> Result<InodeRecord> {
        self.ensure_writable()?;
        if size > BLOCK_SIZE as u64 {
            return Err(FsError::FileTooLarge(size));
        }

        let mut table = self.inodes.lock().await?;
        let sb = self.superblock.snapshot().await?;
        let mut inode = self.alive(&table, &sb, ino).await?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }

        let old = inode.file_size().min(BLOCK_SIZE as u64);
        if old != size {
            let (start, end) = (old.min(size) as usize, old.max(size) as usize);
            let mut block = self.store.read_block(inode.data_block_number).await?;
            block.data_mut()[start..end].fill(0);
            self.store.commit(block).await?;
        }

        inode.payload = size;
        table.save_info(&sb, &inode).await?;
        Ok(inode)
    }

    /// List directory `ino` once: a context that has already advanced gets nothing
    pub async fn iterate(&self, ino: u64, ctx: &mut DirContext) -> Result<Vec<DirEntry>> {
        if ctx.pos != 0 {
            return Ok(Vec::new());
        }
        let table = self.inodes.lock().await?;
        let sb = self.superblock.snapshot().await?;
        let dir = self.directory(&table, &sb, ino).await?;
        let (entries, end) = self.dirs.entries_with_end(&table, &dir).await?;
        ctx.pos = end as u64;
        Ok(entries)
    }

    /// Every live entry of directory `ino`
    pub async fn read_dir(&self, ino: u64) -> Result<Vec<DirEntry>> {
        self.iterate(ino, &mut DirContext::default()).await
    }

    /// Resolve an absolute path such as `/docs/a.txt`
    pub async fn resolve(&self, path: &str) -> Result<InodeRecord> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidArgument(format!("{:?} is not absolute", path)));
        }
        let mut current = self.getattr(ROOT_INODE).await?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !current.is_dir() {
                return Err(FsError::NotADirectory);
            }
            current = self
                .lookup(current.inode_no, component)
                .await?
                .ok_or(FsError::NotFound)?;
        }
        Ok(current)
    }

    /// Volume counters
    pub async fn stats(&self) -> Result<FsStats> {
        let sb = self.superblock.snapshot().await?;
        Ok(FsStats {
            block_size: sb.block_size,
            device_blocks: self.store.block_count(),
            free_blocks: sb.free_blocks.free_count(),
            inodes_count: sb.inodes_count,
            live_inodes: sb.real_inodes_count,
            max_objects: MAX_OBJECTS,
            inode_slots: INODE_SLOTS as u64,
            read_only: self.store.is_read_only(),
        })
    }
}

/// How far [`FlatFs::create_object`] got before failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreateStage {
    BlockAllocated,
    InodeAdded,
    /// Directory record written at this position
    EntryAdded(usize),
}

/// How far a cross-directory rename got; positions are in the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveStage {
    Started,
    Added(usize),
    Counted(usize),
    Detached(usize),
}

/// `count - 1`, or corruption if the stored counter is already zero
fn decrement(count: u64, what: &str) -> Result<u64> {
    count.checked_sub(1).ok_or_else(|| {
        log::error!("FS: {} would drop below zero", what);
        FsError::Corrupt(format!("{} is already zero", what))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::{BlockDeviceError, MemBlockDevice};
    use crate::layout::ROOT_DIR_BLOCK;
    use crate::config::FormatOptions;
    use crate::format::format_device;

    async fn mounted() -> (Arc<MemBlockDevice>, FlatFs) {
        let device = Arc::new(MemBlockDevice::new(MAX_OBJECTS));
        format_device(device.as_ref(), &FormatOptions::default())
            .await
            .unwrap();
        let fs = FlatFs::mount(device.clone(), FsConfig::default()).await.unwrap();
        (device, fs)
    }

    /// Passes everything through to a memory device, except that one chosen
    /// block's next write fails
    struct FailingDevice {
        inner: Arc<MemBlockDevice>,
        fail_write_to: parking_lot::Mutex<Option<u64>>,
    }

    impl FailingDevice {
        fn fail_next_write(&self, block_num: u64) {
            *self.fail_write_to.lock() = Some(block_num);
        }
    }

    #[async_trait::async_trait]
    impl BlockDevice for FailingDevice {
        async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> crate::blockdev::Result<()> {
            self.inner.read_block(block_num, buf).await
        }

        async fn write_block(&self, block_num: u64, data: &[u8]) -> crate::blockdev::Result<()> {
            {
                let mut fail = self.fail_write_to.lock();
                if *fail == Some(block_num) {
                    *fail = None;
                    return Err(BlockDeviceError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "injected write failure",
                    )));
                }
            }
            self.inner.write_block(block_num, data).await
        }

        fn block_count(&self) -> u64 {
            self.inner.block_count()
        }

        async fn sync(&self) -> crate::blockdev::Result<()> {
            self.inner.sync().await
        }

        async fn close(&self) -> crate::blockdev::Result<()> {
            self.inner.close().await
        }
    }

    async fn mounted_failing() -> (Arc<FailingDevice>, FlatFs) {
        let inner = Arc::new(MemBlockDevice::new(MAX_OBJECTS));
        format_device(inner.as_ref(), &FormatOptions::default())
            .await
            .unwrap();
        let device = Arc::new(FailingDevice {
            inner,
            fail_write_to: parking_lot::Mutex::new(None),
        });
        let fs = FlatFs::mount(device.clone(), FsConfig::default()).await.unwrap();
        (device, fs)
    }

    async fn assert_consistent(fs: &FlatFs) {
        let report = crate::check::check(fs).await.unwrap();
        assert!(report.is_clean(), "{:?}", report.errors);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[tokio::test]
    async fn test_failed_data_block_write_frees_the_block() {
        let (device, fs) = mounted_failing().await;
        device.fail_next_write(4);

        assert!(matches!(
            fs.create(fs.root(), "a").await,
            Err(FsError::Io(BlockDeviceError::Io(_)))
        ));
        let stats = fs.stats().await.unwrap();
        assert_eq!(stats.free_blocks, 60);
        assert_eq!(stats.live_inodes, 2);
        assert!(fs.lookup(fs.root(), "a").await.unwrap().is_none());
        assert_consistent(&fs).await;

        // The freed block is handed out again
        let file = fs.create(fs.root(), "a").await.unwrap();
        assert_eq!(file.data_block_number, 4);
    }

    #[tokio::test]
    async fn test_failed_directory_write_undoes_the_inode() {
        let (device, fs) = mounted_failing().await;
        device.fail_next_write(ROOT_DIR_BLOCK);

        assert!(fs.create(fs.root(), "a").await.is_err());
        let stats = fs.stats().await.unwrap();
        assert_eq!(stats.free_blocks, 60);
        assert_eq!(stats.live_inodes, 2);
        assert!(matches!(fs.getattr(3).await, Err(FsError::NotFound)));
        assert_eq!(fs.read_dir(fs.root()).await.unwrap().len(), 1);
        assert_consistent(&fs).await;

        fs.create(fs.root(), "a").await.unwrap();
        assert_consistent(&fs).await;
    }

    #[tokio::test]
    async fn test_failed_move_leaves_source_in_place() {
        let (device, fs) = mounted_failing().await;
        let a = fs.mkdir(fs.root(), "a").await.unwrap();
        let b = fs.mkdir(fs.root(), "b").await.unwrap();
        let file = fs.create(a.inode_no, "f").await.unwrap();

        device.fail_next_write(a.data_block_number);
        assert!(fs.rename(a.inode_no, "f", b.inode_no, "g").await.is_err());

        assert_eq!(fs.lookup(a.inode_no, "f").await.unwrap(), Some(file));
        assert!(fs.lookup(b.inode_no, "g").await.unwrap().is_none());
        assert!(fs.read_dir(b.inode_no).await.unwrap().is_empty());
        assert_eq!(fs.getattr(a.inode_no).await.unwrap().children_count(), 1);
        assert_eq!(fs.getattr(b.inode_no).await.unwrap().children_count(), 0);
        assert_consistent(&fs).await;

        fs.rename(a.inode_no, "f", b.inode_no, "g").await.unwrap();
        assert_consistent(&fs).await;
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let (_device, fs) = mounted().await;
        let file = fs.create(fs.root(), "a.txt").await.unwrap();
        assert_eq!(file.inode_no, file.data_block_number - 1);
        assert_eq!(file.file_size(), 0);

        let found = fs.lookup(fs.root(), "a.txt").await.unwrap().unwrap();
        assert_eq!(found, file);
        assert!(fs.lookup(fs.root(), "A.TXT").await.unwrap().is_none());
        assert!(matches!(
            fs.create(fs.root(), "a.txt").await,
            Err(FsError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn test_new_block_is_zeroed() {
        let device = Arc::new(MemBlockDevice::from_bytes(vec![0xAB; 64 * BLOCK_SIZE], false));
        format_device(device.as_ref(), &FormatOptions::default())
            .await
            .unwrap();
        let fs = FlatFs::mount(device.clone(), FsConfig::default()).await.unwrap();

        let file = fs.create(fs.root(), "z").await.unwrap();
        assert!(device.block(file.data_block_number).iter().all(|&b| b == 0));
        let dir = fs.mkdir(fs.root(), "d").await.unwrap();
        assert!(fs.read_dir(dir.inode_no).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_honours_offset() {
        let (_device, fs) = mounted().await;
        let file = fs.create(fs.root(), "f").await.unwrap();
        fs.write_at(file.inode_no, 0, b"0123456789").await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(fs.read_at(file.inode_no, 3, &mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"3456");
        assert_eq!(fs.read_at(file.inode_no, 8, &mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(fs.read_at(file.inode_no, 10, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cursor_read_write() {
        let (_device, fs) = mounted().await;
        let file = fs.create(fs.root(), "f").await.unwrap();

        let mut handle = fs.open(file.inode_no).await.unwrap();
        fs.write(&mut handle, b"hello ").await.unwrap();
        fs.write(&mut handle, b"world").await.unwrap();
        assert_eq!(handle.position(), 11);
        assert_eq!(fs.getattr(file.inode_no).await.unwrap().file_size(), 11);

        handle.seek(0);
        let mut buf = vec![0u8; 64];
        let n = fs.read(&mut handle, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello world");
        assert_eq!(fs.read(&mut handle, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_past_block_is_rejected() {
        let (device, fs) = mounted().await;
        let file = fs.create(fs.root(), "big").await.unwrap();
        let before = device.snapshot();

        let data = vec![1u8; 10];
        assert!(matches!(
            fs.write_at(file.inode_no, BLOCK_SIZE as u64 - 5, &data).await,
            Err(FsError::FileTooLarge(_))
        ));
        assert_eq!(device.snapshot(), before);

        let full = vec![7u8; BLOCK_SIZE];
        assert_eq!(fs.write_at(file.inode_no, 0, &full).await.unwrap(), BLOCK_SIZE);
    }

    #[tokio::test]
    async fn test_truncate() {
        let (_device, fs) = mounted().await;
        let file = fs.create(fs.root(), "t").await.unwrap();
        fs.write_at(file.inode_no, 0, b"abcdef").await.unwrap();

        assert_eq!(fs.truncate(file.inode_no, 2).await.unwrap().file_size(), 2);
        fs.truncate(file.inode_no, 6).await.unwrap();
        let mut buf = [0xFFu8; 6];
        assert_eq!(fs.read_at(file.inode_no, 0, &mut buf).await.unwrap(), 6);
        assert_eq!(&buf, b"ab\0\0\0\0");
        assert!(matches!(
            fs.truncate(file.inode_no, BLOCK_SIZE as u64 + 1).await,
            Err(FsError::FileTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_directories_reject_file_io() {
        let (_device, fs) = mounted().await;
        let dir = fs.mkdir(fs.root(), "d").await.unwrap();
        assert!(matches!(fs.open(dir.inode_no).await, Err(FsError::IsADirectory)));
        assert!(matches!(
            fs.write_at(dir.inode_no, 0, b"x").await,
            Err(FsError::IsADirectory)
        ));
        let file = fs.create(fs.root(), "f").await.unwrap();
        assert!(matches!(
            fs.create(file.inode_no, "child").await,
            Err(FsError::NotADirectory)
        ));
    }

    #[tokio::test]
    async fn test_unlink_rules() {
        let (_device, fs) = mounted().await;
        let dir = fs.mkdir(fs.root(), "d").await.unwrap();
        fs.create(dir.inode_no, "inner").await.unwrap();

        assert!(matches!(fs.unlink(fs.root(), "d").await, Err(FsError::NotEmpty)));
        assert!(matches!(fs.rmdir(fs.root(), "d").await, Err(FsError::NotEmpty)));
        assert!(matches!(
            fs.rmdir(fs.root(), "README.txt").await,
            Err(FsError::NotADirectory)
        ));

        fs.unlink(dir.inode_no, "inner").await.unwrap();
        fs.rmdir(fs.root(), "d").await.unwrap();
        assert!(fs.lookup(fs.root(), "d").await.unwrap().is_none());
        assert!(matches!(fs.unlink(fs.root(), "d").await, Err(FsError::NotFound)));
    }

    #[tokio::test]
    async fn test_unlink_with_zero_live_count_is_corrupt() {
        let (device, fs) = mounted().await;
        {
            let mut sb = fs.superblock.lock().await.unwrap();
            sb.real_inodes_count = 0;
        }
        let before = device.snapshot();
        assert!(matches!(
            fs.unlink(fs.root(), "README.txt").await,
            Err(FsError::Corrupt(_))
        ));
        assert_eq!(device.snapshot(), before);
    }

    #[tokio::test]
    async fn test_write_after_shrink_zeroes_the_gap() {
        let (_device, fs) = mounted().await;
        let file = fs.create(fs.root(), "f").await.unwrap();
        fs.write_at(file.inode_no, 0, b"SECRET-DATA").await.unwrap();
        fs.write_at(file.inode_no, 0, b"ab").await.unwrap();
        fs.write_at(file.inode_no, 8, b"x").await.unwrap();

        let mut buf = [0xFFu8; 16];
        assert_eq!(fs.read_at(file.inode_no, 0, &mut buf).await.unwrap(), 9);
        assert_eq!(&buf[..9], b"ab\0\0\0\0\0\0x");
    }

    #[tokio::test]
    async fn test_unlink_last_of_many() {
        let (_device, fs) = mounted().await;
        for name in ["a", "b", "c"] {
            fs.create(fs.root(), name).await.unwrap();
        }
        fs.unlink(fs.root(), "a").await.unwrap();
        fs.unlink(fs.root(), "c").await.unwrap();

        let names: Vec<_> = fs
            .read_dir(fs.root())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["README.txt", "b"]);
    }

    #[tokio::test]
    async fn test_iterate_guard() {
        let (_device, fs) = mounted().await;
        let mut ctx = DirContext::default();
        let first = fs.iterate(fs.root(), &mut ctx).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_ne!(ctx.pos, 0);
        assert!(fs.iterate(fs.root(), &mut ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_same_directory() {
        let (_device, fs) = mounted().await;
        let file = fs.create(fs.root(), "old").await.unwrap();
        fs.rename(fs.root(), "old", fs.root(), "new").await.unwrap();

        assert!(fs.lookup(fs.root(), "old").await.unwrap().is_none());
        assert_eq!(fs.lookup(fs.root(), "new").await.unwrap(), Some(file));
        assert_eq!(fs.getattr(fs.root()).await.unwrap().children_count(), 2);

        // Renaming onto itself changes nothing
        fs.rename(fs.root(), "new", fs.root(), "new").await.unwrap();
        assert!(matches!(
            fs.rename(fs.root(), "new", fs.root(), "README.txt").await,
            Err(FsError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn test_rename_across_directories() {
        let (_device, fs) = mounted().await;
        let dir = fs.mkdir(fs.root(), "docs").await.unwrap();
        fs.rename(fs.root(), "README.txt", dir.inode_no, "readme").await.unwrap();

        assert_eq!(fs.getattr(fs.root()).await.unwrap().children_count(), 1);
        assert_eq!(fs.getattr(dir.inode_no).await.unwrap().children_count(), 1);
        let moved = fs.resolve("/docs/readme").await.unwrap();
        assert!(moved.is_file());
        assert!(matches!(fs.resolve("/README.txt").await, Err(FsError::NotFound)));
    }

    #[tokio::test]
    async fn test_rename_into_own_subtree() {
        let (_device, fs) = mounted().await;
        let a = fs.mkdir(fs.root(), "a").await.unwrap();
        let b = fs.mkdir(a.inode_no, "b").await.unwrap();

        assert!(matches!(
            fs.rename(fs.root(), "a", b.inode_no, "a").await,
            Err(FsError::InvalidMove)
        ));
        assert!(matches!(
            fs.rename(fs.root(), "a", a.inode_no, "self").await,
            Err(FsError::InvalidMove)
        ));
    }

    #[tokio::test]
    async fn test_resolve_paths() {
        let (_device, fs) = mounted().await;
        assert_eq!(fs.resolve("/").await.unwrap().inode_no, ROOT_INODE);
        assert!(fs.resolve("//README.txt").await.unwrap().is_file());
        assert!(matches!(
            fs.resolve("/README.txt/x").await,
            Err(FsError::NotADirectory)
        ));
        assert!(matches!(
            fs.resolve("README.txt").await,
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_read_only_mount() {
        let device = Arc::new(MemBlockDevice::new(MAX_OBJECTS));
        format_device(device.as_ref(), &FormatOptions::default())
            .await
            .unwrap();
        let config = FsConfig {
            read_only: true,
            ..Default::default()
        };
        let fs = FlatFs::mount(device.clone(), config).await.unwrap();
        let writes = device.write_count();

        assert!(matches!(fs.create(fs.root(), "x").await, Err(FsError::ReadOnly)));
        assert!(matches!(fs.unlink(fs.root(), "README.txt").await, Err(FsError::ReadOnly)));
        assert_eq!(fs.read_dir(fs.root()).await.unwrap().len(), 1);
        assert!(fs.stats().await.unwrap().read_only);
        assert_eq!(device.write_count(), writes);
    }

    #[tokio::test]
    async fn test_mount_rejects_unformatted() {
        let device = Arc::new(MemBlockDevice::new(8));
        assert!(matches!(
            FlatFs::mount(device, FsConfig::default()).await,
            Err(FsError::BadMagic(_))
        ));
    }

    #[tokio::test]
    async fn test_live_object_limit() {
        let (device, fs) = mounted().await;
        {
            let mut sb = fs.superblock.lock().await.unwrap();
            sb.real_inodes_count = MAX_OBJECTS;
        }
        let before = device.snapshot();
        assert!(matches!(
            fs.create(fs.root(), "one-too-many").await,
            Err(FsError::TooManyObjects(64))
        ));
        assert_eq!(device.snapshot(), before);
    }

    #[tokio::test]
    async fn test_interrupted_waiter_leaves_no_trace() {
        let (device, fs) = mounted().await;
        let fs = Arc::new(fs);
        let held = fs.inodes.lock().await.unwrap();

        let waiter = {
            let fs = fs.clone();
            tokio::spawn(async move { fs.create(ROOT_INODE, "late").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let before = device.snapshot();
        fs.interrupt_waiters();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_retryable());
        drop(held);
        assert_eq!(device.snapshot(), before);

        // Retrying succeeds
        fs.create(ROOT_INODE, "late").await.unwrap();
    }

    #[tokio::test]
    async fn test_stats() {
        let (_device, fs) = mounted().await;
        let stats = fs.stats().await.unwrap();
        assert_eq!(stats.free_blocks, 60);
        assert_eq!(stats.live_inodes, 2);
        fs.create(fs.root(), "x").await.unwrap();
        assert_eq!(fs.stats().await.unwrap().free_blocks, 59);
    }
}
