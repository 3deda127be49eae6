//! Read-only consistency checker
//!
//! Walks the superblock, the inode table and every live directory and
//! reports anything that breaks the volume's invariants. Nothing is repaired.

use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::blockdev::BLOCK_SIZE;
use crate::error::Result;
use crate::fs::FlatFs;
use crate::layout::{InodeRecord, FIRST_ALLOCATABLE_BLOCK, MAX_OBJECTS, ROOT_INODE};

/// Findings of one [`check`] run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub live_inodes: u64,
    pub tombstoned_inodes: u64,
    pub directories: u64,
    pub files: u64,
    /// Broken invariants
    pub errors: Vec<String>,
    /// Harmless oddities, e.g. allocated blocks nothing points to
    pub warnings: Vec<String>,
}

impl CheckReport {
    /// No errors were found
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: String) {
        log::error!("CHECK: {}", message);
        self.errors.push(message);
    }

    fn warning(&mut self, message: String) {
        log::warn!("CHECK: {}", message);
        self.warnings.push(message);
    }
}

/// Check every structural invariant of a mounted volume
pub async fn check(fs: &FlatFs) -> Result<CheckReport> {
    let mut report = CheckReport::default();
    let table = fs.inode_table().lock().await?;
    let sb = fs.superblock().await?;
    let records = table.records(&sb).await?;

    let device_blocks = fs.block_count().min(MAX_OBJECTS);
    let mut live: HashMap<u64, InodeRecord> = HashMap::new();
    let mut owners: HashMap<u64, u64> = HashMap::new();

    for (slot, record) in &records {
        if !record.is_alive() {
            report.tombstoned_inodes += 1;
            continue;
        }
        report.live_inodes += 1;

        match (record.is_dir(), record.is_file()) {
            (true, _) => report.directories += 1,
            (_, true) => {
                report.files += 1;
                if record.file_size() > BLOCK_SIZE as u64 {
                    report.error(format!(
                        "inode {} has size {} beyond one block",
                        record.inode_no,
                        record.file_size()
                    ));
                }
            }
            _ => report.error(format!(
                "inode {} in slot {} has unknown mode {:o}",
                record.inode_no, slot, record.mode
            )),
        }

        if live.insert(record.inode_no, *record).is_some() {
            report.error(format!("inode number {} is live in more than one slot", record.inode_no));
        }

        let block = record.data_block_number;
        if block < FIRST_ALLOCATABLE_BLOCK || block >= device_blocks {
            report.error(format!("inode {} uses invalid block {}", record.inode_no, block));
        } else if sb.free_blocks.is_free(block) {
            report.error(format!(
                "block {} of inode {} is marked free",
                block, record.inode_no
            ));
        }
        if let Some(other) = owners.insert(block, record.inode_no) {
            report.error(format!(
                "block {} is shared by inodes {} and {}",
                block, other, record.inode_no
            ));
        }
    }

    if report.live_inodes != sb.real_inodes_count {
        report.error(format!(
            "real_inodes_count is {} but {} inodes are live",
            sb.real_inodes_count, report.live_inodes
        ));
    }

    match live.get(&ROOT_INODE) {
        Some(root) if root.is_dir() => {}
        Some(_) => report.error("root inode is not a directory".to_string()),
        None => report.error("root inode is missing".to_string()),
    }

    let mut references: HashMap<u64, u64> = HashMap::new();
    let mut directories: Vec<InodeRecord> = live.values().filter(|r| r.is_dir()).copied().collect();
    directories.sort_by_key(|r| r.inode_no);

    for dir in &directories {
        let slots = fs.directories().raw_records(&table, dir).await?;
        let mut names = HashSet::new();
        let mut alive = 0u64;

        for record in slots.iter().filter(|r| r.state.is_alive()) {
            alive += 1;
            if !names.insert(record.name.as_str()) {
                report.error(format!(
                    "directory {} holds {:?} more than once",
                    dir.inode_no, record.name
                ));
            }
            if live.contains_key(&record.inode_no) {
                *references.entry(record.inode_no).or_default() += 1;
            } else {
                report.error(format!(
                    "entry {:?} in directory {} points to dead inode {}",
                    record.name, dir.inode_no, record.inode_no
                ));
            }
        }

        if alive != dir.children_count() {
            report.error(format!(
                "directory {} has {} live entries but a child count of {}",
                dir.inode_no,
                alive,
                dir.children_count()
            ));
        } else if let Err(e) = fs.directories().entries(&table, dir).await {
            report.error(format!("directory {} cannot be walked: {}", dir.inode_no, e));
        }
    }

    let mut inodes: Vec<_> = live.keys().copied().collect();
    inodes.sort_unstable();
    for ino in inodes {
        let count = references.get(&ino).copied().unwrap_or(0);
        let expected = if ino == ROOT_INODE { 0 } else { 1 };
        if count != expected {
            report.error(format!(
                "inode {} is referenced {} times, expected {}",
                ino, count, expected
            ));
        }
    }

    for block in FIRST_ALLOCATABLE_BLOCK..device_blocks {
        if !sb.free_blocks.is_free(block) && !owners.contains_key(&block) {
            report.warning(format!("block {} is allocated but unused", block));
        }
    }

    log::info!(
        "CHECK: {} live inodes, {} tombstones, {} errors, {} warnings",
        report.live_inodes,
        report.tombstoned_inodes,
        report.errors.len(),
        report.warnings.len()
    );
    Ok(report)
}
