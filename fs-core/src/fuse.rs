//! FUSE host integration
//!
//! Maps `fuser` callbacks onto [`FlatFs`]. Callbacks arrive on the FUSE
//! session thread and are driven to completion on a tokio runtime handle.

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Handle;

use crate::blockdev::BLOCK_SIZE;
use crate::error::FsError;
use crate::fs::FlatFs;
use crate::layout::{InodeRecord, FILENAME_MAXLEN, ROOT_INODE};

// Time-to-live for attributes and entries
const TTL: Duration = Duration::from_secs(1);

// Linux renameat2 flag; a rename never replaces an existing name anyway
const RENAME_NOREPLACE: u32 = 1;

/// Parent of every directory the kernel has been told about
#[derive(Debug)]
struct ParentMap {
    parents: Mutex<HashMap<u64, u64>>,
}

impl ParentMap {
    fn new() -> Self {
        let mut parents = HashMap::new();
        parents.insert(ROOT_INODE, ROOT_INODE);
        Self {
            parents: Mutex::new(parents),
        }
    }

    fn note(&self, record: &InodeRecord, parent: u64) {
        if record.is_dir() {
            self.parents.lock().insert(record.inode_no, parent);
        }
    }

    fn forget(&self, ino: u64) {
        if ino != ROOT_INODE {
            self.parents.lock().remove(&ino);
        }
    }

    /// Parent of `dir`; the root stands in for directories not seen yet
    fn parent_of(&self, dir: u64) -> u64 {
        self.parents.lock().get(&dir).copied().unwrap_or(ROOT_INODE)
    }
}

/// errno reported to the kernel for a filesystem error
pub fn errno(err: &FsError) -> i32 {
    match err {
        FsError::NotFound => libc::ENOENT,
        FsError::AlreadyExists => libc::EEXIST,
        FsError::NotADirectory => libc::ENOTDIR,
        FsError::IsADirectory => libc::EISDIR,
        FsError::NotEmpty => libc::ENOTEMPTY,
        FsError::NameTooLong(_) => libc::ENAMETOOLONG,
        FsError::InvalidName | FsError::InvalidMove | FsError::InvalidArgument(_) => libc::EINVAL,
        FsError::OutOfSpace
        | FsError::TooManyObjects(_)
        | FsError::InodeTableFull
        | FsError::DirectoryFull(_) => libc::ENOSPC,
        FsError::FileTooLarge(_) => libc::EFBIG,
        FsError::ReadOnly => libc::EROFS,
        FsError::Interrupted => libc::EINTR,
        FsError::Io(_)
        | FsError::BadMagic(_)
        | FsError::BadBlockSize(_)
        | FsError::UnsupportedVersion(_)
        | FsError::InodeNotFound(_)
        | FsError::Corrupt(_) => libc::EIO,
    }
}

/// `fuser::Filesystem` implementation over a mounted volume
pub struct FuseAdapter {
    fs: Arc<FlatFs>,
    runtime: Handle,
    parents: ParentMap,
    uid: u32,
    gid: u32,
}

impl FuseAdapter {
    pub fn new(fs: Arc<FlatFs>, runtime: Handle) -> Self {
        Self {
            fs,
            runtime,
            parents: ParentMap::new(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn attr(&self, record: &InodeRecord) -> FileAttr {
        let (kind, size, nlink) = if record.is_dir() {
            (FileType::Directory, BLOCK_SIZE as u64, 2)
        } else {
            (FileType::RegularFile, record.file_size(), 1)
        };
        FileAttr {
            ino: record.inode_no,
            size,
            blocks: (BLOCK_SIZE / 512) as u64,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind,
            perm: record.perm() as u16,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            flags: 0,
            blksize: BLOCK_SIZE as u32,
        }
    }
}

fn utf8(name: &OsStr) -> Result<&str, i32> {
    name.to_str().ok_or(libc::EINVAL)
}

impl Filesystem for FuseAdapter {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match utf8(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        match self.runtime.block_on(self.fs.lookup(parent, name)) {
            Ok(Some(record)) => {
                self.parents.note(&record, parent);
                reply.entry(&TTL, &self.attr(&record), 0)
            }
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.runtime.block_on(self.fs.getattr(ino)) {
            Ok(record) => reply.attr(&TTL, &self.attr(&record)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // Only the size is stored; mode, owner and time changes are accepted and dropped
        let result = match size {
            Some(size) => self.runtime.block_on(self.fs.truncate(ino, size)),
            None => self.runtime.block_on(self.fs.getattr(ino)),
        };
        match result {
            Ok(record) => reply.attr(&TTL, &self.attr(&record)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.runtime.block_on(self.fs.read_dir(ino)) {
            Ok(entries) => entries,
            Err(e) => return reply.error(errno(&e)),
        };

        let mut listing = vec![
            (ino, FileType::Directory, ".".to_string()),
            (self.parents.parent_of(ino), FileType::Directory, "..".to_string()),
        ];
        for entry in entries {
            let kind = match self.runtime.block_on(self.fs.getattr(entry.inode_no)) {
                Ok(record) if record.is_dir() => {
                    self.parents.note(&record, ino);
                    FileType::Directory
                }
                Ok(_) => FileType::RegularFile,
                Err(e) => return reply.error(errno(&e)),
            };
            listing.push((entry.inode_no, kind, entry.name));
        }

        for (i, (ino, kind, name)) in listing.into_iter().enumerate().skip(offset.max(0) as usize) {
            // The offset handed back is that of the next entry
            if reply.add(ino, i as i64 + 1, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match utf8(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        match self.runtime.block_on(self.fs.mkdir(parent, name)) {
            Ok(record) => {
                self.parents.note(&record, parent);
                reply.entry(&TTL, &self.attr(&record), 0)
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match utf8(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        match self.runtime.block_on(self.fs.create(parent, name)) {
            Ok(record) => reply.created(&TTL, &self.attr(&record), 0, 0, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        let mut buf = vec![0u8; (size as usize).min(BLOCK_SIZE)];
        match self.runtime.block_on(self.fs.read_at(ino, offset as u64, &mut buf)) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.runtime.block_on(self.fs.write_at(ino, offset as u64, data)) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match utf8(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        match self.runtime.block_on(self.fs.unlink(parent, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match utf8(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        let removed = self.runtime.block_on(self.fs.lookup(parent, name));
        match self.runtime.block_on(self.fs.rmdir(parent, name)) {
            Ok(()) => {
                if let Ok(Some(record)) = removed {
                    self.parents.forget(record.inode_no);
                }
                reply.ok()
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        // Exchange and whiteout renames are not supported
        if flags & !RENAME_NOREPLACE != 0 {
            return reply.error(libc::EINVAL);
        }
        let (name, newname) = match (utf8(name), utf8(newname)) {
            (Ok(name), Ok(newname)) => (name, newname),
            _ => return reply.error(libc::EINVAL),
        };
        match self
            .runtime
            .block_on(self.fs.rename(parent, name, newparent, newname))
        {
            Ok(()) => {
                if let Ok(Some(record)) = self.runtime.block_on(self.fs.lookup(newparent, newname)) {
                    self.parents.note(&record, newparent);
                }
                reply.ok()
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.runtime.block_on(self.fs.stats()) {
            Ok(stats) => reply.statfs(
                stats.max_objects,
                stats.free_blocks,
                stats.free_blocks,
                stats.max_objects,
                stats.max_objects.saturating_sub(stats.live_inodes),
                BLOCK_SIZE as u32,
                FILENAME_MAXLEN as u32,
                BLOCK_SIZE as u32,
            ),
            Err(e) => reply.error(errno(&e)),
        }
    }
}
