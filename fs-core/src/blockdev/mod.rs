//! Block device I/O operations for flatfs

mod blockdev_trait;
mod mem;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

// Re-export the block device trait and related types
use self::blockdev_trait::check_request;
pub use self::blockdev_trait::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};
pub use self::mem::MemBlockDevice;

/// A block device that is backed by a file on the filesystem
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<Option<File>>,
    path: PathBuf,
    size: u64,
    block_count: u64,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create a new zero-filled image file of `size` bytes
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        file.set_len(size).await?;

        let block_count = size / BLOCK_SIZE as u64;
        log::debug!("BLOCKDEV: created {} ({} blocks)", path.display(), block_count);

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size,
            block_count,
            read_only: false,
        })
    }

    /// Open an existing image file or raw block device
    pub async fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .await?;

        // Handles both regular files and block devices
        let size = Self::device_size(&path)?;
        let block_count = size / BLOCK_SIZE as u64;
        log::debug!(
            "BLOCKDEV: opened {} ({} blocks, read_only={})",
            path.display(),
            block_count,
            read_only
        );

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size,
            block_count,
            read_only,
        })
    }

    #[cfg(unix)]
    fn device_size(path: &Path) -> Result<u64> {
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::io::AsRawFd;

        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_block_device() {
            return Ok(metadata.len());
        }

        let file = std::fs::File::open(path)?;
        // BLKGETSIZE64 on Linux
        const BLKGETSIZE64: libc::c_ulong = 0x80081272;

        let mut size: u64 = 0;
        let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size as *mut u64) };
        if result == -1 {
            return Err(BlockDeviceError::Io(std::io::Error::last_os_error()));
        }
        Ok(size)
    }

    #[cfg(not(unix))]
    fn device_size(path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the total size of the device in bytes
    pub fn size(&self) -> u64 {
        self.size
    }
}

fn opened(slot: &mut Option<File>) -> Result<&mut File> {
    slot.as_mut().ok_or(BlockDeviceError::DeviceClosed)
}

#[async_trait]
impl BlockDevice for FileBackedBlockDevice {
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        check_request(block_num, self.block_count, buf.len())?;

        let mut slot = self.file.lock().await;
        let file = opened(&mut slot)?;
        file.seek(SeekFrom::Start(block_num * BLOCK_SIZE as u64)).await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_request(block_num, self.block_count, data.len())?;

        let mut slot = self.file.lock().await;
        let file = opened(&mut slot)?;
        file.seek(SeekFrom::Start(block_num * BLOCK_SIZE as u64)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    async fn sync(&self) -> Result<()> {
        let mut slot = self.file.lock().await;
        let file = opened(&mut slot)?;
        if !self.read_only {
            file.sync_all().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let file = self
            .file
            .lock()
            .await
            .take()
            .ok_or(BlockDeviceError::DeviceClosed)?;
        if !self.read_only {
            file.sync_all().await?;
        }
        log::debug!("BLOCKDEV: closed {}", self.path.display());
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_block_device_operations() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_device.img");

        let device = FileBackedBlockDevice::create(&file_path, 4096 * 8)
            .await
            .unwrap();
        assert_eq!(device.block_count(), 8);

        // Write every block, then read them back in reverse
        for i in 0..8u64 {
            device.write_block(i, &[i as u8 + 1; BLOCK_SIZE]).await.unwrap();
        }
        let mut buf = [0u8; BLOCK_SIZE];
        for i in (0..8u64).rev() {
            device.read_block(i, &mut buf).await.unwrap();
            assert!(buf.iter().all(|&b| b == i as u8 + 1));
        }

        assert!(matches!(
            device.read_block(8, &mut buf).await,
            Err(BlockDeviceError::InvalidBlockNumber(8))
        ));
        device.close().await.unwrap();
        assert_eq!(std::fs::metadata(&file_path).unwrap().len(), 8 * BLOCK_SIZE as u64);
    }

    #[tokio::test]
    async fn test_read_only() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_read_only.img");

        let device = FileBackedBlockDevice::create(&file_path, 4096)
            .await
            .unwrap();
        let test_data = [0x55u8; 4096];
        device.write_block(0, &test_data).await.unwrap();
        device.close().await.unwrap();

        let read_only_device = FileBackedBlockDevice::open(&file_path, true).await.unwrap();

        let mut read_buf = [0u8; 4096];
        read_only_device.read_block(0, &mut read_buf).await.unwrap();
        assert_eq!(test_data, read_buf);

        let write_result = read_only_device.write_block(0, &[0u8; 4096]).await;
        assert!(matches!(write_result, Err(BlockDeviceError::ReadOnly)));
    }

    #[tokio::test]
    async fn test_closed_device() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("closed.img");

        let device = FileBackedBlockDevice::create(&file_path, 4096 * 2)
            .await
            .unwrap();
        device.close().await.unwrap();
        assert!(matches!(device.close().await, Err(BlockDeviceError::DeviceClosed)));
        assert!(matches!(device.sync().await, Err(BlockDeviceError::DeviceClosed)));
    }
}
