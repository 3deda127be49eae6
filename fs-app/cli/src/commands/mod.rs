//! Subcommands of the flatfs CLI

use anyhow::{anyhow, Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

use flatfs::{FileBackedBlockDevice, FlatFs, FsConfig, InodeRecord};

pub mod cat;
pub mod check;
pub mod format;
pub mod info;
pub mod ls;
pub mod mkdir;
#[cfg(feature = "fuse")]
pub mod mount;
pub mod mv;
pub mod put;
pub mod rm;

/// Image selection shared by every command that mounts
#[derive(Args, Debug)]
pub struct ImageArgs {
    /// Device or image file holding a flatfs volume
    pub image: PathBuf,

    /// JSON file with mount options (cache_capacity, read_only)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ImageArgs {
    /// Open and mount the image; `read_only` forces a read-only mount
    pub async fn mount(&self, read_only: bool) -> Result<FlatFs> {
        let mut config = match &self.config {
            Some(path) => FsConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => FsConfig::default(),
        };
        config.read_only |= read_only;

        let device = FileBackedBlockDevice::open(&self.image, config.read_only)
            .await
            .with_context(|| format!("Failed to open {}", self.image.display()))?;
        FlatFs::mount(Arc::new(device), config)
            .await
            .with_context(|| format!("Failed to mount {}", self.image.display()))
    }
}

/// Split an absolute path into its parent path and final name
pub fn split_path(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, "")) | None => Err(anyhow!("{:?} is not an absolute path to an entry", path)),
        Some(("", name)) => Ok(("/", name)),
        Some((parent, name)) => Ok((parent, name)),
    }
}

/// Resolve `path` and require a directory
pub async fn resolve_dir(fs: &FlatFs, path: &str) -> Result<InodeRecord> {
    let record = fs
        .resolve(path)
        .await
        .with_context(|| format!("Failed to resolve {}", path))?;
    if !record.is_dir() {
        return Err(anyhow!("{} is not a directory", path));
    }
    Ok(record)
}
