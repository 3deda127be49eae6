//! Rm and rmdir commands

use anyhow::{Context, Result};
use clap::Parser;

use super::{resolve_dir, split_path, ImageArgs};

/// Remove a file or an empty directory
#[derive(Parser, Debug)]
#[command(about = "Remove a file or an empty directory")]
pub struct RmArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Absolute path inside the volume
    pub path: String,
}

/// Remove an empty directory
#[derive(Parser, Debug)]
#[command(about = "Remove an empty directory")]
pub struct RmdirArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Absolute path of the directory
    pub path: String,
}

pub async fn run(args: RmArgs) -> Result<()> {
    let (parent_path, name) = split_path(&args.path)?;
    let fs = args.image.mount(false).await?;
    let parent = resolve_dir(&fs, parent_path).await?;
    fs.unlink(parent.inode_no, name)
        .await
        .with_context(|| format!("Failed to remove {}", args.path))?;
    fs.unmount().await?;
    Ok(())
}

pub async fn run_rmdir(args: RmdirArgs) -> Result<()> {
    let (parent_path, name) = split_path(&args.path)?;
    let fs = args.image.mount(false).await?;
    let parent = resolve_dir(&fs, parent_path).await?;
    fs.rmdir(parent.inode_no, name)
        .await
        .with_context(|| format!("Failed to remove directory {}", args.path))?;
    fs.unmount().await?;
    Ok(())
}
