//! Mkdir command

use anyhow::{Context, Result};
use clap::Parser;

use super::{resolve_dir, split_path, ImageArgs};

/// Create a directory
#[derive(Parser, Debug)]
#[command(about = "Create a directory")]
pub struct MkdirArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Absolute path of the new directory
    pub path: String,
}

pub async fn run(args: MkdirArgs) -> Result<()> {
    let (parent_path, name) = split_path(&args.path)?;
    let fs = args.image.mount(false).await?;
    let parent = resolve_dir(&fs, parent_path).await?;
    fs.mkdir(parent.inode_no, name)
        .await
        .with_context(|| format!("Failed to create directory {}", args.path))?;
    fs.unmount().await?;
    Ok(())
}
