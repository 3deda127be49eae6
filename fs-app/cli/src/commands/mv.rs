//! Mv command: rename or move an entry

use anyhow::{Context, Result};
use clap::Parser;

use super::{resolve_dir, split_path, ImageArgs};

/// Rename or move a file or directory
#[derive(Parser, Debug)]
#[command(about = "Rename or move a file or directory")]
pub struct MvArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Current absolute path
    pub from: String,

    /// New absolute path; its parent directory must exist
    pub to: String,
}

pub async fn run(args: MvArgs) -> Result<()> {
    let (from_parent, from_name) = split_path(&args.from)?;
    let (to_parent, to_name) = split_path(&args.to)?;

    let fs = args.image.mount(false).await?;
    let source = resolve_dir(&fs, from_parent).await?;
    let destination = resolve_dir(&fs, to_parent).await?;
    fs.rename(source.inode_no, from_name, destination.inode_no, to_name)
        .await
        .with_context(|| format!("Failed to move {} to {}", args.from, args.to))?;
    fs.unmount().await?;
    Ok(())
}
