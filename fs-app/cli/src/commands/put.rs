//! Put command: create or replace a file

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::io::Read;

use flatfs::BLOCK_SIZE;

use super::{resolve_dir, split_path, ImageArgs};

/// Store data in a file, creating it if needed
#[derive(Parser, Debug)]
#[command(about = "Write data to a file (from --data or stdin), replacing its contents")]
pub struct PutArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Absolute path inside the volume
    pub path: String,

    /// Text to store; stdin is read when omitted
    #[arg(long)]
    pub data: Option<String>,
}

pub async fn run(args: PutArgs) -> Result<()> {
    let data = match args.data {
        Some(text) => text.into_bytes(),
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };

    ensure_fits(data.len())?;

    let (parent_path, name) = split_path(&args.path)?;
    let fs = args.image.mount(false).await?;
    let parent = resolve_dir(&fs, parent_path).await?;

    let file = match fs.lookup(parent.inode_no, name).await? {
        Some(existing) => {
            fs.truncate(existing.inode_no, 0)
                .await
                .with_context(|| format!("Failed to truncate {}", args.path))?
        }
        None => fs
            .create(parent.inode_no, name)
            .await
            .with_context(|| format!("Failed to create {}", args.path))?,
    };
    fs.write_at(file.inode_no, 0, &data)
        .await
        .with_context(|| format!("Failed to write {}", args.path))?;

    info!("Wrote {} bytes to {}", data.len(), args.path);
    fs.unmount().await?;
    Ok(())
}

/// Files hold at most one block; reject larger input before the volume is touched
fn ensure_fits(len: usize) -> Result<()> {
    if len > BLOCK_SIZE {
        return Err(anyhow!(
            "{} bytes do not fit in a file (at most {} bytes)",
            len,
            BLOCK_SIZE
        ));
    }
    Ok(())
}
