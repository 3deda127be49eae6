//! Cat command: print a file

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::Write;

use flatfs::BLOCK_SIZE;

use super::ImageArgs;

/// Print the contents of a file
#[derive(Parser, Debug)]
#[command(about = "Write the contents of a file to stdout")]
pub struct CatArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Absolute path inside the volume
    pub path: String,
}

pub async fn run(args: CatArgs) -> Result<()> {
    let fs = args.image.mount(true).await?;
    let file = fs
        .resolve(&args.path)
        .await
        .with_context(|| format!("Failed to resolve {}", args.path))?;
    if file.is_dir() {
        return Err(anyhow!("{} is a directory", args.path));
    }

    let mut handle = fs.open(file.inode_no).await?;
    let mut buf = vec![0u8; BLOCK_SIZE];
    let n = fs.read(&mut handle, &mut buf).await?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&buf[..n])?;
    stdout.flush()?;

    fs.unmount().await?;
    Ok(())
}
