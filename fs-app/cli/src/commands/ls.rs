//! Ls command: list a directory

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use super::ImageArgs;

/// List a directory
#[derive(Parser, Debug)]
#[command(about = "List the entries of a directory")]
pub struct LsArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Absolute path inside the volume
    #[arg(default_value = "/")]
    pub path: String,

    /// Print the listing as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct Listing {
    name: String,
    inode: u64,
    directory: bool,
    mode: u32,
    size: u64,
}

pub async fn run(args: LsArgs) -> Result<()> {
    let fs = args.image.mount(true).await?;
    let target = fs
        .resolve(&args.path)
        .await
        .with_context(|| format!("Failed to resolve {}", args.path))?;

    let mut rows = Vec::new();
    if target.is_dir() {
        for entry in fs.read_dir(target.inode_no).await? {
            let record = fs.getattr(entry.inode_no).await?;
            rows.push(Listing {
                name: entry.name,
                inode: record.inode_no,
                directory: record.is_dir(),
                mode: record.mode,
                size: if record.is_dir() { record.children_count() } else { record.file_size() },
            });
        }
    } else {
        let name = args.path.rsplit('/').next().unwrap_or_default().to_string();
        rows.push(Listing {
            name,
            inode: target.inode_no,
            directory: false,
            mode: target.mode,
            size: target.file_size(),
        });
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for row in &rows {
            let kind = if row.directory { 'd' } else { '-' };
            let name = if row.directory { format!("{}/", row.name) } else { row.name.clone() };
            println!("{}{:o} {:>4} {:>6} {}", kind, row.mode & 0o7777, row.inode, row.size, name);
        }
    }

    fs.unmount().await?;
    Ok(())
}
