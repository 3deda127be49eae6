//! Info command: superblock and usage counters

use anyhow::Result;
use clap::Parser;

use super::ImageArgs;

/// Show volume information
#[derive(Parser, Debug)]
#[command(about = "Show superblock and usage counters of a flatfs volume")]
pub struct InfoArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Print the counters as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: InfoArgs) -> Result<()> {
    let fs = args.image.mount(true).await?;
    let stats = fs.stats().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        let superblock = fs.superblock().await?;
        println!("Image:           {}", args.image.image.display());
        println!("Version:         {}", superblock.version);
        println!("Magic:           {:#x}", superblock.magic);
        println!("Block size:      {}", stats.block_size);
        println!("Device blocks:   {}", stats.device_blocks);
        println!("Free blocks:     {}", stats.free_blocks);
        println!("Live objects:    {} / {}", stats.live_inodes, stats.max_objects);
        println!("Inode slots:     {} used / {}", stats.inodes_count, stats.inode_slots);
        println!("Free bitmap:     {:?}", superblock.free_blocks);
    }

    fs.unmount().await?;
    Ok(())
}
