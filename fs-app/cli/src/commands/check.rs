//! Check command for filesystem verification

use anyhow::{anyhow, Result};
use clap::Parser;
use log::info;
use std::time::Instant;

use super::ImageArgs;

/// Verify filesystem consistency
#[derive(Parser, Debug)]
#[command(about = "Verify the consistency of a flatfs volume (never repairs)")]
pub struct CheckArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: CheckArgs) -> Result<()> {
    let fs = args.image.mount(true).await?;

    let start = Instant::now();
    let report = flatfs::check(&fs).await?;
    info!("Check completed in {:?}", start.elapsed());
    fs.unmount().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Check results:");
        println!("  Live inodes:      {}", report.live_inodes);
        println!("  Tombstones:       {}", report.tombstoned_inodes);
        println!("  Directories:      {}", report.directories);
        println!("  Files:            {}", report.files);
        for warning in &report.warnings {
            println!("  warning: {}", warning);
        }
        for error in &report.errors {
            println!("  error: {}", error);
        }
    }

    if report.is_clean() {
        Ok(())
    } else {
        Err(anyhow!("{} consistency errors found", report.errors.len()))
    }
}
