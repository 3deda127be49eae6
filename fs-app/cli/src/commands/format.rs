//! Format command for creating flatfs volumes

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::io::Write;
use std::path::PathBuf;

use flatfs::format::MIN_BLOCKS;
use flatfs::{create_image, format_device, BlockDevice, FileBackedBlockDevice, FormatOptions};

/// Format a device or image file with flatfs
#[derive(Parser, Debug)]
#[command(about = "Format a device or image file with flatfs")]
pub struct FormatArgs {
    /// Device or image file to format
    pub device: PathBuf,

    /// Size of a newly created image, in 4 KiB blocks
    #[arg(short, long, default_value_t = 64)]
    pub blocks: u64,

    /// Create the image file if it does not exist
    #[arg(short, long)]
    pub create: bool,

    /// Force formatting without confirmation
    #[arg(short, long)]
    pub force: bool,

    /// Name of the welcome file placed in the root directory
    #[arg(long)]
    pub welcome_name: Option<String>,
}

pub async fn run(args: FormatArgs) -> Result<()> {
    info!("flatfs format v{}", env!("CARGO_PKG_VERSION"));

    let mut options = FormatOptions::default();
    if let Some(name) = args.welcome_name {
        options.welcome_name = name;
    }

    if !args.device.exists() {
        if !args.create {
            return Err(anyhow!(
                "Device {:?} does not exist (use --create to make a new image)",
                args.device
            ));
        }
        if args.blocks < MIN_BLOCKS {
            return Err(anyhow!("An image needs at least {} blocks", MIN_BLOCKS));
        }

        let device = create_image(&args.device, args.blocks, &options)
            .await
            .with_context(|| format!("Failed to create image {}", args.device.display()))?;
        device.close().await?;
        println!(
            "Created {} with {} blocks",
            args.device.display(),
            args.blocks
        );
        return Ok(());
    }

    // Confirm before formatting
    if !args.force {
        println!(
            "WARNING: This will format {} as a flatfs volume.",
            args.device.display()
        );
        println!("This operation will DESTROY ALL DATA on the device!");
        print!("Are you sure you want to continue? [y/N] ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin()
            .read_line(&mut input)
            .context("Failed to read confirmation")?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Operation cancelled.");
            return Ok(());
        }
    }

    let device = FileBackedBlockDevice::open(&args.device, false)
        .await
        .with_context(|| format!("Failed to open {}", args.device.display()))?;
    let superblock = format_device(&device, &options)
        .await
        .with_context(|| format!("Failed to format device: {}", args.device.display()))?;
    device.close().await?;

    info!("Successfully formatted {}", args.device.display());
    println!(
        "Formatted {} ({} blocks, {} free for data)",
        args.device.display(),
        device.block_count(),
        superblock.free_blocks.free_count()
    );
    Ok(())
}
