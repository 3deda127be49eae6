//! Mount command for mounting flatfs volumes via FUSE

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use fuser::MountOption;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;

use flatfs::fuse::FuseAdapter;

use super::ImageArgs;

/// Mount a flatfs volume
#[derive(Parser, Debug)]
#[command(about = "Mount a flatfs volume via FUSE")]
pub struct MountArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Mount point
    pub mountpoint: PathBuf,

    /// Mount read-only
    #[arg(long)]
    pub read_only: bool,

    /// Let other users access the mount (needs user_allow_other in /etc/fuse.conf)
    #[arg(long)]
    pub allow_other: bool,
}

pub async fn run(args: MountArgs) -> Result<()> {
    let mountpoint = args
        .mountpoint
        .canonicalize()
        .with_context(|| format!("Failed to access mountpoint: {}", args.mountpoint.display()))?;
    if !mountpoint.is_dir() {
        return Err(anyhow!("Mountpoint must be a directory"));
    }

    let fs = Arc::new(args.image.mount(args.read_only).await?);

    let mut options = vec![
        MountOption::FSName("flatfs".to_string()),
        MountOption::Subtype("flatfs".to_string()),
        MountOption::NoExec,
    ];
    options.push(if fs.is_read_only() { MountOption::RO } else { MountOption::RW });
    if args.allow_other {
        options.push(MountOption::AllowOther);
        options.push(MountOption::AutoUnmount);
    }

    info!(
        "Mounting {} at {}",
        args.image.image.display(),
        mountpoint.display()
    );
    let adapter = FuseAdapter::new(fs.clone(), Handle::current());
    let session = fuser::spawn_mount2(adapter, &mountpoint, &options)
        .with_context(|| format!("Failed to mount at {}", mountpoint.display()))?;

    // Set up signal handler for clean unmount
    let (tx, rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set Ctrl+C handler")?;

    println!("Filesystem mounted at {}", mountpoint.display());
    println!("Press Ctrl+C to unmount");
    tokio::task::spawn_blocking(move || rx.recv())
        .await?
        .context("Signal handler went away")?;

    info!("Unmounting filesystem...");
    session.join();

    let fs = Arc::try_unwrap(fs).map_err(|_| anyhow!("Filesystem still in use after unmount"))?;
    fs.unmount().await?;
    info!("Filesystem unmounted successfully");
    Ok(())
}
