//! flatfs Command Line Interface
//!
//! Formats, inspects, edits, checks and mounts flatfs images.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};

mod commands;

/// flatfs - a flat inode table filesystem
#[derive(Parser)]
#[command(
    name = "flatfs",
    about = "flatfs command-line interface",
    version = env!("CARGO_PKG_VERSION"),
    author = "flatfs contributors"
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Format a device or image with flatfs
    Format(commands::format::FormatArgs),

    /// Show superblock and usage counters
    Info(commands::info::InfoArgs),

    /// List a directory
    Ls(commands::ls::LsArgs),

    /// Print a file
    Cat(commands::cat::CatArgs),

    /// Write a file
    Put(commands::put::PutArgs),

    /// Create a directory
    Mkdir(commands::mkdir::MkdirArgs),

    /// Remove a file or empty directory
    Rm(commands::rm::RmArgs),

    /// Remove an empty directory
    Rmdir(commands::rm::RmdirArgs),

    /// Rename or move an entry
    Mv(commands::mv::MvArgs),

    /// Verify filesystem consistency
    Check(commands::check::CheckArgs),

    /// Mount a flatfs volume
    #[cfg(feature = "fuse")]
    Mount(commands::mount::MountArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .init();

    info!("flatfs CLI v{} starting...", env!("CARGO_PKG_VERSION"));

    // Execute the appropriate command
    match cli.command {
        Commands::Format(args) => commands::format::run(args).await,
        Commands::Info(args) => commands::info::run(args).await,
        Commands::Ls(args) => commands::ls::run(args).await,
        Commands::Cat(args) => commands::cat::run(args).await,
        Commands::Put(args) => commands::put::run(args).await,
        Commands::Mkdir(args) => commands::mkdir::run(args).await,
        Commands::Rm(args) => commands::rm::run(args).await,
        Commands::Rmdir(args) => commands::rm::run_rmdir(args).await,
        Commands::Mv(args) => commands::mv::run(args).await,
        Commands::Check(args) => commands::check::run(args).await,
        #[cfg(feature = "fuse")]
        Commands::Mount(args) => commands::mount::run(args).await,
    }
}
