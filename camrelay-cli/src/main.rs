//! camrelay CLI
//!
//! Stream a camera to a remote receiver over WebSocket.
//!
//! # Usage
//!
//! ```bash
//! # Stream the front camera to a receiver
//! camrelay stream --host 192.168.1.20:8080
//!
//! # Show the encoder ladder for a resolution
//! camrelay ladder --resolution 1920x1080
//!
//! # Write the default config file
//! camrelay config --init
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// camrelay - adaptive camera streaming
#[derive(Parser)]
#[command(name = "camrelay")]
#[command(version)]
#[command(about = "Stream a camera to a remote receiver with adaptive H.264 fallback", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start streaming; type commands on stdin to switch camera or resolution
    Stream(commands::StreamArgs),

    /// Show the encoder fallback ladder
    Ladder(commands::LadderArgs),

    /// Show or create the configuration file
    Config(commands::ConfigArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(format!("camrelay={}", level).parse()?),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Stream(args) => commands::stream(args).await?,
        Commands::Ladder(args) => commands::ladder(args).await?,
        Commands::Config(args) => commands::config(args).await?,
    }

    Ok(())
}
