//! Config command - show or create the configuration file

use anyhow::{Context, Result};
use clap::Args;
use camrelay_core::config::{sample_config, ConfigFile};

/// Arguments for the config command
#[derive(Args)]
pub struct ConfigArgs {
    /// Write the sample config to the default location
    #[arg(long)]
    init: bool,

    /// Overwrite an existing file with --init
    #[arg(short, long, requires = "init")]
    force: bool,

    /// Print the path of the config file
    #[arg(long, conflicts_with = "init")]
    path: bool,
}

/// Run the config command
pub async fn config(args: ConfigArgs) -> Result<()> {
    if args.path {
        let path = ConfigFile::default_path();
        println!("{}", path.display());
        if path.exists() {
            println!("(file exists)");
        } else {
            println!("(file does not exist)");
        }
        return Ok(());
    }

    if args.init {
        if args.force {
            let path = ConfigFile::default_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
            std::fs::write(&path, sample_config()).context("Failed to write config file")?;
            println!("Created configuration file: {}", path.display());
            return Ok(());
        }

        let (path, created) =
            ConfigFile::create_default_if_missing().context("Failed to create config file")?;
        if created {
            println!("Created configuration file: {}", path.display());
            println!();
            println!("Set [server] host to your receiver before streaming.");
        } else {
            println!("Configuration file already exists: {}", path.display());
            println!();
            println!("Use --force to overwrite, or edit the existing file.");
        }
        return Ok(());
    }

    print!("{}", sample_config());
    Ok(())
}
