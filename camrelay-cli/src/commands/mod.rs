//! CLI command implementations

mod config;
mod ladder;
mod stream;

pub use config::{config, ConfigArgs};
pub use ladder::{ladder, LadderArgs};
pub use stream::{stream, StreamArgs};

use anyhow::{Context, Result};
use camrelay_core::config::ConfigFile;
use camrelay_core::encode::EncoderProvider;
use std::path::PathBuf;
use std::sync::Arc;

/// Load the config file given on the command line, or the default one
fn load_config(path: Option<PathBuf>) -> Result<ConfigFile> {
    match path {
        Some(path) => ConfigFile::load_from(path.clone())
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(ConfigFile::load_or_default()),
    }
}

/// Encoder provider for the configured FFmpeg backend
#[cfg(feature = "ffmpeg")]
fn encoder_provider(backend: &str) -> Result<Arc<dyn EncoderProvider>> {
    let provider = camrelay_core::encode::FfmpegEncoderProvider::new(backend)
        .with_context(|| format!("Encoder backend '{}' is not usable", backend))?;
    Ok(Arc::new(provider))
}

#[cfg(not(feature = "ffmpeg"))]
fn encoder_provider(backend: &str) -> Result<Arc<dyn EncoderProvider>> {
    anyhow::bail!(
        "No H.264 encoder available for '{}': rebuild with `--features ffmpeg`",
        backend
    )
}
