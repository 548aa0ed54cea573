//! Ladder command - show the encoder fallback ladder

use anyhow::{Context, Result};
use clap::Args;
use camrelay_core::config::{EncoderCandidate, SessionConfig};
use camrelay_core::types::Resolution;
use std::path::PathBuf;

/// Arguments for the ladder command
#[derive(Args)]
pub struct LadderArgs {
    /// Requested capture resolution; replaces the first rung's size
    #[arg(short, long)]
    resolution: Option<String>,

    /// Config file to read instead of the default one
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Print the effective ladder
pub async fn ladder(args: LadderArgs) -> Result<()> {
    let file = super::load_config(args.config)?;
    let config = SessionConfig::from_file(&file).context("Invalid configuration")?;

    let requested = args
        .resolution
        .as_deref()
        .unwrap_or(&file.capture.resolution);
    let resolution: Resolution = requested.parse().map_err(anyhow::Error::msg)?;

    let candidates: Vec<EncoderCandidate> = config
        .ladder
        .iter()
        .enumerate()
        .map(|(rung, c)| {
            if rung == 0 {
                c.with_resolution(resolution.width, resolution.height)
            } else {
                c.clone()
            }
        })
        .collect();

    println!(
        "Encoder ladder for {} ({} candidates):\n",
        resolution,
        candidates.len()
    );

    for (rung, candidate) in candidates.iter().enumerate() {
        let profile = candidate
            .profile()
            .with_context(|| format!("Invalid codec in rung {}", rung + 1))?;
        println!(
            "  {}. {:<12} {:<20} level {:<4} {:>9} {:>6} kbps {:>3} fps  {}",
            rung + 1,
            candidate.codec,
            profile.profile_name(),
            profile.level(),
            candidate.resolution().to_string(),
            candidate.bitrate / 1000,
            candidate.framerate,
            candidate.latency
        );
    }

    #[cfg(feature = "ffmpeg")]
    {
        println!();
        let provider = super::encoder_provider(&file.encoder.backend)?;
        println!("Probing with {}:", provider.name());
        for (rung, candidate) in candidates.iter().enumerate() {
            let result = match provider.probe(candidate).await {
                Ok(true) => "supported".to_string(),
                Ok(false) => "not supported".to_string(),
                Err(e) => format!("probe failed: {}", e),
            };
            println!("  {}. {}: {}", rung + 1, candidate.codec, result);
        }
    }
    #[cfg(not(feature = "ffmpeg"))]
    println!("\n(Build with `--features ffmpeg` to probe these candidates)");

    Ok(())
}
