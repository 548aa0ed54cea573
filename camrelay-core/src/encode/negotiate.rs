//! Encoder fallback negotiation
//!
//! Walks the candidate ladder in priority order and activates the first
//! configuration the provider accepts.

use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{ActiveEncoder, EncodedUnit, EncoderProvider};
use crate::config::EncoderCandidate;
use crate::error::{CamrelayError, Result};

/// Outcome of a successful negotiation
#[derive(Debug)]
pub struct Negotiation {
    /// The configured encoder
    pub encoder: ActiveEncoder,
    /// Output queue of the encoder, in encode order
    pub output: mpsc::UnboundedReceiver<EncodedUnit>,
    /// Ladder position of the selected candidate (0-based)
    pub rung: usize,
}

/// Select and activate the first supported candidate
///
/// The requested resolution replaces the first candidate's size only; the
/// lower rungs keep their own fallback sizes. Candidates that are
/// unsupported, fail to probe or fail to configure are skipped. Nothing
/// after the first activated candidate is evaluated.
pub async fn select(
    provider: &dyn EncoderProvider,
    ladder: &[EncoderCandidate],
    width: u32,
    height: u32,
) -> Result<Negotiation> {
    for (rung, base) in ladder.iter().enumerate() {
        let candidate = if rung == 0 {
            base.with_resolution(width, height)
        } else {
            base.clone()
        };

        info!(
            "Trying encoder {}/{} on {}: {}",
            rung + 1,
            ladder.len(),
            provider.name(),
            candidate
        );

        match provider.probe(&candidate).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Encoder candidate not supported: {}", candidate.codec);
                continue;
            }
            Err(e) => {
                warn!("Encoder probe failed for {}: {}", candidate.codec, e);
                continue;
            }
        }

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let instance = match provider.create(output_tx) {
            Ok(instance) => instance,
            Err(e) => {
                warn!("Failed to create encoder for {}: {}", candidate.codec, e);
                continue;
            }
        };

        let mut encoder = ActiveEncoder::new(instance, candidate);
        if let Err(e) = encoder.configure() {
            warn!(
                "Failed to configure encoder {}: {}",
                encoder.candidate().codec,
                e
            );
            encoder.close();
            continue;
        }

        info!("Encoder selected: {}", encoder.candidate());
        return Ok(Negotiation {
            encoder,
            output: output_rx,
            rung,
        });
    }

    Err(CamrelayError::EncoderUnavailable {
        tried: ladder.len(),
    })
}
