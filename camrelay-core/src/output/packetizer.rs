//! Encoded unit packetizer
//!
//! One packetizer runs per encoder instance. Payload extraction of several
//! units may be in flight at once, but packets are emitted strictly in the
//! order the encoder produced the units.

use bytes::Bytes;
use futures::stream::{FuturesOrdered, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::channel::OutboundSink;
use super::protocol::{ControlMessage, Packet, UnitKind};
use crate::config::EncoderCandidate;
use crate::encode::EncodedUnit;
use crate::error::Result;

/// Chunks between progress logs
const LOG_EVERY_CHUNKS: u64 = 30;

/// Counters shared between a packetizer and its session
#[derive(Debug, Default)]
pub struct PacketizerCounters {
    /// Units received from encoders
    pub chunks: AtomicU64,
    /// Packets handed to the channel
    pub packets: AtomicU64,
    /// Units whose payload could not be extracted
    pub failed: AtomicU64,
}

/// A unit with its payload extracted
struct ReadyUnit {
    keyframe: bool,
    byte_length: usize,
    description: Option<Bytes>,
    payload: Result<Bytes>,
}

async fn extract(unit: EncodedUnit) -> ReadyUnit {
    let EncodedUnit {
        keyframe,
        byte_length,
        description,
        payload,
        ..
    } = unit;
    ReadyUnit {
        keyframe,
        byte_length,
        description,
        payload: payload.extract().await,
    }
}

/// Running packetizer for one encoder instance
pub struct Packetizer {
    task: JoinHandle<()>,
}

impl Packetizer {
    /// Start packetizing the output of an encoder configured with `candidate`
    pub fn spawn(
        units: mpsc::UnboundedReceiver<EncodedUnit>,
        sink: OutboundSink,
        candidate: EncoderCandidate,
        counters: Arc<PacketizerCounters>,
    ) -> Self {
        let task = tokio::spawn(run(units, sink, candidate, counters));
        Self { task }
    }

    /// Whether the encoder output has ended and every unit was emitted
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the remaining units once the encoder is closed
    ///
    /// Gives up after `timeout` and discards whatever is still pending.
    pub async fn finish(mut self, timeout: Duration) {
        if tokio::time::timeout(timeout, &mut self.task).await.is_err() {
            warn!("Packetizer did not drain within {:?}, discarding", timeout);
            self.task.abort();
        }
    }
}

impl Drop for Packetizer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Consumer loop: submission order in, the same order out
async fn run(
    mut units: mpsc::UnboundedReceiver<EncodedUnit>,
    sink: OutboundSink,
    candidate: EncoderCandidate,
    counters: Arc<PacketizerCounters>,
) {
    let mut pending = FuturesOrdered::new();
    let mut input_open = true;
    let mut config_sent = false;

    loop {
        tokio::select! {
            unit = units.recv(), if input_open => match unit {
                Some(unit) => {
                    let total = counters.chunks.fetch_add(1, Ordering::Relaxed) + 1;
                    if total % LOG_EVERY_CHUNKS == 0 {
                        info!("{} chunks produced by the encoder", total);
                    }
                    pending.push_back(extract(unit));
                }
                None => input_open = false,
            },
            Some(ready) = pending.next(), if !pending.is_empty() => {
                emit(ready, &sink, &candidate, &counters, &mut config_sent);
            }
            else => break,
        }
    }

    debug!("Packetizer for {} finished", candidate.codec);
}

fn emit(
    ready: ReadyUnit,
    sink: &OutboundSink,
    candidate: &EncoderCandidate,
    counters: &PacketizerCounters,
    config_sent: &mut bool,
) {
    if let Some(description) = ready.description {
        if !*config_sent {
            sink.send(ControlMessage::VideoConfig {
                codec: candidate.codec.clone(),
                width: candidate.width,
                height: candidate.height,
                description: description.to_vec(),
            });
            *config_sent = true;
            info!(
                "Decoder description sent for {} ({} bytes)",
                candidate.codec,
                description.len()
            );
        } else {
            trace!("Ignoring repeated decoder description");
        }
    }

    let payload = match ready.payload {
        Ok(payload) => payload,
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("Payload extraction failed, unit skipped: {}", e);
            return;
        }
    };

    if payload.len() != ready.byte_length {
        warn!(
            "Unit declared {} bytes but {} were extracted",
            ready.byte_length,
            payload.len()
        );
    }

    let length = payload.len();
    let kind = UnitKind::from_keyframe(ready.keyframe);
    let packet = match Packet::new(kind, payload) {
        Ok(packet) => packet,
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("Unit cannot be framed, skipped: {}", e);
            return;
        }
    };
    sink.send(packet);
    counters.packets.fetch_add(1, Ordering::Relaxed);

    if kind == UnitKind::Key {
        debug!("Keyframe sent ({} bytes)", length);
    }
}
