//! Video encoding
//!
//! This module provides:
//! - The encoder capability contract (probe, configure, encode, flush, close)
//! - [`ActiveEncoder`], the single configured encoder a session owns
//! - The fallback ladder negotiator
//! - An FFmpeg-backed H.264 encoder (`ffmpeg` feature)

#[cfg(feature = "ffmpeg")]
mod ffmpeg;
pub mod negotiate;

#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg::FfmpegEncoderProvider;
pub use negotiate::{select, Negotiation};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::EncoderCandidate;
use crate::error::{CamrelayError, Result};
use crate::types::Frame;

/// Queue an encoder instance emits its output on, in encode order
pub type EncoderOutput = mpsc::UnboundedSender<EncodedUnit>;

/// Encoder capability provider
#[async_trait]
pub trait EncoderProvider: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Whether the exact candidate configuration is supported
    async fn probe(&self, candidate: &EncoderCandidate) -> Result<bool>;

    /// Create an unconfigured encoder instance emitting on `output`
    fn create(&self, output: EncoderOutput) -> Result<Box<dyn VideoEncoder>>;
}

/// One encoder instance
#[async_trait]
pub trait VideoEncoder: Send {
    /// Configure the instance for `candidate`
    ///
    /// The first unit emitted after configuration carries the out-of-band
    /// decoder description, if the codec has one.
    fn configure(&mut self, candidate: &EncoderCandidate) -> Result<()>;

    /// Queue a frame for encoding
    fn encode(&mut self, frame: &Frame, force_keyframe: bool) -> Result<()>;

    /// Emit every pending unit
    async fn flush(&mut self) -> Result<()>;

    /// Release the instance; no unit is emitted afterwards
    fn close(&mut self);
}

/// Encoded payload, possibly still to be copied out of encoder memory
pub enum Payload {
    /// Bytes already available
    Ready(Bytes),
    /// Extraction that completes later
    Pending(BoxFuture<'static, Result<Bytes>>),
}

impl Payload {
    /// Wait for the payload bytes
    pub async fn extract(self) -> Result<Bytes> {
        match self {
            Self::Ready(bytes) => Ok(bytes),
            Self::Pending(extraction) => extraction.await,
        }
    }
}

/// One encoder output event
pub struct EncodedUnit {
    /// Whether the unit decodes on its own
    pub keyframe: bool,
    /// Declared payload length in bytes
    pub byte_length: usize,
    /// Presentation timestamp in microseconds
    pub timestamp_us: u64,
    /// Decoder description, present right after (re)configuration
    pub description: Option<Bytes>,
    /// Payload bytes
    pub payload: Payload,
}

impl EncodedUnit {
    /// Unit whose payload is already available
    pub fn ready(keyframe: bool, data: Bytes, timestamp_us: u64) -> Self {
        Self {
            keyframe,
            byte_length: data.len(),
            timestamp_us,
            description: None,
            payload: Payload::Ready(data),
        }
    }

    /// Unit whose payload is extracted asynchronously
    pub fn deferred(
        keyframe: bool,
        byte_length: usize,
        timestamp_us: u64,
        extraction: BoxFuture<'static, Result<Bytes>>,
    ) -> Self {
        Self {
            keyframe,
            byte_length,
            timestamp_us,
            description: None,
            payload: Payload::Pending(extraction),
        }
    }

    /// Attach the decoder description
    pub fn with_description(mut self, description: Bytes) -> Self {
        self.description = Some(description);
        self
    }
}

impl std::fmt::Debug for EncodedUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedUnit")
            .field("keyframe", &self.keyframe)
            .field("byte_length", &self.byte_length)
            .field("timestamp_us", &self.timestamp_us)
            .field("description", &self.description.as_ref().map(|d| d.len()))
            .finish()
    }
}

/// Lifecycle of an [`ActiveEncoder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Unconfigured,
    Configured,
    Closed,
}

/// The configured encoder owned by a session
pub struct ActiveEncoder {
    /// Dropped on close, which also ends the instance's output queue
    inner: Option<Box<dyn VideoEncoder>>,
    candidate: EncoderCandidate,
    state: EncoderState,
    frames_encoded: u64,
    encode_errors: u64,
}

impl ActiveEncoder {
    /// Wrap an unconfigured instance
    pub fn new(inner: Box<dyn VideoEncoder>, candidate: EncoderCandidate) -> Self {
        Self {
            inner: Some(inner),
            candidate,
            state: EncoderState::Unconfigured,
            frames_encoded: 0,
            encode_errors: 0,
        }
    }

    /// Configure the instance with its candidate
    pub fn configure(&mut self) -> Result<()> {
        let Some(inner) = self.inner.as_mut().filter(|_| self.state == EncoderState::Unconfigured)
        else {
            return Err(CamrelayError::InvalidState(format!(
                "cannot configure a {:?} encoder",
                self.state
            )));
        };
        inner.configure(&self.candidate)?;
        self.state = EncoderState::Configured;
        Ok(())
    }

    /// Candidate this encoder runs with
    pub fn candidate(&self) -> &EncoderCandidate {
        &self.candidate
    }

    /// Current lifecycle state
    pub fn state(&self) -> EncoderState {
        self.state
    }

    /// Frames accepted by the encoder
    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    /// Frames the encoder rejected
    pub fn encode_errors(&self) -> u64 {
        self.encode_errors
    }

    /// Encode one frame
    pub fn encode(&mut self, frame: &Frame, force_keyframe: bool) -> Result<()> {
        let Some(inner) = self.inner.as_mut().filter(|_| self.state == EncoderState::Configured)
        else {
            return Err(CamrelayError::InvalidState(format!(
                "encoder is {:?}",
                self.state
            )));
        };
        match inner.encode(frame, force_keyframe) {
            Ok(()) => {
                self.frames_encoded += 1;
                Ok(())
            }
            Err(e) => {
                self.encode_errors += 1;
                Err(e)
            }
        }
    }

    /// Emit every pending unit
    pub async fn flush(&mut self) -> Result<()> {
        match self.inner.as_mut() {
            Some(inner) if self.state == EncoderState::Configured => inner.flush().await,
            _ => Ok(()),
        }
    }

    /// Close the instance; idempotent
    pub fn close(&mut self) {
        let Some(mut inner) = self.inner.take() else {
            return;
        };
        inner.close();
        self.state = EncoderState::Closed;
        debug!("Encoder closed: {}", self.candidate.codec);
    }

    /// Flush then close
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.flush().await {
            warn!("Encoder flush failed: {}", e);
        }
        self.close();
        info!(
            "Encoder {} shut down after {} frames ({} rejected)",
            self.candidate.codec, self.frames_encoded, self.encode_errors
        );
    }
}

impl Drop for ActiveEncoder {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ActiveEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveEncoder")
            .field("candidate", &self.candidate)
            .field("state", &self.state)
            .field("frames_encoded", &self.frames_encoded)
            .finish()
    }
}
