//! Configuration types for camrelay
//!
//! Provides the encoder fallback ladder, codec profile parsing, keyframe
//! cadence and runtime session configuration.

mod file;

pub use file::{sample_config, ConfigFile};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CamrelayError, Result};
use crate::output::Endpoint;
use crate::types::{FacingMode, Resolution, SourceDescriptor};

/// Default keyframe interval in frames
pub const DEFAULT_KEYFRAME_INTERVAL: u64 = 60;

/// Default bound on the channel readiness wait
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Encoder latency preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LatencyMode {
    /// Favor low latency over quality
    #[default]
    Realtime,
    /// Favor quality over latency
    Quality,
}

impl std::fmt::Display for LatencyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Realtime => write!(f, "realtime"),
            Self::Quality => write!(f, "quality"),
        }
    }
}

/// Parsed `avc1.PPCCLL` codec identifier
///
/// `PP` is the H.264 profile_idc, `CC` the constraint flags and `LL` the
/// level_idc, each as two hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodecProfile {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
}

impl CodecProfile {
    /// Parse an `avc1.PPCCLL` string (hex digits are case-insensitive)
    pub fn parse(codec: &str) -> Result<Self> {
        let hex = codec
            .strip_prefix("avc1.")
            .or_else(|| codec.strip_prefix("avc3."))
            .ok_or_else(|| CamrelayError::config(format!("Unsupported codec '{}'", codec)))?;

        if hex.len() != 6 || !hex.is_ascii() {
            return Err(CamrelayError::config(format!(
                "Codec '{}' must have 6 hex digits after the prefix",
                codec
            )));
        }

        let byte = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| CamrelayError::config(format!("Invalid hex in codec '{}'", codec)))
        };

        Ok(Self {
            profile_idc: byte(0)?,
            constraint_flags: byte(2)?,
            level_idc: byte(4)?,
        })
    }

    /// H.264 profile name understood by common encoders
    pub fn profile_name(&self) -> &'static str {
        match self.profile_idc {
            0x42 if self.constraint_flags & 0x40 != 0 => "constrained_baseline",
            0x42 => "baseline",
            0x4d => "main",
            0x58 => "extended",
            0x64 => "high",
            0x6e => "high10",
            0x7a => "high422",
            0xf4 => "high444",
            _ => "baseline",
        }
    }

    /// Level as a dotted string, e.g. `3.1`
    pub fn level(&self) -> String {
        format!("{}.{}", self.level_idc / 10, self.level_idc % 10)
    }
}

impl std::fmt::Display for CodecProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "avc1.{:02x}{:02x}{:02x}",
            self.profile_idc, self.constraint_flags, self.level_idc
        )
    }
}

/// One encoder configuration of the fallback ladder
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncoderCandidate {
    /// Codec profile identifier, e.g. `avc1.42001f`
    pub codec: String,
    /// Target width in pixels
    pub width: u32,
    /// Target height in pixels
    pub height: u32,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Target framerate
    pub framerate: u32,
    /// Latency preference
    #[serde(default)]
    pub latency: LatencyMode,
}

impl EncoderCandidate {
    /// Create a realtime candidate
    pub fn new(codec: impl Into<String>, width: u32, height: u32, bitrate: u32, framerate: u32) -> Self {
        Self {
            codec: codec.into(),
            width,
            height,
            bitrate,
            framerate,
            latency: LatencyMode::Realtime,
        }
    }

    /// Same candidate at another resolution
    pub fn with_resolution(&self, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..self.clone()
        }
    }

    /// Set the latency preference
    pub fn with_latency(mut self, latency: LatencyMode) -> Self {
        self.latency = latency;
        self
    }

    /// Target resolution
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Parsed codec profile
    pub fn profile(&self) -> Result<CodecProfile> {
        CodecProfile::parse(&self.codec)
    }
}

impl std::fmt::Display for EncoderCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} @ {}x{} ({}fps, {} kbps, {})",
            self.codec,
            self.width,
            self.height,
            self.framerate,
            self.bitrate / 1000,
            self.latency
        )
    }
}

/// The built-in fallback ladder, highest quality first
///
/// The first rung is a placeholder size; the negotiator replaces it with
/// the requested resolution.
pub fn default_ladder() -> Vec<EncoderCandidate> {
    vec![
        EncoderCandidate::new("avc1.420028", 1280, 720, 4_000_000, 60),
        EncoderCandidate::new("avc1.42001f", 1280, 720, 2_500_000, 60),
        EncoderCandidate::new("avc1.42E01E", 1280, 720, 2_000_000, 30),
        EncoderCandidate::new("avc1.42E01E", 640, 360, 800_000, 30),
    ]
}

/// Frame-count based keyframe cadence
///
/// Frame 0 and every multiple of `interval` (by cumulative frame counter)
/// are forced keyframes, whatever the negotiated framerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyframePolicy {
    interval: u64,
}

impl KeyframePolicy {
    /// Policy forcing a keyframe every `interval` frames
    pub fn every(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
        }
    }

    /// Interval in frames
    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Whether the frame at `frame_index` must be a keyframe
    pub fn forces(&self, frame_index: u64) -> bool {
        frame_index % self.interval == 0
    }
}

impl Default for KeyframePolicy {
    fn default() -> Self {
        Self::every(DEFAULT_KEYFRAME_INTERVAL)
    }
}

/// How frames are taken from a raw track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryPreference {
    /// Discrete frame events when the track offers them, polling otherwise
    #[default]
    Auto,
    /// Always sample the video surface at display refresh cadence
    Poll,
}

impl std::str::FromStr for DeliveryPreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "pull" => Ok(Self::Auto),
            "poll" => Ok(Self::Poll),
            _ => Err(format!("Unknown frame delivery: {}", s)),
        }
    }
}

/// Runtime configuration of a streaming session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Where the channel connects to
    pub endpoint: Endpoint,
    /// Encoder fallback ladder
    pub ladder: Vec<EncoderCandidate>,
    /// Forced keyframe cadence
    pub keyframes: KeyframePolicy,
    /// Bound on the channel readiness wait
    pub handshake_timeout: Duration,
    /// Frame delivery preference
    pub delivery: DeliveryPreference,
}

impl SessionConfig {
    /// Configuration for the given endpoint with defaults elsewhere
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ladder: default_ladder(),
            keyframes: KeyframePolicy::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            delivery: DeliveryPreference::Auto,
        }
    }

    /// Build from a loaded config file
    pub fn from_file(file: &ConfigFile) -> Result<Self> {
        let endpoint = Endpoint::new(&file.server.host, file.server.secure)
            .with_path(&file.server.path);

        let ladder = match &file.encoder.ladder {
            Some(ladder) if !ladder.is_empty() => ladder.clone(),
            Some(_) => {
                return Err(CamrelayError::config("encoder.ladder must not be empty"));
            }
            None => default_ladder(),
        };

        let delivery = file
            .capture
            .delivery
            .parse()
            .map_err(CamrelayError::config)?;

        let config = Self {
            endpoint,
            ladder,
            keyframes: KeyframePolicy::every(file.encoder.keyframe_interval),
            handshake_timeout: Duration::from_millis(file.channel.handshake_timeout_ms),
            delivery,
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the ladder
    pub fn with_ladder(mut self, ladder: Vec<EncoderCandidate>) -> Self {
        self.ladder = ladder;
        self
    }

    /// Set the keyframe interval in frames
    pub fn with_keyframe_interval(mut self, interval: u64) -> Self {
        self.keyframes = KeyframePolicy::every(interval);
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the frame delivery preference
    pub fn with_delivery(mut self, delivery: DeliveryPreference) -> Self {
        self.delivery = delivery;
        self
    }

    /// Check the configuration for values the pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.ladder.is_empty() {
            return Err(CamrelayError::config("Encoder ladder is empty"));
        }
        for candidate in &self.ladder {
            candidate.profile()?;
            if candidate.width == 0 || candidate.height == 0 {
                return Err(CamrelayError::config(format!(
                    "Candidate {} has a zero dimension",
                    candidate
                )));
            }
            if candidate.framerate == 0 || candidate.bitrate == 0 {
                return Err(CamrelayError::config(format!(
                    "Candidate {} needs a non-zero bitrate and framerate",
                    candidate
                )));
            }
        }
        if self.handshake_timeout.is_zero() {
            return Err(CamrelayError::config("Handshake timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Initial source descriptor from a config file
pub fn descriptor_from_file(file: &ConfigFile) -> Result<SourceDescriptor> {
    let facing: FacingMode = file.capture.facing.parse().map_err(CamrelayError::config)?;
    let resolution: Resolution = file
        .capture
        .resolution
        .parse()
        .map_err(CamrelayError::config)?;
    Ok(SourceDescriptor::new(facing, resolution.width, resolution.height))
}
