//! Configuration file loading and saving
//!
//! Loads user configuration from `~/.config/camrelay/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::{EncoderCandidate, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_KEYFRAME_INTERVAL};
use crate::error::{CamrelayError, Result};

/// Configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Receiver connection settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Capture settings
    #[serde(default)]
    pub capture: CaptureSettings,

    /// Encoder settings
    #[serde(default)]
    pub encoder: EncoderSettings,

    /// Channel settings
    #[serde(default)]
    pub channel: ChannelSettings,
}

/// Receiver connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host and port of the receiver (e.g., "192.168.1.20:8080")
    #[serde(default = "default_host")]
    pub host: String,

    /// Use wss:// instead of ws://
    #[serde(default)]
    pub secure: bool,

    /// WebSocket path on the receiver
    #[serde(default = "default_path")]
    pub path: String,
}

/// Capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Camera facing mode (user, environment)
    #[serde(default = "default_facing")]
    pub facing: String,

    /// Requested resolution (e.g., "1280x720")
    #[serde(default = "default_resolution")]
    pub resolution: String,

    /// Frame delivery (auto, poll)
    #[serde(default = "default_delivery")]
    pub delivery: String,
}

/// Encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderSettings {
    /// FFmpeg encoder backend (e.g., "libx264", "h264_nvenc")
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Forced keyframe interval in frames
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval: u64,

    /// Override of the built-in fallback ladder, highest quality first
    #[serde(default)]
    pub ladder: Option<Vec<EncoderCandidate>>,
}

/// Channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Readiness timeout in milliseconds
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_path() -> String {
    "/raw".to_string()
}

fn default_facing() -> String {
    "user".to_string()
}

fn default_resolution() -> String {
    "1280x720".to_string()
}

fn default_delivery() -> String {
    "auto".to_string()
}

fn default_backend() -> String {
    "libx264".to_string()
}

fn default_keyframe_interval() -> u64 {
    DEFAULT_KEYFRAME_INTERVAL
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            secure: false,
            path: default_path(),
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            facing: default_facing(),
            resolution: default_resolution(),
            delivery: default_delivery(),
        }
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            keyframe_interval: default_keyframe_interval(),
            ladder: None,
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl ConfigFile {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("camrelay").join("config.toml")
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("camrelay")
                .join("config.toml")
        } else {
            PathBuf::from("/etc/camrelay/config.toml")
        }
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| CamrelayError::Config(format!("Failed to read config file: {}", e)))?;

        let config: ConfigFile = toml::from_str(&content)
            .map_err(|e| CamrelayError::Config(format!("Failed to parse config file: {}", e)))?;

        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load configuration, logging warnings but returning defaults on error
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load config file: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CamrelayError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| CamrelayError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&path, content)
            .map_err(|e| CamrelayError::Config(format!("Failed to write config file: {}", e)))?;

        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Write the sample config to the default path if nothing is there yet
    ///
    /// Returns the path and whether a file was written.
    pub fn create_default_if_missing() -> Result<(PathBuf, bool)> {
        let path = Self::default_path();
        if path.exists() {
            return Ok((path, false));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CamrelayError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }
        std::fs::write(&path, sample_config())
            .map_err(|e| CamrelayError::Config(format!("Failed to write config file: {}", e)))?;
        Ok((path, true))
    }
}

/// Generate a sample configuration file
pub fn sample_config() -> String {
    r#"# camrelay configuration

[server]
# Receiver host and port
host = "127.0.0.1:8080"

# Connect with wss:// (set when the receiver is served over HTTPS)
secure = false

# WebSocket path of the raw stream endpoint
path = "/raw"

[capture]
# Camera: user (front) or environment (rear)
facing = "user"

# Requested capture resolution
resolution = "1280x720"

# Frame delivery: auto (frame events when available) or poll (sample at refresh rate)
delivery = "auto"

[encoder]
# FFmpeg encoder backend: libx264, h264_nvenc, h264_vaapi, ...
backend = "libx264"

# Force a keyframe every N frames (frame count, not time: 60 frames at 30fps is 2s)
keyframe_interval = 60

# Optional ladder override, highest quality first. The first rung's size is
# replaced by the requested resolution.
# [[encoder.ladder]]
# codec = "avc1.42001f"
# width = 1280
# height = 720
# bitrate = 2500000
# framerate = 60
# latency = "realtime"

[channel]
# How long to wait for the receiver to accept the connection
handshake_timeout_ms = 5000
"#
    .to_string()
}
