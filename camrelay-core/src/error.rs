//! Error types for camrelay

use std::time::Duration;

use thiserror::Error;

/// Result type alias using CamrelayError
pub type Result<T> = std::result::Result<T, CamrelayError>;

/// Main error type for camrelay operations
#[derive(Debug, Error)]
pub enum CamrelayError {
    /// The raw capture source could not be acquired
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Every candidate of the encoder ladder was rejected
    #[error("No encoder configuration accepted ({tried} candidates tried)")]
    EncoderUnavailable {
        /// Number of candidates evaluated
        tried: usize,
    },

    /// Encoder error on a configured instance
    #[error("Encoder error: {0}")]
    Encoder(String),

    /// Channel did not signal readiness in time
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Transport-level failure
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Channel was closed by the remote side or the transport
    #[error("Channel closed")]
    ChannelClosed,

    /// Operation not valid in the current session state
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Session already running
    #[error("Session already running")]
    SessionAlreadyRunning,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed wire data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<CamrelayError>,
    },
}

impl CamrelayError {
    /// Create a source unavailable error
    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    /// Create an encoder error
    pub fn encoder(msg: impl Into<String>) -> Self {
        Self::Encoder(msg.into())
    }

    /// Create a channel error
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::ChannelError(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping context layers
    pub fn root(&self) -> &CamrelayError {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Advice shown to the user alongside the error message
    pub fn user_hint(&self) -> Option<&'static str> {
        match self.root() {
            Self::SourceUnavailable(_) => Some(
                "Check that the camera exists, is not used by another application, \
                 and that access was granted (browsers require HTTPS for camera access)",
            ),
            Self::EncoderUnavailable { .. } => Some(
                "The hardware H.264 encoder rejected every configuration; \
                 try a lower resolution or another encoder backend",
            ),
            Self::HandshakeTimeout(_) | Self::ChannelError(_) => Some(
                "Make sure the receiver is running and reachable, and that ws/wss \
                 matches how the host is served",
            ),
            Self::Config(_) => Some("Check ~/.config/camrelay/config.toml"),
            _ => None,
        }
    }

    /// Whether the user can fix this without code changes
    pub fn is_user_recoverable(&self) -> bool {
        matches!(
            self.root(),
            Self::SourceUnavailable(_)
                | Self::HandshakeTimeout(_)
                | Self::ChannelError(_)
                | Self::ChannelClosed
                | Self::Config(_)
                | Self::InvalidState(_)
                | Self::SessionAlreadyRunning
        )
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

// Conversions from external error types

impl From<serde_json::Error> for CamrelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CamrelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::ChannelError(err.to_string())
    }
}

#[cfg(feature = "ffmpeg")]
impl From<ffmpeg_next::Error> for CamrelayError {
    fn from(err: ffmpeg_next::Error) -> Self {
        Self::Encoder(err.to_string())
    }
}
