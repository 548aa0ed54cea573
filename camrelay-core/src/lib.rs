//! camrelay core library
//!
//! Streams a live camera to a remote consumer over a persistent channel,
//! negotiating the best H.264 configuration the encoder accepts.
//!
//! This library provides:
//! - Camera capture with pull (frame events) or poll (surface sampling) delivery
//! - Encoder negotiation over a fallback ladder of configurations
//! - Ordered packetization of encoder output
//! - A WebSocket control channel shared across source and resolution switches
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌────────────────┐    ┌──────────────┐    ┌───────────┐
//! │ Camera       │───▶│ Encoder        │───▶│ Packetizer   │───▶│ Channel   │
//! │ (pull/poll)  │    │ (ladder)       │    │ (in order)   │    │ (ws/wss)  │
//! └──────────────┘    └────────────────┘    └──────────────┘    └───────────┘
//! ```

pub mod capture;
pub mod config;
pub mod encode;
pub mod error;
pub mod output;
pub mod session;
pub mod types;

pub use config::{ConfigFile, EncoderCandidate, SessionConfig};
pub use error::{CamrelayError, Result};
pub use output::{Endpoint, WsConnector};
pub use session::{Session, SessionState, SessionStats};
pub use types::{FacingMode, Handle, Resolution, SourceDescriptor};
