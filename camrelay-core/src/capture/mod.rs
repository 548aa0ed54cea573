//! Camera capture
//!
//! This module handles:
//! - The raw source contract the pipeline drives (acquire, frame delivery, stop)
//! - Binding a raw track to a [`FrameSource`] with pull or poll delivery
//! - A synthetic test-pattern source

pub mod pattern;
pub mod source;

pub use pattern::PatternSourceProvider;
pub use source::{DeliveryKind, FrameSource};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{Frame, SourceDescriptor};

/// Acquires raw capture sources
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Open the camera described by `descriptor`
    ///
    /// Fails with `SourceUnavailable` when the camera cannot be opened.
    async fn acquire(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn RawSource>>;
}

/// Actual settings of an acquired track
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub label: String,
}

/// A live capture track
pub trait RawSource: Send {
    /// Settings the track actually runs with
    fn settings(&self) -> TrackSettings;

    /// Discrete per-frame events, if the platform offers them
    ///
    /// Returns `None` when frames can only be sampled from the surface, or
    /// when the events were already taken.
    fn take_frame_events(&mut self) -> Option<mpsc::Receiver<Frame>>;

    /// Live video surface that can be snapshotted at any time
    fn surface(&self) -> Arc<dyn VideoSurface>;

    /// Stop all tracks of this source
    fn stop(&mut self);

    /// Whether `stop` was called or the source ended on its own
    fn is_stopped(&self) -> bool;
}

/// A surface showing the latest captured image
pub trait VideoSurface: Send + Sync {
    /// Snapshot the current image, stamped with `timestamp_us`
    ///
    /// Returns `Ok(None)` while no image is available yet.
    fn snapshot(&self, timestamp_us: u64) -> Result<Option<Frame>>;

    /// Display refresh rate driving the sampler, in Hz
    fn refresh_rate(&self) -> f64;

    /// Whether the surface still shows a live track
    fn is_live(&self) -> bool;
}
