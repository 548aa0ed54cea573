//! Frame source adapter
//!
//! Wraps a raw track and yields individual frames, either from discrete
//! frame events (pull) or by sampling the video surface at display refresh
//! cadence (poll). The variant is picked once, at bind time.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::{RawSource, VideoSurface};
use crate::config::DeliveryPreference;
use crate::types::Frame;

/// Which delivery mechanism a bound source uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    /// Frames arrive as discrete events
    Pull,
    /// Frames are sampled from the surface
    Poll,
}

impl std::fmt::Display for DeliveryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pull => write!(f, "pull"),
            Self::Poll => write!(f, "poll"),
        }
    }
}

/// Source of frames bound to one raw track
pub enum FrameSource {
    /// Discrete frame events
    Pull(PullSource),
    /// Surface sampler
    Poll(PollSource),
}

/// Reader over a track's frame events
pub struct PullSource {
    events: mpsc::Receiver<Frame>,
}

/// Periodic sampler over a live surface
pub struct PollSource {
    surface: Arc<dyn VideoSurface>,
    ticker: Interval,
    origin: Instant,
    closed: bool,
}

impl FrameSource {
    /// Bind a raw track
    ///
    /// Uses the track's frame events when available, unless polling is
    /// explicitly preferred.
    pub fn bind(raw: &mut dyn RawSource, preference: DeliveryPreference) -> Self {
        let events = match preference {
            DeliveryPreference::Auto => raw.take_frame_events(),
            DeliveryPreference::Poll => None,
        };

        let source = match events {
            Some(events) => Self::Pull(PullSource { events }),
            None => Self::Poll(PollSource::new(raw.surface())),
        };

        let settings = raw.settings();
        info!(
            "Frame source bound ({}): {}x{} @ {:.0}fps, track '{}'",
            source.kind(),
            settings.width,
            settings.height,
            settings.frame_rate,
            settings.label
        );
        source
    }

    /// Delivery mechanism in use
    pub fn kind(&self) -> DeliveryKind {
        match self {
            Self::Pull(_) => DeliveryKind::Pull,
            Self::Poll(_) => DeliveryKind::Poll,
        }
    }

    /// Wait for the next frame
    ///
    /// Returns `None` once the source has ended or was closed. The caller
    /// owns the returned frame and must release it after use.
    pub async fn next(&mut self) -> Option<Frame> {
        match self {
            Self::Pull(pull) => pull.events.recv().await,
            Self::Poll(poll) => poll.next().await,
        }
    }

    /// Stop delivering frames
    ///
    /// Frames still queued in the pull reader are released.
    pub fn close(&mut self) {
        match self {
            Self::Pull(pull) => {
                pull.events.close();
                let mut released = 0usize;
                while let Ok(frame) = pull.events.try_recv() {
                    frame.release();
                    released += 1;
                }
                if released > 0 {
                    debug!("Released {} queued frames on close", released);
                }
            }
            Self::Poll(poll) => poll.closed = true,
        }
    }
}

impl PollSource {
    fn new(surface: Arc<dyn VideoSurface>) -> Self {
        let rate = surface.refresh_rate().max(1.0);
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / rate));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Self {
            surface,
            ticker,
            origin: Instant::now(),
            closed: false,
        }
    }

    async fn next(&mut self) -> Option<Frame> {
        loop {
            if self.closed || !self.surface.is_live() {
                return None;
            }

            self.ticker.tick().await;

            let timestamp_us = self.origin.elapsed().as_micros() as u64;
            match self.surface.snapshot(timestamp_us) {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => trace!("Surface has no image yet"),
                Err(e) => warn!("Surface snapshot failed: {}", e),
            }
        }
    }
}
