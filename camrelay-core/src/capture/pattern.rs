//! Synthetic test-pattern camera
//!
//! Produces a moving BGRA gradient at the requested size. Useful to run the
//! whole pipeline without camera hardware, in either delivery mode.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::{RawSource, SourceProvider, TrackSettings, VideoSurface};
use crate::error::{CamrelayError, Result};
use crate::types::{FacingMode, Frame, FrameFormat, FrameLease, SourceDescriptor};

/// Frame events buffered before the producer starts dropping
const EVENT_BUFFER: usize = 4;

/// Source provider backed by a generated gradient
#[derive(Debug, Clone)]
pub struct PatternSourceProvider {
    facings: Vec<FacingMode>,
    frame_rate: u32,
    frame_events: bool,
    outstanding: Arc<AtomicUsize>,
}

impl PatternSourceProvider {
    /// Provider with both cameras at 30fps delivering frame events
    pub fn new() -> Self {
        Self {
            facings: vec![FacingMode::User, FacingMode::Environment],
            frame_rate: 30,
            frame_events: true,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Restrict the cameras this provider can open
    pub fn with_facings(mut self, facings: Vec<FacingMode>) -> Self {
        self.facings = facings;
        self
    }

    /// Set the generated frame rate
    pub fn with_frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = frame_rate.max(1);
        self
    }

    /// Whether sources expose discrete frame events
    ///
    /// Without them the pipeline samples the surface instead.
    pub fn with_frame_events(mut self, enabled: bool) -> Self {
        self.frame_events = enabled;
        self
    }

    /// Frames handed out and not yet released
    pub fn outstanding_frames(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl Default for PatternSourceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceProvider for PatternSourceProvider {
    async fn acquire(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn RawSource>> {
        if !self.facings.contains(&descriptor.facing) {
            return Err(CamrelayError::source_unavailable(format!(
                "no {} camera on this device",
                descriptor.facing
            )));
        }
        if descriptor.width == 0 || descriptor.height == 0 {
            return Err(CamrelayError::source_unavailable(format!(
                "cannot capture at {}x{}",
                descriptor.width, descriptor.height
            )));
        }

        let surface = Arc::new(PatternSurface {
            width: descriptor.width,
            height: descriptor.height,
            frame_rate: self.frame_rate,
            facing: descriptor.facing,
            origin: Instant::now(),
            live: AtomicBool::new(true),
            outstanding: self.outstanding.clone(),
        });

        let (events, producer) = if self.frame_events {
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            let producer = tokio::spawn(produce_frames(surface.clone(), tx));
            (Some(rx), Some(producer))
        } else {
            (None, None)
        };

        info!("Pattern camera opened: {}", descriptor);

        Ok(Box::new(PatternSource {
            surface,
            events,
            producer,
        }))
    }
}

/// Generated surface shared by the producer and the poll sampler
struct PatternSurface {
    width: u32,
    height: u32,
    frame_rate: u32,
    facing: FacingMode,
    origin: Instant,
    live: AtomicBool,
    outstanding: Arc<AtomicUsize>,
}

impl PatternSurface {
    fn render(&self, phase: u32) -> Vec<u8> {
        let (width, height) = (self.width, self.height);
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        let tint = match self.facing {
            FacingMode::User => 0u8,
            FacingMode::Environment => 128u8,
        };
        for y in 0..height {
            let g = ((y * 255) / height.max(1)) as u8;
            for x in 0..width {
                let r = (((x + phase) % width.max(1)) * 255 / width.max(1)) as u8;
                data.extend_from_slice(&[tint, g, r, 255]);
            }
        }
        data
    }
}

impl VideoSurface for PatternSurface {
    fn snapshot(&self, timestamp_us: u64) -> Result<Option<Frame>> {
        if !self.is_live() {
            return Ok(None);
        }

        let phase = (self.origin.elapsed().as_millis() / 10) as u32;
        let data = Bytes::from(self.render(phase));

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let outstanding = self.outstanding.clone();
        let lease = FrameLease::new(move || {
            outstanding.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(Some(
            Frame::new(FrameFormat::bgra(self.width, self.height), data, timestamp_us)
                .with_lease(lease),
        ))
    }

    fn refresh_rate(&self) -> f64 {
        self.frame_rate as f64
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Pattern camera track
struct PatternSource {
    surface: Arc<PatternSurface>,
    events: Option<mpsc::Receiver<Frame>>,
    producer: Option<JoinHandle<()>>,
}

impl RawSource for PatternSource {
    fn settings(&self) -> TrackSettings {
        TrackSettings {
            width: self.surface.width,
            height: self.surface.height,
            frame_rate: self.surface.frame_rate as f64,
            label: format!("Pattern camera ({})", self.surface.facing),
        }
    }

    fn take_frame_events(&mut self) -> Option<mpsc::Receiver<Frame>> {
        self.events.take()
    }

    fn surface(&self) -> Arc<dyn VideoSurface> {
        self.surface.clone()
    }

    fn stop(&mut self) {
        if self.surface.live.swap(false, Ordering::SeqCst) {
            debug!("Stopping pattern camera ({})", self.surface.facing);
        }
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }

    fn is_stopped(&self) -> bool {
        !self.surface.is_live()
    }
}

impl Drop for PatternSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Push frames to the event queue at the surface's frame rate
async fn produce_frames(surface: Arc<PatternSurface>, tx: mpsc::Sender<Frame>) {
    let period = Duration::from_secs_f64(1.0 / surface.refresh_rate());
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while surface.is_live() {
        ticker.tick().await;

        let timestamp_us = surface.origin.elapsed().as_micros() as u64;
        let Ok(Some(frame)) = surface.snapshot(timestamp_us) else {
            break;
        };

        match tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                trace!("Frame queue full, dropping frame");
                frame.release();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}
