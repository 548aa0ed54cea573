//! Streaming session
//!
//! Orchestrates the flow from camera capture through encoder negotiation to
//! the control channel.
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌────────────┐   ┌─────────┐
//! │ FrameSource │──▶│ feed loop   │──▶│ Packetizer │──▶│ Channel │
//! │ (pull/poll) │   │ (keyframes) │   │ (ordered)  │   │ (FIFO)  │
//! └─────────────┘   └─────────────┘   └────────────┘   └─────────┘
//! ```
//!
//! The channel outlives source and encoder switches; everything else is
//! rebuilt on `reconfigure`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capture::{DeliveryKind, FrameSource, RawSource, SourceProvider};
use crate::config::{EncoderCandidate, KeyframePolicy, SessionConfig};
use crate::encode::{self, ActiveEncoder, EncoderProvider, Negotiation};
use crate::error::{CamrelayError, Result};
use crate::output::{Channel, Connector, OutboundSink, Packetizer, PacketizerCounters};
use crate::types::{Handle, Resolution, SourceDescriptor};

/// How long a closed encoder's remaining units may take to drain
const PACKETIZER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Frames between progress logs of the feed loop
const LOG_EVERY_FRAMES: u64 = 300;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing running
    Idle,
    /// Acquiring source, channel and encoder
    Starting,
    /// Frames flow to the channel
    Streaming,
    /// Switching source or resolution
    Reconfiguring,
    /// Tearing everything down
    Stopping,
    /// A transition failed; only `stop` is accepted
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Streaming => "streaming",
            Self::Reconfiguring => "reconfiguring",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Source and encoder handed back by a stopped feed loop
struct FeedParts {
    source: FrameSource,
    encoder: ActiveEncoder,
}

/// Running feed loop
struct FeedTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<FeedParts>,
}

impl FeedTask {
    /// Stop the loop, even while it waits for a frame, and take its parts back
    async fn halt(self) -> Option<FeedParts> {
        let _ = self.stop.send(true);
        match self.handle.await {
            Ok(parts) => Some(parts),
            Err(e) => {
                error!("Feed loop ended abnormally: {}", e);
                None
            }
        }
    }
}

/// One source paired with one encoder
struct Stage {
    raw: Box<dyn RawSource>,
    feed: FeedTask,
    packetizer: Packetizer,
    candidate: EncoderCandidate,
    delivery: DeliveryKind,
}

impl Stage {
    /// Stop the feed loop and the source tracks
    ///
    /// The encoder is returned still configured so the caller decides when
    /// to flush it.
    async fn stop_source(self) -> (Option<ActiveEncoder>, Packetizer) {
        let Stage {
            mut raw,
            feed,
            packetizer,
            ..
        } = self;

        let encoder = feed.halt().await.map(|FeedParts { mut source, encoder }| {
            source.close();
            encoder
        });
        raw.stop();
        (encoder, packetizer)
    }

    /// Tear down source, encoder and packetizer
    async fn shutdown(self) {
        let (encoder, packetizer) = self.stop_source().await;
        retire_encoder(encoder, packetizer).await;
    }
}

/// Flush and close an encoder, then let its packetizer drain
async fn retire_encoder(encoder: Option<ActiveEncoder>, packetizer: Packetizer) {
    if let Some(mut encoder) = encoder {
        encoder.shutdown().await;
    }
    packetizer.finish(PACKETIZER_DRAIN_TIMEOUT).await;
}

/// Adaptive capture-encode-transmit session
///
/// Owned by the caller; at most one source, encoder and channel are active
/// at a time.
pub struct Session {
    handle: Handle,
    config: SessionConfig,
    sources: Arc<dyn SourceProvider>,
    encoders: Arc<dyn EncoderProvider>,
    connector: Arc<dyn Connector>,
    state: SessionState,
    descriptor: Option<SourceDescriptor>,
    /// Frames fed to encoders since the last fresh start
    frames: Arc<AtomicU64>,
    /// Encoder output counters since the last fresh start
    output: Arc<PacketizerCounters>,
    started_at: Option<Instant>,
    channel: Option<Channel>,
    stage: Option<Stage>,
}

impl Session {
    /// Create an idle session
    pub fn new(
        config: SessionConfig,
        sources: Arc<dyn SourceProvider>,
        encoders: Arc<dyn EncoderProvider>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            handle: Handle::new(),
            config,
            sources,
            encoders,
            connector,
            state: SessionState::Idle,
            descriptor: None,
            frames: Arc::new(AtomicU64::new(0)),
            output: Arc::new(PacketizerCounters::default()),
            started_at: None,
            channel: None,
            stage: None,
        }
    }

    /// Session handle
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Descriptor of the active source
    pub fn descriptor(&self) -> Option<SourceDescriptor> {
        self.descriptor
    }

    /// Candidate of the active encoder
    pub fn active_candidate(&self) -> Option<&EncoderCandidate> {
        self.stage.as_ref().map(|stage| &stage.candidate)
    }

    /// Delivery mechanism of the active source
    pub fn delivery(&self) -> Option<DeliveryKind> {
        self.stage.as_ref().map(|stage| stage.delivery)
    }

    /// Whether a channel is established and open
    pub fn channel_open(&self) -> bool {
        self.channel.as_ref().is_some_and(Channel::is_open)
    }

    /// Frames fed since the last fresh start
    pub fn frames_fed(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Encoder chunks produced since the last fresh start
    pub fn chunks_produced(&self) -> u64 {
        self.output.chunks.load(Ordering::Relaxed)
    }

    /// Whether the feed loop ended on its own because the source ended
    pub fn feed_finished(&self) -> bool {
        self.stage
            .as_ref()
            .is_some_and(|stage| stage.feed.handle.is_finished())
    }

    /// Start streaming from `descriptor`
    ///
    /// Opens the channel when none is live. Starting while streaming tears
    /// down the current source and encoder first, keeps the channel and
    /// resets the counters. On failure everything acquired by this attempt
    /// is released and the session is `Failed`.
    pub async fn start(&mut self, descriptor: SourceDescriptor) -> Result<()> {
        match self.state {
            SessionState::Idle => {}
            SessionState::Streaming => {
                info!("{}: restarting with {}", self.handle, descriptor);
                if let Some(stage) = self.stage.take() {
                    stage.shutdown().await;
                }
            }
            SessionState::Failed => {
                return Err(CamrelayError::InvalidState(
                    "session failed; stop it before starting again".into(),
                ));
            }
            _ => return Err(CamrelayError::SessionAlreadyRunning),
        }

        info!("{}: starting with {}", self.handle, descriptor);
        self.state = SessionState::Starting;
        self.descriptor = Some(descriptor);
        self.frames = Arc::new(AtomicU64::new(0));
        self.output = Arc::new(PacketizerCounters::default());
        self.started_at = Some(Instant::now());

        let mut raw = match self.sources.acquire(&descriptor).await {
            Ok(raw) => raw,
            Err(e) => return Err(self.fail(e)),
        };

        let opened_channel = match self.ensure_channel(descriptor.resolution()).await {
            Ok(opened) => opened,
            Err(e) => {
                raw.stop();
                return Err(self.fail(e));
            }
        };

        let negotiation = match self.negotiate(descriptor.resolution()).await {
            Ok(negotiation) => negotiation,
            Err(e) => {
                raw.stop();
                if opened_channel {
                    if let Some(mut channel) = self.channel.take() {
                        channel.close().await;
                    }
                }
                return Err(self.fail(e));
            }
        };

        self.launch(raw, negotiation);
        self.state = SessionState::Streaming;
        info!("{}: streaming", self.handle);
        Ok(())
    }

    /// Switch camera and/or resolution while streaming
    ///
    /// Reuses the open channel: one fresh `Metadata`, no new handshake. A
    /// channel that has closed is replaced by a new one. The whole ladder is
    /// renegotiated at the new resolution. Counters keep counting.
    pub async fn reconfigure(&mut self, descriptor: SourceDescriptor) -> Result<()> {
        if self.state != SessionState::Streaming {
            return Err(CamrelayError::InvalidState(format!(
                "cannot reconfigure while {}",
                self.state
            )));
        }

        info!("{}: reconfiguring to {}", self.handle, descriptor);
        self.state = SessionState::Reconfiguring;
        self.descriptor = Some(descriptor);

        let (old_encoder, old_packetizer) = match self.stage.take() {
            Some(stage) => {
                let (encoder, packetizer) = stage.stop_source().await;
                (encoder, Some(packetizer))
            }
            None => (None, None),
        };

        let acquired = self.sources.acquire(&descriptor).await;

        if let Some(packetizer) = old_packetizer {
            retire_encoder(old_encoder, packetizer).await;
        }

        let mut raw = match acquired {
            Ok(raw) => raw,
            Err(e) => return Err(self.fail(e)),
        };

        match self.ensure_channel(descriptor.resolution()).await {
            Ok(true) => info!("{}: channel was closed, reconnected", self.handle),
            Ok(false) => {}
            Err(e) => {
                raw.stop();
                return Err(self.fail(e));
            }
        }

        let negotiation = match self.negotiate(descriptor.resolution()).await {
            Ok(negotiation) => negotiation,
            Err(e) => {
                raw.stop();
                return Err(self.fail(e));
            }
        };

        self.launch(raw, negotiation);
        self.state = SessionState::Streaming;
        info!("{}: streaming", self.handle);
        Ok(())
    }

    /// Stop everything and return to idle; a no-op when already idle
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == SessionState::Idle {
            debug!("{}: already idle", self.handle);
            return Ok(());
        }

        info!("{}: stopping", self.handle);
        self.state = SessionState::Stopping;

        if let Some(stage) = self.stage.take() {
            stage.shutdown().await;
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }

        info!("{}: stopped ({})", self.handle, self.stats());
        self.state = SessionState::Idle;
        self.descriptor = None;
        self.started_at = None;
        Ok(())
    }

    /// Snapshot of the session counters
    pub fn stats(&self) -> SessionStats {
        let elapsed = self
            .started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let frames = self.frames_fed();
        let actual_fps = if elapsed > 0.0 {
            frames as f64 / elapsed
        } else {
            0.0
        };
        let channel = self.channel.as_ref().map(Channel::stats).unwrap_or_default();

        SessionStats {
            handle: self.handle,
            state: self.state,
            resolution: self.active_candidate().map(EncoderCandidate::resolution),
            codec: self.active_candidate().map(|c| c.codec.clone()),
            delivery: self.delivery(),
            frames,
            chunks: self.chunks_produced(),
            packets_sent: channel.sent,
            packets_dropped: channel.dropped,
            actual_fps,
            elapsed_seconds: elapsed,
        }
    }

    /// Open the channel unless a live one exists; true when newly opened
    async fn ensure_channel(&mut self, resolution: Resolution) -> Result<bool> {
        if let Some(channel) = self.channel.as_ref().filter(|c| c.is_open()) {
            channel.send_metadata(resolution);
            return Ok(false);
        }

        if let Some(mut stale) = self.channel.take() {
            debug!("{}: discarding closed channel", self.handle);
            stale.close().await;
        }

        let channel = Channel::open(
            self.connector.as_ref(),
            &self.config.endpoint,
            resolution,
            self.config.handshake_timeout,
        )
        .await?;
        self.channel = Some(channel);
        Ok(true)
    }

    async fn negotiate(&self, resolution: Resolution) -> Result<Negotiation> {
        encode::select(
            self.encoders.as_ref(),
            &self.config.ladder,
            resolution.width,
            resolution.height,
        )
        .await
    }

    /// Bind the source and start the packetizer and feed loop
    fn launch(&mut self, mut raw: Box<dyn RawSource>, negotiation: Negotiation) {
        let Negotiation { encoder, output, .. } = negotiation;
        let candidate = encoder.candidate().clone();

        let sink = self
            .channel
            .as_ref()
            .map(Channel::sink)
            .unwrap_or_else(OutboundSink::disconnected);
        let packetizer = Packetizer::spawn(output, sink, candidate.clone(), self.output.clone());

        let source = FrameSource::bind(raw.as_mut(), self.config.delivery);
        let delivery = source.kind();

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(feed(
            source,
            encoder,
            self.config.keyframes,
            self.frames.clone(),
            stop_rx,
        ));

        self.stage = Some(Stage {
            raw,
            feed: FeedTask { stop, handle },
            packetizer,
            candidate,
            delivery,
        });
    }

    /// Enter `Failed` and log
    fn fail(&mut self, e: CamrelayError) -> CamrelayError {
        error!("{}: {}", self.handle, e);
        self.state = SessionState::Failed;
        e
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("descriptor", &self.descriptor)
            .field("candidate", &self.active_candidate())
            .finish()
    }
}

/// Feed frames to the encoder until stopped or the source ends
async fn feed(
    mut source: FrameSource,
    mut encoder: ActiveEncoder,
    keyframes: KeyframePolicy,
    frames: Arc<AtomicU64>,
    mut stop: watch::Receiver<bool>,
) -> FeedParts {
    loop {
        if *stop.borrow() {
            break;
        }

        let next = tokio::select! {
            biased;
            _ = stop.changed() => break,
            frame = source.next() => frame,
        };
        let Some(frame) = next else {
            info!("Frame source ended");
            break;
        };

        let index = frames.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = encoder.encode(&frame, keyframes.forces(index)) {
            warn!("Frame {} skipped: {}", index, e);
        }
        frame.release();

        if (index + 1) % LOG_EVERY_FRAMES == 0 {
            debug!("{} frames fed", index + 1);
        }
    }

    FeedParts { source, encoder }
}

/// Session statistics
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Session handle
    pub handle: Handle,
    /// Current state
    pub state: SessionState,
    /// Resolution of the active encoder
    pub resolution: Option<Resolution>,
    /// Codec of the active encoder
    pub codec: Option<String>,
    /// Frame delivery in use
    pub delivery: Option<DeliveryKind>,
    /// Frames fed to encoders
    pub frames: u64,
    /// Chunks produced by encoders
    pub chunks: u64,
    /// Messages written to the channel
    pub packets_sent: u64,
    /// Messages dropped by the channel
    pub packets_dropped: u64,
    /// Measured frame rate
    pub actual_fps: f64,
    /// Elapsed time in seconds
    pub elapsed_seconds: f64,
}

impl std::fmt::Display for SessionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FPS: {:.1} | Chunks: {} | T: {:.1}s",
            self.actual_fps, self.chunks, self.elapsed_seconds
        )
    }
}
