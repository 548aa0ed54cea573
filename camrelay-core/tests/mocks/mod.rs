//! Mock infrastructure for testing
//!
//! Fake camera, scriptable encoder and a recording transport, plus small
//! helpers shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use camrelay_core::capture::{RawSource, SourceProvider, TrackSettings, VideoSurface};
use camrelay_core::config::EncoderCandidate;
use camrelay_core::encode::{EncodedUnit, EncoderOutput, EncoderProvider, VideoEncoder};
use camrelay_core::output::{Connector, ControlMessage, Endpoint, Packet, Transport};
use camrelay_core::types::{FacingMode, Frame, FrameFormat, FrameLease, SourceDescriptor};
use camrelay_core::{CamrelayError, Result};

/// Frames a fake camera can queue before `push` waits
const FAKE_QUEUE: usize = 256;

/// Create a small BGRA test frame
pub fn create_test_frame(width: u32, height: u32, timestamp_us: u64) -> Frame {
    let data = vec![0x80u8; (width * height * 4) as usize];
    Frame::new(FrameFormat::bgra(width, height), Bytes::from(data), timestamp_us)
}

/// Poll `cond` until it holds, panicking after `timeout`
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------------
// Camera
// ---------------------------------------------------------------------------

/// Camera provider whose frames are pushed by the test
#[derive(Clone)]
pub struct FakeSourceProvider {
    facings: Vec<FacingMode>,
    frame_events: bool,
    acquired: Arc<Mutex<Vec<SourceDescriptor>>>,
    feeders: Arc<Mutex<Vec<FrameFeeder>>>,
    stopped: Arc<AtomicUsize>,
    outstanding: Arc<AtomicUsize>,
}

impl FakeSourceProvider {
    pub fn new() -> Self {
        Self {
            facings: vec![FacingMode::User, FacingMode::Environment],
            frame_events: true,
            acquired: Arc::new(Mutex::new(Vec::new())),
            feeders: Arc::new(Mutex::new(Vec::new())),
            stopped: Arc::new(AtomicUsize::new(0)),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Only these cameras exist
    pub fn with_facings(mut self, facings: Vec<FacingMode>) -> Self {
        self.facings = facings;
        self
    }

    /// Sources without frame events, sampled through the surface
    pub fn without_frame_events(mut self) -> Self {
        self.frame_events = false;
        self
    }

    /// Descriptors acquired so far
    pub fn acquired(&self) -> Vec<SourceDescriptor> {
        self.acquired.lock().clone()
    }

    /// Feeder of the most recently acquired source
    pub fn feeder(&self) -> FrameFeeder {
        self.feeders
            .lock()
            .last()
            .cloned()
            .expect("no source acquired yet")
    }

    /// Sources stopped so far
    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Frames handed out and not released
    pub fn outstanding_frames(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceProvider for FakeSourceProvider {
    async fn acquire(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn RawSource>> {
        if !self.facings.contains(&descriptor.facing) {
            return Err(CamrelayError::source_unavailable(format!(
                "no {} camera",
                descriptor.facing
            )));
        }
        self.acquired.lock().push(*descriptor);

        let (tx, rx) = mpsc::channel(FAKE_QUEUE);
        self.feeders.lock().push(FrameFeeder {
            tx,
            outstanding: self.outstanding.clone(),
            next_timestamp: Arc::new(AtomicUsize::new(0)),
        });

        Ok(Box::new(FakeSource {
            descriptor: *descriptor,
            events: self.frame_events.then_some(rx),
            surface: Arc::new(FakeSurface {
                live: AtomicBool::new(true),
                outstanding: self.outstanding.clone(),
            }),
            stopped: self.stopped.clone(),
            is_stopped: false,
        }))
    }
}

/// Pushes frames into a fake camera's event queue
#[derive(Clone)]
pub struct FrameFeeder {
    tx: mpsc::Sender<Frame>,
    outstanding: Arc<AtomicUsize>,
    next_timestamp: Arc<AtomicUsize>,
}

impl FrameFeeder {
    /// Push `count` frames; returns how many the source accepted
    pub async fn push(&self, count: usize) -> usize {
        let mut accepted = 0;
        for _ in 0..count {
            let ts = self.next_timestamp.fetch_add(33_333, Ordering::SeqCst) as u64;
            self.outstanding.fetch_add(1, Ordering::SeqCst);
            let outstanding = self.outstanding.clone();
            let frame = create_test_frame(4, 4, ts).with_lease(FrameLease::new(move || {
                outstanding.fetch_sub(1, Ordering::SeqCst);
            }));
            if self.tx.send(frame).await.is_err() {
                break;
            }
            accepted += 1;
        }
        accepted
    }

    /// Whether the source stopped listening
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct FakeSurface {
    live: AtomicBool,
    outstanding: Arc<AtomicUsize>,
}

impl VideoSurface for FakeSurface {
    fn snapshot(&self, timestamp_us: u64) -> Result<Option<Frame>> {
        if !self.is_live() {
            return Ok(None);
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let outstanding = self.outstanding.clone();
        Ok(Some(create_test_frame(4, 4, timestamp_us).with_lease(
            FrameLease::new(move || {
                outstanding.fetch_sub(1, Ordering::SeqCst);
            }),
        )))
    }

    fn refresh_rate(&self) -> f64 {
        60.0
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

struct FakeSource {
    descriptor: SourceDescriptor,
    events: Option<mpsc::Receiver<Frame>>,
    surface: Arc<FakeSurface>,
    stopped: Arc<AtomicUsize>,
    is_stopped: bool,
}

impl RawSource for FakeSource {
    fn settings(&self) -> TrackSettings {
        TrackSettings {
            width: self.descriptor.width,
            height: self.descriptor.height,
            frame_rate: 30.0,
            label: format!("fake {}", self.descriptor.facing),
        }
    }

    fn take_frame_events(&mut self) -> Option<mpsc::Receiver<Frame>> {
        self.events.take()
    }

    fn surface(&self) -> Arc<dyn VideoSurface> {
        self.surface.clone()
    }

    fn stop(&mut self) {
        if !self.is_stopped {
            self.is_stopped = true;
            self.surface.live.store(false, Ordering::SeqCst);
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_stopped(&self) -> bool {
        self.is_stopped
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// What happened to scripted encoder instances
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderEvent {
    Configured { instance: usize, candidate: EncoderCandidate },
    Encoded { instance: usize, keyframe: bool },
    Flushed { instance: usize },
    Closed { instance: usize },
}

type ProbeFn = dyn Fn(&EncoderCandidate) -> Result<bool> + Send + Sync;

struct EncoderScript {
    probe: Box<ProbeFn>,
    probes: Mutex<Vec<EncoderCandidate>>,
    events: Mutex<Vec<EncoderEvent>>,
    failing_configure: Mutex<Vec<String>>,
    delays: Mutex<VecDeque<Duration>>,
    fail_encode: AtomicBool,
    instances: AtomicUsize,
    description: Bytes,
}

/// Encoder provider driven by a probe rule
#[derive(Clone)]
pub struct ScriptedEncoderProvider {
    script: Arc<EncoderScript>,
}

impl ScriptedEncoderProvider {
    /// Provider whose probe answers with `probe`
    pub fn new(probe: impl Fn(&EncoderCandidate) -> Result<bool> + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(EncoderScript {
                probe: Box::new(probe),
                probes: Mutex::new(Vec::new()),
                events: Mutex::new(Vec::new()),
                failing_configure: Mutex::new(Vec::new()),
                delays: Mutex::new(VecDeque::new()),
                fail_encode: AtomicBool::new(false),
                instances: AtomicUsize::new(0),
                description: Bytes::from_static(&[0x01, 0x42, 0x00, 0x1f, 0xff, 0xe1]),
            }),
        }
    }

    /// Provider supporting every candidate
    pub fn accept_all() -> Self {
        Self::new(|_| Ok(true))
    }

    /// Make configure fail for `codec`
    pub fn fail_configure(self, codec: &str) -> Self {
        self.script.failing_configure.lock().push(codec.to_string());
        self
    }

    /// Delay payload extraction of the next units, in encode order
    pub fn with_extraction_delays(self, delays: &[Duration]) -> Self {
        self.script.delays.lock().extend(delays.iter().copied());
        self
    }

    /// Make every encode call fail
    pub fn set_fail_encode(&self, fail: bool) {
        self.script.fail_encode.store(fail, Ordering::SeqCst);
    }

    /// Candidates probed so far
    pub fn probes(&self) -> Vec<EncoderCandidate> {
        self.script.probes.lock().clone()
    }

    /// Instance events so far
    pub fn events(&self) -> Vec<EncoderEvent> {
        self.script.events.lock().clone()
    }

    /// Keyframe flags of every encode call, in order
    pub fn keyframe_flags(&self) -> Vec<bool> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EncoderEvent::Encoded { keyframe, .. } => Some(keyframe),
                _ => None,
            })
            .collect()
    }

    /// Description every instance emits
    pub fn description(&self) -> Bytes {
        self.script.description.clone()
    }

    /// Instances configured and not yet closed
    pub fn open_instances(&self) -> usize {
        let events = self.events();
        events
            .iter()
            .filter(|e| match e {
                EncoderEvent::Configured { instance, .. } => {
                    !events.contains(&EncoderEvent::Closed {
                        instance: *instance,
                    })
                }
                _ => false,
            })
            .count()
    }
}

#[async_trait]
impl EncoderProvider for ScriptedEncoderProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn probe(&self, candidate: &EncoderCandidate) -> Result<bool> {
        self.script.probes.lock().push(candidate.clone());
        (self.script.probe)(candidate)
    }

    fn create(&self, output: EncoderOutput) -> Result<Box<dyn VideoEncoder>> {
        let instance = self.script.instances.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEncoder {
            instance,
            script: self.script.clone(),
            output: Some(output),
            description_pending: false,
            sequence: 0,
        }))
    }
}

struct ScriptedEncoder {
    instance: usize,
    script: Arc<EncoderScript>,
    output: Option<EncoderOutput>,
    description_pending: bool,
    sequence: u32,
}

#[async_trait]
impl VideoEncoder for ScriptedEncoder {
    fn configure(&mut self, candidate: &EncoderCandidate) -> Result<()> {
        if self.script.failing_configure.lock().contains(&candidate.codec) {
            return Err(CamrelayError::encoder(format!(
                "configure rejected {}",
                candidate.codec
            )));
        }
        self.script.events.lock().push(EncoderEvent::Configured {
            instance: self.instance,
            candidate: candidate.clone(),
        });
        self.description_pending = true;
        Ok(())
    }

    fn encode(&mut self, frame: &Frame, force_keyframe: bool) -> Result<()> {
        if self.script.fail_encode.load(Ordering::SeqCst) {
            return Err(CamrelayError::encoder("scripted encode failure"));
        }
        self.script.events.lock().push(EncoderEvent::Encoded {
            instance: self.instance,
            keyframe: force_keyframe,
        });

        // Payload identifies instance and sequence number
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&(self.instance as u32).to_be_bytes());
        payload.extend_from_slice(&self.sequence.to_be_bytes());
        self.sequence += 1;
        let payload = Bytes::from(payload);

        let delay = self.script.delays.lock().pop_front().unwrap_or_default();
        let mut unit = if delay.is_zero() {
            EncodedUnit::ready(force_keyframe, payload, frame.timestamp_us)
        } else {
            EncodedUnit::deferred(
                force_keyframe,
                payload.len(),
                frame.timestamp_us,
                Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    Ok(payload)
                }),
            )
        };
        if self.description_pending {
            self.description_pending = false;
            unit = unit.with_description(self.script.description.clone());
        }

        if let Some(output) = &self.output {
            let _ = output.send(unit);
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.script.events.lock().push(EncoderEvent::Flushed {
            instance: self.instance,
        });
        Ok(())
    }

    fn close(&mut self) {
        self.output = None;
        self.script.events.lock().push(EncoderEvent::Closed {
            instance: self.instance,
        });
    }
}

/// Decode the (instance, sequence) pair a scripted encoder put in a payload
pub fn payload_id(packet: &Packet) -> (u32, u32) {
    let p = packet.payload();
    (
        u32::from_be_bytes([p[0], p[1], p[2], p[3]]),
        u32::from_be_bytes([p[4], p[5], p[6], p[7]]),
    )
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A message as the transport saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Control(ControlMessage),
    Packet(Packet),
}

#[derive(Default)]
struct TransportLog {
    sent: Mutex<Vec<Sent>>,
    open: AtomicBool,
}

/// Connector recording everything written to its transports
#[derive(Clone)]
pub struct RecordingConnector {
    log: Arc<TransportLog>,
    connects: Arc<AtomicUsize>,
    hang: bool,
    refuse: Arc<AtomicBool>,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self {
            log: Arc::new(TransportLog::default()),
            connects: Arc::new(AtomicUsize::new(0)),
            hang: false,
            refuse: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Never become ready
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new()
        }
    }

    /// Fail every connection attempt
    pub fn refusing() -> Self {
        let connector = Self::new();
        connector.set_refusing(true);
        connector
    }

    /// Start or stop refusing connection attempts
    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Connection attempts so far
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Everything written, in order
    pub fn sent(&self) -> Vec<Sent> {
        self.log.sent.lock().clone()
    }

    /// Control messages written, in order
    pub fn controls(&self) -> Vec<ControlMessage> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Control(c) => Some(c),
                Sent::Packet(_) => None,
            })
            .collect()
    }

    /// Packets written, in order
    pub fn packets(&self) -> Vec<Packet> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Packet(p) => Some(p),
                Sent::Control(_) => None,
            })
            .collect()
    }

    /// Metadata messages written
    pub fn metadata(&self) -> Vec<(u32, u32)> {
        self.controls()
            .into_iter()
            .filter_map(|c| match c {
                ControlMessage::Metadata { width, height } => Some((width, height)),
                _ => None,
            })
            .collect()
    }

    /// Codecs of the VideoConfig messages written
    pub fn video_configs(&self) -> Vec<String> {
        self.controls()
            .into_iter()
            .filter_map(|c| match c {
                ControlMessage::VideoConfig { codec, .. } => Some(codec),
                _ => None,
            })
            .collect()
    }

    /// Simulate the remote side going away
    pub fn close_remote(&self) {
        self.log.open.store(false, Ordering::SeqCst);
    }

    /// Whether the transport is open
    pub fn is_open(&self) -> bool {
        self.log.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(CamrelayError::channel(format!(
                "connection to {} refused",
                endpoint
            )));
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.log.open.store(true, Ordering::SeqCst);
        Ok(Box::new(RecordingTransport {
            log: self.log.clone(),
        }))
    }
}

struct RecordingTransport {
    log: Arc<TransportLog>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_text(&self, text: String) -> Result<()> {
        let msg = ControlMessage::from_json(&text)?;
        self.log.sent.lock().push(Sent::Control(msg));
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        let packet = Packet::parse(&data)
            .ok_or_else(|| CamrelayError::protocol("malformed packet"))?;
        self.log.sent.lock().push(Sent::Packet(packet));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.log.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.log.open.store(false, Ordering::SeqCst);
    }
}
