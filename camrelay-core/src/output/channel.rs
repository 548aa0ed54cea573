//! Control channel to the remote consumer
//!
//! A [`Channel`] is established once per session and reused across
//! reconfigurations. Every write goes through one FIFO queue drained by a
//! single writer task, so control messages and packets reach the transport
//! in the order they were enqueued. Once the transport is closed, queued
//! messages are dropped rather than buffered.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::protocol::{ControlMessage, Outbound};
use crate::error::{CamrelayError, Result};
use crate::types::Resolution;

/// Default path of the ingest endpoint
pub const DEFAULT_PATH: &str = "/raw";

/// How long `close` waits for queued messages to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Where the channel connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// `host[:port]` of the controlling server
    pub host: String,
    /// Whether the host is served over TLS
    pub secure: bool,
    /// Request path
    pub path: String,
}

impl Endpoint {
    /// Endpoint at the default path
    pub fn new(host: &str, secure: bool) -> Self {
        Self {
            host: host.to_string(),
            secure,
            path: DEFAULT_PATH.to_string(),
        }
    }

    /// Use another request path
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        self
    }

    /// WebSocket URL, `wss` when the host is served securely
    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}{}", scheme, self.host, self.path)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url())
    }
}

/// A connected, ready transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a text frame
    async fn send_text(&self, text: String) -> Result<()>;

    /// Send a binary frame
    async fn send_binary(&self, data: Bytes) -> Result<()>;

    /// Whether the transport is still open
    fn is_open(&self) -> bool;

    /// Close the transport
    async fn close(&self);
}

/// Establishes transports
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `endpoint` and resolve once the transport is ready
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>>;
}

#[derive(Debug, Default)]
struct ChannelCounters {
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of channel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Messages written to the transport
    pub sent: u64,
    /// Messages dropped because the channel was closed or a write failed
    pub dropped: u64,
}

/// Cloneable handle that enqueues messages on a channel
#[derive(Debug, Clone)]
pub struct OutboundSink {
    queue: mpsc::UnboundedSender<Outbound>,
    counters: Arc<ChannelCounters>,
}

impl OutboundSink {
    /// Sink without a channel behind it; every message counts as dropped
    pub fn disconnected() -> Self {
        let (queue, _) = mpsc::unbounded_channel();
        Self {
            queue,
            counters: Arc::new(ChannelCounters::default()),
        }
    }

    /// Enqueue a message; returns false when the channel is gone
    pub fn send(&self, msg: impl Into<Outbound>) -> bool {
        if self.queue.send(msg.into()).is_err() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }
}

/// An established channel
pub struct Channel {
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    sink: OutboundSink,
    writer: Option<JoinHandle<()>>,
    counters: Arc<ChannelCounters>,
    closed: bool,
}

impl Channel {
    /// Connect and perform the handshake
    ///
    /// Fails with `HandshakeTimeout` when the transport is not ready within
    /// `timeout`, and with `ChannelError` on transport failure. On success a
    /// `Metadata` message for `resolution` is the first message queued.
    pub async fn open(
        connector: &dyn Connector,
        endpoint: &Endpoint,
        resolution: Resolution,
        timeout: Duration,
    ) -> Result<Self> {
        info!("Connecting to {}", endpoint);

        let transport = match tokio::time::timeout(timeout, connector.connect(endpoint)).await {
            Err(_) => {
                warn!("No answer from {} within {:?}", endpoint, timeout);
                return Err(CamrelayError::HandshakeTimeout(timeout));
            }
            Ok(Err(e)) => {
                let channel_level = matches!(
                    e.root(),
                    CamrelayError::HandshakeTimeout(_) | CamrelayError::ChannelError(_)
                );
                return Err(if channel_level {
                    e
                } else {
                    CamrelayError::channel(e.to_string())
                });
            }
            Ok(Ok(transport)) => Arc::<dyn Transport>::from(transport),
        };

        let counters = Arc::new(ChannelCounters::default());
        let (queue, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(transport.clone(), rx, counters.clone()));

        let channel = Self {
            endpoint: endpoint.clone(),
            transport,
            sink: OutboundSink {
                queue,
                counters: counters.clone(),
            },
            writer: Some(writer),
            counters,
            closed: false,
        };

        info!("Channel ready: {}", channel.endpoint);
        channel.send_metadata(resolution);
        Ok(channel)
    }

    /// Endpoint this channel is connected to
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Handle for enqueueing messages from other tasks
    ///
    /// After `close`, messages sent through the handle are counted as
    /// dropped.
    pub fn sink(&self) -> OutboundSink {
        self.sink.clone()
    }

    /// Enqueue a message
    pub fn send(&self, msg: impl Into<Outbound>) -> bool {
        self.sink.send(msg)
    }

    /// Announce the intended capture size
    pub fn send_metadata(&self, resolution: Resolution) -> bool {
        debug!("Sending metadata {}", resolution);
        self.send(ControlMessage::Metadata {
            width: resolution.width,
            height: resolution.height,
        })
    }

    /// Whether the transport is open and the writer is running
    pub fn is_open(&self) -> bool {
        !self.closed && self.transport.is_open()
    }

    /// Current counters
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Drain the queue and close the transport; idempotent
    ///
    /// Clones of the sink still held elsewhere keep the writer alive until
    /// the drain timeout.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // Swap in a disconnected queue so the writer sees the end of input
        let (queue, _) = mpsc::unbounded_channel();
        self.sink = OutboundSink {
            queue,
            counters: self.counters.clone(),
        };

        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
                warn!("Channel writer did not drain in time, aborting");
                writer.abort();
            }
        }

        self.transport.close().await;
        let stats = self.stats();
        info!(
            "Channel to {} closed ({} sent, {} dropped)",
            self.endpoint, stats.sent, stats.dropped
        );
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("endpoint", &self.endpoint)
            .field("open", &self.is_open())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Single writer draining the FIFO queue
async fn write_loop(
    transport: Arc<dyn Transport>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    counters: Arc<ChannelCounters>,
) {
    let mut closed_logged = false;

    while let Some(msg) = rx.recv().await {
        if !transport.is_open() {
            if !closed_logged {
                warn!("Channel closed, dropping outbound data");
                closed_logged = true;
            }
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let result = match msg {
            Outbound::Control(control) => match control.to_json() {
                Ok(text) => transport.send_text(text).await,
                Err(e) => Err(e),
            },
            Outbound::Packet(packet) => transport.send_binary(packet.to_bytes()).await,
        };

        match result {
            Ok(()) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Channel write failed: {}", e);
            }
        }
    }

    trace!("Channel writer finished");
}
