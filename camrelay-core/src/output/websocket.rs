//! WebSocket transport
//!
//! Control messages go out as text frames and packets as binary frames.
//! A reader task watches the socket and marks the transport closed when the
//! peer goes away.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};

use super::channel::{Connector, Endpoint, Transport};
use crate::error::{CamrelayError, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Connects over WebSocket
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>> {
        let url = endpoint.url();
        let (stream, response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| CamrelayError::channel(format!("Failed to connect to {}: {}", url, e)))?;
        debug!("WebSocket upgrade response: {}", response.status());

        let (sink, mut reader) = stream.split();
        let open = Arc::new(AtomicBool::new(true));

        let reader_open = open.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Close(frame)) => {
                        debug!("Peer closed the WebSocket: {:?}", frame);
                        break;
                    }
                    Ok(other) => trace!("Ignoring inbound message ({} bytes)", other.len()),
                    Err(e) => {
                        debug!("WebSocket read error: {}", e);
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            info!("WebSocket closed");
        });

        Ok(Box::new(WsTransport {
            sink: Mutex::new(sink),
            open,
            reader: reader_task,
        }))
    }
}

/// Transport over an open WebSocket
struct WsTransport {
    sink: Mutex<WsSink>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl WsTransport {
    async fn send(&self, msg: Message) -> Result<()> {
        if !self.is_open() {
            return Err(CamrelayError::ChannelClosed);
        }
        let result = self.sink.lock().await.send(msg).await;
        if let Err(e) = result {
            self.open.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&self, text: String) -> Result<()> {
        self.send(Message::text(text)).await
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.send(Message::binary(data.to_vec())).await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        self.reader.abort();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
