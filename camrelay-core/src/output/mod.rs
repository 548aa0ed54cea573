//! Transmission to the remote consumer
//!
//! - Wire protocol (JSON control messages, framed binary packets)
//! - The control channel with its single FIFO writer
//! - WebSocket transport
//! - The per-encoder packetizer

mod channel;
mod packetizer;
mod protocol;
mod websocket;

pub use channel::{
    Channel, ChannelStats, Connector, Endpoint, OutboundSink, Transport, DEFAULT_PATH,
};
pub use packetizer::{Packetizer, PacketizerCounters};
pub use protocol::{ControlMessage, Outbound, Packet, PacketHeader, UnitKind};
pub use websocket::WsConnector;
