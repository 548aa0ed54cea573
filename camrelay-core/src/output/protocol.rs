//! Wire format
//!
//! Control messages are JSON text frames with a `type` discriminator. Encoded
//! units travel as binary frames: an 8-byte big-endian header followed by
//! the payload.
//!
//! ```text
//!  0      1      2      3      4              8
//! +------+------+------+------+--------------+--------------
//! | 0x50 | 0x43 | kind | flags| payload len  | payload ...
//! +------+------+------+------+--------------+--------------
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{CamrelayError, Result};

/// Kind of an encoded unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnitKind {
    /// Depends on previous units
    Delta = 0,
    /// Independently decodable
    Key = 1,
}

impl UnitKind {
    /// Kind for a unit's keyframe flag
    pub fn from_keyframe(keyframe: bool) -> Self {
        if keyframe {
            Self::Key
        } else {
            Self::Delta
        }
    }
}

/// Fixed packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: UnitKind,
    pub flags: u8,
    pub payload_length: u32,
}

impl PacketHeader {
    /// Magic bytes, "PC"
    pub const MAGIC: [u8; 2] = [0x50, 0x43];
    /// Encoded header size in bytes
    pub const SIZE: usize = 8;

    /// Header for a payload of `len` bytes
    ///
    /// Fails when `len` does not fit the 32-bit length field.
    pub fn for_payload(kind: UnitKind, len: usize) -> Result<Self> {
        let payload_length = u32::try_from(len).map_err(|_| {
            CamrelayError::protocol(format!(
                "payload of {} bytes exceeds the 32-bit length field",
                len
            ))
        })?;
        Ok(Self {
            kind,
            flags: 0,
            payload_length,
        })
    }

    /// Write the header to `buf`
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&Self::MAGIC);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.flags);
        buf.put_u32(self.payload_length);
    }

    /// Parse a header from the start of `data`
    ///
    /// Returns `None` for short input, wrong magic or an unknown kind.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE || data[..2] != Self::MAGIC {
            return None;
        }
        let mut buf = &data[2..Self::SIZE];
        let kind = match buf.get_u8() {
            0 => UnitKind::Delta,
            1 => UnitKind::Key,
            _ => return None,
        };
        let flags = buf.get_u8();
        let payload_length = buf.get_u32();
        Some(Self {
            kind,
            flags,
            payload_length,
        })
    }
}

/// One encoded unit framed for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: UnitKind,
    payload: Bytes,
}

impl Packet {
    /// Frame a payload
    ///
    /// Rejects payloads longer than the header can describe.
    pub fn new(kind: UnitKind, payload: Bytes) -> Result<Self> {
        PacketHeader::for_payload(kind, payload.len())?;
        Ok(Self { kind, payload })
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Header describing this packet
    ///
    /// The payload length was checked on construction.
    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            kind: self.kind,
            flags: 0,
            payload_length: self.payload.len() as u32,
        }
    }

    /// Total size on the wire
    pub fn wire_len(&self) -> usize {
        PacketHeader::SIZE + self.payload.len()
    }

    /// Serialize header and payload
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.header().encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a full packet, checking the declared length
    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = PacketHeader::parse(data)?;
        let payload = &data[PacketHeader::SIZE..];
        if payload.len() != header.payload_length as usize {
            return None;
        }
        Some(Self {
            kind: header.kind,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// Control message sent as a JSON text frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Intended capture size, sent on readiness and on reconfiguration
    #[serde(rename = "metadata")]
    Metadata { width: u32, height: u32 },

    /// Decoder configuration of a newly configured encoder
    #[serde(rename = "v-config")]
    VideoConfig {
        codec: String,
        width: u32,
        height: u32,
        /// Codec description as a list of byte values
        description: Vec<u8>,
    },
}

impl ControlMessage {
    /// Encode as JSON text
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Anything written to the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Control(ControlMessage),
    Packet(Packet),
}

impl From<ControlMessage> for Outbound {
    fn from(msg: ControlMessage) -> Self {
        Self::Control(msg)
    }
}

impl From<Packet> for Outbound {
    fn from(packet: Packet) -> Self {
        Self::Packet(packet)
    }
}
