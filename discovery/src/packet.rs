//! Wire schema for the multicast discovery protocol.
//!
//! Every datagram carries a 4-byte big-endian length prefix followed by a
//! bincode-serialized [`MdnsPacket`]. The schema borrows the record-type
//! vocabulary of DNS-SD (PTR/SRV/TXT/A) but is not DNS wire format.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::service_info::Transport;

/// Largest serialized packet body accepted on the wire. Chosen so that the
/// framed datagram always fits a single UDP payload.
pub const MAX_PACKET_LEN: usize = 65_503;

/// Errors produced while encoding or decoding framed discovery packets.
#[derive(Error, Debug)]
pub enum PacketError {
    /// The datagram is shorter than the 4-byte length prefix.
    #[error("datagram of {0} bytes is too short to carry a length prefix")]
    Truncated(usize),
    /// The length prefix does not match the number of payload bytes received.
    #[error("length prefix claims {declared} bytes but the datagram carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    /// The serialized body exceeds [`MAX_PACKET_LEN`].
    #[error("packet body of {0} bytes exceeds the {MAX_PACKET_LEN} byte limit")]
    Oversized(usize),
    /// Serialization or deserialization of the packet body failed.
    #[error("packet codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Record types a question may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    Ptr,
    Srv,
    Txt,
    A,
}

/// A single question inside a query packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub name: String,
    pub record_type: RecordType,
}

/// The payload of one resource record. Consumers switch on the variant tag;
/// new record types extend this enum in one place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordData {
    Ptr {
        domain_name: String,
    },
    Srv {
        port: u16,
        target: String,
        protocol: Transport,
        service: String,
        instance: String,
    },
    Txt {
        entries: HashMap<String, String>,
    },
    A {
        address: Ipv4Addr,
    },
}

impl RecordData {
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordData::Ptr { .. } => RecordType::Ptr,
            RecordData::Srv { .. } => RecordType::Srv,
            RecordData::Txt { .. } => RecordType::Txt,
            RecordData::A { .. } => RecordType::A,
        }
    }
}

/// One resource record: a name, a time-to-live, the cache-flush hint and the
/// typed payload. A `ttl` of zero announces a goodbye.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdnsRecord {
    pub name: String,
    pub ttl: u32,
    pub cache_flush: bool,
    pub data: RecordData,
}

/// Body of a packet: either a query or a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PacketBody {
    Query {
        questions: Vec<Question>,
    },
    Response {
        answers: Vec<MdnsRecord>,
        additional: Vec<MdnsRecord>,
    },
}

/// A complete discovery packet as it travels inside one framed datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdnsPacket {
    pub transaction_id: u32,
    /// Wall-clock send time, second precision.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub body: PacketBody,
}

impl MdnsPacket {
    /// Builds a packet stamped with the current wall clock, truncated to whole
    /// seconds so that an encode/decode round trip compares equal.
    pub fn new(transaction_id: u32, body: PacketBody) -> Self {
        let timestamp = Utc
            .timestamp_opt(Utc::now().timestamp(), 0)
            .single()
            .unwrap_or_default();
        Self {
            transaction_id,
            timestamp,
            body,
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self.body, PacketBody::Query { .. })
    }
}

/// Serializes a packet and prepends the 4-byte big-endian length prefix.
pub fn encode_packet(packet: &MdnsPacket) -> Result<Vec<u8>, PacketError> {
    let body = bincode::serialize(packet)?;
    if body.len() > MAX_PACKET_LEN {
        return Err(PacketError::Oversized(body.len()));
    }
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Parses one framed datagram. The length prefix must agree exactly with the
/// datagram size; anything else is rejected without panicking.
pub fn decode_packet(datagram: &[u8]) -> Result<MdnsPacket, PacketError> {
    if datagram.len() < 4 {
        return Err(PacketError::Truncated(datagram.len()));
    }
    let declared = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]) as usize;
    let actual = datagram.len() - 4;
    if declared != actual {
        return Err(PacketError::LengthMismatch { declared, actual });
    }
    if declared > MAX_PACKET_LEN {
        return Err(PacketError::Oversized(declared));
    }
    Ok(bincode::deserialize(&datagram[4..])?)
}
