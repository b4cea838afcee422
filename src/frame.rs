//! Transport-level frame and protocol-neutral message types.

use std::fmt;
use std::time::SystemTime;

/// Identifies which transport produced or should carry a [`RawFrame`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportTag {
    SocketCan,
    Rp1210,
    TruckDuck,
    Loopback,
    /// Frames built locally for transmission, before a transport takes ownership.
    Local,
}

/// A single transport-level unit as it came off the wire, before any protocol decoding.
///
/// For CAN based transports `bytes` is the 29-bit identifier in big-endian followed by up to
/// 8 payload bytes. For J1708 transports `bytes` is the complete frame including the trailing
/// checksum. A `RawFrame` is immutable once captured and is consumed by the matching codec.
#[derive(Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawFrame {
    pub bytes: Vec<u8>,
    /// Receive timestamp assigned by the transport. Monotonic per transport.
    pub timestamp: SystemTime,
    pub source: TransportTag,
    /// Set on frames echoed back by the transport after transmission (readback).
    pub loopback: bool,
}

impl RawFrame {
    pub fn new(source: TransportTag, bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            timestamp: SystemTime::now(),
            source,
            loopback: false,
        }
    }

    /// A frame built by the application for transmission.
    pub fn outbound(bytes: &[u8]) -> Self {
        Self::new(TransportTag::Local, bytes)
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("source", &self.source)
            .field("bytes", &hex::encode(&self.bytes))
            .field("loopback", &self.loopback)
            .finish()
    }
}

/// A fully decoded message, the unit the [`Router`](crate::router::Router) dispatches.
#[derive(Clone, PartialEq, Debug)]
pub enum Message {
    J1587(crate::j1587::J1587Message),
    J1939(crate::j1939::J1939Message),
}

impl Message {
    /// J1708/J1587 message identifier, if this is a J1587 message.
    pub fn mid(&self) -> Option<u8> {
        match self {
            Message::J1587(msg) => Some(msg.mid),
            Message::J1939(_) => None,
        }
    }

    /// Parameter group number, if this is a J1939 message.
    pub fn pgn(&self) -> Option<u32> {
        match self {
            Message::J1587(_) => None,
            Message::J1939(msg) => Some(msg.pgn),
        }
    }

    /// J1939 source address, if this is a J1939 message.
    pub fn source_address(&self) -> Option<u8> {
        match self {
            Message::J1587(_) => None,
            Message::J1939(msg) => Some(msg.sa),
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            Message::J1587(msg) => &msg.data,
            Message::J1939(msg) => &msg.data,
        }
    }

    pub fn timestamp(&self) -> SystemTime {
        match self {
            Message::J1587(msg) => msg.timestamp,
            Message::J1939(msg) => msg.timestamp,
        }
    }
}
