//! J1939 identifier decoding and message types, implements SAE J1939-21 framing.
//!
//! A J1939 frame uses the 29-bit extended CAN identifier, split into a 3-bit priority, an
//! 18-bit parameter group number (PGN) and an 8-bit source address. The PDU format byte of
//! the PGN decides the addressing mode: below 240 (PDU1) the PDU specific byte is a
//! destination address, at 240 and above (PDU2) it is a group extension and the message is
//! a broadcast. Payloads larger than 8 bytes move via the transport protocol in
//! [`transport`].

pub mod error;
pub mod transport;

pub use transport::{J1939Transport, J1939TransportConfig, ReassemblyConfig, Reassembler};

use crate::error::Error;
use std::fmt;
use std::time::SystemTime;

/// Transport protocol connection management PGN (TP.CM).
pub const PGN_TP_CM: u32 = 0x00EC00;
/// Transport protocol data transfer PGN (TP.DT).
pub const PGN_TP_DT: u32 = 0x00EB00;
/// Request PGN.
pub const PGN_REQUEST: u32 = 0x00EA00;

/// Global (broadcast) destination address.
pub const ADDRESS_GLOBAL: u8 = 0xFF;
/// Largest payload the transport protocol can move: 255 segments of 7 bytes.
pub const MAX_TP_SIZE: usize = 1785;
/// Payload bytes per TP.DT frame.
pub const TP_SEGMENT_LEN: usize = 7;

/// Destination of a J1939 message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Destination {
    Broadcast,
    Address(u8),
}

/// Decoded fields of a 29-bit J1939 identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct J1939Header {
    pub priority: u8,
    pub pgn: u32,
    pub sa: u8,
    pub destination: Destination,
}

impl J1939Header {
    pub fn new(priority: u8, pgn: u32, sa: u8, destination: Destination) -> Self {
        Self {
            priority,
            pgn,
            sa,
            destination,
        }
    }

    /// PDU format byte of the PGN.
    pub fn pf(&self) -> u8 {
        ((self.pgn >> 8) & 0xff) as u8
    }

    /// PDU specific byte as it appears in the identifier: destination address for PDU1,
    /// group extension for PDU2.
    pub fn ps(&self) -> u8 {
        match self.destination {
            Destination::Address(addr) => addr,
            Destination::Broadcast => (self.pgn & 0xff) as u8,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self.destination, Destination::Broadcast)
    }
}

/// Split a 29-bit identifier into its J1939 fields.
///
/// PF below 240 is PDU1: the PS byte is a destination address and the PGN's low byte is
/// zero. PF of 240 and above is PDU2: the PS byte is part of the PGN and the message is a
/// broadcast.
pub fn decode_id(id: u32) -> J1939Header {
    let id = id & 0x1FFF_FFFF;
    let priority = ((id >> 26) & 0x7) as u8;
    let edp_dp = (id >> 24) & 0x3;
    let pf = ((id >> 16) & 0xff) as u8;
    let ps = ((id >> 8) & 0xff) as u8;
    let sa = (id & 0xff) as u8;

    let (pgn, destination) = if pf < 240 {
        let destination = if ps == ADDRESS_GLOBAL {
            Destination::Broadcast
        } else {
            Destination::Address(ps)
        };
        ((edp_dp << 16) | ((pf as u32) << 8), destination)
    } else {
        (
            (edp_dp << 16) | ((pf as u32) << 8) | ps as u32,
            Destination::Broadcast,
        )
    };

    J1939Header {
        priority,
        pgn,
        sa,
        destination,
    }
}

/// Assemble a 29-bit identifier from J1939 fields. Inverse of [`decode_id`].
pub fn encode_id(header: &J1939Header) -> u32 {
    let edp_dp = (header.pgn >> 16) & 0x3;
    let pf = (header.pgn >> 8) & 0xff;
    let ps = if pf < 240 {
        match header.destination {
            Destination::Address(addr) => addr as u32,
            Destination::Broadcast => ADDRESS_GLOBAL as u32,
        }
    } else {
        header.pgn & 0xff
    };

    ((header.priority as u32 & 0x7) << 26)
        | (edp_dp << 24)
        | (pf << 16)
        | (ps << 8)
        | header.sa as u32
}

/// A single physical J1939 frame: decoded identifier plus up to 8 payload bytes.
#[derive(Clone, PartialEq)]
pub struct J1939Frame {
    pub header: J1939Header,
    pub data: Vec<u8>,
}

impl J1939Frame {
    pub fn new(header: J1939Header, data: &[u8]) -> crate::Result<Self> {
        if data.len() > 8 {
            return Err(Error::PayloadTooLarge);
        }
        Ok(Self {
            header,
            data: data.to_vec(),
        })
    }

    /// Decode from the raw byte convention used by CAN transports: 4-byte big-endian
    /// identifier followed by the payload.
    pub fn from_raw(raw: &crate::frame::RawFrame) -> crate::Result<Self> {
        if raw.bytes.len() < 4 || raw.bytes.len() > 12 {
            return Err(Error::MalformedFrame);
        }
        let id = u32::from_be_bytes([raw.bytes[0], raw.bytes[1], raw.bytes[2], raw.bytes[3]]);
        Ok(Self {
            header: decode_id(id),
            data: raw.bytes[4..].to_vec(),
        })
    }

    /// Serialize to the raw byte convention: 4-byte big-endian identifier plus payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = encode_id(&self.header).to_be_bytes().to_vec();
        buf.extend_from_slice(&self.data);
        buf
    }
}

impl fmt::Debug for J1939Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("J1939Frame")
            .field("id", &format_args!("0x{:08x}", encode_id(&self.header)))
            .field("pgn", &self.header.pgn)
            .field("sa", &self.header.sa)
            .field("data", &hex::encode(&self.data))
            .finish()
    }
}

/// A complete J1939 message, either a single frame or a reassembled transport payload.
#[derive(Clone, PartialEq, Debug)]
pub struct J1939Message {
    pub pgn: u32,
    pub sa: u8,
    pub destination: Destination,
    pub priority: u8,
    pub data: Vec<u8>,
    pub timestamp: SystemTime,
}

impl J1939Message {
    pub fn from_frame(frame: J1939Frame, timestamp: SystemTime) -> Self {
        Self {
            pgn: frame.header.pgn,
            sa: frame.header.sa,
            destination: frame.header.destination,
            priority: frame.header.priority,
            data: frame.data,
            timestamp,
        }
    }
}
