//! J1708 framing and J1587 parameter decoding.
//!
//! J1708 is the physical/link layer: a frame is a message identifier byte (MID), up to 19
//! data bytes and a two's-complement checksum. J1587 sits on top and defines how the data
//! bytes split into parameters (PIDs). J2497 ("PLC4TRUCKS") reuses the same frame shape over
//! a power-line carrier, so the codec is parameterized by a [`BitTimingProfile`] rather than
//! having a separate code path.
//! ## Example:
//! ```rust
//! let frame = truckbus::j1587::encode(0x80, &[0x01, 0x02, 0x03]).unwrap();
//! let msg = truckbus::j1587::decode(&frame.to_bytes()).unwrap();
//! assert_eq!(msg.mid, 0x80);
//! ```

pub mod error;
mod params;
pub mod transport;

pub use params::{parse_parameters, Parameter};
pub use transport::{J1587Transport, J1587TransportConfig};

use crate::error::Error;
use std::fmt;
use std::time::SystemTime;

/// Maximum number of data bytes in a J1708 frame, excluding MID and checksum.
pub const MAX_DATA_LEN: usize = 19;
/// Maximum total frame length on the wire: MID + data + checksum.
pub const MAX_FRAME_LEN: usize = MAX_DATA_LEN + 2;

/// Bit-timing profile of the serial bus variant carrying the frames.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BitTimingProfile {
    /// SAE J1708, 9600 baud over RS-485 style twisted pair.
    J1708,
    /// SAE J2497 power-line carrier framing at the higher signalling rate.
    J2497,
}

impl BitTimingProfile {
    pub fn baud_rate(&self) -> u32 {
        match self {
            BitTimingProfile::J1708 => 9600,
            BitTimingProfile::J2497 => 19200,
        }
    }

    /// Duration of one bit time on the bus, used for inter-frame gap accounting.
    pub fn bit_time(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(1_000_000_000 / self.baud_rate() as u64)
    }
}

/// Two's-complement checksum over MID and data bytes, as mandated by J1708.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// A single J1708 frame: MID, data bytes and checksum.
#[derive(Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct J1708Frame {
    pub mid: u8,
    pub data: Vec<u8>,
    pub checksum: u8,
}

impl J1708Frame {
    /// Build a frame from MID and data, computing the checksum. Fails with
    /// [`Error::PayloadTooLarge`] if `data` exceeds [`MAX_DATA_LEN`] bytes.
    pub fn new(mid: u8, data: &[u8]) -> crate::Result<Self> {
        if data.len() > MAX_DATA_LEN {
            return Err(Error::PayloadTooLarge);
        }

        let mut sum_input = vec![mid];
        sum_input.extend_from_slice(data);

        Ok(Self {
            mid,
            data: data.to_vec(),
            checksum: checksum(&sum_input),
        })
    }

    /// Parse a frame from raw bus bytes including the trailing checksum.
    ///
    /// Length violations fail with [`Error::MalformedFrame`], a checksum mismatch with
    /// [`Error::ChecksumError`]. A frame is never silently repaired.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        if bytes.len() < 2 || bytes.len() > MAX_FRAME_LEN {
            return Err(Error::MalformedFrame);
        }

        // Sum of all bytes including the checksum must be zero mod 256
        if bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) != 0 {
            return Err(Error::ChecksumError);
        }

        Ok(Self {
            mid: bytes[0],
            data: bytes[1..bytes.len() - 1].to_vec(),
            checksum: bytes[bytes.len() - 1],
        })
    }

    /// Serialize to wire bytes, including the checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data.len() + 2);
        buf.push(self.mid);
        buf.extend_from_slice(&self.data);
        buf.push(self.checksum);
        buf
    }
}

impl fmt::Debug for J1708Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("J1708Frame")
            .field("mid", &self.mid)
            .field("data", &hex::encode(&self.data))
            .field("checksum", &format_args!("0x{:02x}", self.checksum))
            .finish()
    }
}

/// A decoded J1587 message: the frame contents plus any parameters recognized in the data
/// region. Unrecognized MIDs keep their payload unparsed and `parameters` empty.
#[derive(Clone, PartialEq, Debug)]
pub struct J1587Message {
    pub mid: u8,
    pub data: Vec<u8>,
    pub parameters: Vec<Parameter>,
    pub timestamp: SystemTime,
}

impl J1587Message {
    pub fn from_frame(frame: J1708Frame, timestamp: SystemTime) -> Self {
        Self::from_parts(frame.mid, frame.data, timestamp)
    }

    /// Build a message from an already validated MID and data region. Used for single frames
    /// and for payloads reassembled by the transport layer, which can exceed one frame.
    pub fn from_parts(mid: u8, data: Vec<u8>, timestamp: SystemTime) -> Self {
        let parameters = if params::is_parameter_mid(mid) {
            match parse_parameters(&data) {
                Ok(parameters) => parameters,
                Err(e) => {
                    tracing::warn!(
                        "unparseable parameter stream from MID {}: {} ({})",
                        mid,
                        hex::encode(&data),
                        e
                    );
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Self {
            mid,
            data,
            parameters,
            timestamp,
        }
    }
}

/// Encode MID and data into a J1708 frame, computing the checksum.
pub fn encode(mid: u8, data: &[u8]) -> crate::Result<J1708Frame> {
    J1708Frame::new(mid, data)
}

/// Decode raw bus bytes into a [`J1587Message`], verifying the checksum.
pub fn decode(bytes: &[u8]) -> crate::Result<J1587Message> {
    let frame = J1708Frame::from_bytes(bytes)?;
    Ok(J1587Message::from_frame(frame, SystemTime::now()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_twos_complement() {
        // 128 + 1 + 2 + 3 = 134, checksum = 256 - 134 = 0x7a
        assert_eq!(checksum(&[128, 1, 2, 3]), 0x7a);
    }

    #[test]
    fn encode_decode_round_trip() {
        let frame = encode(128, &[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(frame.checksum, 0x7a);

        let msg = decode(&frame.to_bytes()).unwrap();
        assert_eq!(msg.mid, 128);
        assert_eq!(msg.data, vec![1, 2, 3]);
    }

    #[test]
    fn decode_rejects_corrupt_checksum() {
        let mut bytes = encode(128, &[0x01, 0x02, 0x03]).unwrap().to_bytes();
        bytes[4] ^= 0xff;
        assert_eq!(decode(&bytes).unwrap_err(), Error::ChecksumError);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let r = encode(128, &[0u8; MAX_DATA_LEN + 1]);
        assert_eq!(r.unwrap_err(), Error::PayloadTooLarge);
    }

    #[test]
    fn from_bytes_rejects_bad_lengths() {
        assert_eq!(
            J1708Frame::from_bytes(&[0x80]).unwrap_err(),
            Error::MalformedFrame
        );
        assert_eq!(
            J1708Frame::from_bytes(&[0u8; MAX_FRAME_LEN + 1]).unwrap_err(),
            Error::MalformedFrame
        );
    }

    #[test]
    fn empty_data_frame_is_valid() {
        let frame = encode(0xac, &[]).unwrap();
        let decoded = J1708Frame::from_bytes(&frame.to_bytes()).unwrap();
        assert_eq!(decoded.data, Vec::<u8>::new());
    }
}
