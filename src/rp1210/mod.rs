//! [`Transport`] implementation backed by a vendor RP1210 adapter library.
//!
//! RP1210 is the TMC standard for PC-to-vehicle adapters: every vendor ships a shared
//! library exporting the same C entry points, and a client connects with a device id and a
//! protocol connection string such as "J1939:Baud=250" or "J1708:Baud=9600". The wire
//! format of [`RawFrame`] depends on that protocol, so the adapter translates between the
//! vendor message layout and the crate's CAN or J1708 byte conventions.

pub mod api;
pub mod error;

use std::collections::VecDeque;

use tracing::{info, warn};

use api::Rp1210Api;
use error::Error;

use crate::frame::{RawFrame, TransportTag};
use crate::j1939::{decode_id, encode_id, Destination, J1939Header, ADDRESS_GLOBAL};
use crate::transport::{AsyncTransport, FrameFilter, ReceiveError, SendError, Transport};

const CMD_SET_ALL_FILTERS_TO_PASS: i16 = 3;
const CMD_SET_MESSAGE_FILTERING_FOR_J1708: i16 = 7;
const CMD_ECHO_TRANSMITTED_MESSAGES: i16 = 16;

const ERR_TX_QUEUE_FULL: i16 = 138;
const ERR_HARDWARE_NOT_RESPONDING: i16 = 143;
const ERR_DLL_NOT_INITIALIZED: i16 = 128;
const ERR_ADDRESS_LOST: i16 = 147;

/// Default priority for transmitted J1708 frames, mid-range per J1708 table 1.
const J1708_TX_PRIORITY: u8 = 5;

/// Protocol family of the connection string, decides the message layout.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ProtocolKind {
    J1939,
    J1708,
}

/// Adapter for one RP1210 client connection.
pub struct Rp1210 {
    api: Rp1210Api,
    client_id: i16,
    kind: ProtocolKind,
    /// Filters the vendor API cannot express are applied here instead.
    software_filter: FrameFilter,
}

impl Rp1210 {
    pub fn new(library_path: &str, device_id: i16, connection_type: &str) -> crate::Result<Self> {
        let kind = if connection_type.starts_with("J1708") || connection_type.starts_with("J1587")
        {
            ProtocolKind::J1708
        } else if connection_type.starts_with("J1939") || connection_type.starts_with("CAN") {
            ProtocolKind::J1939
        } else {
            return Err(crate::Error::TransportUnavailable(format!(
                "unsupported RP1210 connection type {}",
                connection_type
            )));
        };

        let api = Rp1210Api::load(library_path)?;
        match api.read_version() {
            Ok(version) => info!("RP1210 library {}: {}", library_path, version),
            Err(e) => warn!("RP1210_ReadVersion failed: {}", e),
        }

        let client_id = api
            .client_connect(device_id, connection_type)
            .map_err(|e| {
                crate::Error::TransportUnavailable(format!(
                    "RP1210 connect to device {} failed: {}",
                    device_id, e
                ))
            })?;

        // Echoed transmissions become readback frames. Not every vendor supports the
        // command, in which case sends simply produce no readback.
        if let Err(e) = api.send_command(CMD_ECHO_TRANSMITTED_MESSAGES, client_id, &[1]) {
            warn!("RP1210 echo mode not enabled: {}", e);
        }

        info!(
            "connected RP1210 client {} on {} ({})",
            client_id, library_path, connection_type
        );

        Ok(Self {
            api,
            client_id,
            kind,
            software_filter: FrameFilter::All,
        })
    }

    pub fn new_async(
        library_path: &str,
        device_id: i16,
        connection_type: &str,
    ) -> crate::Result<AsyncTransport> {
        AsyncTransport::new(
            Self::new(library_path, device_id, connection_type)?,
            FrameFilter::All,
        )
    }
}

/// Vendor J1939 read layout: 4-byte timestamp, echo flag, 3-byte little-endian PGN,
/// priority, source address, destination address, then the payload.
fn j1939_read_to_raw(message: &[u8]) -> Result<RawFrame, Error> {
    if message.len() < 11 {
        return Err(Error::ShortMessage(message.len()));
    }

    let echo = message[4] != 0;
    let pgn = u32::from_le_bytes([message[5], message[6], message[7], 0]);
    let priority = message[8] & 0x07;
    let sa = message[9];
    let da = message[10];

    let destination = if (pgn >> 8) & 0xff >= 240 || da == ADDRESS_GLOBAL {
        Destination::Broadcast
    } else {
        Destination::Address(da)
    };
    let header = J1939Header::new(priority, pgn, sa, destination);

    let mut bytes = encode_id(&header).to_be_bytes().to_vec();
    bytes.extend_from_slice(&message[11..]);

    let mut raw = RawFrame::new(TransportTag::Rp1210, &bytes);
    raw.loopback = echo;
    Ok(raw)
}

/// Vendor J1939 send layout: 3-byte little-endian PGN, priority, source address,
/// destination address, then the payload.
fn raw_to_j1939_send(frame: &RawFrame) -> Result<Vec<u8>, Error> {
    if frame.bytes.len() < 4 {
        return Err(Error::ShortMessage(frame.bytes.len()));
    }
    let id = u32::from_be_bytes([frame.bytes[0], frame.bytes[1], frame.bytes[2], frame.bytes[3]]);
    let header = decode_id(id);

    let [p0, p1, p2, _] = header.pgn.to_le_bytes();
    let da = match header.destination {
        Destination::Address(addr) => addr,
        Destination::Broadcast => ADDRESS_GLOBAL,
    };

    let mut message = vec![p0, p1, p2, header.priority, header.sa, da];
    message.extend_from_slice(&frame.bytes[4..]);
    Ok(message)
}

/// Vendor J1708 read layout: 4-byte timestamp, echo flag, then MID and data without the
/// checksum, which the adapter verifies and strips. The crate convention carries the full
/// frame, so the checksum is recomputed here.
fn j1708_read_to_raw(message: &[u8]) -> Result<RawFrame, Error> {
    if message.len() < 6 {
        return Err(Error::ShortMessage(message.len()));
    }

    let echo = message[4] != 0;
    let mut bytes = message[5..].to_vec();
    bytes.push(crate::j1587::checksum(&bytes));

    let mut raw = RawFrame::new(TransportTag::Rp1210, &bytes);
    raw.loopback = echo;
    Ok(raw)
}

/// Vendor J1708 send layout: a priority byte, then MID and data without the checksum.
fn raw_to_j1708_send(frame: &RawFrame) -> Result<Vec<u8>, Error> {
    if frame.bytes.len() < 2 {
        return Err(Error::ShortMessage(frame.bytes.len()));
    }

    let mut message = vec![J1708_TX_PRIORITY];
    // Drop the trailing checksum, the adapter appends its own
    message.extend_from_slice(&frame.bytes[..frame.bytes.len() - 1]);
    Ok(message)
}

impl Transport for Rp1210 {
    fn send(&mut self, frames: &mut VecDeque<RawFrame>) -> Result<(), SendError> {
        while let Some(frame) = frames.pop_front() {
            let message = match self.kind {
                ProtocolKind::J1939 => raw_to_j1939_send(&frame),
                ProtocolKind::J1708 => raw_to_j1708_send(&frame),
            }
            .map_err(|e| SendError::Io(e.to_string()))?;

            match self.api.send_message(self.client_id, &message) {
                Ok(()) => {}
                Err(Error::Api(ERR_TX_QUEUE_FULL)) => {
                    frames.push_front(frame);
                    break;
                }
                Err(e) => {
                    frames.push_front(frame);
                    return Err(SendError::Io(e.to_string()));
                }
            }
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<RawFrame>, ReceiveError> {
        let mut frames = vec![];
        loop {
            let message = match self.api.read_message(self.client_id) {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(Error::Api(
                    ERR_DLL_NOT_INITIALIZED | ERR_HARDWARE_NOT_RESPONDING | ERR_ADDRESS_LOST,
                )) => return Err(ReceiveError::Disconnected),
                Err(e) => return Err(ReceiveError::Io(e.to_string())),
            };

            let raw = match self.kind {
                ProtocolKind::J1939 => j1939_read_to_raw(&message),
                ProtocolKind::J1708 => j1708_read_to_raw(&message),
            };
            match raw {
                Ok(frame) => {
                    if self.software_filter.matches(&frame) {
                        frames.push(frame);
                    }
                }
                Err(e) => warn!("discarding unparseable RP1210 message: {}", e),
            }
        }
        Ok(frames)
    }

    fn set_filter(&mut self, filter: &FrameFilter) -> crate::Result<()> {
        match filter {
            FrameFilter::All => {
                self.api
                    .send_command(CMD_SET_ALL_FILTERS_TO_PASS, self.client_id, &[])
                    .map_err(crate::Error::from)?;
                self.software_filter = FrameFilter::All;
            }
            FrameFilter::Mids(mids) => {
                let list: Vec<u8> = mids.iter().copied().collect();
                self.api
                    .send_command(CMD_SET_MESSAGE_FILTERING_FOR_J1708, self.client_id, &list)
                    .map_err(crate::Error::from)?;
                self.software_filter = FrameFilter::All;
            }
            // The vendor PGN filter command cannot express id/mask pairs, filter in software
            FrameFilter::IdMask(_) => {
                self.software_filter = filter.clone();
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Err(e) = self.api.client_disconnect(self.client_id) {
            warn!("RP1210 disconnect failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn j1939_read_translation() {
        // timestamp, echo, PGN 0xF004 LE, priority 6, SA 0x01, DA 0xFF, 2 data bytes
        let message = [0, 0, 0, 0, 0, 0x04, 0xF0, 0x00, 6, 0x01, 0xFF, 0xAA, 0xBB];
        let raw = j1939_read_to_raw(&message).unwrap();
        assert!(!raw.loopback);
        assert_eq!(raw.bytes, vec![0x18, 0xF0, 0x04, 0x01, 0xAA, 0xBB]);
    }

    #[test]
    fn j1939_send_translation() {
        let raw = RawFrame::outbound(&[0x18, 0xF0, 0x04, 0x01, 0xAA, 0xBB]);
        let message = raw_to_j1939_send(&raw).unwrap();
        assert_eq!(message, vec![0x04, 0xF0, 0x00, 6, 0x01, 0xFF, 0xAA, 0xBB]);
    }

    #[test]
    fn j1939_echo_flag_becomes_readback() {
        let message = [0, 0, 0, 0, 1, 0x04, 0xF0, 0x00, 6, 0x01, 0xFF];
        assert!(j1939_read_to_raw(&message).unwrap().loopback);
    }

    #[test]
    fn j1708_read_appends_checksum() {
        let message = [0, 0, 0, 0, 0, 128, 1, 2, 3];
        let raw = j1708_read_to_raw(&message).unwrap();
        // 0x7a closes the sum of 128 + 1 + 2 + 3 to zero
        assert_eq!(raw.bytes, vec![128, 1, 2, 3, 0x7a]);
    }

    #[test]
    fn j1708_send_strips_checksum() {
        let raw = RawFrame::outbound(&[128, 1, 2, 3, 0x7a]);
        let message = raw_to_j1708_send(&raw).unwrap();
        assert_eq!(message, vec![J1708_TX_PRIORITY, 128, 1, 2, 3]);
    }

    #[test]
    fn short_messages_are_rejected() {
        assert!(matches!(
            j1939_read_to_raw(&[0, 0, 0, 0]),
            Err(Error::ShortMessage(4))
        ));
        assert!(matches!(
            j1708_read_to_raw(&[0, 0, 0, 0, 0]),
            Err(Error::ShortMessage(5))
        ));
    }
}
