//! Transport abstraction over the supported bus interfaces.
//!
//! A [`Transport`] is a poll-style driver for one physical or virtual interface. It moves
//! [`RawFrame`]s in both directions and knows nothing about J1587 or J1939 semantics beyond
//! the byte conventions documented on [`RawFrame`]. Most code does not use a `Transport`
//! directly but wraps it in an [`AsyncTransport`], which runs the driver on a background
//! thread and exposes async send and a broadcast receive stream.

pub mod async_transport;
pub mod loopback;

pub use async_transport::AsyncTransport;

use std::collections::{BTreeSet, VecDeque};

use thiserror::Error;

use crate::frame::RawFrame;

/// Error while handing frames to the bus.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SendError {
    /// The frame repeatedly lost arbitration or collided. Carries the identifier (CAN id,
    /// or the MID for J1708 transports) of the frame that was given up on.
    #[error("Arbitration Failure on 0x{0:x}")]
    BusArbitrationFailure(u32),
    #[error("Send Io Error: {0}")]
    Io(String),
}

/// Error while reading frames from the bus.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReceiveError {
    #[error("Receive Io Error: {0}")]
    Io(String),
    #[error("Transport Closed")]
    Disconnected,
}

/// Receive filter applied by a transport. Where the interface supports it (SocketCAN,
/// RP1210) the filter is pushed down to the driver, otherwise it is applied in software
/// before frames leave the transport. Readback (`loopback`) frames always pass.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameFilter {
    #[default]
    All,
    /// Accept J1708 frames whose MID is in the set.
    Mids(BTreeSet<u8>),
    /// Accept CAN frames where `id & mask == filter & mask` for any pair.
    IdMask(Vec<(u32, u32)>),
}

impl FrameFilter {
    pub fn matches(&self, frame: &RawFrame) -> bool {
        if frame.loopback {
            return true;
        }
        match self {
            FrameFilter::All => true,
            FrameFilter::Mids(mids) => match frame.bytes.first() {
                Some(mid) => mids.contains(mid),
                None => false,
            },
            FrameFilter::IdMask(pairs) => {
                if frame.bytes.len() < 4 {
                    return false;
                }
                let id = u32::from_be_bytes([
                    frame.bytes[0],
                    frame.bytes[1],
                    frame.bytes[2],
                    frame.bytes[3],
                ]);
                pairs.iter().any(|(filter, mask)| id & mask == filter & mask)
            }
        }
    }
}

/// Poll-style driver for one bus interface.
///
/// `send` drains frames from the front of the queue as the interface accepts them; frames
/// still queued after an error have not been transmitted. `recv` never blocks: it returns
/// the frames that have arrived since the last call, or an empty vec.
pub trait Transport: Send {
    fn send(&mut self, frames: &mut VecDeque<RawFrame>) -> Result<(), SendError>;
    fn recv(&mut self) -> Result<Vec<RawFrame>, ReceiveError>;
    fn set_filter(&mut self, filter: &FrameFilter) -> crate::Result<()>;
    fn close(&mut self) {}
}

/// Describes how to open a transport, suitable for storing in configuration files.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportConfig {
    SocketCan {
        interface: String,
    },
    Rp1210 {
        /// Shared library name as listed in the vendor INI, e.g. "PEAKRP32".
        library_path: String,
        device_id: i16,
        /// Vendor connection string, e.g. "J1939:Baud=250" or "J1708:Baud=9600".
        connection_type: String,
    },
    TruckDuck {
        port: String,
        baud_rate: u32,
    },
}

/// Open the transport a [`TransportConfig`] describes and wrap it for async use.
///
/// Configurations whose driver is not compiled into this build fail with
/// [`Error::TransportUnavailable`](crate::Error::TransportUnavailable).
pub fn open(config: &TransportConfig) -> crate::Result<AsyncTransport> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportConfig::SocketCan { interface } => {
            let socket = crate::socketcan::SocketCan::new(interface)?;
            AsyncTransport::new(socket, FrameFilter::All)
        }
        #[cfg(feature = "rp1210")]
        TransportConfig::Rp1210 {
            library_path,
            device_id,
            connection_type,
        } => {
            let adapter = crate::rp1210::Rp1210::new(library_path, *device_id, connection_type)?;
            AsyncTransport::new(adapter, FrameFilter::All)
        }
        #[cfg(feature = "truckduck")]
        TransportConfig::TruckDuck { port, baud_rate } => {
            let bridge = crate::truckduck::TruckDuck::new(port, *baud_rate)?;
            AsyncTransport::new(bridge, FrameFilter::All)
        }
        #[allow(unreachable_patterns)]
        other => Err(crate::Error::TransportUnavailable(format!(
            "no driver compiled in for {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::TransportTag;

    #[test]
    fn mid_filter_checks_first_byte() {
        let filter = FrameFilter::Mids(BTreeSet::from([0x80, 0xac]));
        assert!(filter.matches(&RawFrame::new(TransportTag::Local, &[0x80, 1, 2])));
        assert!(!filter.matches(&RawFrame::new(TransportTag::Local, &[0x81, 1, 2])));
        assert!(!filter.matches(&RawFrame::new(TransportTag::Local, &[])));
    }

    #[test]
    fn id_mask_filter_matches_any_pair() {
        // Match any frame whose PF byte is 0xEC, regardless of the rest
        let filter = FrameFilter::IdMask(vec![(0x00EC_0000, 0x00FF_0000)]);
        assert!(filter.matches(&RawFrame::new(
            TransportTag::Local,
            &[0x1C, 0xEC, 0xFF, 0xF9, 1, 2]
        )));
        assert!(!filter.matches(&RawFrame::new(
            TransportTag::Local,
            &[0x1C, 0xEB, 0xFF, 0xF9, 1, 2]
        )));
    }

    #[test]
    fn loopback_frames_bypass_filters() {
        let filter = FrameFilter::Mids(BTreeSet::from([0x80]));
        let mut frame = RawFrame::new(TransportTag::Local, &[0x99]);
        frame.loopback = true;
        assert!(filter.matches(&frame));
    }
}
