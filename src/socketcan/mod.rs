//! [`Transport`] implementation backed by a Linux SocketCAN interface.
//!
//! Frames use the CAN byte convention documented on [`RawFrame`]: 4-byte big-endian 29-bit
//! identifier followed by the payload. The socket runs nonblocking with own-message
//! reception on, so transmitted frames come back flagged as readback and the scheduler can
//! confirm delivery.

use std::collections::VecDeque;

use tracing::info;

use crate::frame::{RawFrame, TransportTag};
use crate::transport::{AsyncTransport, FrameFilter, ReceiveError, SendError, Transport};

mod socket;

use socket::CanSocket;

const CAN_ID_MASK: u32 = 0x1FFF_FFFF;

/// Adapter for one SocketCAN interface, e.g. "can0" or "vcan0".
pub struct SocketCan {
    socket: CanSocket,
}

impl SocketCan {
    pub fn new(interface: &str) -> crate::Result<Self> {
        let unavailable =
            |e: std::io::Error| crate::Error::TransportUnavailable(format!("{}: {}", interface, e));

        let socket = CanSocket::open(interface).map_err(unavailable)?;
        socket.set_nonblocking(true).map_err(unavailable)?;
        socket.set_loopback(true).map_err(unavailable)?;
        socket.set_recv_own_msgs(true).map_err(unavailable)?;

        info!("connected to SocketCAN interface {}", interface);
        Ok(Self { socket })
    }

    pub fn new_async(interface: &str) -> crate::Result<AsyncTransport> {
        AsyncTransport::new(Self::new(interface)?, FrameFilter::All)
    }
}

fn pack(frame: &RawFrame) -> Result<libc::can_frame, SendError> {
    if frame.bytes.len() < 4 || frame.bytes.len() > 12 {
        return Err(SendError::Io(format!(
            "not a CAN frame: {} bytes",
            frame.bytes.len()
        )));
    }

    let id = u32::from_be_bytes([frame.bytes[0], frame.bytes[1], frame.bytes[2], frame.bytes[3]]);
    let data = &frame.bytes[4..];

    let mut out: libc::can_frame = unsafe { std::mem::zeroed() };
    out.can_id = (id & CAN_ID_MASK) | libc::CAN_EFF_FLAG;
    out.can_dlc = data.len() as u8;
    out.data[..data.len()].copy_from_slice(data);
    Ok(out)
}

/// Kernel filter pairs for a [`FrameFilter`], `None` meaning pass everything. MID filters
/// describe J1708 traffic and cannot be expressed on a CAN interface.
fn kernel_filters(filter: &FrameFilter) -> crate::Result<Option<&[(u32, u32)]>> {
    match filter {
        FrameFilter::All => Ok(None),
        FrameFilter::IdMask(pairs) => Ok(Some(pairs)),
        FrameFilter::Mids(_) => Err(crate::Error::FilterRejected(
            "MID filters do not apply to a CAN interface".into(),
        )),
    }
}

fn unpack(frame: &libc::can_frame, loopback: bool) -> RawFrame {
    let len = (frame.can_dlc as usize).min(8);
    let mut bytes = (frame.can_id & CAN_ID_MASK).to_be_bytes().to_vec();
    bytes.extend_from_slice(&frame.data[..len]);

    let mut raw = RawFrame::new(TransportTag::SocketCan, &bytes);
    raw.loopback = loopback;
    raw
}

impl Transport for SocketCan {
    fn send(&mut self, frames: &mut VecDeque<RawFrame>) -> Result<(), SendError> {
        while let Some(frame) = frames.pop_front() {
            let to_send = pack(&frame)?;

            if let Err(e) = self.socket.write_frame(&to_send) {
                if e.kind() == std::io::ErrorKind::WouldBlock {
                    // TX queue full, push back for the next iteration
                    frames.push_front(frame);
                    break;
                }
                frames.push_front(frame);
                return Err(SendError::Io(e.to_string()));
            }
        }

        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<RawFrame>, ReceiveError> {
        let mut frames = vec![];
        loop {
            match self.socket.read_frame() {
                Ok((frame, loopback)) => frames.push(unpack(&frame, loopback)),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(ReceiveError::Io(e.to_string())),
            }
        }

        Ok(frames)
    }

    fn set_filter(&mut self, filter: &FrameFilter) -> crate::Result<()> {
        match kernel_filters(filter)? {
            None => self.socket.clear_id_filters(),
            Some(pairs) => self.socket.set_id_filters(pairs),
        }
        .map_err(|e| crate::Error::TransportUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let raw = RawFrame::outbound(&[0x18, 0xF0, 0x04, 0x01, 1, 2, 3, 4, 5, 6, 7, 8]);
        let packed = pack(&raw).unwrap();
        assert_eq!(packed.can_id, 0x18F0_0401 | libc::CAN_EFF_FLAG);
        assert_eq!(packed.can_dlc, 8);

        let unpacked = unpack(&packed, false);
        assert_eq!(unpacked.bytes, raw.bytes);
    }

    #[test]
    fn pack_rejects_short_frames() {
        let raw = RawFrame::outbound(&[0x18, 0xF0]);
        assert!(matches!(pack(&raw), Err(SendError::Io(_))));
    }

    #[test]
    fn mid_filter_is_rejected() {
        let filter = FrameFilter::Mids(std::collections::BTreeSet::from([0x80]));
        assert!(matches!(
            kernel_filters(&filter),
            Err(crate::Error::FilterRejected(_))
        ));
        assert!(kernel_filters(&FrameFilter::All).unwrap().is_none());
    }

    #[test]
    fn unpack_marks_readback() {
        let mut frame: libc::can_frame = unsafe { std::mem::zeroed() };
        frame.can_id = 0x18F0_0401 | libc::CAN_EFF_FLAG;
        frame.can_dlc = 2;
        frame.data[..2].copy_from_slice(&[0xaa, 0xbb]);

        let raw = unpack(&frame, true);
        assert!(raw.loopback);
        assert_eq!(raw.bytes, vec![0x18, 0xF0, 0x04, 0x01, 0xaa, 0xbb]);
    }
}
