//! J1587 connection mode transport over J1708.
//!
//! Messages longer than one frame are moved with a connection management handshake on
//! PID 197 (RTS/CTS/EOM/RSD/ABORT) and data transfer frames on PID 198, each carrying a
//! 1-based segment number and up to 15 data bytes. The receive side answers an RTS with a
//! CTS for all segments, buffers segments by number, re-requests missing segments when the
//! bus goes quiet, and acknowledges completion with an EOM.
//! ## Example:
//! ```rust
//! use futures::stream::StreamExt;
//! async fn transport_example(bus: &truckbus::transport::AsyncTransport) {
//!     let j1587 = truckbus::j1587::J1587Transport::new(bus, Default::default());
//!
//!     let mut stream = j1587.recv(); // create receiver before sending
//!     j1587.transport_send(0x80, &[0xac; 40]).await.unwrap();
//!     let response = stream.next().await;
//! }
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_stream::stream;
use futures_core::stream::Stream;
use strum_macros::FromRepr;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::error::Error;
use crate::frame::RawFrame;
use crate::j1587::{J1587Message, J1708Frame};
use crate::transport::AsyncTransport;

/// PID carrying connection management frames.
pub const MGMT_PID: u8 = 197;
/// PID carrying connection mode data transfer frames.
pub const DATA_PID: u8 = 198;
/// Data bytes per transfer segment.
pub const SEGMENT_LEN: usize = 15;

/// Connection management command codes on PID 197.
#[derive(FromRepr, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionCommand {
    RequestToSend = 1,
    ClearToSend = 2,
    EndOfMessage = 3,
    RequestSegmentData = 4,
    Abort = 255,
}

/// A parsed transport layer frame, either connection management or data transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportFrame {
    Rts {
        src: u8,
        dst: u8,
        segments: u8,
        length: u16,
    },
    Cts {
        src: u8,
        dst: u8,
        count: u8,
        next: u8,
    },
    Eom {
        src: u8,
        dst: u8,
    },
    Rsd {
        src: u8,
        dst: u8,
        pid: u16,
    },
    Abort {
        src: u8,
        dst: u8,
    },
    Data {
        src: u8,
        dst: u8,
        segment: u8,
        data: Vec<u8>,
    },
}

impl TransportFrame {
    /// Parse a J1708 frame as a transport frame. Returns `None` for ordinary frames.
    pub fn parse(frame: &J1708Frame) -> Option<crate::Result<TransportFrame>> {
        match frame.data.first() {
            Some(&MGMT_PID) => Some(Self::parse_mgmt(frame)),
            Some(&DATA_PID) => Some(Self::parse_data(frame)),
            _ => None,
        }
    }

    fn parse_mgmt(frame: &J1708Frame) -> crate::Result<TransportFrame> {
        // Layout: [197, byte count, dst, command, ...]
        let data = &frame.data;
        if data.len() < 4 {
            return Err(Error::MalformedFrame);
        }
        let src = frame.mid;
        let dst = data[2];

        let command = ConnectionCommand::from_repr(data[3])
            .ok_or(crate::j1587::error::Error::UnknownConnectionCommand)?;

        let frame = match command {
            ConnectionCommand::RequestToSend => {
                if data.len() < 7 {
                    return Err(Error::MalformedFrame);
                }
                TransportFrame::Rts {
                    src,
                    dst,
                    segments: data[4],
                    length: u16::from_le_bytes([data[5], data[6]]),
                }
            }
            ConnectionCommand::ClearToSend => {
                if data.len() < 6 {
                    return Err(Error::MalformedFrame);
                }
                TransportFrame::Cts {
                    src,
                    dst,
                    count: data[4],
                    next: data[5],
                }
            }
            ConnectionCommand::EndOfMessage => TransportFrame::Eom { src, dst },
            ConnectionCommand::RequestSegmentData => {
                if data.len() < 6 {
                    return Err(Error::MalformedFrame);
                }
                TransportFrame::Rsd {
                    src,
                    dst,
                    pid: u16::from_le_bytes([data[4], data[5]]),
                }
            }
            ConnectionCommand::Abort => TransportFrame::Abort { src, dst },
        };

        Ok(frame)
    }

    fn parse_data(frame: &J1708Frame) -> crate::Result<TransportFrame> {
        // Layout: [198, byte count, dst, segment number, segment data...]
        let data = &frame.data;
        if data.len() < 4 {
            return Err(Error::MalformedFrame);
        }

        Ok(TransportFrame::Data {
            src: frame.mid,
            dst: data[2],
            segment: data[3],
            data: data[4..].to_vec(),
        })
    }

    /// Serialize into a J1708 frame. The MID is the transport frame's source address.
    pub fn to_frame(&self) -> crate::Result<J1708Frame> {
        match self {
            TransportFrame::Rts {
                src,
                dst,
                segments,
                length,
            } => {
                let [lo, hi] = length.to_le_bytes();
                J1708Frame::new(
                    *src,
                    &[
                        MGMT_PID,
                        5,
                        *dst,
                        ConnectionCommand::RequestToSend as u8,
                        *segments,
                        lo,
                        hi,
                    ],
                )
            }
            TransportFrame::Cts {
                src,
                dst,
                count,
                next,
            } => J1708Frame::new(
                *src,
                &[
                    MGMT_PID,
                    4,
                    *dst,
                    ConnectionCommand::ClearToSend as u8,
                    *count,
                    *next,
                ],
            ),
            TransportFrame::Eom { src, dst } => J1708Frame::new(
                *src,
                &[MGMT_PID, 2, *dst, ConnectionCommand::EndOfMessage as u8],
            ),
            TransportFrame::Rsd { src, dst, pid } => {
                let [lo, hi] = pid.to_le_bytes();
                J1708Frame::new(
                    *src,
                    &[
                        MGMT_PID,
                        4,
                        *dst,
                        ConnectionCommand::RequestSegmentData as u8,
                        lo,
                        hi,
                    ],
                )
            }
            TransportFrame::Abort { src, dst } => {
                J1708Frame::new(*src, &[MGMT_PID, 2, *dst, ConnectionCommand::Abort as u8])
            }
            TransportFrame::Data {
                src,
                dst,
                segment,
                data,
            } => {
                let mut buf = vec![DATA_PID, 2 + data.len() as u8, *dst, *segment];
                buf.extend_from_slice(data);
                J1708Frame::new(*src, &buf)
            }
        }
    }

    pub fn dst(&self) -> u8 {
        match self {
            TransportFrame::Rts { dst, .. }
            | TransportFrame::Cts { dst, .. }
            | TransportFrame::Eom { dst, .. }
            | TransportFrame::Rsd { dst, .. }
            | TransportFrame::Abort { dst, .. }
            | TransportFrame::Data { dst, .. } => *dst,
        }
    }
}

/// State of one inbound connection mode transfer.
struct ReceiveSession {
    src: u8,
    length: u16,
    segments: Vec<Option<Vec<u8>>>,
    last_activity: Instant,
}

impl ReceiveSession {
    fn new(src: u8, segments: u8, length: u16) -> Self {
        Self {
            src,
            length,
            segments: vec![None; segments as usize],
            last_activity: Instant::now(),
        }
    }

    /// Store a segment by its 1-based number. Returns the full payload once every segment
    /// is present.
    fn handle_data(&mut self, segment: u8, data: Vec<u8>) -> Option<Vec<u8>> {
        self.last_activity = Instant::now();

        let idx = segment as usize;
        if idx == 0 || idx > self.segments.len() {
            warn!("segment {} out of range for session from {}", segment, self.src);
            return None;
        }
        self.segments[idx - 1] = Some(data);

        if self.segments.iter().any(|s| s.is_none()) {
            return None;
        }

        let mut payload = Vec::with_capacity(self.length as usize);
        for segment in self.segments.iter().flatten() {
            payload.extend_from_slice(segment);
        }
        Some(payload)
    }

    /// 1-based number of the first segment not yet received.
    fn first_missing(&self) -> Option<u8> {
        self.segments
            .iter()
            .position(|s| s.is_none())
            .map(|i| i as u8 + 1)
    }
}

/// Configuration for a [`J1587Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct J1587TransportConfig {
    /// Our MID on the bus. 0xac is the customary off-board tool address.
    pub mid: u8,
    /// Quiet time before a receive session re-requests missing segments.
    pub segment_timeout: Duration,
    /// Total lifetime of a receive session before it is aborted.
    pub receive_timeout: Duration,
    /// Total lifetime of a send session before it fails with a timeout.
    pub send_timeout: Duration,
    /// Per-attempt response window for [`J1587Transport::request_pid`].
    pub request_timeout: Duration,
    pub request_retries: u32,
}

impl Default for J1587TransportConfig {
    fn default() -> Self {
        Self {
            mid: 0xac,
            segment_timeout: Duration::from_secs(2),
            receive_timeout: Duration::from_secs(60),
            send_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_millis(100),
            request_retries: 3,
        }
    }
}

/// Wraps a transport to provide J1587 messaging including the connection mode transport
/// layer. Reassembled transport messages surface through [`recv`](Self::recv) exactly like
/// single frames.
pub struct J1587Transport<'a> {
    bus: &'a AsyncTransport,
    config: J1587TransportConfig,
}

impl<'a> J1587Transport<'a> {
    pub fn new(bus: &'a AsyncTransport, config: J1587TransportConfig) -> Self {
        Self { bus, config }
    }

    /// Send a single J1708 frame as-is.
    pub async fn send(&self, frame: &J1708Frame) -> crate::Result<()> {
        debug!("TX {:?}", frame);
        self.bus.send(&RawFrame::outbound(&frame.to_bytes())).await
    }

    async fn send_transport_frame(&self, tf: &TransportFrame) -> crate::Result<()> {
        let frame = tf.to_frame()?;
        debug!("TX {:?}", tf);
        self.bus.send(&RawFrame::outbound(&frame.to_bytes())).await
    }

    /// Stream of decoded J1587 messages. Single frames are yielded directly; connection
    /// mode transfers addressed to our MID are reassembled and yielded once complete.
    /// Transport traffic between other nodes passes through undecoded, like any other frame.
    pub fn recv(&self) -> impl Stream<Item = crate::Result<J1587Message>> + '_ {
        // Subscribe here, not inside the generator: a stream body only runs once polled,
        // and frames broadcast before the first poll must not be lost
        let frames = self
            .bus
            .recv_filter(|frame| !frame.loopback)
            .timeout(self.config.segment_timeout);

        Box::pin(stream! {
            let mut sessions: HashMap<u8, ReceiveSession> = HashMap::new();
            tokio::pin!(frames);

            loop {
                let raw = match frames.next().await {
                    None => break,
                    Some(Err(_)) => {
                        // Bus went quiet: re-request stalled sessions, expire dead ones
                        let mut expired = Vec::new();
                        for (src, session) in sessions.iter() {
                            if session.last_activity.elapsed() > self.config.receive_timeout {
                                expired.push(*src);
                            } else if let Some(next) = session.first_missing() {
                                let cts = TransportFrame::Cts {
                                    src: self.config.mid,
                                    dst: *src,
                                    count: 1,
                                    next,
                                };
                                if let Err(e) = self.send_transport_frame(&cts).await {
                                    yield Err(e);
                                }
                            }
                        }
                        for src in expired {
                            sessions.remove(&src);
                            let abort = TransportFrame::Abort { src: self.config.mid, dst: src };
                            let _ = self.send_transport_frame(&abort).await;
                            yield Err(Error::Timeout);
                        }
                        continue;
                    }
                    Some(Ok(raw)) => raw,
                };

                let frame = match J1708Frame::from_bytes(&raw.bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        yield Err(e);
                        continue;
                    }
                };

                let tf = match TransportFrame::parse(&frame) {
                    None => {
                        yield Ok(J1587Message::from_frame(frame, raw.timestamp));
                        continue;
                    }
                    Some(Err(e)) => {
                        yield Err(e);
                        continue;
                    }
                    Some(Ok(tf)) => tf,
                };

                if tf.dst() != self.config.mid {
                    // Transport traffic for another node, pass it through
                    yield Ok(J1587Message::from_frame(frame, raw.timestamp));
                    continue;
                }

                match tf {
                    TransportFrame::Rts { src, segments, length, .. } => {
                        debug!("RX RTS from {}: {} segments, {} bytes", src, segments, length);
                        if segments == 0 {
                            yield Err(Error::MalformedFrame);
                            continue;
                        }
                        let session = ReceiveSession::new(src, segments, length);
                        let cts = TransportFrame::Cts {
                            src: self.config.mid,
                            dst: src,
                            count: segments,
                            next: 1,
                        };
                        if let Err(e) = self.send_transport_frame(&cts).await {
                            yield Err(e);
                            continue;
                        }
                        // A fresh RTS from the same source replaces any stale session
                        sessions.insert(src, session);
                    }
                    TransportFrame::Data { src, segment, data, .. } => {
                        match sessions.get_mut(&src) {
                            Some(session) => {
                                if let Some(payload) = session.handle_data(segment, data) {
                                    sessions.remove(&src);
                                    let eom = TransportFrame::Eom { src: self.config.mid, dst: src };
                                    if let Err(e) = self.send_transport_frame(&eom).await {
                                        yield Err(e);
                                        continue;
                                    }
                                    debug!("RX transport complete from {}: {} bytes", src, payload.len());
                                    yield Ok(J1587Message::from_parts(src, payload, raw.timestamp));
                                }
                            }
                            None => {
                                // Data with no open session, tell the sender to stop
                                let abort = TransportFrame::Abort { src: self.config.mid, dst: src };
                                let _ = self.send_transport_frame(&abort).await;
                            }
                        }
                    }
                    TransportFrame::Abort { src, .. } => {
                        if sessions.remove(&src).is_some() {
                            yield Err(crate::j1587::error::Error::Aborted.into());
                        }
                    }
                    // CTS/EOM/RSD addressed to us belong to an active send session, which
                    // listens on its own filtered stream
                    TransportFrame::Cts { .. }
                    | TransportFrame::Eom { .. }
                    | TransportFrame::Rsd { .. } => {}
                }
            }
        })
    }

    /// Send a message of any length to `dst` using the connection mode transport. Fragments
    /// into RTS plus data segments, honors the receiver's CTS windows, and completes on EOM.
    pub async fn transport_send(&self, dst: u8, data: &[u8]) -> crate::Result<()> {
        let src = self.config.mid;
        let segments: Vec<&[u8]> = data.chunks(SEGMENT_LEN).collect();
        if segments.len() > u8::MAX as usize {
            return Err(Error::PayloadTooLarge);
        }

        // Subscribe to management frames from the peer before announcing
        let stream = self
            .bus
            .recv_filter(move |f| {
                !f.loopback
                    && f.bytes.len() > 4
                    && f.bytes[0] == dst
                    && f.bytes[1] == MGMT_PID
                    && f.bytes[3] == src
            })
            .timeout(self.config.segment_timeout);
        tokio::pin!(stream);

        let rts = TransportFrame::Rts {
            src,
            dst,
            segments: segments.len() as u8,
            length: data.len() as u16,
        };
        self.send_transport_frame(&rts).await?;

        let deadline = Instant::now() + self.config.send_timeout;
        loop {
            if Instant::now() > deadline {
                return Err(Error::Timeout);
            }

            let raw = match stream.next().await {
                None => return Err(Error::Disconnected),
                Some(Err(_)) => continue, // quiet interval, keep waiting until the deadline
                Some(Ok(raw)) => raw,
            };

            let frame = J1708Frame::from_bytes(&raw.bytes)?;
            let tf = match TransportFrame::parse(&frame) {
                Some(Ok(tf)) => tf,
                _ => continue,
            };

            match tf {
                TransportFrame::Cts { count, next, .. } => {
                    debug!("RX CTS: {} segments from {}", count, next);
                    if next == 0 {
                        return Err(crate::j1587::error::Error::UnexpectedFrame.into());
                    }
                    let base = next as usize - 1;
                    let end = (base + count as usize).min(segments.len());
                    for (i, chunk) in segments[base..end].iter().enumerate() {
                        let data_frame = TransportFrame::Data {
                            src,
                            dst,
                            segment: (base + i) as u8 + 1,
                            data: chunk.to_vec(),
                        };
                        self.send_transport_frame(&data_frame).await?;
                    }
                }
                TransportFrame::Eom { .. } => {
                    debug!("RX EOM, transport send to {} complete", dst);
                    return Ok(());
                }
                TransportFrame::Abort { .. } => {
                    return Err(crate::j1587::error::Error::Aborted.into());
                }
                _ => continue,
            }
        }
    }

    /// Request a parameter from a specific MID and wait for the matching response.
    pub async fn request_pid(&self, mid: u8, pid: u16) -> crate::Result<J1587Message> {
        let request = if pid < 256 {
            J1708Frame::new(self.config.mid, &[0, pid as u8])?
        } else {
            J1708Frame::new(self.config.mid, &[0, 255, (pid % 256) as u8])?
        };

        for _ in 0..self.config.request_retries {
            let stream = self
                .bus
                .recv_filter(move |f| !f.loopback && f.bytes.first() == Some(&mid))
                .timeout(self.config.request_timeout);
            tokio::pin!(stream);

            self.send(&request).await?;

            while let Some(item) = stream.next().await {
                let raw = match item {
                    Ok(raw) => raw,
                    Err(_) => break, // this attempt timed out
                };
                if let Ok(msg) = crate::j1587::decode(&raw.bytes) {
                    if msg.data.first() == Some(&((pid & 0xff) as u8)) {
                        return Ok(msg);
                    }
                }
            }
        }

        Err(Error::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rts_round_trip() {
        let rts = TransportFrame::Rts {
            src: 0xac,
            dst: 0x80,
            segments: 3,
            length: 40,
        };
        let frame = rts.to_frame().unwrap();
        assert_eq!(TransportFrame::parse(&frame).unwrap().unwrap(), rts);
    }

    #[test]
    fn data_round_trip() {
        let data = TransportFrame::Data {
            src: 0x80,
            dst: 0xac,
            segment: 2,
            data: vec![1, 2, 3, 4, 5],
        };
        let frame = data.to_frame().unwrap();
        assert_eq!(TransportFrame::parse(&frame).unwrap().unwrap(), data);
    }

    #[test]
    fn ordinary_frames_are_not_transport() {
        let frame = J1708Frame::new(0x80, &[84, 0x50]).unwrap();
        assert!(TransportFrame::parse(&frame).is_none());
    }

    #[test]
    fn unknown_command_is_rejected() {
        let frame = J1708Frame::new(0x80, &[MGMT_PID, 2, 0xac, 99]).unwrap();
        let err = TransportFrame::parse(&frame).unwrap().unwrap_err();
        assert_eq!(
            err,
            Error::J1587Error(crate::j1587::error::Error::UnknownConnectionCommand)
        );
    }

    #[test]
    fn receive_session_accepts_out_of_order_segments() {
        let mut session = ReceiveSession::new(0x80, 3, 35);
        assert!(session.handle_data(3, vec![7, 8, 9]).is_none());
        assert!(session.handle_data(1, vec![1, 2, 3]).is_none());
        assert_eq!(session.first_missing(), Some(2));
        let payload = session.handle_data(2, vec![4, 5, 6]).unwrap();
        assert_eq!(payload, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn out_of_range_segment_is_ignored() {
        let mut session = ReceiveSession::new(0x80, 2, 20);
        assert!(session.handle_data(0, vec![1]).is_none());
        assert!(session.handle_data(3, vec![1]).is_none());
        assert_eq!(session.first_missing(), Some(1));
    }
}
