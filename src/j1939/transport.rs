//! J1939 transport protocol (TP.CM/TP.DT), implements SAE J1939-21 multi-packet transfer.
//!
//! Payloads over 8 bytes are announced with a TP.CM frame and moved in TP.DT segments of
//! 7 bytes. Unicast transfers use the RTS/CTS handshake; broadcasts use BAM, which needs no
//! handshake but must pace segments with a minimum gap. The receive side keeps a reassembly
//! table keyed by (source address, PGN): segments may arrive out of order, and an entry
//! that goes quiet past the configured timeout is discarded with a reassembly error.
//! ## Example:
//! ```rust
//! use futures::stream::StreamExt;
//! async fn j1939_example(bus: &truckbus::transport::AsyncTransport) {
//!     let j1939 = truckbus::j1939::J1939Transport::new(bus, Default::default());
//!
//!     let mut stream = j1939.recv();
//!     j1939
//!         .send(6, 0xFEEC, truckbus::j1939::Destination::Broadcast, &[0x55; 17])
//!         .await
//!         .unwrap();
//!     let message = stream.next().await;
//! }
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use async_stream::stream;
use futures_core::stream::Stream;
use strum_macros::FromRepr;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::error::Error;
use crate::frame::RawFrame;
use crate::j1939::error::Error as J1939Error;
use crate::j1939::{
    Destination, J1939Frame, J1939Header, J1939Message, MAX_TP_SIZE, PGN_REQUEST, PGN_TP_CM,
    PGN_TP_DT, TP_SEGMENT_LEN,
};
use crate::transport::AsyncTransport;

/// Priority used for transport protocol frames.
pub const TP_PRIORITY: u8 = 7;

/// TP.CM control byte values.
#[derive(FromRepr, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TpControl {
    Rts = 16,
    Cts = 17,
    EndOfMsgAck = 19,
    Bam = 32,
    Abort = 255,
}

/// A parsed TP.CM payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TpCm {
    Rts {
        size: u16,
        segments: u8,
        max_per_cts: u8,
        pgn: u32,
    },
    Cts {
        count: u8,
        next: u8,
        pgn: u32,
    },
    EndOfMsgAck {
        size: u16,
        segments: u8,
        pgn: u32,
    },
    Bam {
        size: u16,
        segments: u8,
        pgn: u32,
    },
    Abort {
        reason: u8,
        pgn: u32,
    },
}

impl TpCm {
    pub fn parse(data: &[u8]) -> Result<Self, J1939Error> {
        if data.len() < 8 {
            return Err(J1939Error::UnexpectedFrame);
        }
        let pgn = u32::from_le_bytes([data[5], data[6], data[7], 0]);
        let control = TpControl::from_repr(data[0]).ok_or(J1939Error::UnknownControlByte)?;

        Ok(match control {
            TpControl::Rts => TpCm::Rts {
                size: u16::from_le_bytes([data[1], data[2]]),
                segments: data[3],
                max_per_cts: data[4],
                pgn,
            },
            TpControl::Cts => TpCm::Cts {
                count: data[1],
                next: data[2],
                pgn,
            },
            TpControl::EndOfMsgAck => TpCm::EndOfMsgAck {
                size: u16::from_le_bytes([data[1], data[2]]),
                segments: data[3],
                pgn,
            },
            TpControl::Bam => TpCm::Bam {
                size: u16::from_le_bytes([data[1], data[2]]),
                segments: data[3],
                pgn,
            },
            TpControl::Abort => TpCm::Abort {
                reason: data[1],
                pgn,
            },
        })
    }

    pub fn to_payload(&self) -> [u8; 8] {
        let (control, b1, b2, b3, b4, pgn) = match *self {
            TpCm::Rts {
                size,
                segments,
                max_per_cts,
                pgn,
            } => {
                let [lo, hi] = size.to_le_bytes();
                (TpControl::Rts, lo, hi, segments, max_per_cts, pgn)
            }
            TpCm::Cts { count, next, pgn } => (TpControl::Cts, count, next, 0xff, 0xff, pgn),
            TpCm::EndOfMsgAck {
                size,
                segments,
                pgn,
            } => {
                let [lo, hi] = size.to_le_bytes();
                (TpControl::EndOfMsgAck, lo, hi, segments, 0xff, pgn)
            }
            TpCm::Bam {
                size,
                segments,
                pgn,
            } => {
                let [lo, hi] = size.to_le_bytes();
                (TpControl::Bam, lo, hi, segments, 0xff, pgn)
            }
            TpCm::Abort { reason, pgn } => (TpControl::Abort, reason, 0xff, 0xff, 0xff, pgn),
        };

        let [p0, p1, p2, _] = pgn.to_le_bytes();
        [control as u8, b1, b2, b3, b4, p0, p1, p2]
    }

    /// PGN of the payload being transferred.
    pub fn pgn(&self) -> u32 {
        match *self {
            TpCm::Rts { pgn, .. }
            | TpCm::Cts { pgn, .. }
            | TpCm::EndOfMsgAck { pgn, .. }
            | TpCm::Bam { pgn, .. }
            | TpCm::Abort { pgn, .. } => pgn,
        }
    }

    /// Wrap into a TP.CM frame from `sa` to `destination`.
    pub fn to_frame(&self, sa: u8, destination: Destination) -> J1939Frame {
        J1939Frame {
            header: J1939Header::new(TP_PRIORITY, PGN_TP_CM, sa, destination),
            data: self.to_payload().to_vec(),
        }
    }
}

/// Build a TP.DT frame carrying one segment. Data is padded to 8 bytes with 0xFF.
pub fn tp_dt_frame(sequence: u8, chunk: &[u8], sa: u8, destination: Destination) -> J1939Frame {
    let mut data = vec![sequence];
    data.extend_from_slice(chunk);
    data.resize(8, 0xff);

    J1939Frame {
        header: J1939Header::new(TP_PRIORITY, PGN_TP_DT, sa, destination),
        data,
    }
}

/// Fragment a payload into a TP.CM announce frame plus TP.DT segments. Unicast destinations
/// get an RTS announce, broadcast a BAM.
pub fn fragment(
    pgn: u32,
    sa: u8,
    destination: Destination,
    data: &[u8],
) -> crate::Result<(J1939Frame, Vec<J1939Frame>)> {
    if data.len() > MAX_TP_SIZE {
        return Err(J1939Error::DataTooLarge.into());
    }

    let chunks: Vec<&[u8]> = data.chunks(TP_SEGMENT_LEN).collect();
    let segments = chunks.len() as u8;
    let size = data.len() as u16;

    let cm = match destination {
        Destination::Broadcast => TpCm::Bam {
            size,
            segments,
            pgn,
        },
        Destination::Address(_) => TpCm::Rts {
            size,
            segments,
            max_per_cts: 0xff,
            pgn,
        },
    };

    let dts = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| tp_dt_frame(i as u8 + 1, chunk, sa, destination))
        .collect();

    Ok((cm.to_frame(sa, destination), dts))
}

/// Configuration for the reassembly table.
#[derive(Debug, Clone, PartialEq)]
pub struct ReassemblyConfig {
    /// An entry with no new segment for this long is discarded (J1939-21 T1).
    pub timeout: Duration,
    /// Minimum gap between BAM data frames on the send side.
    pub bam_gap: Duration,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(750),
            bam_gap: Duration::from_millis(50),
        }
    }
}

/// State of one in-progress transfer.
struct ReassemblyEntry {
    destination: Destination,
    total_size: usize,
    segments: Vec<Option<Vec<u8>>>,
    last_activity: Instant,
}

/// Reassembles transport protocol transfers. Pure state machine: feed it every received
/// frame, collect completed messages, and call [`expire`](Self::expire) periodically.
pub struct Reassembler {
    config: ReassemblyConfig,
    entries: HashMap<(u8, u32), ReassemblyEntry>,
}

impl Reassembler {
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Feed one received frame. Returns a complete message for single-frame PGNs and for
    /// transfers whose last segment just arrived.
    pub fn handle_frame(
        &mut self,
        frame: &J1939Frame,
        timestamp: SystemTime,
    ) -> Result<Option<J1939Message>, J1939Error> {
        match frame.header.pgn {
            PGN_TP_CM => self.handle_cm(frame),
            PGN_TP_DT => self.handle_dt(frame, timestamp),
            _ => Ok(Some(J1939Message::from_frame(frame.clone(), timestamp))),
        }
    }

    fn handle_cm(&mut self, frame: &J1939Frame) -> Result<Option<J1939Message>, J1939Error> {
        let cm = TpCm::parse(&frame.data)?;
        let sa = frame.header.sa;

        match cm {
            TpCm::Rts { size, segments, pgn, .. } | TpCm::Bam { size, segments, pgn } => {
                let size = size as usize;
                if size > MAX_TP_SIZE {
                    return Err(J1939Error::ReassemblyError("announced size too large"));
                }
                if segments == 0
                    || size <= (segments as usize - 1) * TP_SEGMENT_LEN
                    || size > segments as usize * TP_SEGMENT_LEN
                {
                    return Err(J1939Error::ReassemblyError("size does not match segment count"));
                }

                debug!("RX TP.CM from {}: pgn {} size {} segments {}", sa, pgn, size, segments);

                // A new announce replaces any stale transfer for the same key
                self.entries.insert(
                    (sa, pgn),
                    ReassemblyEntry {
                        destination: frame.header.destination,
                        total_size: size,
                        segments: vec![None; segments as usize],
                        last_activity: Instant::now(),
                    },
                );
                Ok(None)
            }
            TpCm::Abort { pgn, reason } => {
                if self.entries.remove(&(sa, pgn)).is_some() {
                    warn!("transfer from {} pgn {} aborted, reason {}", sa, pgn, reason);
                    return Err(J1939Error::Aborted);
                }
                Ok(None)
            }
            // CTS and EndOfMsgAck are consumed by the send side of the handshake
            TpCm::Cts { .. } | TpCm::EndOfMsgAck { .. } => Ok(None),
        }
    }

    fn handle_dt(
        &mut self,
        frame: &J1939Frame,
        timestamp: SystemTime,
    ) -> Result<Option<J1939Message>, J1939Error> {
        if frame.data.is_empty() {
            return Err(J1939Error::UnexpectedFrame);
        }
        let sa = frame.header.sa;
        let sequence = frame.data[0] as usize;

        // TP.DT does not carry the payload PGN, so match the transfer by source address
        // and destination: broadcast segments belong to the BAM entry, directed segments
        // to the directed entry. Both can be open at once for the same source.
        let key = self
            .entries
            .iter()
            .find(|((esa, _), entry)| *esa == sa && entry.destination == frame.header.destination)
            .map(|(key, _)| *key);
        let key = match key {
            Some(key) => key,
            None => {
                warn!("TP.DT from {} with no open transfer", sa);
                return Ok(None);
            }
        };
        let entry = self.entries.get_mut(&key).ok_or(J1939Error::UnexpectedFrame)?;

        if sequence == 0 || sequence > entry.segments.len() {
            self.entries.remove(&key);
            return Err(J1939Error::ReassemblyError("sequence number out of range"));
        }

        // Out-of-order segments are placed by sequence number, not rejected
        entry.segments[sequence - 1] = Some(frame.data[1..].to_vec());
        entry.last_activity = Instant::now();

        if entry.segments.iter().any(|s| s.is_none()) {
            return Ok(None);
        }

        let entry = self.entries.remove(&key).ok_or(J1939Error::UnexpectedFrame)?;
        let mut payload = Vec::with_capacity(entry.total_size);
        for segment in entry.segments.iter().flatten() {
            payload.extend_from_slice(segment);
        }
        if payload.len() < entry.total_size {
            return Err(J1939Error::ReassemblyError("reassembled payload short of announced size"));
        }
        payload.truncate(entry.total_size);

        debug!("RX transfer complete from {}: pgn {} {} bytes", sa, key.1, payload.len());

        Ok(Some(J1939Message {
            pgn: key.1,
            sa,
            destination: entry.destination,
            priority: TP_PRIORITY,
            data: payload,
            timestamp,
        }))
    }

    /// Discard entries with no activity since `now - timeout`. Returns the discarded keys;
    /// each one represents a transfer that failed with a reassembly timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<(u8, u32)> {
        let timeout = self.config.timeout;
        let expired: Vec<(u8, u32)> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_activity) > timeout)
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            warn!("reassembly timeout for transfer from {} pgn {}", key.0, key.1);
            self.entries.remove(key);
        }
        expired
    }

    pub fn open_transfers(&self) -> usize {
        self.entries.len()
    }
}

/// Configuration for a [`J1939Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct J1939TransportConfig {
    /// Our source address. 0xF9 is the customary off-board tool address.
    pub sa: u8,
    pub reassembly: ReassemblyConfig,
    /// How long the send side waits for a CTS or acknowledgement (J1939-21 T3).
    pub response_timeout: Duration,
    /// Per-attempt response window for [`J1939Transport::request_pgn`].
    pub request_timeout: Duration,
    pub request_retries: u32,
}

impl Default for J1939TransportConfig {
    fn default() -> Self {
        Self {
            sa: 0xF9,
            reassembly: ReassemblyConfig::default(),
            response_timeout: Duration::from_millis(1250),
            request_timeout: Duration::from_millis(500),
            request_retries: 3,
        }
    }
}

/// Wraps a transport to provide J1939 messaging with transparent multi-packet transfer.
pub struct J1939Transport<'a> {
    bus: &'a AsyncTransport,
    config: J1939TransportConfig,
}

impl<'a> J1939Transport<'a> {
    pub fn new(bus: &'a AsyncTransport, config: J1939TransportConfig) -> Self {
        Self { bus, config }
    }

    async fn send_frame(&self, frame: &J1939Frame) -> crate::Result<()> {
        debug!("TX {:?}", frame);
        self.bus.send(&RawFrame::outbound(&frame.to_bytes())).await
    }

    /// Send a message. Payloads up to 8 bytes go out as a single frame; larger payloads use
    /// the transport protocol: BAM for broadcast, the RTS/CTS handshake for unicast.
    pub async fn send(
        &self,
        priority: u8,
        pgn: u32,
        destination: Destination,
        data: &[u8],
    ) -> crate::Result<()> {
        if data.len() <= 8 {
            let header = J1939Header::new(priority, pgn, self.config.sa, destination);
            let frame = J1939Frame::new(header, data)?;
            return self.send_frame(&frame).await;
        }

        match destination {
            Destination::Broadcast => self.send_bam(pgn, data).await,
            Destination::Address(da) => self.send_rts(pgn, da, data).await,
        }
    }

    async fn send_bam(&self, pgn: u32, data: &[u8]) -> crate::Result<()> {
        let (cm, dts) = fragment(pgn, self.config.sa, Destination::Broadcast, data)?;
        self.send_frame(&cm).await?;

        for dt in &dts {
            tokio::time::sleep(self.config.reassembly.bam_gap).await;
            self.send_frame(dt).await?;
        }
        Ok(())
    }

    async fn send_rts(&self, pgn: u32, da: u8, data: &[u8]) -> crate::Result<()> {
        let sa = self.config.sa;

        // Subscribe to the peer's TP.CM responses before announcing
        let stream = self
            .bus
            .recv_filter(move |f| {
                if f.loopback {
                    return false;
                }
                match J1939Frame::from_raw(f) {
                    Ok(frame) => {
                        frame.header.pgn == PGN_TP_CM
                            && frame.header.sa == da
                            && frame.header.destination == Destination::Address(sa)
                    }
                    Err(_) => false,
                }
            })
            .timeout(self.config.response_timeout);
        tokio::pin!(stream);

        let (cm, dts) = fragment(pgn, sa, Destination::Address(da), data)?;
        self.send_frame(&cm).await?;

        loop {
            let raw = match stream.next().await {
                None => return Err(Error::Disconnected),
                Some(Err(_)) => return Err(Error::Timeout),
                Some(Ok(raw)) => raw,
            };

            let frame = J1939Frame::from_raw(&raw)?;
            match TpCm::parse(&frame.data).map_err(Error::from)? {
                TpCm::Cts { count, next, pgn: cts_pgn } => {
                    if cts_pgn != pgn {
                        continue;
                    }
                    debug!("RX CTS from {}: {} segments from {}", da, count, next);
                    if next == 0 || next as usize > dts.len() {
                        return Err(J1939Error::UnexpectedFrame.into());
                    }
                    // count == 0 is a hold request, keep waiting for the next CTS
                    let base = next as usize - 1;
                    let end = (base + count as usize).min(dts.len());
                    for dt in &dts[base..end] {
                        self.send_frame(dt).await?;
                    }
                }
                TpCm::EndOfMsgAck { pgn: ack_pgn, .. } => {
                    if ack_pgn == pgn {
                        debug!("RX EndOfMsgAck from {}", da);
                        return Ok(());
                    }
                }
                TpCm::Abort { reason, pgn: abort_pgn } => {
                    if abort_pgn == pgn {
                        warn!("transfer to {} aborted, reason {}", da, reason);
                        return Err(J1939Error::Aborted.into());
                    }
                }
                TpCm::Rts { .. } | TpCm::Bam { .. } => continue,
            }
        }
    }

    /// Stream of complete J1939 messages: single frames directly, multi-packet transfers
    /// once reassembled. Unicast transfers addressed to our source address are acknowledged
    /// with CTS and EndOfMsgAck as J1939-21 requires. Reassembly timeouts surface as
    /// [`Error::J1939Error`] items without ending the stream.
    pub fn recv(&self) -> impl Stream<Item = crate::Result<J1939Message>> + '_ {
        // Subscribe here, not inside the generator: a stream body only runs once polled,
        // and frames broadcast before the first poll must not be lost.
        // Poll at half the reassembly timeout so expiry is detected promptly.
        let frames = self
            .bus
            .recv_filter(|frame| !frame.loopback)
            .timeout(self.config.reassembly.timeout / 2);

        Box::pin(stream! {
            let mut reassembler = Reassembler::new(self.config.reassembly.clone());
            tokio::pin!(frames);

            loop {
                let raw = match frames.next().await {
                    None => break,
                    Some(Err(_)) => {
                        for _ in reassembler.expire(Instant::now()) {
                            yield Err(J1939Error::ReassemblyTimeout.into());
                        }
                        continue;
                    }
                    Some(Ok(raw)) => raw,
                };

                let frame = match J1939Frame::from_raw(&raw) {
                    Ok(frame) => frame,
                    Err(e) => {
                        yield Err(e);
                        continue;
                    }
                };

                // Answer a unicast RTS addressed to us with a CTS for every segment
                if frame.header.pgn == PGN_TP_CM
                    && frame.header.destination == Destination::Address(self.config.sa)
                {
                    if let Ok(TpCm::Rts { segments, pgn, .. }) = TpCm::parse(&frame.data) {
                        let cts = TpCm::Cts { count: segments, next: 1, pgn }
                            .to_frame(self.config.sa, Destination::Address(frame.header.sa));
                        if let Err(e) = self.send_frame(&cts).await {
                            yield Err(e);
                            continue;
                        }
                    }
                }

                match reassembler.handle_frame(&frame, raw.timestamp) {
                    Ok(Some(msg)) => {
                        // Unicast transfers to us get the closing acknowledgement
                        if msg.data.len() > 8
                            && msg.destination == Destination::Address(self.config.sa)
                        {
                            let segments =
                                msg.data.len().div_ceil(TP_SEGMENT_LEN) as u8;
                            let ack = TpCm::EndOfMsgAck {
                                size: msg.data.len() as u16,
                                segments,
                                pgn: msg.pgn,
                            }
                            .to_frame(self.config.sa, Destination::Address(msg.sa));
                            if let Err(e) = self.send_frame(&ack).await {
                                yield Err(e);
                                continue;
                            }
                        }
                        yield Ok(msg);
                    }
                    Ok(None) => {}
                    Err(e) => yield Err(e.into()),
                }

                for _ in reassembler.expire(Instant::now()) {
                    yield Err(J1939Error::ReassemblyTimeout.into());
                }
            }
        })
    }

    /// Request a PGN from a destination and wait for the matching response.
    pub async fn request_pgn(
        &self,
        pgn: u32,
        destination: Destination,
    ) -> crate::Result<J1939Message> {
        let [p0, p1, p2, _] = pgn.to_le_bytes();
        let payload = [p0, p1, p2];

        for _ in 0..self.config.request_retries {
            let stream = self.recv().timeout(self.config.request_timeout);
            tokio::pin!(stream);

            self.send(6, PGN_REQUEST, destination, &payload).await?;

            while let Some(item) = stream.next().await {
                let msg = match item {
                    Ok(Ok(msg)) => msg,
                    Ok(Err(_)) => continue,
                    Err(_) => break, // this attempt timed out
                };
                let sa_matches = match destination {
                    Destination::Address(da) => msg.sa == da,
                    Destination::Broadcast => true,
                };
                if msg.pgn == pgn && sa_matches {
                    return Ok(msg);
                }
            }
        }

        Err(Error::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(sa: u8, seq: u8, chunk: &[u8]) -> J1939Frame {
        tp_dt_frame(seq, chunk, sa, Destination::Broadcast)
    }

    fn dt_to(sa: u8, dst: u8, seq: u8, chunk: &[u8]) -> J1939Frame {
        tp_dt_frame(seq, chunk, sa, Destination::Address(dst))
    }

    fn bam(sa: u8, pgn: u32, size: u16, segments: u8) -> J1939Frame {
        TpCm::Bam { size, segments, pgn }.to_frame(sa, Destination::Broadcast)
    }

    #[test]
    fn cm_payload_round_trip() {
        let frames = [
            TpCm::Rts { size: 100, segments: 15, max_per_cts: 0xff, pgn: 0xFEEC },
            TpCm::Cts { count: 5, next: 3, pgn: 0xFEEC },
            TpCm::EndOfMsgAck { size: 100, segments: 15, pgn: 0xFEEC },
            TpCm::Bam { size: 10, segments: 2, pgn: 0xFEEC },
            TpCm::Abort { reason: 1, pgn: 0xFEEC },
        ];
        for cm in frames {
            assert_eq!(TpCm::parse(&cm.to_payload()).unwrap(), cm);
        }
    }

    #[test]
    fn fragment_ten_byte_broadcast() {
        let data: Vec<u8> = (0..10).collect();
        let (cm, dts) = fragment(0xFEEC, 0xF9, Destination::Broadcast, &data).unwrap();

        assert_eq!(
            TpCm::parse(&cm.data).unwrap(),
            TpCm::Bam { size: 10, segments: 2, pgn: 0xFEEC }
        );
        assert_eq!(dts.len(), 2);
        assert_eq!(dts[0].data[0], 1);
        assert_eq!(&dts[0].data[1..], &[0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(dts[1].data[0], 2);
        // Last segment carries 3 payload bytes plus padding
        assert_eq!(&dts[1].data[1..4], &[7, 8, 9]);
    }

    #[test]
    fn fragment_rejects_oversized_payload() {
        let r = fragment(0xFEEC, 0xF9, Destination::Broadcast, &[0u8; MAX_TP_SIZE + 1]);
        assert_eq!(r.unwrap_err(), Error::J1939Error(J1939Error::DataTooLarge));
    }

    #[test]
    fn reassembly_in_order() {
        let mut reassembler = Reassembler::new(ReassemblyConfig::default());
        let now = SystemTime::now();

        reassembler.handle_frame(&bam(0x01, 0xFEEC, 10, 2), now).unwrap();
        assert!(reassembler
            .handle_frame(&dt(0x01, 1, &[0, 1, 2, 3, 4, 5, 6]), now)
            .unwrap()
            .is_none());
        let msg = reassembler
            .handle_frame(&dt(0x01, 2, &[7, 8, 9]), now)
            .unwrap()
            .unwrap();

        assert_eq!(msg.pgn, 0xFEEC);
        assert_eq!(msg.sa, 0x01);
        assert_eq!(msg.data, (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn reassembly_is_order_independent() {
        let data: Vec<u8> = (0..20).collect();
        let (cm, dts) = fragment(0xFEEC, 0x01, Destination::Broadcast, &data).unwrap();
        let now = SystemTime::now();

        let mut forward = Reassembler::new(ReassemblyConfig::default());
        forward.handle_frame(&cm, now).unwrap();
        let mut forward_result = None;
        for dt in &dts {
            forward_result = forward.handle_frame(dt, now).unwrap();
        }

        let mut reverse = Reassembler::new(ReassemblyConfig::default());
        reverse.handle_frame(&cm, now).unwrap();
        let mut reverse_result = None;
        for dt in dts.iter().rev() {
            reverse_result = reverse.handle_frame(dt, now).unwrap();
        }

        let forward_msg = forward_result.unwrap();
        let reverse_msg = reverse_result.unwrap();
        assert_eq!(forward_msg.data, data);
        assert_eq!(forward_msg.data, reverse_msg.data);
    }

    #[test]
    fn expired_entry_is_removed_and_key_reusable() {
        let mut reassembler = Reassembler::new(ReassemblyConfig::default());
        let now = SystemTime::now();

        reassembler.handle_frame(&bam(0x01, 0xFEEC, 10, 2), now).unwrap();
        reassembler
            .handle_frame(&dt(0x01, 1, &[0, 1, 2, 3, 4, 5, 6]), now)
            .unwrap();
        assert_eq!(reassembler.open_transfers(), 1);

        // One segment still missing when the timeout window passes
        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(reassembler.expire(later), vec![(0x01, 0xFEEC)]);
        assert_eq!(reassembler.open_transfers(), 0);

        // The same key starts a fresh transfer afterwards
        reassembler.handle_frame(&bam(0x01, 0xFEEC, 10, 2), now).unwrap();
        assert!(reassembler
            .handle_frame(&dt(0x01, 1, &[9, 9, 9, 9, 9, 9, 9]), now)
            .unwrap()
            .is_none());
        let msg = reassembler
            .handle_frame(&dt(0x01, 2, &[1, 2, 3]), now)
            .unwrap()
            .unwrap();
        assert_eq!(msg.data[..7], [9, 9, 9, 9, 9, 9, 9]);
    }

    #[test]
    fn broadcast_segments_do_not_complete_a_directed_transfer() {
        let mut reassembler = Reassembler::new(ReassemblyConfig::default());
        let now = SystemTime::now();

        let rts = TpCm::Rts { size: 10, segments: 2, max_per_cts: 0xff, pgn: 0xFEE5 }
            .to_frame(0x01, Destination::Address(0xF9));
        reassembler.handle_frame(&rts, now).unwrap();

        // Stray broadcast segments from the same source must not land in the
        // directed session
        assert!(reassembler.handle_frame(&dt(0x01, 1, &[9; 7]), now).unwrap().is_none());
        assert!(reassembler.handle_frame(&dt(0x01, 2, &[9; 3]), now).unwrap().is_none());
        assert_eq!(reassembler.open_transfers(), 1);
    }

    #[test]
    fn concurrent_directed_and_broadcast_transfers_from_same_source() {
        let mut reassembler = Reassembler::new(ReassemblyConfig::default());
        let now = SystemTime::now();

        reassembler.handle_frame(&bam(0x01, 0xFEEC, 10, 2), now).unwrap();
        let rts = TpCm::Rts { size: 12, segments: 2, max_per_cts: 0xff, pgn: 0xFEE5 }
            .to_frame(0x01, Destination::Address(0xF9));
        reassembler.handle_frame(&rts, now).unwrap();

        // Interleaved: directed segments fill the directed entry, broadcast the BAM
        assert!(reassembler
            .handle_frame(&dt_to(0x01, 0xF9, 1, &[1; 7]), now)
            .unwrap()
            .is_none());
        assert!(reassembler.handle_frame(&dt(0x01, 1, &[2; 7]), now).unwrap().is_none());
        let directed = reassembler
            .handle_frame(&dt_to(0x01, 0xF9, 2, &[1; 5]), now)
            .unwrap()
            .unwrap();
        let broadcast = reassembler
            .handle_frame(&dt(0x01, 2, &[2; 3]), now)
            .unwrap()
            .unwrap();

        assert_eq!(directed.pgn, 0xFEE5);
        assert_eq!(directed.destination, Destination::Address(0xF9));
        assert_eq!(directed.data, vec![1; 12]);
        assert_eq!(broadcast.pgn, 0xFEEC);
        assert_eq!(broadcast.destination, Destination::Broadcast);
        assert_eq!(broadcast.data, vec![2; 10]);
    }

    #[test]
    fn size_segment_mismatch_is_rejected() {
        let mut reassembler = Reassembler::new(ReassemblyConfig::default());
        let now = SystemTime::now();

        // 2 segments can carry at most 14 bytes
        let r = reassembler.handle_frame(&bam(0x01, 0xFEEC, 15, 2), now);
        assert!(matches!(r, Err(J1939Error::ReassemblyError(_))));
    }

    #[test]
    fn out_of_range_sequence_fails_reassembly() {
        let mut reassembler = Reassembler::new(ReassemblyConfig::default());
        let now = SystemTime::now();

        reassembler.handle_frame(&bam(0x01, 0xFEEC, 10, 2), now).unwrap();
        let r = reassembler.handle_frame(&dt(0x01, 3, &[1, 2, 3]), now);
        assert!(matches!(r, Err(J1939Error::ReassemblyError(_))));
        assert_eq!(reassembler.open_transfers(), 0);
    }

    #[test]
    fn single_frames_pass_straight_through() {
        let mut reassembler = Reassembler::new(ReassemblyConfig::default());
        let header = J1939Header::new(6, 0xF004, 0x00, Destination::Broadcast);
        let frame = J1939Frame::new(header, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let msg = reassembler
            .handle_frame(&frame, SystemTime::now())
            .unwrap()
            .unwrap();
        assert_eq!(msg.pgn, 0xF004);
        assert_eq!(msg.data.len(), 8);
    }
}
