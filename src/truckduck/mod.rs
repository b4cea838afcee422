//! [`Transport`] implementation for the TruckDuck serial bridge.
//!
//! The TruckDuck is a BeagleBone based open-source ECU interface whose firmware bridges
//! its J1708/J2497 transceivers to a serial port. Frames cross the serial link wrapped in
//! the envelope format from [`envelope`], carrying the complete J1708 frame including its
//! checksum. The bridge does not echo transmissions, so this transport produces no
//! readback frames.

pub mod envelope;

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Duration;

use tracing::info;

use envelope::EnvelopeParser;

use crate::frame::{RawFrame, TransportTag};
use crate::transport::{AsyncTransport, FrameFilter, ReceiveError, SendError, Transport};

/// Serial read timeout. Short, because the background thread polls.
const READ_TIMEOUT: Duration = Duration::from_millis(1);

pub struct TruckDuck {
    port: Box<dyn serialport::SerialPort>,
    parser: EnvelopeParser,
    filter: FrameFilter,
}

impl TruckDuck {
    pub fn new(port_name: &str, baud_rate: u32) -> crate::Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| crate::Error::TransportUnavailable(format!("{}: {}", port_name, e)))?;

        info!("connected to TruckDuck bridge on {}", port_name);
        Ok(Self {
            port,
            parser: EnvelopeParser::new(),
            filter: FrameFilter::All,
        })
    }

    pub fn new_async(port: &str, baud_rate: u32) -> crate::Result<AsyncTransport> {
        AsyncTransport::new(Self::new(port, baud_rate)?, FrameFilter::All)
    }
}

impl Transport for TruckDuck {
    fn send(&mut self, frames: &mut VecDeque<RawFrame>) -> Result<(), SendError> {
        while let Some(frame) = frames.pop_front() {
            if let Err(e) = self.port.write_all(&envelope::encode(&frame.bytes)) {
                frames.push_front(frame);
                return Err(SendError::Io(e.to_string()));
            }
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<RawFrame>, ReceiveError> {
        let mut buffer = [0u8; 256];
        loop {
            match self.port.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => self.parser.push(&buffer[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(ReceiveError::Io(e.to_string())),
            }
        }

        let mut frames = vec![];
        while let Some(payload) = self.parser.next_frame() {
            let frame = RawFrame::new(TransportTag::TruckDuck, &payload);
            if self.filter.matches(&frame) {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    fn set_filter(&mut self, filter: &FrameFilter) -> crate::Result<()> {
        // The bridge firmware has no filtering, everything is applied in software
        self.filter = filter.clone();
        Ok(())
    }
}
