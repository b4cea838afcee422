//! In-memory transport for tests and examples.
//!
//! [`LoopbackTransport::pair`] gives two connected endpoints: frames sent on one come out of
//! the other, with the sending side also seeing its own traffic as readback frames when
//! `echo` is on. An [`Injector`] can push arbitrary frames into an endpoint's receive path,
//! which is how tests simulate bus traffic without a peer task.

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};

use crate::frame::{RawFrame, TransportTag};
use crate::transport::{FrameFilter, ReceiveError, SendError, Transport};

pub struct LoopbackTransport {
    to_peer: Sender<RawFrame>,
    inbox: Receiver<RawFrame>,
    inject: Sender<RawFrame>,
    filter: FrameFilter,
    /// When set, sent frames also appear on this endpoint's own receive path with
    /// `loopback` set, mirroring hardware readback.
    pub echo: bool,
}

impl LoopbackTransport {
    /// Two endpoints wired back to back.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = channel();
        let (b_tx, b_rx) = channel();

        let a = Self {
            to_peer: b_tx.clone(),
            inbox: a_rx,
            inject: a_tx.clone(),
            filter: FrameFilter::All,
            echo: true,
        };
        let b = Self {
            to_peer: a_tx,
            inbox: b_rx,
            inject: b_tx,
            filter: FrameFilter::All,
            echo: true,
        };
        (a, b)
    }

    /// Handle for pushing frames into this endpoint's receive path.
    pub fn injector(&self) -> Injector {
        Injector(self.inject.clone())
    }
}

/// Pushes frames into a [`LoopbackTransport`]'s receive path, as if they arrived off the wire.
#[derive(Clone)]
pub struct Injector(Sender<RawFrame>);

impl Injector {
    pub fn inject(&self, bytes: &[u8]) -> crate::Result<()> {
        self.inject_frame(RawFrame::new(TransportTag::Loopback, bytes))
    }

    pub fn inject_frame(&self, frame: RawFrame) -> crate::Result<()> {
        self.0.send(frame).map_err(|_| crate::Error::Disconnected)
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, frames: &mut VecDeque<RawFrame>) -> Result<(), SendError> {
        while let Some(frame) = frames.pop_front() {
            let mut delivered = frame.clone();
            delivered.source = TransportTag::Loopback;
            delivered.loopback = false;
            self.to_peer
                .send(delivered)
                .map_err(|_| SendError::Io("peer endpoint dropped".into()))?;

            if self.echo {
                let mut echo = frame;
                echo.source = TransportTag::Loopback;
                echo.loopback = true;
                // Our own inject sender keeps the channel open, this cannot fail
                let _ = self.inject.send(echo);
            }
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<RawFrame>, ReceiveError> {
        let mut frames = Vec::new();
        loop {
            match self.inbox.try_recv() {
                Ok(frame) => {
                    if self.filter.matches(&frame) {
                        frames.push(frame);
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(frames)
    }

    fn set_filter(&mut self, filter: &FrameFilter) -> crate::Result<()> {
        self.filter = filter.clone();
        Ok(())
    }
}
