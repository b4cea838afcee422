//! Async wrapper for drivers implementing the [`Transport`] trait.

use std::collections::VecDeque;
use std::time::Duration;

use async_stream::stream;
use futures_core::stream::Stream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::frame::RawFrame;
use crate::transport::{FrameFilter, Transport};
use crate::Error;

const TX_BUFFER_SIZE: usize = 128;
const RX_BUFFER_SIZE: usize = 1024;
/// Consecutive driver errors before the background thread gives up and the transport is
/// considered disconnected.
const MAX_IO_ERRORS: usize = 3;

type FrameCallback = (RawFrame, oneshot::Sender<crate::Result<()>>);

fn process<T: Transport>(
    mut transport: T,
    mut shutdown_receiver: oneshot::Receiver<()>,
    rx_sender: broadcast::Sender<RawFrame>,
    mut tx_receiver: mpsc::Receiver<FrameCallback>,
) {
    let mut io_errors = 0;

    while shutdown_receiver.try_recv().is_err() {
        match transport.recv() {
            Ok(frames) => {
                io_errors = 0;
                for frame in frames {
                    debug!("RX {:?}", frame);
                    // Only fails when no receiver is subscribed, which cannot
                    // happen while the AsyncTransport holds one
                    let _ = rx_sender.send(frame);
                }
            }
            Err(e) => {
                warn!("transport receive failed: {}", e);
                io_errors += 1;
                if io_errors >= MAX_IO_ERRORS {
                    break;
                }
            }
        }

        let mut batch: VecDeque<RawFrame> = VecDeque::new();
        let mut callbacks = Vec::new();
        while let Ok((frame, callback)) = tx_receiver.try_recv() {
            debug!("TX {:?}", frame);
            batch.push_back(frame);
            callbacks.push(callback);
        }

        if !callbacks.is_empty() {
            let result = transport.send(&mut batch);
            for callback in callbacks {
                // The sender may have stopped waiting, that is fine
                let _ = callback.send(result.clone().map_err(Error::from));
            }
            if let Err(e) = result {
                warn!("transport send failed: {}", e);
                io_errors += 1;
                if io_errors >= MAX_IO_ERRORS {
                    break;
                }
            }
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    transport.close();
}

/// Async wrapper around a [`Transport`]. Starts a background thread to poll the driver and
/// uses tokio channels to communicate with it. Received frames go out over a broadcast
/// channel, so any number of consumers can subscribe via [`recv`](Self::recv) without
/// stealing frames from each other.
pub struct AsyncTransport {
    processing_handle: Option<std::thread::JoinHandle<()>>,
    recv_receiver: broadcast::Receiver<RawFrame>,
    send_sender: mpsc::Sender<FrameCallback>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl AsyncTransport {
    /// Apply `filter` to the driver and start the background thread.
    pub fn new<T: Transport + 'static>(mut transport: T, filter: FrameFilter) -> crate::Result<Self> {
        transport.set_filter(&filter)?;

        let (shutdown_sender, shutdown_receiver) = oneshot::channel();
        let (send_sender, send_receiver) = mpsc::channel(TX_BUFFER_SIZE);
        let (recv_sender, recv_receiver) = broadcast::channel(RX_BUFFER_SIZE);

        let mut ret = AsyncTransport {
            shutdown: Some(shutdown_sender),
            processing_handle: None,
            recv_receiver,
            send_sender,
        };

        ret.processing_handle = Some(std::thread::spawn(move || {
            process(transport, shutdown_receiver, recv_sender, send_receiver);
        }));

        Ok(ret)
    }

    /// Send a single frame. The future resolves once the driver has accepted the frame,
    /// which does not mean it is on the wire yet, as it could still be pending arbitration.
    pub async fn send(&self, frame: &RawFrame) -> crate::Result<()> {
        let (callback_sender, callback_receiver) = oneshot::channel();
        self.send_sender
            .send((frame.clone(), callback_sender))
            .await
            .map_err(|_| Error::Disconnected)?;

        callback_receiver.await.map_err(|_| Error::Disconnected)?
    }

    /// Receive all frames.
    pub fn recv(&self) -> impl Stream<Item = RawFrame> {
        self.recv_filter(|_| true)
    }

    /// Receive frames that match a filter. Useful in combination with stream adapters.
    pub fn recv_filter(&self, filter: impl Fn(&RawFrame) -> bool) -> impl Stream<Item = RawFrame> {
        let mut rx = self.recv_receiver.resubscribe();

        Box::pin(stream! {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if filter(&frame) {
                            yield frame
                        } else {
                            continue
                        }
                    }
                    // Lagged: receiver fell behind and the channel dropped old
                    // frames, keep going with what remains
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("receive stream lagged, {} frames dropped", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Receive a single frame with explicit timeout semantics:
    ///  - `None` blocks until a frame arrives or the transport shuts down.
    ///  - `Some(d)` waits at most `d` and resolves to `Ok(None)` if nothing arrived.
    ///  - `Some(Duration::ZERO)` is a non-blocking poll.
    pub async fn recv_timeout(&self, timeout: Option<Duration>) -> crate::Result<Option<RawFrame>> {
        let stream = self.recv();
        tokio::pin!(stream);

        match timeout {
            None => Ok(stream.next().await),
            Some(d) => match tokio::time::timeout(d, stream.next()).await {
                Ok(frame) => Ok(frame),
                Err(_) => Ok(None),
            },
        }
    }
}

impl Drop for AsyncTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.processing_handle.take() {
            if let Some(shutdown) = self.shutdown.take() {
                // The thread may already have exited after repeated IO errors
                let _ = shutdown.send(());
            }
            let _ = handle.join();
        }
    }
}
