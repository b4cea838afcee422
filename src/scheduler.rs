//! Bus access scheduling.
//!
//! J1708 has no hardware arbitration below the UART, so a well-behaved node waits for the
//! bus to be idle, transmits, and checks its own readback against what it sent. A mismatch
//! or missing readback means a collision, answered with a random backoff and a bounded
//! number of retries. J1939 arbitration is handled by the CAN controller, so its scheduler
//! instead orders queued frames by priority and paces transmissions to keep this node's
//! share of the bus below a configurable utilization fraction.
//!
//! One scheduler instance per physical bus. It owns the outbound ordering for that bus and
//! is the intended concurrent-safe send entry point.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{oneshot, Mutex};
use tokio_stream::StreamExt;
use tracing::debug;

use crate::error::Error;
use crate::frame::RawFrame;
use crate::j1587::{BitTimingProfile, J1708Frame};
use crate::j1939::J1939Frame;
use crate::transport::{AsyncTransport, SendError};

/// Configuration for a [`J1708Scheduler`].
#[derive(Debug, Clone, PartialEq)]
pub struct J1708SchedulerConfig {
    /// Minimum quiet time before transmitting, 21 bit times at the bus baud rate.
    pub idle_gap: Duration,
    /// How long to wait for the transport to echo a transmitted frame.
    pub echo_timeout: Duration,
    /// Upper bound for the random collision backoff.
    pub max_backoff: Duration,
    pub max_retries: u32,
    /// Whether the transport echoes transmissions. Without readback, collisions cannot be
    /// detected and a send is considered done once the transport accepts it.
    pub readback: bool,
}

impl J1708SchedulerConfig {
    /// Defaults with the idle gap derived from the bus variant's bit timing: J2497 signals
    /// twice as fast as J1708, so its inter-frame gap is half as long.
    pub fn for_profile(profile: BitTimingProfile) -> Self {
        Self {
            idle_gap: profile.bit_time() * 21,
            echo_timeout: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            max_retries: 5,
            readback: true,
        }
    }
}

impl Default for J1708SchedulerConfig {
    fn default() -> Self {
        Self::for_profile(BitTimingProfile::J1708)
    }
}

/// Serializes J1708 transmissions with idle-wait and collision backoff.
pub struct J1708Scheduler<'a> {
    bus: &'a AsyncTransport,
    config: J1708SchedulerConfig,
}

impl<'a> J1708Scheduler<'a> {
    pub fn new(bus: &'a AsyncTransport, config: J1708SchedulerConfig) -> Self {
        Self { bus, config }
    }

    /// Transmit one frame, retrying on detected collisions. Fails with
    /// [`SendError::BusArbitrationFailure`] when the retry budget is exhausted.
    pub async fn send(&self, frame: &J1708Frame) -> crate::Result<()> {
        let bytes = frame.to_bytes();
        let raw = RawFrame::outbound(&bytes);

        for attempt in 0..=self.config.max_retries {
            self.wait_for_idle().await;

            // Subscribe before sending so the echo cannot be missed
            let echo = self
                .bus
                .recv_filter(|f| f.loopback)
                .timeout(self.config.echo_timeout);
            tokio::pin!(echo);

            self.bus.send(&raw).await?;

            if !self.config.readback {
                return Ok(());
            }

            match echo.next().await {
                Some(Ok(readback)) if readback.bytes == bytes => return Ok(()),
                Some(Ok(readback)) => {
                    debug!(
                        "collision on attempt {}: sent {} read {}",
                        attempt,
                        hex::encode(&bytes),
                        hex::encode(&readback.bytes)
                    );
                }
                Some(Err(_)) => {
                    debug!("no readback within echo window on attempt {}", attempt);
                }
                None => return Err(Error::Disconnected),
            }

            if self.config.max_backoff > Duration::ZERO {
                let backoff = rand::thread_rng().gen_range(Duration::ZERO..self.config.max_backoff);
                tokio::time::sleep(backoff).await;
            }
        }

        Err(SendError::BusArbitrationFailure(frame.mid as u32).into())
    }

    /// Resolves once the bus has been quiet for the configured idle gap.
    async fn wait_for_idle(&self) {
        let stream = self.bus.recv().timeout(self.config.idle_gap);
        tokio::pin!(stream);

        loop {
            match stream.next().await {
                // Traffic seen, the gap starts over
                Some(Ok(_)) => continue,
                // Gap elapsed without traffic
                Some(Err(_)) => return,
                None => return,
            }
        }
    }
}

/// Configuration for a [`J1939Scheduler`].
#[derive(Debug, Clone, PartialEq)]
pub struct J1939SchedulerConfig {
    pub bus_bitrate: u32,
    /// Fraction of the bus this node may consume, measured over `window`.
    pub max_utilization: f64,
    pub window: Duration,
}

impl Default for J1939SchedulerConfig {
    fn default() -> Self {
        Self {
            bus_bitrate: 250_000,
            max_utilization: 0.5,
            window: Duration::from_secs(1),
        }
    }
}

/// Worst-case bits on the wire for one extended-id data frame, including stuffing.
const FRAME_BITS: u64 = 160;

struct QueuedFrame {
    priority: u8,
    seq: u64,
    frame: J1939Frame,
    callback: oneshot::Sender<crate::Result<()>>,
}

impl PartialEq for QueuedFrame {
    fn eq(&self, other: &Self) -> bool {
        (self.priority, self.seq) == (other.priority, other.seq)
    }
}
impl Eq for QueuedFrame {}

impl Ord for QueuedFrame {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: invert so the lowest numeric priority pops first,
        // with sequence number keeping order stable within a priority
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}
impl PartialOrd for QueuedFrame {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedFrame>,
    next_seq: u64,
    /// Transmission timestamps inside the sliding utilization window.
    sent: VecDeque<Instant>,
}

/// Priority-ordered, utilization-paced J1939 send queue.
pub struct J1939Scheduler<'a> {
    bus: &'a AsyncTransport,
    config: J1939SchedulerConfig,
    state: Mutex<QueueState>,
    drain_lock: Mutex<()>,
}

impl<'a> J1939Scheduler<'a> {
    pub fn new(bus: &'a AsyncTransport, config: J1939SchedulerConfig) -> Self {
        Self {
            bus,
            config,
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                sent: VecDeque::new(),
            }),
            drain_lock: Mutex::new(()),
        }
    }

    /// Queue a frame and resolve once it has been handed to the transport. Queued frames
    /// go out lowest numeric priority first, in submission order within a priority.
    pub async fn send(&self, frame: &J1939Frame) -> crate::Result<()> {
        let (callback, done) = oneshot::channel();

        {
            let mut state = self.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(QueuedFrame {
                priority: frame.header.priority,
                seq,
                frame: frame.clone(),
                callback,
            });
        }

        self.drain().await;
        done.await.map_err(|_| Error::Disconnected)?
    }

    /// Drain the queue until it is empty. Drainers wait on the drain lock rather than
    /// skipping when it is held: a frame pushed just as another task pops the last item
    /// would otherwise sit in the queue until an unrelated send came along.
    async fn drain(&self) {
        let _guard = self.drain_lock.lock().await;

        loop {
            let item = { self.state.lock().await.heap.pop() };
            let Some(item) = item else { return };

            self.pace().await;
            let result = self
                .bus
                .send(&RawFrame::outbound(&item.frame.to_bytes()))
                .await;
            // The sender may have given up waiting
            let _ = item.callback.send(result);
        }
    }

    /// Sleep until transmitting one more frame stays within the utilization budget.
    async fn pace(&self) {
        let budget_bits = (self.config.bus_bitrate as f64
            * self.config.max_utilization
            * self.config.window.as_secs_f64()) as u64;

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let window = self.config.window;
                while state
                    .sent
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    state.sent.pop_front();
                }

                let used_bits = state.sent.len() as u64 * FRAME_BITS;
                if used_bits + FRAME_BITS <= budget_bits {
                    state.sent.push_back(now);
                    None
                } else {
                    // Wait for the oldest transmission to leave the window
                    state.sent.front().map(|t| *t + window - now)
                }
            };

            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(priority: u8, seq: u64) -> QueuedFrame {
        let header =
            crate::j1939::J1939Header::new(priority, 0xF004, 0x01, crate::j1939::Destination::Broadcast);
        QueuedFrame {
            priority,
            seq,
            frame: J1939Frame::new(header, &[]).unwrap(),
            callback: oneshot::channel().0,
        }
    }

    #[test]
    fn idle_gap_follows_bit_timing_profile() {
        let j1708 = J1708SchedulerConfig::default();
        let j2497 = J1708SchedulerConfig::for_profile(BitTimingProfile::J2497);

        assert_eq!(j1708.idle_gap, BitTimingProfile::J1708.bit_time() * 21);
        // Twice the baud rate means half the gap
        assert_eq!(j2497.idle_gap * 2, j1708.idle_gap);
    }

    #[test]
    fn queue_pops_lowest_priority_first_and_is_stable() {
        let mut heap = BinaryHeap::new();
        heap.push(queued(6, 0));
        heap.push(queued(3, 1));
        heap.push(queued(6, 2));
        heap.push(queued(3, 3));

        let order: Vec<(u8, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|q| (q.priority, q.seq))
            .collect();
        assert_eq!(order, vec![(3, 1), (3, 3), (6, 0), (6, 2)]);
    }
}
