//! # The Truckbus Crate
//! Welcome to the `truckbus` crate documentation. The purpose of this crate is to talk to
//! heavy-vehicle diagnostic networks. It provides codecs for the J1708/J1587 serial bus
//! (including the J2497 power-line variant) and the CAN based J1939 bus, on top of a single
//! transport abstraction so the same send/receive code runs over a SocketCAN interface, a
//! vendor RP1210 adapter library, or a TruckDuck serial bridge.
//!
//! ## Receive Example
//!
//! The following opens a transport, wraps it for async use, and prints every frame.
//!
//! ```rust
//! use futures::stream::StreamExt;
//! async fn dump_example() {
//!     let (endpoint, _peer) = truckbus::transport::loopback::LoopbackTransport::pair();
//!     let bus = truckbus::transport::AsyncTransport::new(endpoint, Default::default()).unwrap();
//!     let mut stream = bus.recv();
//!
//!     while let Some(frame) = stream.next().await {
//!         println!("[{:?}] {}", frame.source, hex::encode(&frame.bytes));
//!     }
//! }
//! ```
//!
//! ## J1939 Example
//!
//! Multi-packet J1939 messages are reassembled transparently. The transport layer handles
//! the TP.CM/TP.DT handshake, so a subscriber only ever sees complete parameter groups.
//!
//! ```rust
//! use futures::stream::StreamExt;
//! async fn j1939_example() {
//!     let (endpoint, _peer) = truckbus::transport::loopback::LoopbackTransport::pair();
//!     let bus = truckbus::transport::AsyncTransport::new(endpoint, Default::default()).unwrap();
//!     let j1939 = truckbus::j1939::transport::J1939Transport::new(&bus, Default::default());
//!
//!     let mut stream = j1939.recv();
//!     while let Some(Ok(msg)) = stream.next().await {
//!         println!("PGN {} from {}: {}", msg.pgn, msg.sa, hex::encode(&msg.data));
//!     }
//! }
//! ```
//!
//! ## Supported transports
//!  - SocketCAN (Linux only)
//!  - RP1210 vendor adapter libraries
//!  - TruckDuck serial bridge boards

pub mod frame;
pub mod j1587;
pub mod j1939;
pub mod router;
pub mod scheduler;
pub mod transport;

mod error;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

#[cfg(feature = "rp1210")]
pub mod rp1210;

#[cfg(feature = "truckduck")]
pub mod truckduck;
