//! Contains the main error type for the library.
use thiserror::Error;

/// The main error type for the library. Protocol modules have their own error types that are
/// contained by this error.
#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("Malformed Frame")]
    MalformedFrame,
    #[error("Checksum Error")]
    ChecksumError,
    #[error("Payload Too Large")]
    PayloadTooLarge,
    #[error("Timeout")]
    Timeout,
    #[error("Transport Unavailable: {0}")]
    TransportUnavailable(String),
    /// The transport cannot apply the requested receive filter, e.g. a MID filter on a
    /// CAN interface.
    #[error("Filter Rejected: {0}")]
    FilterRejected(String),
    #[error("Transport Disconnected")]
    Disconnected,
    #[error(transparent)]
    J1587Error(#[from] crate::j1587::error::Error),
    #[error(transparent)]
    J1939Error(#[from] crate::j1939::error::Error),
    #[error(transparent)]
    SendError(#[from] crate::transport::SendError),
    #[error(transparent)]
    ReceiveError(#[from] crate::transport::ReceiveError),
    #[cfg(feature = "rp1210")]
    #[error(transparent)]
    Rp1210Error(#[from] crate::rp1210::error::Error),
}

impl From<tokio_stream::Elapsed> for Error {
    fn from(_: tokio_stream::Elapsed) -> Error {
        Error::Timeout
    }
}
