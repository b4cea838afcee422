//! Error types for the J1939 transport protocol.

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("Reassembly Error: {0}")]
    ReassemblyError(&'static str),
    #[error("Reassembly Timeout")]
    ReassemblyTimeout,
    #[error("Data Too Large")]
    DataTooLarge,
    #[error("Connection Aborted")]
    Aborted,
    #[error("Unknown Control Byte")]
    UnknownControlByte,
    #[error("Unexpected Frame")]
    UnexpectedFrame,
}
