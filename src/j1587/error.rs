//! Error types for the J1587 transport layer.

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("Connection Aborted")]
    Aborted,
    #[error("Unexpected Frame")]
    UnexpectedFrame,
    #[error("Unknown Connection Command")]
    UnknownConnectionCommand,
    #[error("Truncated Parameter")]
    TruncatedParameter,
}
