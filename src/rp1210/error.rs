//! Error types for the RP1210 adapter.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The vendor library could not be loaded or is missing a required symbol.
    #[error("RP1210 library error: {0}")]
    Library(String),
    /// The vendor API returned an error code. See the RP1210C error code table.
    #[error("RP1210 API error code {0}")]
    Api(i16),
    #[error("RP1210 message too short: {0} bytes")]
    ShortMessage(usize),
}
