//! Protocol-level errors.

use thiserror::Error;

/// Errors produced by the wire codec.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The line could not be parsed as an IRC message. Carries the
    /// offending line verbatim.
    #[error("malformed line: {0:?}")]
    MalformedLine(String),

    /// The line exceeds the inbound length limit.
    #[error("line too long: {len} bytes (limit {limit})")]
    LineTooLong {
        /// Actual length of the rejected line in bytes.
        len: usize,
        /// The limit that was exceeded.
        limit: usize,
    },
}
