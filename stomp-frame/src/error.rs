//! Error types for the STOMP frame codec

use thiserror::Error;

/// Errors that can occur while decoding a STOMP frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The text contained no frame at all
    #[error("Empty frame")]
    Empty,

    /// The first line is not a STOMP command
    #[error("Unknown STOMP command: {0}")]
    UnknownCommand(String),

    /// A header line without a `:` separator
    #[error("Malformed header line: {0}")]
    MalformedHeader(String),

    /// A backslash escape outside the STOMP 1.2 set
    #[error("Invalid escape sequence in header: {0}")]
    InvalidEscape(String),

    /// `content-length` is not a number or exceeds the body
    #[error("Invalid content-length header")]
    InvalidContentLength,
}
