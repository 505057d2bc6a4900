//! Error types for the notify-channel crate.
//!
//! Only construction-time APIs return [`ChannelError`]. Once a
//! [`NotificationManager`](crate::NotificationManager) is built, transport and
//! dispatch failures are absorbed (retried or logged) and never cross the
//! public boundary.

use stomp_frame::FrameError;
use thiserror::Error;

/// Errors raised while configuring or building the notification channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The broker endpoint could not be derived from the base address
    #[error("Invalid broker endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    /// The manager was built outside a tokio runtime
    #[error("No tokio runtime available; build the manager from within a runtime")]
    NoRuntime,

    /// The builder was not given a credential source
    #[error("A credential source is required")]
    MissingCredentialSource,
}

/// Errors from the broker transport. Every variant is treated as a transient
/// connectivity failure by the connection supervisor.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The WebSocket connection could not be opened
    #[error("Connect failed: {0}")]
    Connect(String),

    /// The broker answered the handshake with an ERROR frame
    #[error("Broker rejected the connection: {0}")]
    Rejected(String),

    /// The broker sent something the client did not expect
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame could not be decoded
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// The handshake or a heart-beat deadline elapsed
    #[error("Timed out")]
    Timeout,

    /// The connection is already closed
    #[error("Connection closed")]
    Closed,
}

/// Errors from parsing an inbound notification body.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The body is not JSON or does not match the envelope shape
    #[error("Malformed notification envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Convenience type alias for Results using ChannelError.
pub type Result<T> = std::result::Result<T, ChannelError>;
