//! Broker transport seam.
//!
//! The connection supervisor drives a [`Transport`] trait object and never
//! touches sockets itself. [`WebSocketTransport`] is the production
//! implementation (STOMP over WebSocket); tests substitute scripted ones.

mod websocket;

pub use websocket::WebSocketTransport;

use async_trait::async_trait;
use url::Url;

use crate::error::TransportError;

/// Opens broker sessions.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Perform the full handshake: open the connection to `endpoint`,
    /// authenticate and subscribe to `destination`.
    async fn open(
        &self,
        endpoint: &Url,
        destination: &str,
    ) -> Result<Box<dyn BrokerSession>, TransportError>;
}

/// One established, subscribed broker session.
#[async_trait]
pub trait BrokerSession: Send {
    /// Body of the next message delivered on the subscription.
    ///
    /// `None` means the broker closed the session in an orderly way.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Best-effort close. Never fails.
    async fn close(&mut self);
}
