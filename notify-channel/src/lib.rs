//! # notify-channel
//!
//! A persistent, self-healing notification channel client. It keeps one
//! STOMP-over-WebSocket subscription to a message broker alive, reconnects
//! after failures and credential rotation, and fans received notifications out
//! to registered handlers.
//!
//! ## Architecture
//!
//! - **Connection supervisor**: the `Idle -> Connecting -> Connected` state
//!   machine, the single live connection and the single retry timer
//! - **Credential monitor**: forces a reconnect when the credential in use
//!   is no longer the current one
//! - **Lifecycle coordinator**: turns host termination and visibility signals
//!   into graceful disconnects
//! - **Dispatch registry**: parses inbound bodies and invokes every handler in
//!   isolation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use notify_channel::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = NotificationManager::builder(ChannelConfig::new("https://api.example.com"))
//!         .credentials(StaticCredential(std::env::var("NOTIFY_TOKEN")?))
//!         .build()?;
//!
//!     let _tasks = manager.add_notification_handler(|payload| {
//!         println!("{}: {:?}", payload.source, payload.fields);
//!     });
//!
//!     manager.lifecycle().forward_ctrl_c();
//!     manager.enable();
//!     tokio::signal::ctrl_c().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod credential;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod manager;
pub mod payload;
pub mod registry;
pub mod stats;
mod supervisor;
pub mod transport;

pub use config::{ChannelConfig, RetryPolicy};
pub use credential::{CredentialSource, SharedCredential, StaticCredential};
pub use error::{ChannelError, DispatchError, Result, TransportError};
pub use lifecycle::{LifecycleEvent, LifecycleSignals, Visibility};
pub use manager::{NotificationManager, NotificationManagerBuilder};
pub use payload::{NotificationPayload, LOCALE_SOURCE};
pub use registry::{DispatchOutcome, DispatchRegistry, HandlerId, HandlerRegistration};
pub use stats::ChannelStats;
pub use supervisor::ConnectionState;
pub use transport::{BrokerSession, Transport, WebSocketTransport};

pub use stomp_frame::HeartBeat;

/// Common imports for hosts of the channel
pub mod prelude {
    pub use crate::{
        ChannelConfig, CredentialSource, LifecycleEvent, LifecycleSignals, NotificationManager,
        NotificationPayload, RetryPolicy, SharedCredential, StaticCredential, Visibility,
    };
}
