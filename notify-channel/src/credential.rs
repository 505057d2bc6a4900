//! Credential sources and rotation detection
//!
//! The credential is owned by an external auth collaborator; this module only
//! reads it. [`CredentialMonitor`] runs while the channel is enabled and asks
//! the supervisor for a forced reconnect when a live connection is still using
//! an outdated credential.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::supervisor::Supervisor;

/// Read-only access to the current bearer credential.
pub trait CredentialSource: Send + Sync + 'static {
    /// The credential to use right now, `None` when there is none
    fn current(&self) -> Option<String>;

    /// Push notifications of credential changes, when the source has them.
    ///
    /// Sources that can only be polled keep the default.
    fn changes(&self) -> Option<watch::Receiver<Option<String>>> {
        None
    }
}

impl<F> CredentialSource for F
where
    F: Fn() -> Option<String> + Send + Sync + 'static,
{
    fn current(&self) -> Option<String> {
        self()
    }
}

/// A credential that never changes
#[derive(Debug, Clone)]
pub struct StaticCredential(pub String);

impl CredentialSource for StaticCredential {
    fn current(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Settable credential holder shared between the auth layer and the channel.
///
/// Changes are pushed to the monitor immediately; the periodic poll remains
/// as a fallback.
#[derive(Debug, Clone)]
pub struct SharedCredential {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl SharedCredential {
    pub fn new(initial: Option<String>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the credential (login, refresh)
    pub fn set(&self, credential: impl Into<String>) {
        self.tx.send_replace(Some(credential.into()));
    }

    /// Forget the credential (logout)
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }
}

impl Default for SharedCredential {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CredentialSource for SharedCredential {
    fn current(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    fn changes(&self) -> Option<watch::Receiver<Option<String>>> {
        Some(self.tx.subscribe())
    }
}

/// Read a credential, treating empty strings as absent
pub(crate) fn read_credential(source: &dyn CredentialSource) -> Option<String> {
    source.current().filter(|c| !c.is_empty())
}

/// Background task comparing the credential in use against the current one
pub(crate) struct CredentialMonitor {
    task: JoinHandle<()>,
}

impl CredentialMonitor {
    /// Start polling. The owner stops the task with [`stop`](Self::stop) when
    /// the channel is disabled.
    pub fn start(
        supervisor: Supervisor,
        source: Arc<dyn CredentialSource>,
        poll_interval: Duration,
    ) -> Self {
        let task = supervisor
            .runtime()
            .spawn(Self::monitor_task(supervisor.clone(), source, poll_interval));
        Self { task }
    }

    /// Stop polling immediately
    pub fn stop(self) {
        self.task.abort();
        debug!("Credential monitor stopped");
    }

    async fn monitor_task(
        supervisor: Supervisor,
        source: Arc<dyn CredentialSource>,
        poll_interval: Duration,
    ) {
        let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut changes = source.changes();

        debug!(interval_ms = poll_interval.as_millis() as u64, "Credential monitor started");

        loop {
            let pushed = tokio::select! {
                _ = ticker.tick() => None,
                changed = wait_for_change(&mut changes) => Some(changed),
            };
            if pushed == Some(false) {
                // Sender gone; keep polling only.
                changes = None;
                continue;
            }

            if supervisor.is_enabled() {
                Self::check(&supervisor, source.as_ref());
            }
        }
    }

    fn check(supervisor: &Supervisor, source: &dyn CredentialSource) {
        let Some(current) = read_credential(source) else {
            return;
        };
        if !supervisor.is_connected() {
            // The retry loop picks up the new credential on its next attempt.
            return;
        }
        if supervisor.last_credential().as_deref() != Some(current.as_str()) {
            info!("Credential rotated while connected, forcing reconnect");
            supervisor.reconnect();
        }
    }
}

async fn wait_for_change(changes: &mut Option<watch::Receiver<Option<String>>>) -> bool {
    match changes {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}
