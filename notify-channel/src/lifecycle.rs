//! Host lifecycle signals and the coordinator that reacts to them
//!
//! Hosts publish [`LifecycleEvent`]s into a [`LifecycleSignals`] hub: a UI
//! shell forwards its visibility and page-hide callbacks, a terminal process
//! forwards Ctrl-C. While the channel is enabled, the [`LifecycleCoordinator`]
//! listens and forces a graceful disconnect when the host is going away, so
//! no orphaned socket or duplicate server-side session is left behind.
//!
//! A hub nobody emits into is a valid no-op observer for headless hosts.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};

use crate::supervisor::Supervisor;

/// Visibility of the host surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Signals a host can report about its own lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The process is about to terminate
    Terminating,
    /// The page is being hidden. `persisted` navigations keep the page alive
    /// in a cache and do not disconnect.
    PageHide { persisted: bool },
    /// Visibility changed
    Visibility(Visibility),
}

/// Broadcast hub between host adapters and the coordinator
#[derive(Debug, Clone)]
pub struct LifecycleSignals {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleSignals {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(32);
        Self { tx }
    }

    /// Publish an event; returns how many observers received it.
    pub fn emit(&self, event: LifecycleEvent) -> usize {
        debug!(?event, "Lifecycle event");
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Number of observers currently registered
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Map Ctrl-C to [`LifecycleEvent::Terminating`]. Must be called from
    /// within a tokio runtime.
    pub fn forward_ctrl_c(&self) -> JoinHandle<()> {
        let signals = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Ctrl-C received");
                    signals.emit(LifecycleEvent::Terminating);
                }
                Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
            }
        })
    }
}

impl Default for LifecycleSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer task that turns host signals into graceful disconnects
pub(crate) struct LifecycleCoordinator {
    task: JoinHandle<()>,
}

impl LifecycleCoordinator {
    /// Register the observer. The subscription is taken before this returns,
    /// so events emitted afterwards are never missed.
    ///
    /// `disconnect` runs at most once, when the host is going away. It owns
    /// the whole shutdown, including stopping this observer.
    pub fn start(
        supervisor: &Supervisor,
        signals: &LifecycleSignals,
        grace: Duration,
        disconnect: impl FnOnce() + Send + 'static,
    ) -> Self {
        let events = signals.subscribe();
        let task = supervisor
            .runtime()
            .spawn(Self::observe(events, grace, disconnect));
        Self { task }
    }

    /// Remove the observer
    pub fn stop(self) {
        self.task.abort();
    }

    async fn observe(
        mut events: broadcast::Receiver<LifecycleEvent>,
        grace: Duration,
        disconnect: impl FnOnce(),
    ) {
        let mut hidden_timer: Option<std::pin::Pin<Box<Sleep>>> = None;

        let host_leaving = loop {
            let grace_elapsed = async {
                match hidden_timer.as_mut() {
                    Some(timer) => timer.await,
                    None => std::future::pending().await,
                }
            };

            let event = tokio::select! {
                event = events.recv() => event,
                _ = grace_elapsed => {
                    info!(grace_ms = grace.as_millis() as u64, "Host stayed hidden past the grace period, disconnecting");
                    break true;
                }
            };

            match event {
                Ok(LifecycleEvent::Terminating) => {
                    info!("Host terminating, disconnecting");
                    break true;
                }
                Ok(LifecycleEvent::PageHide { persisted: false }) => {
                    info!("Page hidden without persistence, disconnecting");
                    break true;
                }
                Ok(LifecycleEvent::PageHide { persisted: true }) => {
                    debug!("Page persisted, keeping connection");
                }
                Ok(LifecycleEvent::Visibility(Visibility::Hidden)) => {
                    if hidden_timer.is_none() {
                        debug!("Host hidden, starting grace timer");
                        hidden_timer = Some(Box::pin(sleep(grace)));
                    }
                }
                Ok(LifecycleEvent::Visibility(Visibility::Visible)) => {
                    if hidden_timer.take().is_some() {
                        debug!("Host visible again, grace timer cancelled");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Lifecycle observer lagged behind");
                }
                Err(RecvError::Closed) => break false,
            }
        };

        if host_leaving {
            disconnect();
        }
        debug!("Lifecycle observer removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_observers_is_harmless() {
        let signals = LifecycleSignals::new();
        assert_eq!(signals.observer_count(), 0);
        assert_eq!(signals.emit(LifecycleEvent::Terminating), 0);
    }

    #[tokio::test]
    async fn test_observers_receive_events() {
        let signals = LifecycleSignals::new();
        let mut rx = signals.subscribe();
        assert_eq!(signals.emit(LifecycleEvent::PageHide { persisted: true }), 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            LifecycleEvent::PageHide { persisted: true }
        );
    }
}
