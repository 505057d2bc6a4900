//! Connection supervisor.
//!
//! Owns the single broker connection and the single retry timer. Every entry
//! point (public calls, transport completions, timer callbacks) takes the state
//! lock, re-checks `enabled` and the attempt generation, and only then mutates.
//! Completions from an attempt that is no longer the active one are ignored,
//! which is what keeps a stale handshake from resurrecting a disabled channel.
//!
//! ```text
//! Idle --attempt--> Connecting --handshake ok--> Connected
//!   ^                   |                            |
//!   +-- retry timer <---+------- error / close ------+
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ChannelConfig;
use crate::credential::{read_credential, CredentialSource};
use crate::registry::DispatchRegistry;
use crate::stats::Counters;
use crate::transport::Transport;

/// Where the connection state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no attempt in flight
    Idle,
    /// Handshake in flight
    Connecting,
    /// Subscribed and receiving
    Connected,
}

/// The live connection or the attempt producing it
struct ActiveConnection {
    generation: u64,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ActiveConnection {
    fn shut_down(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

struct PendingRetry {
    id: u64,
    task: JoinHandle<()>,
}

struct State {
    enabled: bool,
    phase: ConnectionState,
    generation: u64,
    connection: Option<ActiveConnection>,
    last_credential: Option<String>,
    retry: Option<PendingRetry>,
    retry_seq: u64,
    /// Consecutive failures, feeds the retry policy
    failures: u32,
}

impl State {
    fn is_active_generation(&self, generation: u64) -> bool {
        self.connection.as_ref().map(|c| c.generation) == Some(generation)
    }
}

struct Inner {
    state: Mutex<State>,
    config: ChannelConfig,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    registry: DispatchRegistry,
    counters: Arc<Counters>,
    runtime: Handle,
}

/// Handle to the connection state machine
#[derive(Clone)]
pub(crate) struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        config: ChannelConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        registry: DispatchRegistry,
        counters: Arc<Counters>,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    enabled: false,
                    phase: ConnectionState::Idle,
                    generation: 0,
                    connection: None,
                    last_credential: None,
                    retry: None,
                    retry_seq: 0,
                    failures: 0,
                }),
                config,
                transport,
                credentials,
                registry,
                counters,
                runtime,
            }),
        }
    }

    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Switch on and try to connect. Returns `false` if already enabled.
    pub fn enable(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.enabled {
                return false;
            }
            state.enabled = true;
            state.failures = 0;
        }
        debug!("Notification channel enabled");
        self.attempt_connection();
        true
    }

    /// Start a connection attempt unless one is live, in flight, or unwanted.
    pub fn attempt_connection(&self) {
        {
            let state = self.inner.state.lock();
            if !state.enabled || state.phase != ConnectionState::Idle {
                return;
            }
        }

        // Read outside the lock: the source belongs to someone else.
        let credential = read_credential(self.inner.credentials.as_ref());

        let mut state = self.inner.state.lock();
        if !state.enabled || state.phase != ConnectionState::Idle || state.connection.is_some() {
            return;
        }

        let Some(credential) = credential else {
            debug!("No credential available yet");
            self.schedule_retry(&mut state);
            return;
        };

        let endpoint = match self.inner.config.endpoint_url(&credential) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(error = %e, "Cannot derive broker endpoint");
                self.schedule_retry(&mut state);
                return;
            }
        };

        self.cancel_retry(&mut state);
        state.generation += 1;
        let generation = state.generation;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        state.connection = Some(ActiveConnection {
            generation,
            shutdown: Some(shutdown_tx),
        });
        state.phase = ConnectionState::Connecting;
        Counters::bump(&self.inner.counters.connect_attempts);
        info!(generation, "Connecting to notification broker");

        self.inner.runtime.spawn(self.clone().run_connection(
            generation,
            endpoint,
            credential,
            shutdown_rx,
        ));
    }

    /// Drop the current connection, forget the last credential and connect
    /// again right away (if enabled).
    pub fn reconnect(&self) {
        let enabled = {
            let mut state = self.inner.state.lock();
            self.cancel_retry(&mut state);
            if let Some(connection) = state.connection.take() {
                connection.shut_down();
            }
            state.phase = ConnectionState::Idle;
            state.last_credential = None;
            if state.enabled {
                Counters::bump(&self.inner.counters.reconnects);
                info!("Forced reconnect");
            }
            state.enabled
        };

        if enabled {
            self.attempt_connection();
        }
    }

    /// Disable, cancel the retry timer and close any connection. Never fails.
    pub fn disconnect_gracefully(&self) {
        let mut state = self.inner.state.lock();
        let was_active = state.enabled || state.connection.is_some() || state.retry.is_some();

        state.enabled = false;
        self.cancel_retry(&mut state);
        if let Some(connection) = state.connection.take() {
            connection.shut_down();
        }
        state.phase = ConnectionState::Idle;
        state.failures = 0;

        if was_active {
            Counters::bump(&self.inner.counters.graceful_disconnects);
            info!("Notification channel disconnected");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().phase == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.state.lock().phase == ConnectionState::Connecting
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().phase
    }

    /// Credential the current connection was established with
    pub fn last_credential(&self) -> Option<String> {
        self.inner.state.lock().last_credential.clone()
    }

    #[cfg(test)]
    pub fn has_pending_retry(&self) -> bool {
        self.inner.state.lock().retry.is_some()
    }

    fn schedule_retry(&self, state: &mut State) {
        if !state.enabled {
            return;
        }
        self.cancel_retry(state);

        let attempt = state.failures;
        let delay = self.inner.config.retry_policy.delay(attempt);
        state.failures = state.failures.saturating_add(1);
        state.retry_seq += 1;
        let id = state.retry_seq;

        let supervisor = self.clone();
        let task = self.inner.runtime.spawn(async move {
            sleep(delay).await;
            supervisor.retry_fired(id);
        });
        state.retry = Some(PendingRetry { id, task });
        self.inner.counters.timer_armed();
        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );
    }

    fn cancel_retry(&self, state: &mut State) {
        if let Some(retry) = state.retry.take() {
            retry.task.abort();
            self.inner.counters.timer_cancelled();
            debug!(id = retry.id, "Retry cancelled");
        }
    }

    fn retry_fired(&self, id: u64) {
        {
            let mut state = self.inner.state.lock();
            if state.retry.as_ref().map(|r| r.id) != Some(id) {
                return;
            }
            state.retry = None;
            self.inner.counters.timer_fired();
            if !state.enabled {
                return;
            }
        }
        debug!(id, "Retry timer fired");
        self.attempt_connection();
    }

    /// Handshake completion. Returns `false` when the attempt is stale and
    /// its session must be closed.
    fn handshake_succeeded(&self, generation: u64, credential: &str) -> bool {
        let mut state = self.inner.state.lock();
        if !state.enabled || !state.is_active_generation(generation) {
            return false;
        }
        state.phase = ConnectionState::Connected;
        state.last_credential = Some(credential.to_string());
        state.failures = 0;
        Counters::bump(&self.inner.counters.handshakes_succeeded);
        info!(generation, "Subscribed to notifications");
        true
    }

    /// Handshake error, transport error or unexpected close.
    fn connection_lost(&self, generation: u64) {
        let mut state = self.inner.state.lock();
        if !state.is_active_generation(generation) {
            return;
        }
        state.connection = None;
        state.phase = ConnectionState::Idle;
        Counters::bump(&self.inner.counters.connections_lost);
        self.schedule_retry(&mut state);
    }

    async fn run_connection(
        self,
        generation: u64,
        endpoint: Url,
        credential: String,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let config = &self.inner.config;
        let handshake = timeout(
            config.handshake_timeout,
            self.inner.transport.open(&endpoint, &config.destination),
        );

        let outcome = tokio::select! {
            biased;
            _ = &mut shutdown => {
                debug!(generation, "Handshake abandoned");
                return;
            }
            outcome = handshake => outcome,
        };

        let mut session = match outcome {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!(generation, error = %e, "Handshake failed");
                self.connection_lost(generation);
                return;
            }
            Err(_) => {
                warn!(
                    generation,
                    timeout_ms = config.handshake_timeout.as_millis() as u64,
                    "Handshake timed out"
                );
                self.connection_lost(generation);
                return;
            }
        };

        if !self.handshake_succeeded(generation, &credential) {
            debug!(generation, "Stale handshake completed, closing its session");
            session.close().await;
            return;
        }

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    session.close().await;
                    debug!(generation, "Connection closed on request");
                    return;
                }
                message = session.recv() => match message {
                    Some(Ok(body)) => {
                        self.inner.registry.dispatch(&body);
                    }
                    Some(Err(e)) => {
                        warn!(generation, error = %e, "Connection error");
                        session.close().await;
                        self.connection_lost(generation);
                        return;
                    }
                    None => {
                        warn!(generation, "Broker closed the connection");
                        self.connection_lost(generation);
                        return;
                    }
                }
            }
        }
    }
}
