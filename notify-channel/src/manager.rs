//! Process-wide notification channel facade
//!
//! [`NotificationManager`] is the one object the rest of an application talks
//! to. It is built once, cloned into whoever needs it, and toggled with
//! [`enable`](NotificationManager::enable) / [`disable`](NotificationManager::disable).
//! Both calls are plain synchronous functions: the tokio runtime handle is
//! captured at build time and all work happens on background tasks.

use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::debug;

use crate::config::ChannelConfig;
use crate::credential::{CredentialMonitor, CredentialSource};
use crate::error::{ChannelError, Result};
use crate::lifecycle::{LifecycleCoordinator, LifecycleSignals};
use crate::payload::NotificationPayload;
use crate::registry::{DispatchRegistry, HandlerRegistration};
use crate::stats::{ChannelStats, Counters};
use crate::supervisor::{ConnectionState, Supervisor};
use crate::transport::{Transport, WebSocketTransport};

/// Observer tasks that only run while the channel is enabled
#[derive(Default)]
struct Observers {
    /// Bumped every time a fresh pair is started
    epoch: u64,
    monitor: Option<CredentialMonitor>,
    coordinator: Option<LifecycleCoordinator>,
}

struct ManagerInner {
    supervisor: Supervisor,
    registry: DispatchRegistry,
    counters: Arc<Counters>,
    credentials: Arc<dyn CredentialSource>,
    lifecycle: LifecycleSignals,
    config: ChannelConfig,
    observers: Mutex<Observers>,
}

impl ManagerInner {
    fn stop_observers(observers: &mut Observers) {
        if let Some(monitor) = observers.monitor.take() {
            monitor.stop();
        }
        if let Some(coordinator) = observers.coordinator.take() {
            coordinator.stop();
        }
    }

    /// Replace whatever observers exist with a fresh pair
    fn start_observers(self: &Arc<Self>, observers: &mut Observers) {
        Self::stop_observers(observers);
        observers.epoch += 1;
        let epoch = observers.epoch;

        observers.monitor = Some(CredentialMonitor::start(
            self.supervisor.clone(),
            Arc::clone(&self.credentials),
            self.config.credential_poll_interval,
        ));

        let manager = Arc::downgrade(self);
        observers.coordinator = Some(LifecycleCoordinator::start(
            &self.supervisor,
            &self.lifecycle,
            self.config.hidden_grace_period,
            move || Self::host_leaving(&manager, epoch),
        ));
    }

    /// Shut down on behalf of the lifecycle observer started at `epoch`
    fn host_leaving(manager: &Weak<Self>, epoch: u64) {
        let Some(inner) = manager.upgrade() else {
            return;
        };
        let mut observers = inner.observers.lock();
        if observers.epoch != epoch {
            debug!(
                epoch,
                current = observers.epoch,
                "Ignoring disconnect from a replaced lifecycle observer"
            );
            return;
        }
        Self::stop_observers(&mut observers);
        inner.supervisor.disconnect_gracefully();
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        debug!("NotificationManager dropping, disconnecting");
        Self::stop_observers(&mut self.observers.lock());
        self.supervisor.disconnect_gracefully();
    }
}

/// Persistent, self-healing notification channel.
///
/// Cloning is cheap; every clone drives the same connection. When the last
/// clone is dropped the channel disconnects gracefully.
///
/// # Example
///
/// ```rust,ignore
/// use notify_channel::{ChannelConfig, NotificationManager, SharedCredential};
///
/// let token = SharedCredential::new(Some(login().await?));
/// let manager = NotificationManager::builder(ChannelConfig::new("https://api.example.com"))
///     .credentials(token.clone())
///     .build()?;
///
/// let registration = manager.add_notification_handler(|payload| {
///     println!("{} notification", payload.source);
/// });
/// manager.enable();
///
/// // Later: rotating the token reconnects with the new one.
/// token.set(refresh().await?);
///
/// registration.unregister();
/// manager.disable();
/// ```
#[derive(Clone)]
pub struct NotificationManager {
    inner: Arc<ManagerInner>,
}

impl NotificationManager {
    /// Start building a manager for the given configuration
    pub fn builder(config: ChannelConfig) -> NotificationManagerBuilder {
        NotificationManagerBuilder::new(config)
    }

    /// Ask for a connection to exist.
    ///
    /// Idempotent: a second call while enabled does nothing. Every switch
    /// from disabled to enabled starts a fresh credential monitor and
    /// lifecycle observer.
    pub fn enable(&self) {
        let inner = &self.inner;
        let mut observers = inner.observers.lock();

        // Only this lock flips the enabled flag.
        if inner.supervisor.is_enabled() {
            return;
        }
        debug!("Enabling notification channel");
        inner.start_observers(&mut observers);
        inner.supervisor.enable();
    }

    /// Drop the connection and stop every timer and observer. Idempotent.
    pub fn disable(&self) {
        let mut observers = self.inner.observers.lock();
        ManagerInner::stop_observers(&mut observers);
        self.inner.supervisor.disconnect_gracefully();
    }

    /// Force a reconnect with whatever credential is current now
    pub fn reconnect(&self) {
        self.inner.supervisor.reconnect();
    }

    /// Register a handler invoked once per received notification
    pub fn add_notification_handler<F>(&self, handler: F) -> HandlerRegistration
    where
        F: Fn(&NotificationPayload) + Send + Sync + 'static,
    {
        self.inner.registry.register(handler)
    }

    /// Register an async handler for locale-update notifications
    pub fn add_locale_update_handler<F, Fut>(&self, handler: F) -> HandlerRegistration
    where
        F: Fn(NotificationPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.registry.register_locale(handler)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.supervisor.is_enabled()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.supervisor.is_connected()
    }

    pub fn is_connecting_now(&self) -> bool {
        self.inner.supervisor.is_connecting()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.supervisor.state()
    }

    /// Hub the host reports its lifecycle events into
    pub fn lifecycle(&self) -> &LifecycleSignals {
        &self.inner.lifecycle
    }

    /// Snapshot of the diagnostic counters
    pub fn stats(&self) -> ChannelStats {
        self.inner.counters.snapshot()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }
}

/// Builder for [`NotificationManager`]
pub struct NotificationManagerBuilder {
    config: ChannelConfig,
    credentials: Option<Arc<dyn CredentialSource>>,
    transport: Option<Arc<dyn Transport>>,
    lifecycle: Option<LifecycleSignals>,
}

impl NotificationManagerBuilder {
    fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            credentials: None,
            transport: None,
            lifecycle: None,
        }
    }

    /// Where the bearer credential comes from (required)
    pub fn credentials(mut self, source: impl CredentialSource) -> Self {
        self.credentials = Some(Arc::new(source));
        self
    }

    /// Replace the default [`WebSocketTransport`]
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Share an existing lifecycle hub instead of creating a private one
    pub fn lifecycle(mut self, signals: LifecycleSignals) -> Self {
        self.lifecycle = Some(signals);
        self
    }

    /// Validate the configuration and capture the current tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Configuration`] / [`ChannelError::InvalidEndpoint`]
    ///   for a bad configuration
    /// - [`ChannelError::MissingCredentialSource`] without
    ///   [`credentials`](Self::credentials)
    /// - [`ChannelError::NoRuntime`] outside a tokio runtime
    pub fn build(self) -> Result<NotificationManager> {
        self.config.validate()?;
        let credentials = self
            .credentials
            .ok_or(ChannelError::MissingCredentialSource)?;
        let runtime = Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(WebSocketTransport::new(self.config.heart_beat)));
        let counters = Arc::new(Counters::default());
        let registry = DispatchRegistry::with_counters(Arc::clone(&counters));
        let supervisor = Supervisor::new(
            self.config.clone(),
            transport,
            Arc::clone(&credentials),
            registry.clone(),
            Arc::clone(&counters),
            runtime,
        );

        Ok(NotificationManager {
            inner: Arc::new(ManagerInner {
                supervisor,
                registry,
                counters,
                credentials,
                lifecycle: self.lifecycle.unwrap_or_default(),
                config: self.config,
                observers: Mutex::new(Observers::default()),
            }),
        })
    }
}
