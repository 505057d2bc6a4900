//! Handler registration and notification fan-out
//!
//! The registry maps handler ids to callbacks. Registration hands back a
//! [`HandlerRegistration`] capability that removes exactly that entry, so
//! callers never juggle indices and two registrations of the same closure stay
//! independent.
//!
//! Every inbound body goes through [`DispatchRegistry::dispatch`]: malformed
//! bodies are logged and dropped, and each handler runs in isolation so a
//! panicking handler neither starves the others nor reaches the transport.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::payload::NotificationPayload;
use crate::stats::Counters;

type NotificationHandler = Arc<dyn Fn(&NotificationPayload) + Send + Sync>;
type LocaleUpdateHandler = Arc<dyn Fn(NotificationPayload) -> BoxFuture<'static, ()> + Send + Sync>;

/// Unique identifier for a registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerKind {
    Notification,
    LocaleUpdate,
}

/// Result of dispatching one inbound body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The body parsed and was handed to the registered handlers
    Delivered {
        /// Generic handlers invoked
        handlers: usize,
        /// Generic handlers that panicked
        failed: usize,
        /// Locale-update handlers started
        locale_handlers: usize,
    },
    /// The body was malformed and dropped
    Dropped,
}

struct RegistryInner {
    notification: RwLock<BTreeMap<HandlerId, NotificationHandler>>,
    locale: RwLock<BTreeMap<HandlerId, LocaleUpdateHandler>>,
    next_id: AtomicU64,
    counters: Arc<Counters>,
}

/// Thread-safe registry of notification handlers
#[derive(Clone)]
pub struct DispatchRegistry {
    inner: Arc<RegistryInner>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::with_counters(Arc::new(Counters::default()))
    }

    pub(crate) fn with_counters(counters: Arc<Counters>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                notification: RwLock::new(BTreeMap::new()),
                locale: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                counters,
            }),
        }
    }

    fn next_id(&self) -> HandlerId {
        HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a handler for every notification.
    ///
    /// Handlers run on the connection's reader task in message order and
    /// should return quickly.
    pub fn register<F>(&self, handler: F) -> HandlerRegistration
    where
        F: Fn(&NotificationPayload) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner.notification.write().insert(id, Arc::new(handler));
        debug!(%id, "Registered notification handler");
        HandlerRegistration {
            id,
            kind: HandlerKind::Notification,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Register an async handler for locale-update notifications.
    ///
    /// Each invocation runs as its own task, in addition to the generic
    /// handlers that see the same payload.
    pub fn register_locale<F, Fut>(&self, handler: F) -> HandlerRegistration
    where
        F: Fn(NotificationPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id();
        let boxed: LocaleUpdateHandler = Arc::new(move |payload| handler(payload).boxed());
        self.inner.locale.write().insert(id, boxed);
        debug!(%id, "Registered locale update handler");
        HandlerRegistration {
            id,
            kind: HandlerKind::LocaleUpdate,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered notification handlers
    pub fn handler_count(&self) -> usize {
        self.inner.notification.read().len()
    }

    /// Number of registered locale-update handlers
    pub fn locale_handler_count(&self) -> usize {
        self.inner.locale.read().len()
    }

    /// Parse a raw body and deliver it. Never panics, never returns an error.
    pub fn dispatch(&self, raw: &str) -> DispatchOutcome {
        match NotificationPayload::from_envelope(raw) {
            Ok(payload) => self.deliver(payload),
            Err(e) => {
                Counters::bump(&self.inner.counters.messages_dropped);
                let preview: String = raw.chars().take(200).collect();
                warn!(error = %e, body = %preview, "Dropping malformed notification");
                DispatchOutcome::Dropped
            }
        }
    }

    /// Deliver an already parsed payload to every registered handler
    pub fn deliver(&self, payload: NotificationPayload) -> DispatchOutcome {
        Counters::bump(&self.inner.counters.messages_dispatched);

        // Snapshot so handlers may (un)register from inside a callback.
        let handlers: Vec<(HandlerId, NotificationHandler)> = self
            .inner
            .notification
            .read()
            .iter()
            .map(|(id, h)| (*id, Arc::clone(h)))
            .collect();

        let mut failed = 0;
        for (id, handler) in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&payload))).is_err() {
                failed += 1;
                Counters::bump(&self.inner.counters.handler_failures);
                warn!(%id, source = %payload.source, "Notification handler panicked");
            }
        }

        let locale_handlers = if payload.is_locale_update() {
            self.spawn_locale_handlers(&payload)
        } else {
            0
        };

        DispatchOutcome::Delivered {
            handlers: handlers.len(),
            failed,
            locale_handlers,
        }
    }

    fn spawn_locale_handlers(&self, payload: &NotificationPayload) -> usize {
        let handlers: Vec<(HandlerId, LocaleUpdateHandler)> = self
            .inner
            .locale
            .read()
            .iter()
            .map(|(id, h)| (*id, Arc::clone(h)))
            .collect();
        if handlers.is_empty() {
            return 0;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to run locale update handlers on; skipping");
            return 0;
        };

        let mut started = 0;
        for (id, handler) in handlers {
            let future = match catch_unwind(AssertUnwindSafe(|| handler(payload.clone()))) {
                Ok(future) => future,
                Err(_) => {
                    Counters::bump(&self.inner.counters.handler_failures);
                    warn!(%id, "Locale update handler panicked");
                    continue;
                }
            };
            let counters = Arc::clone(&self.inner.counters);
            runtime.spawn(async move {
                if AssertUnwindSafe(future).catch_unwind().await.is_err() {
                    Counters::bump(&counters.handler_failures);
                    warn!(%id, "Locale update handler panicked");
                }
            });
            started += 1;
        }
        started
    }
}

impl Default for DispatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability to remove one registered handler.
///
/// Dropping it leaves the handler registered.
#[must_use = "keep the registration to be able to unregister the handler"]
#[derive(Debug)]
pub struct HandlerRegistration {
    id: HandlerId,
    kind: HandlerKind,
    registry: Weak<RegistryInner>,
}

impl HandlerRegistration {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Remove the handler this registration was returned for.
    ///
    /// Returns `false` if the registry no longer exists.
    pub fn unregister(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let removed = match self.kind {
            HandlerKind::Notification => registry.notification.write().remove(&self.id).is_some(),
            HandlerKind::LocaleUpdate => registry.locale.write().remove(&self.id).is_some(),
        };
        debug!(id = %self.id, removed, "Unregistered handler");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::LOCALE_SOURCE;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn envelope(source: &str) -> String {
        NotificationPayload::new(source).to_envelope()
    }

    #[test]
    fn test_unregister_removes_exactly_one_handler() {
        let registry = DispatchRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        let handler = {
            let count = Arc::clone(&count);
            move |_: &NotificationPayload| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        let first = registry.register(handler.clone());
        let second = registry.register(handler);
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.handler_count(), 2);

        registry.dispatch(&envelope("tasks"));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(first.unregister());
        assert_eq!(registry.handler_count(), 1);

        registry.dispatch(&envelope("tasks"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let registry = DispatchRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _bad = registry.register(|_| panic!("handler failure"));
        let _good = {
            let seen = Arc::clone(&seen);
            registry.register(move |p| seen.lock().push(p.source.clone()))
        };

        for source in ["a", "b", "c", "d"] {
            let outcome = registry.dispatch(&envelope(source));
            assert_eq!(
                outcome,
                DispatchOutcome::Delivered {
                    handlers: 2,
                    failed: 1,
                    locale_handlers: 0
                }
            );
        }

        assert_eq!(*seen.lock(), vec!["a", "b", "c", "d"]);
        assert_eq!(registry.inner.counters.snapshot().handler_failures, 4);
    }

    #[test]
    fn test_malformed_body_is_dropped_and_later_messages_flow() {
        let registry = DispatchRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let _reg = {
            let count = Arc::clone(&count);
            registry.register(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert_eq!(registry.dispatch("<<not json>>"), DispatchOutcome::Dropped);
        assert_eq!(registry.dispatch(r#"{"payload":{}}"#), DispatchOutcome::Dropped);
        assert!(matches!(
            registry.dispatch(&envelope("tasks")),
            DispatchOutcome::Delivered { handlers: 1, .. }
        ));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let stats = registry.inner.counters.snapshot();
        assert_eq!(stats.messages_dropped, 2);
        assert_eq!(stats.messages_dispatched, 1);
    }

    #[test]
    fn test_handler_may_unregister_itself() {
        let registry = DispatchRegistry::new();
        let slot: Arc<Mutex<Option<HandlerRegistration>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let registration = {
            let slot = Arc::clone(&slot);
            let calls = Arc::clone(&calls);
            registry.register(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = slot.lock().take() {
                    me.unregister();
                }
            })
        };
        *slot.lock() = Some(registration);

        registry.dispatch(&envelope("tasks"));
        registry.dispatch(&envelope("tasks"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.handler_count(), 0);
    }

    #[test]
    fn test_unregister_after_registry_dropped() {
        let registry = DispatchRegistry::new();
        let registration = registry.register(|_| {});
        drop(registry);
        assert!(!registration.unregister());
    }

    #[tokio::test]
    async fn test_locale_handlers_run_in_addition_to_generic_handlers() {
        let registry = DispatchRegistry::new();
        let generic = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let _generic = {
            let generic = Arc::clone(&generic);
            registry.register(move |_| {
                generic.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _locale = registry.register_locale(move |payload: NotificationPayload| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(payload.field("locale").cloned());
            }
        });
        let _panicky = registry.register_locale(|_| async { panic!("locale failure") });

        let raw = NotificationPayload::new(LOCALE_SOURCE)
            .with_field("locale", "fr-FR")
            .to_envelope();
        let outcome = registry.dispatch(&raw);

        assert_eq!(
            outcome,
            DispatchOutcome::Delivered {
                handlers: 1,
                failed: 0,
                locale_handlers: 2
            }
        );
        assert_eq!(generic.load(Ordering::SeqCst), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(received, Some(serde_json::Value::from("fr-FR")));

        // Non-locale payloads never reach the locale handlers.
        registry.dispatch(&envelope("tasks"));
        assert!(rx.try_recv().is_err());
    }
}
