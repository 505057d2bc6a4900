//! Diagnostic counters shared by the supervisor and the dispatch registry.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time snapshot of the channel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub connect_attempts: u64,
    pub handshakes_succeeded: u64,
    pub connections_lost: u64,
    pub retries_scheduled: u64,
    pub retries_cancelled: u64,
    pub retries_fired: u64,
    pub reconnects: u64,
    pub graceful_disconnects: u64,
    /// Retry timers armed and neither fired nor cancelled yet
    pub outstanding_retry_timers: u64,
    /// High-water mark of `outstanding_retry_timers`
    pub max_outstanding_retry_timers: u64,
    pub messages_dispatched: u64,
    pub messages_dropped: u64,
    pub handler_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub connect_attempts: AtomicU64,
    pub handshakes_succeeded: AtomicU64,
    pub connections_lost: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub retries_cancelled: AtomicU64,
    pub retries_fired: AtomicU64,
    pub reconnects: AtomicU64,
    pub graceful_disconnects: AtomicU64,
    outstanding_retry_timers: AtomicU64,
    max_outstanding_retry_timers: AtomicU64,
    pub messages_dispatched: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub handler_failures: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timer_armed(&self) {
        Self::bump(&self.retries_scheduled);
        let now = self.outstanding_retry_timers.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_outstanding_retry_timers
            .fetch_max(now, Ordering::SeqCst);
    }

    pub fn timer_cancelled(&self) {
        Self::bump(&self.retries_cancelled);
        self.outstanding_retry_timers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn timer_fired(&self) {
        Self::bump(&self.retries_fired);
        self.outstanding_retry_timers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ChannelStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ChannelStats {
            connect_attempts: load(&self.connect_attempts),
            handshakes_succeeded: load(&self.handshakes_succeeded),
            connections_lost: load(&self.connections_lost),
            retries_scheduled: load(&self.retries_scheduled),
            retries_cancelled: load(&self.retries_cancelled),
            retries_fired: load(&self.retries_fired),
            reconnects: load(&self.reconnects),
            graceful_disconnects: load(&self.graceful_disconnects),
            outstanding_retry_timers: self.outstanding_retry_timers.load(Ordering::SeqCst),
            max_outstanding_retry_timers: self.max_outstanding_retry_timers.load(Ordering::SeqCst),
            messages_dispatched: load(&self.messages_dispatched),
            messages_dropped: load(&self.messages_dropped),
            handler_failures: load(&self.handler_failures),
        }
    }
}
