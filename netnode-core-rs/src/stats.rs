//! Dispatch counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated by the dispatcher
#[derive(Debug, Default)]
pub struct DispatchStats {
    handled: AtomicU64,
    rejected: AtomicU64,
    replaced: AtomicU64,
    failed: AtomicU64,
    decode_failures: AtomicU64,
    subscriber_failures: AtomicU64,
}

/// Point-in-time copy of `DispatchStats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub handled: u64,
    pub rejected: u64,
    pub replaced: u64,
    pub failed: u64,
    pub decode_failures: u64,
    pub subscriber_failures: u64,
}

impl StatsSnapshot {
    /// Exchanges that produced a response, whatever the outcome
    pub fn total(&self) -> u64 {
        self.handled + self.rejected + self.replaced + self.failed
    }
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replaced(&self) {
        self.replaced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_subscriber_failures(&self, n: usize) {
        if n > 0 {
            self.subscriber_failures.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            handled: self.handled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            replaced: self.replaced.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            subscriber_failures: self.subscriber_failures.load(Ordering::Relaxed),
        }
    }
}
