//! Expiring send-record cache.
//!
//! Each flow owns one cache mapping probe id to its send record. Senders
//! store, the receiver loads, and a background sweep reclaims entries whose
//! responses never arrived; without it unmatched records would accumulate
//! for the lifetime of the session.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::state::SendMetric;

/// Internally synchronized probe-id → send-record map with timed eviction
#[derive(Debug)]
pub struct SendCache {
    entries: RwLock<HashMap<u32, SendMetric>>,
    eviction: Duration,
    sweep: Duration,
}

impl SendCache {
    pub fn new(eviction: Duration, sweep: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            eviction,
            sweep,
        }
    }

    /// Insert a send record, keyed by probe id. The record's send timestamp
    /// doubles as its insertion time for eviction purposes.
    pub fn store(&self, metric: SendMetric) {
        self.entries.write().insert(metric.probe_id, metric);
    }

    /// Look up a send record without removing it or extending its lifetime.
    pub fn load(&self, probe_id: u32) -> Option<SendMetric> {
        self.entries.read().get(&probe_id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Background eviction sweep; runs until the session is cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.sweep);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep_expired(Instant::now());
                }
            }
        }
    }

    fn sweep_expired(&self, now: Instant) {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, metric| now.saturating_duration_since(metric.sent_at) <= self.eviction);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "evicted expired send records");
        }
    }
}
