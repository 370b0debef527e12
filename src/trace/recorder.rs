//! Probe correlation between asynchronous send and receive events.
//!
//! Senders register their flow once, then report every probe through
//! [`Recorder::record_send`]. The receiver reports decoded responses through
//! [`Recorder::record_recv`], which bridges the send cache and the per-hop
//! statistics. The recorder never decides termination.

use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::state::{FlowKey, HopRecord, RecvMetric, SendMetric};
use crate::trace::cache::SendCache;

pub struct Recorder {
    dest: IpAddr,
    probes_per_hop: u8,
    cache_eviction: Duration,
    cache_sweep: Duration,
    /// One send cache per registered flow
    flows: RwLock<HashMap<FlowKey, Arc<SendCache>>>,
    /// One record per TTL 1..=max_ttl, each behind its own lock so
    /// independent hops update without contention
    hops: Vec<Mutex<HopRecord>>,
    /// Lowest TTL at which the destination address was observed
    dest_ttl: Mutex<Option<u8>>,
}

impl Recorder {
    pub fn new(
        dest: IpAddr,
        max_ttl: u8,
        probes_per_hop: u8,
        cache_eviction: Duration,
        cache_sweep: Duration,
    ) -> Self {
        let hops = (1..=max_ttl)
            .map(|ttl| Mutex::new(HopRecord::new(ttl)))
            .collect();
        Self {
            dest,
            probes_per_hop,
            cache_eviction,
            cache_sweep,
            flows: RwLock::new(HashMap::new()),
            hops,
            dest_ttl: Mutex::new(None),
        }
    }

    /// Register a flow's send cache, creating it on first use.
    ///
    /// Returns the cache and whether it was freshly created, so the caller
    /// can spawn exactly one eviction sweeper per flow.
    pub fn register_flow(&self, key: FlowKey) -> (Arc<SendCache>, bool) {
        let mut flows = self.flows.write();
        match flows.entry(key) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let cache = Arc::new(SendCache::new(self.cache_eviction, self.cache_sweep));
                entry.insert(cache.clone());
                (cache, true)
            }
        }
    }

    /// Record an outbound probe. An unregistered flow is dropped silently;
    /// registration and teardown races are expected, not errors.
    pub fn record_send(&self, metric: SendMetric) {
        let Some(cache) = self.flows.read().get(&metric.flow).cloned() else {
            debug!(flow = ?metric.flow, "send for unregistered flow dropped");
            return;
        };
        cache.store(metric);
    }

    /// Correlate an inbound response with its originating probe.
    ///
    /// Returns whether the responder address equals the session destination.
    /// Unknown flows, unseen or already-evicted probe ids, and would-be
    /// negative latencies all leave every hop record untouched.
    pub fn record_recv(&self, metric: RecvMetric) -> bool {
        let Some(cache) = self.flows.read().get(&metric.flow).cloned() else {
            return false;
        };
        let Some(send) = cache.load(metric.probe_id) else {
            debug!(
                probe_id = metric.probe_id,
                responder = %metric.responder,
                "no send record for response, dropped"
            );
            return false;
        };
        let Some(latency) = metric.received_at.checked_duration_since(send.sent_at) else {
            return false;
        };
        let Some(hop) = self.hop(send.ttl) else {
            return false;
        };

        let reached = metric.responder == self.dest;
        {
            let mut record = hop.lock();
            record.record_response(metric.responder, latency, self.probes_per_hop);
            if reached {
                record.reached = true;
            }
        }
        if reached {
            self.note_destination(send.ttl);
        }
        reached
    }

    /// Per-TTL record, 1-indexed
    pub fn hop(&self, ttl: u8) -> Option<&Mutex<HopRecord>> {
        if ttl == 0 {
            return None;
        }
        self.hops.get(ttl as usize - 1)
    }

    /// Lowest TTL at which the destination has been observed so far
    pub fn dest_ttl(&self) -> Option<u8> {
        *self.dest_ttl.lock()
    }

    fn note_destination(&self, ttl: u8) {
        let mut dest_ttl = self.dest_ttl.lock();
        *dest_ttl = Some(dest_ttl.map_or(ttl, |current| current.min(ttl)));
    }
}
