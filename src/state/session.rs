use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{AddressFamily, Config, ConfigError};
use crate::probe::{ProbeCodec, Transport};
use crate::state::hop::{millis, HopReport, UNKNOWN_HOST};
use crate::trace::{
    spawn_receiver, FinishDetector, ProbeEngine, Receiver, ReceiverConfig, Recorder,
};

/// Lowest ephemeral source port assigned to sender flows
const SRC_PORT_FLOOR: u16 = 1000;
/// Randomization window for the session's base source port
const SRC_PORT_SPREAD: u16 = 500;

/// A complete probing session: shared measurement state plus the actors
/// that drive it.
///
/// All state is per-session; multiple sessions can run concurrently in one
/// process without interfering.
pub struct Session {
    config: Config,
    pub source: IpAddr,
    pub dest: IpAddr,
    pub started_at: DateTime<Utc>,
    src_port_base: u16,
    recorder: Arc<Recorder>,
    detector: Arc<FinishDetector>,
    cancel: CancellationToken,
    codec: Arc<dyn ProbeCodec>,
    transport: Arc<dyn Transport>,
    ids: Arc<AtomicU32>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("source", &self.source)
            .field("dest", &self.dest)
            .field("started_at", &self.started_at)
            .field("src_port_base", &self.src_port_base)
            .finish_non_exhaustive()
    }
}

/// Serializable summary of a finished (or partial) session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceReport {
    pub destination: IpAddr,
    pub started_at: DateTime<Utc>,
    /// Set when the session hit its global deadline; stats are partial
    pub timed_out: bool,
    pub hops: Vec<HopReport>,
}

impl Session {
    /// Validate the configuration and set up session state.
    ///
    /// `dest` must be a literal IP address of the configured family; name
    /// resolution happens outside this crate. A missing `source` defaults
    /// to the family's unspecified address.
    pub fn new(
        config: Config,
        dest: &str,
        source: Option<IpAddr>,
        codec: Arc<dyn ProbeCodec>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let dest_addr: IpAddr = dest
            .parse()
            .map_err(|_| ConfigError::Destination(dest.to_string()))?;
        if !config.family.matches(dest_addr) {
            return Err(ConfigError::AddressFamily {
                addr: dest_addr,
                family: config.family,
            });
        }

        let source = source.unwrap_or(match config.family {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });

        let cancel = CancellationToken::new();
        let recorder = Arc::new(Recorder::new(
            dest_addr,
            config.max_ttl,
            config.probes_per_hop,
            config.cache_eviction,
            config.cache_sweep,
        ));
        let detector = Arc::new(FinishDetector::new(
            config.max_ttl as u64 * config.probes_per_hop as u64,
            config.per_probe_timeout,
            config.grace,
            config.global_timeout,
            cancel.clone(),
        ));
        let src_port_base = SRC_PORT_FLOOR + rand::rng().random_range(0..SRC_PORT_SPREAD);

        Ok(Self {
            config,
            source,
            dest: dest_addr,
            started_at: Utc::now(),
            src_port_base,
            recorder,
            detector,
            cancel,
            codec,
            transport,
            ids: Arc::new(AtomicU32::new(1)),
        })
    }

    /// Run the session to completion: fan out one sender per parallel path
    /// plus a single receiver, join them all, and propagate the first
    /// failure. Blocks until one of the termination policies fires.
    pub async fn run(&self) -> Result<()> {
        // Watchdog: the orchestrator's half of the stop-flag contract. The
        // receiver raises the flag on destination match; this raises it on
        // global-deadline expiry even if no message ever arrives.
        let watchdog = {
            let cancel = self.cancel.clone();
            let deadline = tokio::time::Instant::from_std(self.detector.global_deadline());
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        debug!("global deadline reached, broadcasting stop");
                        cancel.cancel();
                    }
                }
            })
        };

        let receiver = Receiver::new(
            ReceiverConfig {
                source: self.source,
                dest: self.dest,
                proto: self.config.protocol.number(),
                read_timeout: self.config.read_timeout,
            },
            self.recorder.clone(),
            self.detector.clone(),
            self.cancel.clone(),
            self.codec.clone(),
            self.transport.clone(),
        );
        let receiver_handle = spawn_receiver(receiver);

        let mut engine_handles = Vec::with_capacity(self.config.probes_per_hop as usize);
        for slot in 0..self.config.probes_per_hop {
            let engine = ProbeEngine::new(
                self.config.clone(),
                self.source,
                self.dest,
                self.src_port_base + slot as u16,
                self.recorder.clone(),
                self.detector.clone(),
                self.cancel.clone(),
                self.codec.clone(),
                self.transport.clone(),
                self.ids.clone(),
            );
            engine_handles.push(tokio::spawn(async move { engine.run().await }));
        }

        // Join everything; keep the first error but never abandon a
        // sibling actor because another one failed
        let mut first_err: Option<anyhow::Error> = None;
        for handle in engine_handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    first_err.get_or_insert(anyhow::anyhow!("sender task failed: {}", e));
                }
            }
        }

        match receiver_handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
            }
            Err(panic_payload) => {
                // run_blocking is wrapped in catch_unwind; this covers a
                // panic outside that protected region
                let msg = panic_payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                first_err.get_or_insert(anyhow::anyhow!("receiver thread failed: {}", msg));
            }
        }

        self.cancel.cancel();
        watchdog.await.ok();

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Request early termination; observed by all actors within one read
    /// deadline.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the session ended by exhausting its global deadline, in
    /// which case the statistics are a best-effort partial view.
    pub fn timed_out(&self) -> bool {
        self.detector.timed_out()
    }

    /// Lowest TTL at which the destination answered, if it ever did
    pub fn destination_ttl(&self) -> Option<u8> {
        self.recorder.dest_ttl()
    }

    /// Ordered per-hop rows up to the destination (or max TTL when the
    /// destination never answered). Hops that never responded render as
    /// placeholder rows: unknown host, 100% loss, zero latencies.
    pub fn statistics(&self) -> Vec<HopReport> {
        let last_hop = self.destination_ttl().unwrap_or(self.config.max_ttl);
        let sent = self.config.probes_per_hop as u64;

        let mut rows = Vec::with_capacity(last_hop as usize);
        for ttl in 1..=last_hop {
            let Some(hop) = self.recorder.hop(ttl) else {
                break;
            };
            let record = hop.lock();
            if record.success {
                rows.push(HopReport {
                    ttl,
                    host: record
                        .responder
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| UNKNOWN_HOST.to_string()),
                    loss_pct: record.loss_pct,
                    sent,
                    last_ms: millis(record.last),
                    avg_ms: millis(record.avg),
                    best_ms: millis(record.best),
                    worst_ms: millis(record.worst),
                    reached: record.reached,
                });
            } else {
                rows.push(HopReport {
                    ttl,
                    host: UNKNOWN_HOST.to_string(),
                    loss_pct: 100.0,
                    sent,
                    last_ms: 0.0,
                    avg_ms: 0.0,
                    best_ms: 0.0,
                    worst_ms: 0.0,
                    reached: false,
                });
            }
        }
        rows
    }

    /// Full serializable summary of the session so far
    pub fn report(&self) -> TraceReport {
        TraceReport {
            destination: self.dest,
            started_at: self.started_at,
            timed_out: self.timed_out(),
            hops: self.statistics(),
        }
    }
}
