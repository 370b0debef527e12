//! Sender actor: one per parallel probe path.
//!
//! Each engine walks TTL 1..=max_ttl once, emitting a single probe per TTL
//! with fixed pacing. Sends are fire-and-forget: the send record goes into
//! the correlation cache before transmission, and transmission failures are
//! surfaced without blocking the remaining probes.

use anyhow::Result;
use rand::Rng;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{Config, Protocol};
use crate::probe::{ProbeCodec, Transport};
use crate::state::{FlowKey, SendMetric};
use crate::trace::finish::FinishDetector;
use crate::trace::recorder::Recorder;

/// Base destination port for UDP probes
const UDP_BASE_PORT: u16 = 33434;
/// Spread applied on top of the UDP base port
const UDP_PORT_SPREAD: u16 = 64;
/// Destination port for TCP SYN probes
const TCP_DEST_PORT: u16 = 443;

pub struct ProbeEngine {
    config: Config,
    dest: IpAddr,
    flow: FlowKey,
    recorder: Arc<Recorder>,
    detector: Arc<FinishDetector>,
    cancel: CancellationToken,
    codec: Arc<dyn ProbeCodec>,
    transport: Arc<dyn Transport>,
    /// Session-wide probe id sequence, shared so ids stay unique even when
    /// several senders share one flow (ICMP)
    ids: Arc<AtomicU32>,
}

impl ProbeEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        source: IpAddr,
        dest: IpAddr,
        src_port: u16,
        recorder: Arc<Recorder>,
        detector: Arc<FinishDetector>,
        cancel: CancellationToken,
        codec: Arc<dyn ProbeCodec>,
        transport: Arc<dyn Transport>,
        ids: Arc<AtomicU32>,
    ) -> Self {
        let flow = match config.protocol {
            Protocol::Icmp => FlowKey::icmp(source, dest),
            Protocol::Udp => {
                let dst_port = UDP_BASE_PORT + rand::rng().random_range(0..UDP_PORT_SPREAD);
                FlowKey::new(source, dest, src_port, dst_port, Protocol::Udp.number())
            }
            Protocol::Tcp => {
                FlowKey::new(source, dest, src_port, TCP_DEST_PORT, Protocol::Tcp.number())
            }
        };
        Self {
            config,
            dest,
            flow,
            recorder,
            detector,
            cancel,
            codec,
            transport,
            ids,
        }
    }

    pub fn flow(&self) -> FlowKey {
        self.flow
    }

    /// Emit one probe per TTL, then return.
    pub async fn run(self) -> Result<()> {
        let (cache, fresh) = self.recorder.register_flow(self.flow);
        if fresh {
            let sweep_cancel = self.cancel.clone();
            tokio::spawn(async move { cache.run(sweep_cancel).await });
        }

        for ttl in 1..=self.config.max_ttl {
            if self.cancel.is_cancelled() {
                break;
            }

            let probe_id = self.ids.fetch_add(1, Ordering::Relaxed);
            self.recorder.record_send(SendMetric {
                flow: self.flow,
                probe_id,
                ttl,
                sent_at: Instant::now(),
            });
            self.detector.note_send();

            match self.codec.build_probe(ttl, probe_id, self.dest) {
                Ok(packet) => {
                    if let Err(e) = self.transport.send(&packet, self.dest) {
                        warn!(ttl, probe_id, error = %e, "probe transmission failed");
                    }
                }
                Err(e) => {
                    warn!(ttl, probe_id, error = %e, "probe construction failed");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.pacing) => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{BuildError, ParseError, ParsedResponse};
    use std::io;
    use std::time::Duration;

    struct NullCodec;

    impl ProbeCodec for NullCodec {
        fn build_probe(&self, _ttl: u8, _probe_id: u32, _dest: IpAddr) -> Result<Vec<u8>, BuildError> {
            Ok(Vec::new())
        }

        fn parse_response(&self, _raw: &[u8], _responder: IpAddr) -> Result<ParsedResponse, ParseError> {
            Err(ParseError::Foreign)
        }
    }

    struct NullTransport;

    impl Transport for NullTransport {
        fn send(&self, _bytes: &[u8], _dest: IpAddr) -> io::Result<()> {
            Ok(())
        }

        fn recv(&self, _buf: &mut [u8], _deadline: Duration) -> io::Result<(usize, IpAddr)> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
    }

    fn engine(protocol: Protocol) -> ProbeEngine {
        let config = Config {
            protocol,
            max_ttl: 3,
            probes_per_hop: 1,
            pacing: Duration::from_millis(1),
            ..Config::default()
        };
        let source: IpAddr = "192.0.2.1".parse().unwrap();
        let dest: IpAddr = "198.51.100.7".parse().unwrap();
        let cancel = CancellationToken::new();
        ProbeEngine::new(
            config.clone(),
            source,
            dest,
            50000,
            Arc::new(Recorder::new(
                dest,
                config.max_ttl,
                config.probes_per_hop,
                config.cache_eviction,
                config.cache_sweep,
            )),
            Arc::new(FinishDetector::new(
                3,
                config.per_probe_timeout,
                config.grace,
                config.global_timeout,
                cancel.clone(),
            )),
            cancel,
            Arc::new(NullCodec),
            Arc::new(NullTransport),
            Arc::new(AtomicU32::new(1)),
        )
    }

    #[test]
    fn test_icmp_flow_uses_shared_wildcard_key() {
        let engine = engine(Protocol::Icmp);
        let flow = engine.flow();
        assert_eq!(flow.src_port, crate::state::WILDCARD_PORT);
        assert_eq!(flow.proto, 1);
    }

    #[test]
    fn test_udp_flow_randomizes_dest_port_in_range() {
        let engine = engine(Protocol::Udp);
        let flow = engine.flow();
        assert_eq!(flow.src_port, 50000);
        assert!(flow.dst_port >= UDP_BASE_PORT && flow.dst_port < UDP_BASE_PORT + UDP_PORT_SPREAD);
        assert_eq!(flow.proto, 17);
    }

    #[tokio::test]
    async fn test_engine_records_every_send() {
        let engine = engine(Protocol::Icmp);
        let recorder = engine.recorder.clone();
        let detector = engine.detector.clone();
        let flow = engine.flow();

        engine.run().await.unwrap();

        assert_eq!(detector.total_sent(), 3);
        let (cache, fresh) = recorder.register_flow(flow);
        assert!(!fresh);
        assert_eq!(cache.len(), 3);
    }
}
