//! Receiver actor: a single dedicated thread looping on bounded-deadline
//! reads. Parsing is delegated to the codec; matched destination responses
//! broadcast the session stop flag. Termination is re-checked after every
//! message and on every read timeout, so the stop decision is never delayed
//! by more than one read deadline.

use anyhow::Result;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::probe::{is_timeout, ProbeCodec, Transport};
use crate::state::{FlowKey, RecvMetric};
use crate::trace::finish::FinishDetector;
use crate::trace::recorder::Recorder;

/// Maximum consecutive receive errors before giving up
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

/// Receive buffer size; responses larger than one MTU are foreign anyway
const RECV_BUFFER_SIZE: usize = 1500;

/// Receiver wiring that stays constant for the session's lifetime
#[derive(Clone)]
pub struct ReceiverConfig {
    pub source: IpAddr,
    pub dest: IpAddr,
    /// IP protocol number of the probing flows
    pub proto: u8,
    pub read_timeout: Duration,
}

pub struct Receiver {
    config: ReceiverConfig,
    recorder: Arc<Recorder>,
    detector: Arc<FinishDetector>,
    cancel: CancellationToken,
    codec: Arc<dyn ProbeCodec>,
    transport: Arc<dyn Transport>,
    consecutive_errors: u32,
}

impl Receiver {
    pub fn new(
        config: ReceiverConfig,
        recorder: Arc<Recorder>,
        detector: Arc<FinishDetector>,
        cancel: CancellationToken,
        codec: Arc<dyn ProbeCodec>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            recorder,
            detector,
            cancel,
            codec,
            transport,
            consecutive_errors: 0,
        }
    }

    /// Run the receive loop on the current (dedicated) thread.
    pub fn run_blocking(mut self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        loop {
            if self.detector.is_finished() {
                self.cancel.cancel();
                break;
            }

            match self.transport.recv(&mut buffer, self.config.read_timeout) {
                Ok((n, source)) => {
                    self.consecutive_errors = 0;
                    self.handle_message(&buffer[..n], source);
                }
                Err(e) if is_timeout(&e) => {
                    // Expected read-deadline tick; loop back into the
                    // termination check
                    self.consecutive_errors = 0;
                }
                Err(e) => {
                    self.consecutive_errors += 1;
                    warn!(
                        error = %e,
                        count = self.consecutive_errors,
                        "receive error"
                    );
                    if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        self.cancel.cancel();
                        anyhow::bail!(
                            "receiver stopped after {} consecutive errors (last: {})",
                            self.consecutive_errors,
                            e
                        );
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_message(&self, data: &[u8], source: IpAddr) {
        let parsed = match self.codec.parse_response(data, source) {
            Ok(parsed) => parsed,
            Err(e) => {
                // Malformed or foreign payload: drop and keep reading
                debug!(error = %e, responder = %source, "undecodable response dropped");
                return;
            }
        };

        // Rebuild the originating flow key the way the probe was keyed:
        // from the ports quoted in the response, or the shared wildcard
        // flow for portless protocols
        let flow = match parsed.quoted_ports {
            Some((src_port, dst_port)) => FlowKey::new(
                self.config.source,
                self.config.dest,
                src_port,
                dst_port,
                self.config.proto,
            ),
            None => FlowKey::icmp(self.config.source, self.config.dest),
        };

        let matched = self.recorder.record_recv(RecvMetric {
            flow,
            probe_id: parsed.probe_id,
            responder: parsed.responder,
            received_at: Instant::now(),
        });

        if matched && parsed.kind.is_terminal() {
            debug!(
                responder = %parsed.responder,
                probe_id = parsed.probe_id,
                "destination reached, broadcasting stop"
            );
            self.cancel.cancel();
        }
    }
}

/// Spawn the receiver on a dedicated OS thread.
///
/// A panic inside the receiver is caught at this boundary and converted to
/// an error so it can never abort the sender actors.
pub fn spawn_receiver(receiver: Receiver) -> std::thread::JoinHandle<Result<()>> {
    std::thread::spawn(move || {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| receiver.run_blocking())) {
            Ok(result) => result,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Err(anyhow::anyhow!("receiver panicked: {}", msg))
            }
        }
    })
}
