use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Matches beyond this no longer improve a hop's loss figure
pub const STREAK_CAP: u64 = 10;

/// Placeholder host for hops that never responded
pub const UNKNOWN_HOST: &str = "???";

/// Running per-TTL statistics, mutated on every matched response.
///
/// A hop's progression from silent to fully responding is expressed purely
/// through `loss_pct`; `success` is sticky for the session's lifetime.
#[derive(Debug, Clone)]
pub struct HopRecord {
    pub ttl: u8,
    /// Best-observed responder for this TTL; last writer wins
    pub responder: Option<IpAddr>,
    pub recv_count: u64,
    /// Consecutive-success counter, capped at [`STREAK_CAP`]; never resets
    pub succ_streak: u64,
    pub loss_pct: f64,
    pub last: Duration,
    pub best: Duration,
    pub worst: Duration,
    pub avg: Duration,
    /// Sum of all observed latencies, feeds the running mean
    pub total: Duration,
    pub success: bool,
    /// Responder address equalled the session destination
    pub reached: bool,
}

impl HopRecord {
    pub fn new(ttl: u8) -> Self {
        Self {
            ttl,
            responder: None,
            recv_count: 0,
            succ_streak: 0,
            loss_pct: 100.0,
            last: Duration::ZERO,
            best: Duration::ZERO,
            worst: Duration::ZERO,
            avg: Duration::ZERO,
            total: Duration::ZERO,
            success: false,
            reached: false,
        }
    }

    /// Fold one matched response into the running stats.
    ///
    /// The mean is a plain arithmetic mean over received responses, not a
    /// smoothed estimate.
    pub fn record_response(&mut self, responder: IpAddr, latency: Duration, probes_per_hop: u8) {
        self.responder = Some(responder);
        self.recv_count += 1;
        self.success = true;
        self.succ_streak = (self.succ_streak + 1).min(STREAK_CAP);
        self.loss_pct =
            (100.0 - (self.succ_streak * 100) as f64 / probes_per_hop as f64).max(0.0);
        self.last = latency;
        if self.worst == Duration::ZERO || latency > self.worst {
            self.worst = latency;
        }
        if self.best == Duration::ZERO || latency < self.best {
            self.best = latency;
        }
        self.total += latency;
        self.avg = self.total / self.recv_count as u32;
    }
}

/// One rendered row of the final report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopReport {
    pub ttl: u8,
    /// Responder address, or `"???"` for hops that never responded
    pub host: String,
    pub loss_pct: f64,
    pub sent: u64,
    pub last_ms: f64,
    pub avg_ms: f64,
    pub best_ms: f64,
    pub worst_ms: f64,
    pub reached: bool,
}

/// Duration as fractional milliseconds
pub(crate) fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
