//! Session termination policies.
//!
//! The receiver polls [`FinishDetector::is_finished`] after every processed
//! message and on every read-timeout tick, so a decision is reached within
//! one read deadline even under total packet loss.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub struct FinishDetector {
    global_deadline: Instant,
    per_probe_timeout: Duration,
    grace: Duration,
    /// max_ttl × probes_per_hop
    expected_sends: u64,
    total_sent: AtomicU64,
    last_send_at: Mutex<Option<Instant>>,
    timed_out: AtomicBool,
    cancel: CancellationToken,
}

impl FinishDetector {
    pub fn new(
        expected_sends: u64,
        per_probe_timeout: Duration,
        grace: Duration,
        global_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            global_deadline: Instant::now() + global_timeout,
            per_probe_timeout,
            grace,
            expected_sends,
            total_sent: AtomicU64::new(0),
            last_send_at: Mutex::new(None),
            timed_out: AtomicBool::new(false),
            cancel,
        }
    }

    /// Account for one emitted probe.
    pub fn note_send(&self) {
        self.total_sent.fetch_add(1, Ordering::Relaxed);
        *self.last_send_at.lock() = Some(Instant::now());
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent.load(Ordering::Relaxed)
    }

    /// Whether the session ended by hitting its global deadline
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Relaxed)
    }

    pub fn global_deadline(&self) -> Instant {
        self.global_deadline
    }

    /// Evaluate the termination policies in order; first true wins.
    ///
    /// 1. Global deadline exceeded: abnormal finish, the report is partial.
    /// 2. Every scheduled probe was sent and nothing has been sent for
    ///    longer than the per-probe timeout plus the grace margin: probes
    ///    still in flight have had their chance.
    /// 3. Stop already broadcast (destination matched, or an external
    ///    cancel): early finish.
    pub fn is_finished(&self) -> bool {
        if Instant::now() >= self.global_deadline {
            self.timed_out.store(true, Ordering::Relaxed);
            self.cancel.cancel();
            return true;
        }

        if self.total_sent.load(Ordering::Relaxed) >= self.expected_sends {
            let last_send = *self.last_send_at.lock();
            if let Some(at) = last_send {
                if at.elapsed() > self.per_probe_timeout + self.grace {
                    return true;
                }
            }
        }

        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_dominates() {
        let cancel = CancellationToken::new();
        let detector = FinishDetector::new(
            100,
            Duration::from_secs(3),
            Duration::from_millis(500),
            Duration::ZERO,
            cancel.clone(),
        );

        // No sends at all, deadline already passed
        assert!(detector.is_finished());
        assert!(detector.timed_out());
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_not_finished_while_sends_outstanding() {
        let detector = FinishDetector::new(
            2,
            Duration::from_millis(1),
            Duration::from_millis(1),
            Duration::from_secs(60),
            CancellationToken::new(),
        );

        detector.note_send();
        assert_eq!(detector.total_sent(), 1);
        assert!(!detector.is_finished());
    }

    #[test]
    fn test_completed_sends_finish_after_grace() {
        let detector = FinishDetector::new(
            2,
            Duration::from_millis(5),
            Duration::from_millis(5),
            Duration::from_secs(60),
            CancellationToken::new(),
        );

        detector.note_send();
        detector.note_send();

        // Quiet period has not elapsed yet
        assert!(!detector.is_finished());

        std::thread::sleep(Duration::from_millis(30));
        assert!(detector.is_finished());
        assert!(!detector.timed_out());
    }

    #[test]
    fn test_stop_broadcast_finishes_early() {
        let cancel = CancellationToken::new();
        let detector = FinishDetector::new(
            100,
            Duration::from_secs(3),
            Duration::from_millis(500),
            Duration::from_secs(60),
            cancel.clone(),
        );

        assert!(!detector.is_finished());
        cancel.cancel();
        assert!(detector.is_finished());
        assert!(!detector.timed_out());
    }
}
