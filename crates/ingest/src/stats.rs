use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Pipeline counters, served as JSON by `GET /metrics`.
///
/// Counters are the only per-request bookkeeping on the hot path; client
/// errors increment one of these and are otherwise not logged.
#[derive(Debug, Default)]
pub struct IngestStats {
    /// HTTP requests read off sockets, any endpoint, any outcome.
    pub requests_received: AtomicU64,
    /// Individual metrics accepted into the pipeline.
    pub total_received: AtomicU64,
    /// Batches accepted with a 200.
    pub batches_processed: AtomicU64,
    /// Batches rejected by the parser/validator.
    pub validation_errors: AtomicU64,
    /// Requests denied with 429.
    pub rate_limited: AtomicU64,
    /// Requests shed with 503 because the writer queue stayed full.
    pub backpressure_rejections: AtomicU64,
    /// Records the writer handed to the backend successfully.
    pub records_written: AtomicU64,
    /// Records the writer gave up on; each one is also logged.
    pub records_dropped: AtomicU64,
}

impl IngestStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            total_received: self.total_received.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            backpressure_rejections: self.backpressure_rejections.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`IngestStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests_received: u64,
    pub total_received: u64,
    pub batches_processed: u64,
    pub validation_errors: u64,
    pub rate_limited: u64,
    pub backpressure_rejections: u64,
    pub records_written: u64,
    pub records_dropped: u64,
}

const HEALTH_WINDOW: Duration = Duration::from_secs(30);
const HEALTH_FATAL_THRESHOLD: usize = 5;

/// Tracks fatal backend errors over a rolling window so `/health` can act
/// as a readiness probe: repeated fatals degrade it to 503.
#[derive(Debug)]
pub struct BackendHealth {
    window: Duration,
    threshold: usize,
    fatals: Mutex<VecDeque<Instant>>,
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self::new(HEALTH_WINDOW, HEALTH_FATAL_THRESHOLD)
    }
}

impl BackendHealth {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            fatals: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_fatal(&self) {
        let now = Instant::now();
        let mut fatals = self.fatals.lock();
        Self::prune(&mut fatals, now, self.window);
        fatals.push_back(now);
    }

    pub fn is_degraded(&self) -> bool {
        let now = Instant::now();
        let mut fatals = self.fatals.lock();
        Self::prune(&mut fatals, now, self.window);
        fatals.len() >= self.threshold
    }

    fn prune(fatals: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(&oldest) = fatals.front() {
            if now.duration_since(oldest) >= window {
                fatals.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counter_state() {
        let stats = IngestStats::default();
        stats.total_received.fetch_add(3, Ordering::Relaxed);
        stats.batches_processed.fetch_add(1, Ordering::Relaxed);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_received, 3);
        assert_eq!(snapshot.batches_processed, 1);
        assert_eq!(snapshot.validation_errors, 0);
    }

    #[test]
    fn health_degrades_after_repeated_fatals() {
        let health = BackendHealth::new(Duration::from_secs(30), 3);
        assert!(!health.is_degraded());
        for _ in 0..3 {
            health.record_fatal();
        }
        assert!(health.is_degraded());
    }

    #[test]
    fn old_fatals_age_out_of_the_window() {
        let health = BackendHealth::new(Duration::from_millis(40), 1);
        health.record_fatal();
        assert!(health.is_degraded());
        std::thread::sleep(Duration::from_millis(60));
        assert!(!health.is_degraded());
    }
}
