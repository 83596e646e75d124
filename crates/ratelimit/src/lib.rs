//! Sharded sliding-window rate limiter keyed by client identifier.
//!
//! Per-client state is a deque of request instants inside the current
//! window. The state maps are split across a fixed pool of mutexes so lock
//! count stays constant regardless of client cardinality, while collisions
//! between active clients stay rare.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use metrion_types::stable_hash64;
use parking_lot::Mutex;

/// Number of shard locks. Prime, so `hash mod SHARD_COUNT` distributes well
/// even for key sets with structured hashes.
pub const SHARD_COUNT: usize = 10_007;

const DEFAULT_WINDOW: Duration = Duration::from_millis(1000);

type Shard = Mutex<HashMap<String, VecDeque<Instant>>>;

/// Thread-safe sliding-window limiter.
///
/// `allow_request` is non-blocking apart from shard-lock acquisition, which
/// is uncontended in steady state.
pub struct RateLimiter {
    shards: Vec<Shard>,
    max_per_window: usize,
    window: Duration,
}

impl RateLimiter {
    /// Limiter over the standard 1000 ms window.
    pub fn new(max_per_window: usize) -> Self {
        Self::with_window(max_per_window, DEFAULT_WINDOW)
    }

    pub fn with_window(max_per_window: usize, window: Duration) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards,
            max_per_window,
            window,
        }
    }

    /// Record a request attempt for `client_id`, returning whether it is
    /// permitted under the configured per-window maximum.
    pub fn allow_request(&self, client_id: &str) -> bool {
        self.allow_at(client_id, Instant::now())
    }

    fn allow_at(&self, client_id: &str, now: Instant) -> bool {
        let mut shard = self.shard_for(client_id).lock();

        if let Some(window) = shard.get_mut(client_id) {
            Self::prune(window, now, self.window);
            if window.len() < self.max_per_window {
                window.push_back(now);
                true
            } else {
                false
            }
        } else {
            if self.max_per_window == 0 {
                return false;
            }
            let mut window = VecDeque::with_capacity(4);
            window.push_back(now);
            shard.insert(client_id.to_owned(), window);
            true
        }
    }

    /// Drop clients whose windows are empty. Bounds memory under
    /// high-cardinality workloads where clients come and go; intended to be
    /// called periodically from a background thread. Returns the number of
    /// clients removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut map = shard.lock();
            map.retain(|_, window| {
                Self::prune(window, now, self.window);
                if window.is_empty() {
                    removed += 1;
                    false
                } else {
                    true
                }
            });
        }
        removed
    }

    /// Number of clients currently tracked, across all shards.
    pub fn tracked_clients(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    fn shard_for(&self, client_id: &str) -> &Shard {
        let index = (stable_hash64(client_id.as_bytes()) % SHARD_COUNT as u64) as usize;
        &self.shards[index]
    }

    fn prune(window: &mut VecDeque<Instant>, now: Instant, width: Duration) {
        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= width {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn permits_up_to_the_maximum_within_one_window() {
        let limiter = RateLimiter::new(10);
        let base = Instant::now();
        for i in 0..10 {
            assert!(
                limiter.allow_at("cli1", base + Duration::from_millis(i * 10)),
                "request {i} should pass"
            );
        }
        assert!(!limiter.allow_at("cli1", base + Duration::from_millis(150)));
    }

    #[test]
    fn window_slides_as_old_requests_expire() {
        let limiter = RateLimiter::new(2);
        let base = Instant::now();
        assert!(limiter.allow_at("cli1", base));
        assert!(limiter.allow_at("cli1", base + Duration::from_millis(100)));
        assert!(!limiter.allow_at("cli1", base + Duration::from_millis(200)));
        // First request leaves the window at base + 1000 ms.
        assert!(limiter.allow_at("cli1", base + Duration::from_millis(1050)));
    }

    #[test]
    fn clients_are_limited_independently() {
        let limiter = RateLimiter::new(1);
        let base = Instant::now();
        assert!(limiter.allow_at("cli1", base));
        assert!(limiter.allow_at("cli2", base));
        assert!(!limiter.allow_at("cli1", base + Duration::from_millis(1)));
    }

    #[test]
    fn zero_limit_denies_everything() {
        let limiter = RateLimiter::new(0);
        assert!(!limiter.allow_request("cli1"));
    }

    #[test]
    fn sweep_reaps_only_empty_windows() {
        let limiter = RateLimiter::with_window(5, Duration::from_millis(50));
        assert!(limiter.allow_request("stale"));
        std::thread::sleep(Duration::from_millis(80));
        assert!(limiter.allow_request("active"));
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn concurrent_permits_never_exceed_the_maximum() {
        // Wide window so every attempt lands inside one window regardless of
        // scheduling; the permitted total per client must equal the limit.
        let limiter = Arc::new(RateLimiter::with_window(100, Duration::from_secs(30)));
        let clients = ["a", "b", "c", "d"];
        let mut handles = Vec::new();

        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(std::thread::spawn(move || {
                let mut permitted = [0usize; 4];
                for _ in 0..100 {
                    for (slot, client) in clients.iter().enumerate() {
                        if limiter.allow_request(client) {
                            permitted[slot] += 1;
                        }
                    }
                }
                permitted
            }));
        }

        let mut totals = [0usize; 4];
        for handle in handles {
            let permitted = handle.join().unwrap();
            for (slot, count) in permitted.iter().enumerate() {
                totals[slot] += count;
            }
        }
        for total in totals {
            assert_eq!(total, 100);
        }
    }
}
