use std::time::Duration;

/// Tunables for the ingestion pipeline. The CLI layer fills these in from
/// its environment; every field has a production default.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Fixed worker pool size.
    pub worker_count: usize,
    /// Per-client sliding-window limit, requests per second.
    pub max_requests_per_sec: usize,
    /// Capacity of the async writer's task queue.
    pub writer_queue_capacity: usize,
    /// How long a worker waits for writer-queue space before answering 503.
    pub producer_timeout: Duration,
    /// Receive timeout on accepted sockets; idle persistent connections are
    /// closed after this.
    pub read_timeout: Duration,
    /// Listen backlog requested from the kernel.
    pub listen_backlog: i32,
    /// Request line plus headers must fit in this many bytes.
    pub max_header_bytes: usize,
    /// Declared `Content-Length` cap.
    pub max_body_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            worker_count: 16,
            max_requests_per_sec: 10_000,
            writer_queue_capacity: 8192,
            producer_timeout: Duration::from_millis(50),
            read_timeout: Duration::from_secs(60),
            listen_backlog: 1024,
            max_header_bytes: 64 * 1024,
            max_body_bytes: 1024 * 1024,
        }
    }
}
