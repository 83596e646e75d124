//! Partitioned queue backends for the ingestion write path.
//!
//! Two implementations of the same [`QueueBackend`] contract: a local
//! file-backed [`PartitionedQueue`] with per-partition append-only logs and
//! checkpointed offsets, and a [`BrokerProducer`] that forwards records to
//! an external Kafka-protocol broker behind an internal lock. Both route a
//! record by the stable hash of its key, so a client's records always land
//! in the same partition and stay ordered there.

mod broker;
mod partition;

pub use broker::{BrokerConfig, BrokerProducer};
pub use partition::{FsyncPolicy, PartitionedQueue};

use thiserror::Error;

/// Failure kinds surfaced by the queue backends.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Filesystem failure in the local backend. Propagated, not retried;
    /// the caller decides.
    #[error("queue i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be serialized into its on-disk line.
    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The producer's in-flight queue stayed full past the retry budget.
    #[error("producer queue full")]
    QueueFull,

    /// The broker client reported an error other than queue-full.
    #[error("broker error: {0}")]
    Broker(#[from] rdkafka::error::KafkaError),
}

impl QueueError {
    /// Transient errors are worth a brief retry by the caller; everything
    /// else indicates a sick backend.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::QueueFull)
    }
}

/// Successful produce acknowledgment: where the record went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAck {
    pub partition: u32,
    pub offset: u64,
}

/// Append-only, hash-partitioned write path.
///
/// Implementations are thread-safe; concurrent producers are serialized per
/// partition (local backend) or through one producer lock (broker backend).
pub trait QueueBackend: Send + Sync {
    /// Durably hand one record to the partition selected by `key`. The
    /// payload must be a self-contained JSON document.
    fn produce(&self, key: &str, payload: &[u8]) -> Result<QueueAck, QueueError>;

    /// Push any buffered records down to the durable medium.
    fn flush(&self) -> Result<(), QueueError> {
        Ok(())
    }

    fn partition_count(&self) -> u32;
}

/// Partition index for `key` over `count` partitions. Shared by both
/// backends so routing is identical regardless of mode.
pub(crate) fn route_partition(key: &str, count: u32) -> u32 {
    (metrion_types::stable_hash64(key.as_bytes()) % u64::from(count)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_is_stable_and_in_range() {
        for count in [1u32, 4, 16] {
            let first = route_partition("cli1", count);
            assert!(first < count);
            assert_eq!(first, route_partition("cli1", count));
        }
    }

    #[test]
    fn transient_classification() {
        assert!(QueueError::QueueFull.is_transient());
        assert!(!QueueError::Io(std::io::Error::other("disk gone")).is_transient());
    }
}
