//! Thread-safe producer wrapper over the broker client.
//!
//! The client library must be treated as exclusively owned: every call into
//! it happens under the wrapper's mutex, and teardown drives the client to a
//! quiescent state (flush, then poll the in-flight queue dry) before it is
//! dropped. Releasing the client while its background delivery threads are
//! still active is a use-after-free in the underlying library.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use rdkafka::ClientContext;
use tracing::{info, warn};

use crate::{route_partition, QueueAck, QueueBackend, QueueError};

/// How many times a queue-full send is retried after polling the client.
const QUEUE_FULL_RETRIES: u32 = 5;
/// Poll window between queue-full retries.
const QUEUE_FULL_POLL: Duration = Duration::from_millis(10);
/// Flush allowance during teardown.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
/// Secondary teardown budget: polls × interval.
const SHUTDOWN_POLLS: u32 = 100;
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Bootstrap servers, `host:port[,host:port…]`.
    pub bootstrap_servers: String,
    pub topic: String,
    /// Partition count of the target topic; routing must agree with it so
    /// per-client ordering holds.
    pub partition_count: u32,
    /// How long the client keeps trying to deliver one message before the
    /// delivery callback reports failure.
    pub message_timeout: Duration,
}

impl BrokerConfig {
    pub fn new(bootstrap_servers: String, topic: String, partition_count: u32) -> Self {
        Self {
            bootstrap_servers,
            topic,
            partition_count,
            message_timeout: Duration::from_secs(5),
        }
    }
}

/// Producer context: counts and logs asynchronous delivery failures.
struct DeliveryTracker {
    failures: Arc<AtomicU64>,
}

impl ClientContext for DeliveryTracker {}

impl ProducerContext for DeliveryTracker {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _: ()) {
        if let Err((err, _)) = result {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "broker delivery failed, record lost");
        }
    }
}

/// Same `produce` contract as the local queue, forwarding to the broker.
///
/// Offsets returned here are the wrapper's per-partition enqueue sequence;
/// the broker assigns its own offsets asynchronously, after `produce` has
/// already returned. Monotonicity per partition, which is what callers rely
/// on, holds either way.
pub struct BrokerProducer {
    producer: Mutex<BaseProducer<DeliveryTracker>>,
    topic: String,
    partition_count: u32,
    next_offsets: Vec<AtomicU64>,
    delivery_failures: Arc<AtomicU64>,
}

impl BrokerProducer {
    pub fn connect(config: BrokerConfig) -> Result<Self, QueueError> {
        let failures = Arc::new(AtomicU64::new(0));
        let producer: BaseProducer<DeliveryTracker> = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set(
                "message.timeout.ms",
                config.message_timeout.as_millis().to_string(),
            )
            .create_with_context(DeliveryTracker {
                failures: Arc::clone(&failures),
            })?;

        info!(
            bootstrap = %config.bootstrap_servers,
            topic = %config.topic,
            partitions = config.partition_count,
            "broker producer ready"
        );
        Ok(Self {
            producer: Mutex::new(producer),
            topic: config.topic,
            partition_count: config.partition_count.max(1),
            next_offsets: (0..config.partition_count.max(1))
                .map(|_| AtomicU64::new(0))
                .collect(),
            delivery_failures: failures,
        })
    }

    /// Records the broker confirmed it could not deliver.
    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }
}

impl QueueBackend for BrokerProducer {
    fn produce(&self, key: &str, payload: &[u8]) -> Result<QueueAck, QueueError> {
        let partition = route_partition(key, self.partition_count);
        let producer = self.producer.lock();

        let mut attempts = 0;
        loop {
            let record = BaseRecord::to(&self.topic)
                .partition(partition as i32)
                .key(key)
                .payload(payload);
            match producer.send(record) {
                Ok(()) => {
                    // Serve any pending delivery callbacks without waiting.
                    producer.poll(Duration::ZERO);
                    let offset =
                        self.next_offsets[partition as usize].fetch_add(1, Ordering::Relaxed);
                    return Ok(QueueAck { partition, offset });
                }
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                    attempts += 1;
                    if attempts > QUEUE_FULL_RETRIES {
                        return Err(QueueError::QueueFull);
                    }
                    producer.poll(QUEUE_FULL_POLL);
                }
                Err((err, _)) => return Err(err.into()),
            }
        }
    }

    fn flush(&self) -> Result<(), QueueError> {
        self.producer.lock().flush(SHUTDOWN_FLUSH_TIMEOUT)?;
        Ok(())
    }

    fn partition_count(&self) -> u32 {
        self.partition_count
    }
}

impl Drop for BrokerProducer {
    fn drop(&mut self) {
        let producer = self.producer.get_mut();
        if let Err(err) = producer.flush(SHUTDOWN_FLUSH_TIMEOUT) {
            warn!(error = %err, "broker flush failed during shutdown");
        }
        let mut polls = 0;
        while producer.in_flight_count() > 0 && polls < SHUTDOWN_POLLS {
            producer.poll(SHUTDOWN_POLL_INTERVAL);
            polls += 1;
        }
        let remaining = producer.in_flight_count();
        if remaining > 0 {
            warn!(remaining, "dropping broker producer with undelivered records");
        }
    }
}
