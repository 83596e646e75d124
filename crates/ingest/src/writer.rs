//! The asynchronous queue writer: one dedicated thread draining validated
//! batches into the selected backend.
//!
//! Workers acknowledge the client before the durable write happens; in
//! exchange the writer guarantees that every dequeued batch either reaches
//! the backend or shows up in the dropped-records counter with a log line.
//! Nothing is dropped silently.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use metrion_queue::QueueBackend;
use metrion_types::MetricBatch;
use tracing::{debug, info, warn};

use crate::stats::{BackendHealth, IngestStats};

/// Retries for transient backend errors before a record is dropped.
const WRITE_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// A validated batch waiting for its background write.
#[derive(Debug)]
pub struct WriteTask {
    pub batch: MetricBatch,
}

/// Owns the writer thread. The thread runs until every [`Sender`] handed
/// out by [`QueueWriter::spawn`] has been dropped, then drains the queue,
/// flushes the backend, and exits.
pub struct QueueWriter {
    handle: Option<JoinHandle<()>>,
}

impl QueueWriter {
    /// Spawn the writer over a bounded task queue, returning the sending
    /// side workers enqueue into (with their own timeout).
    pub fn spawn(
        backend: Arc<dyn QueueBackend>,
        capacity: usize,
        stats: Arc<IngestStats>,
        health: Arc<BackendHealth>,
    ) -> io::Result<(Self, Sender<WriteTask>)> {
        let (sender, receiver) = bounded(capacity);
        let handle = thread::Builder::new()
            .name("queue-writer".to_string())
            .spawn(move || drain(receiver, backend, stats, health))?;
        Ok((
            Self {
                handle: Some(handle),
            },
            sender,
        ))
    }

    /// Wait for the thread to drain and finish. All senders must be gone
    /// first, or this blocks until they are.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("queue writer thread panicked");
            }
        }
    }
}

impl Drop for QueueWriter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn drain(
    receiver: Receiver<WriteTask>,
    backend: Arc<dyn QueueBackend>,
    stats: Arc<IngestStats>,
    health: Arc<BackendHealth>,
) {
    while let Ok(task) = receiver.recv() {
        write_one(backend.as_ref(), task, &stats, &health);
    }
    if let Err(err) = backend.flush() {
        warn!(error = %err, "backend flush failed during writer shutdown");
    }
    info!("queue writer stopped");
}

fn write_one(
    backend: &dyn QueueBackend,
    task: WriteTask,
    stats: &IngestStats,
    health: &BackendHealth,
) {
    let payload = match task.batch.to_wire_json() {
        Ok(payload) => payload,
        Err(err) => {
            stats.records_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(client = %task.batch.client_id, error = %err, "unserializable batch dropped");
            return;
        }
    };

    let mut attempts = 0;
    loop {
        match backend.produce(&task.batch.client_id, payload.as_bytes()) {
            Ok(ack) => {
                stats.records_written.fetch_add(1, Ordering::Relaxed);
                debug!(
                    client = %task.batch.client_id,
                    partition = ack.partition,
                    offset = ack.offset,
                    "batch written"
                );
                return;
            }
            Err(err) if err.is_transient() && attempts < WRITE_RETRIES => {
                attempts += 1;
                thread::sleep(RETRY_BACKOFF);
            }
            Err(err) => {
                stats.records_dropped.fetch_add(1, Ordering::Relaxed);
                if !err.is_transient() {
                    health.record_fatal();
                }
                warn!(
                    client = %task.batch.client_id,
                    attempts = attempts + 1,
                    error = %err,
                    "dropping batch after failed write"
                );
                return;
            }
        }
    }
}
