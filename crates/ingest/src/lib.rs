//! The ingestion pipeline: acceptor, worker pool, per-connection HTTP/1.1
//! request loop, and the asynchronous queue writer.
//!
//! Everything here runs on plain OS threads. One acceptor owns the listening
//! socket and feeds a bounded channel of client sockets; a fixed pool of
//! workers drains it, each running the persistent-connection request loop; a
//! single writer thread drains validated batches into the selected queue
//! backend. Acknowledgment is decoupled from the durable write, which keeps
//! the request hot path sub-millisecond at the cost of at-least-once
//! delivery semantics downstream.

pub mod config;
pub mod http;
pub mod server;
pub mod stats;
pub mod writer;

pub use config::IngestConfig;
pub use server::IngestServer;
pub use stats::{BackendHealth, IngestStats, StatsSnapshot};
pub use writer::{QueueWriter, WriteTask};
