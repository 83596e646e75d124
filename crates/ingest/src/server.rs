//! Acceptor, worker pool, and the per-connection request loop.

use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use metrion_queue::QueueBackend;
use metrion_ratelimit::RateLimiter;
use metrion_types::MetricBatch;
use serde_json::json;
use socket2::{Domain, Socket, Type};
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::http::{self, HttpError, Request};
use crate::stats::{BackendHealth, IngestStats};
use crate::writer::{QueueWriter, WriteTask};

/// Idle sleep between nonblocking accept attempts; bounds how long shutdown
/// waits on the acceptor.
const ACCEPT_IDLE: Duration = Duration::from_millis(50);
/// How often a blocked acceptor re-checks the running flag while the worker
/// queue is full.
const ENQUEUE_RECHECK: Duration = Duration::from_secs(1);
/// Limiter sweep cadence.
const SWEEP_INTERVAL_SECS: u64 = 60;

/// State shared by every pipeline thread.
struct ServerContext {
    config: IngestConfig,
    stats: Arc<IngestStats>,
    health: Arc<BackendHealth>,
    limiter: Arc<RateLimiter>,
    tasks: Sender<WriteTask>,
    running: Arc<AtomicBool>,
    started_at: Instant,
}

/// The running ingestion server: acceptor thread, W workers, the limiter
/// sweeper, and the queue writer.
pub struct IngestServer {
    local_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
    writer: Option<QueueWriter>,
    stats: Arc<IngestStats>,
    health: Arc<BackendHealth>,
}

impl IngestServer {
    /// Bind the listener and spin up every pipeline thread. Fails fast on
    /// bind errors so the caller can exit non-zero.
    pub fn start(
        addr: SocketAddr,
        config: IngestConfig,
        backend: Arc<dyn QueueBackend>,
        running: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let listener = bind_listener(addr, config.listen_backlog)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let stats = Arc::new(IngestStats::default());
        let health = Arc::new(BackendHealth::default());
        let limiter = Arc::new(RateLimiter::new(config.max_requests_per_sec));
        let (writer, tasks) = QueueWriter::spawn(
            backend,
            config.writer_queue_capacity,
            Arc::clone(&stats),
            Arc::clone(&health),
        )?;

        let worker_count = config.worker_count.max(1);
        let context = Arc::new(ServerContext {
            config,
            stats: Arc::clone(&stats),
            health: Arc::clone(&health),
            limiter: Arc::clone(&limiter),
            tasks,
            running: Arc::clone(&running),
            started_at: Instant::now(),
        });

        // Bounded socket queue: when every worker is busy and the queue is
        // full, the acceptor stops accepting, which is the backpressure.
        let (conn_tx, conn_rx) = bounded::<TcpStream>(worker_count * 2);

        let mut threads = Vec::with_capacity(worker_count + 2);
        for index in 0..worker_count {
            let receiver = conn_rx.clone();
            let context = Arc::clone(&context);
            threads.push(
                thread::Builder::new()
                    .name(format!("ingest-worker-{index}"))
                    .spawn(move || worker_loop(receiver, context))?,
            );
        }
        drop(conn_rx);

        {
            let context = Arc::clone(&context);
            threads.push(
                thread::Builder::new()
                    .name("ingest-acceptor".to_string())
                    .spawn(move || acceptor_loop(listener, conn_tx, context))?,
            );
        }
        {
            let running = Arc::clone(&running);
            threads.push(
                thread::Builder::new()
                    .name("limiter-sweeper".to_string())
                    .spawn(move || sweeper_loop(limiter, running))?,
            );
        }

        info!(addr = %local_addr, workers = worker_count, "ingestion server listening");
        Ok(Self {
            local_addr,
            threads,
            writer: Some(writer),
            stats,
            health,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    pub fn health(&self) -> Arc<BackendHealth> {
        Arc::clone(&self.health)
    }

    /// Block until shutdown completes: acceptor and workers exit once the
    /// running flag clears, then the writer drains its queue and flushes
    /// the backend.
    pub fn join(mut self) {
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("pipeline thread panicked");
            }
        }
        if let Some(writer) = self.writer.take() {
            writer.join();
        }
    }
}

/// std's `TcpListener::bind` hardcodes a small backlog; build the socket by
/// hand so the kernel queue survives accept bursts.
fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

fn acceptor_loop(listener: TcpListener, conn_tx: Sender<TcpStream>, context: Arc<ServerContext>) {
    while context.running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _peer)) => {
                if let Err(err) = prepare_stream(&stream, context.config.read_timeout) {
                    debug!(error = %err, "dropping connection, socket setup failed");
                    continue;
                }
                let mut pending = Some(stream);
                while let Some(stream) = pending.take() {
                    match conn_tx.send_timeout(stream, ENQUEUE_RECHECK) {
                        Ok(()) => {}
                        Err(crossbeam_channel::SendTimeoutError::Timeout(stream)) => {
                            if !context.running.load(Ordering::Acquire) {
                                return;
                            }
                            pending = Some(stream);
                        }
                        Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => return,
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE);
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                thread::sleep(ACCEPT_IDLE);
            }
        }
    }
    info!("acceptor stopped");
}

fn prepare_stream(stream: &TcpStream, read_timeout: Duration) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(read_timeout))?;
    stream.set_write_timeout(Some(read_timeout))?;
    stream.set_nodelay(true)
}

fn worker_loop(receiver: Receiver<TcpStream>, context: Arc<ServerContext>) {
    while let Ok(stream) = receiver.recv() {
        if let Err(err) = serve_connection(stream, &context) {
            // Mid-request socket failures close the connection silently.
            debug!(error = %err, "connection ended on protocol error");
        }
    }
    debug!("worker exiting");
}

/// The persistent-connection loop: read, route, respond, repeat until the
/// peer stops, an error ends the connection, or shutdown begins.
fn serve_connection(stream: TcpStream, context: &ServerContext) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut stream = stream;

    loop {
        let request = match http::read_request(&mut reader, &context.config) {
            Ok(request) => request,
            Err(HttpError::ConnectionClosed | HttpError::UnexpectedEof | HttpError::Timeout) => {
                return Ok(())
            }
            Err(HttpError::Io(err)) => return Err(err),
            Err(err) => {
                // Malformed framing: answer once, then drop the link since
                // the byte stream can no longer be trusted.
                let body = error_body(&err.to_string());
                let _ = http::write_response(&mut stream, 400, &body, false);
                return Ok(());
            }
        };

        context.stats.requests_received.fetch_add(1, Ordering::Relaxed);
        let keep_alive = request.keep_alive() && context.running.load(Ordering::Acquire);
        let (status, body) = route(&request, context);
        http::write_response(&mut stream, status, &body, keep_alive)?;
        if !keep_alive {
            return Ok(());
        }
    }
}

fn route(request: &Request, context: &ServerContext) -> (u16, Vec<u8>) {
    match (request.method.as_str(), request.route_path()) {
        ("POST", "/metrics") => handle_ingest(request, context),
        ("GET", "/health") => handle_health(context),
        ("GET", "/metrics") => handle_counters(context),
        (_, "/metrics") | (_, "/health") => (405, error_body("method not allowed")),
        _ => (404, error_body("not found")),
    }
}

fn handle_ingest(request: &Request, context: &ServerContext) -> (u16, Vec<u8>) {
    let client_id = match request
        .header("authorization")
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        Some(id) => id,
        None => return (401, error_body("missing client identifier")),
    };

    let metrics = match metrion_parser::parse(&request.body) {
        Ok(metrics) => metrics,
        Err(err) => {
            context.stats.validation_errors.fetch_add(1, Ordering::Relaxed);
            return (400, error_body(&err.to_string()));
        }
    };

    if !context.limiter.allow_request(client_id) {
        context.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
        return (429, error_body("rate limit exceeded"));
    }

    let accepted = metrics.len();
    let task = WriteTask {
        batch: MetricBatch::new(client_id.to_string(), metrics),
    };
    match context
        .tasks
        .send_timeout(task, context.config.producer_timeout)
    {
        Ok(()) => {
            context
                .stats
                .total_received
                .fetch_add(accepted as u64, Ordering::Relaxed);
            context.stats.batches_processed.fetch_add(1, Ordering::Relaxed);
            (
                200,
                json_body(&json!({ "success": true, "metrics_processed": accepted })),
            )
        }
        Err(_) => {
            let shed = context
                .stats
                .backpressure_rejections
                .fetch_add(1, Ordering::Relaxed)
                + 1;
            // Saturation is steady-state noise once it starts; log the
            // first occurrence and then sample.
            if shed == 1 || shed % 1024 == 0 {
                warn!(total_shed = shed, "writer queue saturated, shedding requests");
            }
            (503, error_body("ingestion queue saturated"))
        }
    }
}

fn handle_health(context: &ServerContext) -> (u16, Vec<u8>) {
    if context.health.is_degraded() {
        (503, json_body(&json!({ "status": "degraded" })))
    } else {
        let uptime_ms = context.started_at.elapsed().as_millis() as u64;
        (200, json_body(&json!({ "status": "ok", "uptime_ms": uptime_ms })))
    }
}

fn handle_counters(context: &ServerContext) -> (u16, Vec<u8>) {
    match serde_json::to_vec(&context.stats.snapshot()) {
        Ok(body) => (200, body),
        Err(_) => (500, error_body("snapshot serialization failed")),
    }
}

fn sweeper_loop(limiter: Arc<RateLimiter>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        for _ in 0..SWEEP_INTERVAL_SECS {
            if !running.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(Duration::from_secs(1));
        }
        let removed = limiter.sweep();
        if removed > 0 {
            debug!(removed, "swept idle client windows");
        }
    }
}

fn error_body(message: &str) -> Vec<u8> {
    json_body(&json!({ "success": false, "error": message }))
}

fn json_body(value: &serde_json::Value) -> Vec<u8> {
    value.to_string().into_bytes()
}
