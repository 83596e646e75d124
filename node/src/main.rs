use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use config::Config;
use metrion_ingest::{IngestConfig, IngestServer};
use metrion_queue::{
    BrokerConfig, BrokerProducer, FsyncPolicy, PartitionedQueue, QueueBackend,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Mode {
    /// Local file-backed partitions under the queue directory.
    File,
    /// Forward records to an external broker.
    Broker,
}

#[derive(Debug, Parser)]
#[command(name = "metrion-node", version, about = "Metrion metrics ingestion node")]
struct Args {
    /// TCP port the ingestion listener binds.
    port: u16,
    /// Queue backend selection.
    #[arg(value_enum)]
    mode: Mode,
    /// Broker bootstrap servers, `host:port[,host:port…]` (broker mode).
    bootstrap: Option<String>,
    /// Broker topic (broker mode).
    topic: Option<String>,
}

/// Tunables loaded from `METRION_*` environment variables, with production
/// defaults. The CLI carries only what varies per invocation.
#[derive(Debug, Clone)]
struct AppConfig {
    host: String,
    workers: usize,
    rate_limit: usize,
    partitions: u32,
    queue_dir: String,
    writer_queue_capacity: usize,
    producer_timeout_ms: u64,
    read_timeout_secs: u64,
    fsync: String,
    log_level: String,
    log_format: String,
}

impl AppConfig {
    fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(config::Environment::with_prefix("METRION"))
            .build()?;

        Ok(Self {
            host: config
                .get_string("HOST")
                .unwrap_or_else(|_| "0.0.0.0".to_string()),
            workers: config
                .get_string("WORKERS")
                .unwrap_or_else(|_| "16".to_string())
                .parse()?,
            rate_limit: config
                .get_string("RATE_LIMIT")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()?,
            partitions: config
                .get_string("PARTITIONS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()?,
            queue_dir: config
                .get_string("QUEUE_DIR")
                .unwrap_or_else(|_| "./data/queue".to_string()),
            writer_queue_capacity: config
                .get_string("WRITER_QUEUE_CAPACITY")
                .unwrap_or_else(|_| "8192".to_string())
                .parse()?,
            producer_timeout_ms: config
                .get_string("PRODUCER_TIMEOUT_MS")
                .unwrap_or_else(|_| "50".to_string())
                .parse()?,
            read_timeout_secs: config
                .get_string("READ_TIMEOUT_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,
            fsync: config
                .get_string("FSYNC")
                .unwrap_or_else(|_| "always".to_string()),
            log_level: config
                .get_string("LOG_LEVEL")
                .unwrap_or_else(|_| "info".to_string()),
            log_format: config
                .get_string("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string()),
        })
    }
}

/// `always`, `every-n:<records>`, or `interval-ms:<millis>`.
fn parse_fsync_policy(raw: &str) -> Result<FsyncPolicy> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("always") {
        return Ok(FsyncPolicy::Always);
    }
    if let Some(count) = raw.strip_prefix("every-n:") {
        let count: u32 = count
            .parse()
            .with_context(|| format!("invalid fsync record count in {raw:?}"))?;
        return Ok(FsyncPolicy::EveryN(count));
    }
    if let Some(millis) = raw.strip_prefix("interval-ms:") {
        let millis: u64 = millis
            .parse()
            .with_context(|| format!("invalid fsync interval in {raw:?}"))?;
        return Ok(FsyncPolicy::Interval(Duration::from_millis(millis)));
    }
    bail!("unknown fsync policy {raw:?} (expected always, every-n:<k>, or interval-ms:<t>)")
}

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::load()?;
    init_logging(&config);

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            info!("shutdown signal received");
            running.store(false, Ordering::Release);
        })
        .context("installing signal handler")?;
    }

    let backend: Arc<dyn QueueBackend> = match args.mode {
        Mode::File => {
            let policy = parse_fsync_policy(&config.fsync)?;
            let queue = PartitionedQueue::open(&config.queue_dir, config.partitions, policy)
                .with_context(|| format!("opening local queue at {}", config.queue_dir))?;
            info!(
                queue_dir = %config.queue_dir,
                partitions = config.partitions,
                "file mode selected"
            );
            Arc::new(queue)
        }
        Mode::Broker => {
            let bootstrap = args
                .bootstrap
                .clone()
                .context("broker mode requires <broker-bootstrap>")?;
            let topic = args.topic.clone().context("broker mode requires <topic>")?;
            let producer = BrokerProducer::connect(BrokerConfig::new(
                bootstrap,
                topic,
                config.partitions,
            ))
            .context("creating broker producer")?;
            Arc::new(producer)
        }
    };

    let ingest_config = IngestConfig {
        worker_count: config.workers,
        max_requests_per_sec: config.rate_limit,
        writer_queue_capacity: config.writer_queue_capacity,
        producer_timeout: Duration::from_millis(config.producer_timeout_ms),
        read_timeout: Duration::from_secs(config.read_timeout_secs),
        ..IngestConfig::default()
    };

    let addr: SocketAddr = format!("{}:{}", config.host, args.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, args.port))?;
    let server = IngestServer::start(addr, ingest_config, Arc::clone(&backend), running)
        .with_context(|| format!("binding ingestion listener on {addr}"))?;

    info!(addr = %server.local_addr(), workers = config.workers, "metrion node is ready");
    server.join();

    if let Err(err) = backend.flush() {
        tracing::warn!(error = %err, "final backend flush failed");
    }
    drop(backend);
    info!("metrion node shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsync_policies_parse() {
        assert_eq!(parse_fsync_policy("always").unwrap(), FsyncPolicy::Always);
        assert_eq!(
            parse_fsync_policy("every-n:128").unwrap(),
            FsyncPolicy::EveryN(128)
        );
        assert_eq!(
            parse_fsync_policy("interval-ms:250").unwrap(),
            FsyncPolicy::Interval(Duration::from_millis(250))
        );
        assert!(parse_fsync_policy("sometimes").is_err());
    }

    #[test]
    fn cli_shape_matches_the_documented_surface() {
        use clap::CommandFactory;
        Args::command().debug_assert();

        let args = Args::try_parse_from(["metrion-node", "8080", "file"]).unwrap();
        assert_eq!(args.port, 8080);
        assert_eq!(args.mode, Mode::File);

        let args = Args::try_parse_from([
            "metrion-node",
            "8080",
            "broker",
            "localhost:9092",
            "metrics",
        ])
        .unwrap();
        assert_eq!(args.mode, Mode::Broker);
        assert_eq!(args.bootstrap.as_deref(), Some("localhost:9092"));
        assert_eq!(args.topic.as_deref(), Some("metrics"));

        assert!(Args::try_parse_from(["metrion-node", "8080", "sqlite"]).is_err());
    }
}
