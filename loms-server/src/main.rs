//! loms-server: HTTP/JSON gateway and outbox processor for LOMS.
//!
//! Configuration comes from the environment (a `.env` file is honoured) and
//! the command line. Shard databases are read from `DATABASE_MASTER_URL_<i>`
//! and `DATABASE_REPLICA_URL_<i>`.

mod http;
mod kafka;
mod publisher;

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use loms::seed::load_stock_seed;
use loms::{
    BusConfig, BusKind, DatabaseConfig, LomsApi, LomsConfig, MaxConnections, MessagePublisher,
    OrderLifecycleService, OrderRepository, OutboxConfig, OutboxProcessor, PoolConfig,
    RetryingPublisher, ShardConfig, StockRepository, StockReservationEngine, TransactionManager,
};
use loms_memory::MemoryCluster;
use loms_postgres::PostgresCluster;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::kafka::KafkaPublisher;
use crate::publisher::LogPublisher;

/// Storage the server runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// One PostgreSQL primary (and optional replica) per shard.
    Postgres,
    /// Process-local tables; nothing survives a restart.
    Memory,
}

/// Where outbox events are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Bus {
    /// Kafka cluster reached through `--kafka-brokers`.
    Kafka,
    /// Log every message instead of sending it.
    Log,
}

impl From<Bus> for BusKind {
    fn from(bus: Bus) -> Self {
        match bus {
            Bus::Kafka => Self::Kafka,
            Bus::Log => Self::Log,
        }
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Order and inventory service.
#[derive(Debug, Parser)]
#[command(name = "loms-server", version, about)]
struct Cli {
    /// Storage backend
    #[arg(long, env = "LOMS_BACKEND", value_enum, default_value_t = Backend::Postgres)]
    backend: Backend,

    /// Number of shards
    #[arg(long, env = "SHARD_COUNT", default_value_t = 1)]
    shard_count: usize,

    /// HTTP listen address
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8081")]
    http_addr: String,

    /// Milliseconds between outbox ticks
    #[arg(long, env = "INTERVAL_OUTBOX_MS", default_value_t = 1000)]
    outbox_interval_ms: u64,

    /// Events drained per shard per tick
    #[arg(long, env = "OUTBOX_BATCH_SIZE", default_value_t = 10)]
    outbox_batch_size: usize,

    /// Topic order events are published to
    #[arg(long, env = "KAFKA_TOPIC", default_value = "loms.order-events")]
    topic: String,

    /// Message bus for outbox events
    #[arg(long, env = "LOMS_BUS", value_enum, default_value_t = Bus::Kafka)]
    bus: Bus,

    /// Kafka bootstrap brokers, comma separated
    #[arg(
        long,
        env = "KAFKA_BROKERS",
        value_delimiter = ',',
        default_value = "localhost:9092"
    )]
    kafka_brokers: Vec<String>,

    /// Retries after a failed publish
    #[arg(long, env = "KAFKA_RETRY_MAX", default_value_t = 3)]
    retry_max: u32,

    /// Connections per database pool
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value = "10")]
    max_connections: NonZeroU32,

    /// JSON stock seed loaded at startup
    #[arg(long, env = "STOCK_SEED_PATH")]
    stock_seed_path: Option<PathBuf>,

    /// Log line format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Cli {
    fn config(&self) -> Result<LomsConfig> {
        let shards = match self.backend {
            Backend::Postgres => {
                ShardConfig::from_lookup(self.shard_count, |name| std::env::var(name).ok())?
            }
            Backend::Memory => (0..self.shard_count)
                .map(|shard| ShardConfig {
                    primary: DatabaseConfig {
                        url: format!("memory://shard-{shard}"),
                    },
                    replica: None,
                })
                .collect(),
        };

        let config = LomsConfig {
            shards,
            pool: PoolConfig {
                max_connections: MaxConnections::new(self.max_connections),
                ..PoolConfig::default()
            },
            outbox: OutboxConfig {
                interval: Duration::from_millis(self.outbox_interval_ms),
                batch_size: self.outbox_batch_size,
                topic: self.topic.clone(),
            },
            bus: BusConfig {
                kind: self.bus.into(),
                brokers: self.kafka_brokers.clone(),
                retry_max: self.retry_max,
            },
            stock_seed_path: self.stock_seed_path.clone(),
            http_addr: self.http_addr.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = cli.config().context("invalid configuration")?;
    info!(
        backend = ?cli.backend,
        bus = ?cli.bus,
        shards = config.shards.len(),
        "[server.start] starting loms"
    );
    let publisher = connect_publisher(&config).await?;

    match cli.backend {
        Backend::Postgres => {
            let cluster = PostgresCluster::connect(&config.shards, &config.pool)
                .await
                .context("failed to connect to shard databases")?;
            cluster.migrate().await.context("failed to apply migrations")?;
            serve(
                &config,
                cluster.order_repository(),
                cluster.stock_repository(),
                cluster.transaction_manager(),
                publisher,
            )
            .await
        }
        Backend::Memory => {
            let cluster = MemoryCluster::new(config.shards.len())?;
            serve(
                &config,
                cluster.order_repository(),
                cluster.stock_repository(),
                cluster.transaction_manager(),
                publisher,
            )
            .await
        }
    }
}

async fn connect_publisher(config: &LomsConfig) -> Result<Arc<dyn MessagePublisher>> {
    match config.bus.kind {
        BusKind::Kafka => {
            let producer = KafkaPublisher::connect(&config.bus.brokers, &config.outbox.topic)
                .await
                .context("failed to start kafka producer")?;
            Ok(Arc::new(producer))
        }
        BusKind::Log => Ok(Arc::new(LogPublisher)),
    }
}

async fn serve<O, S, T>(
    config: &LomsConfig,
    orders: O,
    stocks: S,
    transactions: T,
    publisher: Arc<dyn MessagePublisher>,
) -> Result<()>
where
    O: OrderRepository + 'static,
    S: StockRepository + 'static,
    T: TransactionManager + 'static,
{
    let stocks = Arc::new(stocks);
    if let Some(path) = &config.stock_seed_path {
        load_stock_seed(stocks.as_ref(), path)
            .await
            .with_context(|| format!("failed to load stock seed {}", path.display()))?;
    }

    let engine = StockReservationEngine::new(stocks);
    let lifecycle = OrderLifecycleService::new(Arc::new(orders), engine.clone());
    let api = LomsApi::new(lifecycle, engine);

    let shutdown = CancellationToken::new();
    let processor = OutboxProcessor::new(
        Arc::new(transactions),
        Arc::new(RetryingPublisher::new(publisher, config.bus.retry_max)),
        config.outbox.clone(),
    );
    let processor_shutdown = shutdown.clone();
    let processor_handle = tokio::spawn(async move { processor.run(processor_shutdown).await });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "[server.signal] failed to listen for ctrl-c");
        }
        info!("[server.signal] shutting down");
        signal_shutdown.cancel();
    });

    let listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    info!(addr = %config.http_addr, "[server.listen] http listening");

    let served = axum::serve(listener, http::router(api))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;

    shutdown.cancel();
    processor_handle.await.context("outbox processor panicked")?;
    served.context("http server failed")?;
    info!("[server.stop] stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use loms::ConfigError;

    #[test]
    fn memory_backend_needs_no_database_urls() {
        let cli = Cli::parse_from(["loms-server", "--backend", "memory", "--shard-count", "3"]);
        let config = cli.config().expect("valid");
        assert_eq!(config.shards.len(), 3);
        assert_eq!(config.outbox.interval, Duration::from_secs(1));
        assert_eq!(config.bus.retry_max, 3);
        assert_eq!(config.bus.kind, BusKind::Kafka);
        assert_eq!(config.bus.brokers, vec!["localhost:9092".to_owned()]);
    }

    #[test]
    fn kafka_brokers_are_split_on_commas() {
        let cli = Cli::parse_from([
            "loms-server",
            "--backend",
            "memory",
            "--kafka-brokers",
            "kafka-0:9092,kafka-1:9092",
        ]);
        let config = cli.config().expect("valid");
        assert_eq!(config.bus.brokers, vec!["kafka-0:9092", "kafka-1:9092"]);
    }

    #[test]
    fn kafka_bus_without_brokers_is_rejected() {
        let cli = Cli::parse_from(["loms-server", "--backend", "memory", "--kafka-brokers", ""]);
        let error = cli.config().unwrap_err();
        assert_eq!(error.downcast_ref::<ConfigError>(), Some(&ConfigError::NoBrokers));

        let cli = Cli::parse_from([
            "loms-server",
            "--backend",
            "memory",
            "--bus",
            "log",
            "--kafka-brokers",
            "",
        ]);
        assert_eq!(cli.config().expect("valid").bus.kind, BusKind::Log);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let cli = Cli::parse_from([
            "loms-server",
            "--backend",
            "memory",
            "--outbox-batch-size",
            "0",
        ]);
        assert!(cli.config().is_err());
    }

    #[test]
    fn zero_outbox_interval_is_rejected() {
        let cli = Cli::parse_from([
            "loms-server",
            "--backend",
            "memory",
            "--bus",
            "log",
            "--outbox-interval-ms",
            "0",
        ]);
        let error = cli.config().unwrap_err();
        assert_eq!(
            error.downcast_ref::<ConfigError>(),
            Some(&ConfigError::ZeroInterval)
        );
    }

    #[test]
    fn zero_max_connections_fails_to_parse() {
        let parsed = Cli::try_parse_from(["loms-server", "--max-connections", "0"]);
        assert!(parsed.is_err());
    }
}
