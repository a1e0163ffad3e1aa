use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use callvault_indexer::config::{ChunkingArgs, DatabaseArgs, EmbeddingArgs, RateLimitArgs};
use callvault_indexer::server::{self, AppState};
use callvault_indexer::worker::{DEFAULT_STALE_AFTER, DEFAULT_TIME_BUDGET};
use callvault_indexer::{logging, PgStore, QueueWorker, RecordingIndexer, Store, WorkerConfig};
use clap::Parser;
use tracing::info;

const DEFAULT_VECTOR_DIMS: usize = 1536;

#[derive(Parser, Debug)]
#[command(
    name = "embedding-worker",
    about = "HTTP worker that drains embedding queues and runs the stale-claim sweep"
)]
struct WorkerCli {
    /// Address to bind the HTTP server to (host:port)
    #[arg(long, env = "CALLVAULT_BIND", default_value = "127.0.0.1:8787")]
    bind: String,

    /// Run the sweep in-process every N seconds
    #[arg(long, env = "CALLVAULT_SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: Option<u64>,

    /// Entries claimed per job during a sweep
    #[arg(long, env = "CALLVAULT_SWEEP_BATCH", default_value_t = 10)]
    sweep_batch_size: usize,

    /// Seconds after which a worker stops starting new entries
    #[arg(long, default_value_t = DEFAULT_TIME_BUDGET.as_secs())]
    time_budget_secs: u64,

    /// Seconds after which a processing claim counts as abandoned
    #[arg(long, default_value_t = DEFAULT_STALE_AFTER.as_secs())]
    stale_after_secs: u64,

    /// Do not chain follow-up batches after a request
    #[arg(long)]
    no_chain: bool,

    /// Create the extension, tables and notify triggers if missing
    #[arg(long, env = "CALLVAULT_PREPARE_SCHEMA")]
    prepare_schema: bool,

    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    #[command(flatten)]
    rate: RateLimitArgs,

    #[command(flatten)]
    chunking: ChunkingArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info");
    let cli = WorkerCli::parse();

    let pg = PgStore::connect(&cli.database.database_url, cli.database.tables()?)
        .await
        .context("failed to open call store")?;
    if cli.prepare_schema {
        let dims = cli.embedding.openai_dimensions.unwrap_or(DEFAULT_VECTOR_DIMS);
        pg.ensure_schema(dims).await?;
        info!(dims, schema = pg.tables().schema(), "schema ready");
    }
    let store: Arc<dyn Store> = Arc::new(pg);

    let embedder = Arc::new(cli.embedding.build()?);
    let indexer = RecordingIndexer::new(store, embedder, cli.chunking.config())
        .with_rate_limits(cli.rate.limiter(), cli.rate.limits());
    let worker = Arc::new(QueueWorker::new(
        indexer,
        WorkerConfig {
            time_budget: Duration::from_secs(cli.time_budget_secs),
            stale_after: Duration::from_secs(cli.stale_after_secs.max(1)),
        },
    ));

    let _sweeper = cli.sweep_interval_secs.map(|secs| {
        info!(every_secs = secs, "in-process sweep enabled");
        server::spawn_sweeper(
            worker.clone(),
            Duration::from_secs(secs.max(1)),
            cli.sweep_batch_size.max(1),
        )
    });

    let state = AppState::new(worker, cli.sweep_batch_size).with_chaining(!cli.no_chain);
    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "embedding worker listening");
    server::serve(listener, state).await
}
