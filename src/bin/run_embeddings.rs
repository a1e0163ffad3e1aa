use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use callvault_indexer::config::{ChunkingArgs, DatabaseArgs, EmbeddingArgs, RateLimitArgs};
use callvault_indexer::{logging, BackfillPlanner, PgStore, RecordingIndexer};
use clap::Parser;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "run-embeddings",
    about = "Index every missing recording inline, without jobs or a worker"
)]
struct RunCli {
    /// User whose calls should be indexed
    user_id: Uuid,

    /// Only process the first N missing recordings
    #[arg(long)]
    limit: Option<usize>,

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
async fn main() -> Result<ExitCode> {
    logging::init("info");
    let cli = RunCli::parse();

    let store = Arc::new(
        PgStore::connect(&cli.database.database_url, cli.database.tables()?)
            .await
            .context("failed to open call store")?,
    );
    let embedder = Arc::new(cli.embedding.build()?);
    let plan = BackfillPlanner::new(store.as_ref())
        .plan_with_coverage(cli.user_id)
        .await?;
    let mut missing = plan.missing;
    if let Some(limit) = cli.limit {
        missing.truncate(limit);
    }

    println!(
        "Coverage {:.1}% ({}/{}); indexing {} recording(s) with {}",
        plan.coverage.percent,
        plan.coverage.indexed,
        plan.coverage.total,
        missing.len(),
        embedder.model()
    );
    if missing.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }

    let indexer = RecordingIndexer::new(store, embedder, cli.chunking.config())
        .with_rate_limits(cli.rate.limiter(), cli.rate.limits());
    let report = indexer.index_all(cli.user_id, &missing).await;

    println!();
    println!("Processed: {}", report.processed);
    println!("Chunks:    {}", report.chunks_created);
    println!("Failed:    {}", report.failures.len());
    for failure in &report.failures {
        println!("  - {}", failure.error);
    }

    if report.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
