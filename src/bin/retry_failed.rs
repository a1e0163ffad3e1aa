use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use callvault_indexer::config::{DatabaseArgs, WorkerTriggerArgs};
use callvault_indexer::{logging, JobManager, JobStore, PgStore};
use clap::Parser;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "retry-failed",
    about = "Requeue a job's failed recordings and trigger the worker"
)]
struct RetryCli {
    /// Job whose failed entries should be retried
    job_id: Uuid,

    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    worker: WorkerTriggerArgs,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    logging::init("info");
    let cli = RetryCli::parse();
    let store = Arc::new(
        PgStore::connect(&cli.database.database_url, cli.database.tables()?)
            .await
            .context("failed to open call store")?,
    );

    let Some(job) = store.job(cli.job_id).await? else {
        eprintln!("job {} not found", cli.job_id);
        return Ok(ExitCode::FAILURE);
    };
    println!(
        "Job {} is {} ({} completed, {} failed of {})",
        job.id, job.status, job.queue_completed, job.queue_failed, job.queue_total
    );

    let trigger = Arc::new(cli.worker.trigger()?);
    let manager = JobManager::new(store, trigger);
    let summary = manager
        .requeue_failed(cli.job_id, cli.worker.worker_batch_size.max(1))
        .await?;

    if summary.requeued == 0 {
        println!("No failed recordings to retry.");
        return Ok(ExitCode::SUCCESS);
    }
    println!("Requeued {} recording(s).", summary.requeued);
    if summary.triggered {
        println!("Worker triggered.");
    } else {
        println!("Worker could not be reached; the sweep will pick the job up.");
    }
    Ok(ExitCode::SUCCESS)
}
