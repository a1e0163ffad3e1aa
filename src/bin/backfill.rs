use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use callvault_indexer::config::{DatabaseArgs, WorkerTriggerArgs};
use callvault_indexer::manager::{BackfillOptions, DEFAULT_JOB_BATCH_SIZE};
use callvault_indexer::trigger::NoopTrigger;
use callvault_indexer::{logging, BackfillPlanner, JobManager, PgStore, WorkerTrigger};
use clap::Parser;
use uuid::Uuid;

const SAMPLE_SIZE: usize = 10;

#[derive(Parser, Debug)]
#[command(
    name = "backfill",
    about = "Queue embedding jobs for every transcribed call that has no chunks yet"
)]
struct BackfillCli {
    /// User whose calls should be indexed
    user_id: Uuid,

    /// Recordings per job
    #[arg(long, default_value_t = DEFAULT_JOB_BATCH_SIZE)]
    batch_size: usize,

    /// Plan only: print what would be queued without creating jobs
    #[arg(long)]
    dry_run: bool,

    /// Create jobs without calling the worker; the sweep picks them up
    #[arg(long)]
    skip_trigger: bool,

    /// Milliseconds to wait between job submissions
    #[arg(long, default_value_t = 1_000)]
    batch_delay_ms: u64,

    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    worker: WorkerTriggerArgs,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    logging::init("info");
    let cli = BackfillCli::parse();
    let batch_size = cli.batch_size.max(1);

    println!("Embedding backfill");
    println!("  user:       {}", cli.user_id);
    println!("  batch size: {batch_size}");
    println!(
        "  mode:       {}",
        if cli.dry_run { "dry run" } else { "live" }
    );
    println!();

    let store = Arc::new(
        PgStore::connect(&cli.database.database_url, cli.database.tables()?)
            .await
            .context("failed to open call store")?,
    );
    let plan = BackfillPlanner::new(store.as_ref())
        .plan_with_coverage(cli.user_id)
        .await?;
    let coverage = plan.coverage;

    println!("Calls with transcripts: {}", coverage.total);
    println!(
        "Already embedded:       {} ({:.1}%)",
        coverage.indexed, coverage.percent
    );
    println!("Missing embeddings:     {}", plan.missing.len());

    if plan.missing.is_empty() {
        println!();
        println!("All transcribed calls already have embeddings. Nothing to do.");
        return Ok(ExitCode::SUCCESS);
    }

    let batches = plan.missing.len().div_ceil(batch_size);
    println!("Will create {batches} batch(es) of up to {batch_size} recordings each");
    println!();

    if cli.dry_run {
        println!(
            "Dry run: would queue {} recordings in {batches} batches",
            plan.missing.len()
        );
        println!("Sample recording IDs:");
        for id in plan.missing.iter().take(SAMPLE_SIZE) {
            println!("  - {id}");
        }
        if plan.missing.len() > SAMPLE_SIZE {
            println!("  ... and {} more", plan.missing.len() - SAMPLE_SIZE);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let trigger: Arc<dyn WorkerTrigger> = if cli.skip_trigger {
        Arc::new(NoopTrigger)
    } else {
        Arc::new(cli.worker.trigger()?)
    };
    let manager = JobManager::new(store, trigger);
    let options = BackfillOptions {
        job_batch_size: batch_size,
        inter_batch_delay: Duration::from_millis(cli.batch_delay_ms),
        worker_batch_size: cli.worker.worker_batch_size.max(1),
        triggered_by: "backfill-script".to_string(),
    };
    let summary = manager
        .backfill(cli.user_id, &plan.missing, &options)
        .await;

    let expected = if coverage.total == 0 {
        0.0
    } else {
        (coverage.indexed + summary.queued) as f64 / coverage.total as f64 * 100.0
    };

    println!();
    println!("Backfill summary");
    println!("  recordings queued:       {}", summary.queued);
    println!("  successful job batches:  {}", summary.successful_job_batches);
    println!("  failed job batches:      {}", summary.failed_job_batches);
    if !summary.job_ids.is_empty() {
        println!("  job ids:");
        for job_id in &summary.job_ids {
            let note = if summary.untriggered_jobs.contains(job_id) {
                " (not triggered; left for sweep)"
            } else {
                ""
            };
            println!("    - {job_id}{note}");
        }
    }
    for failed in &summary.failed_batches {
        println!(
            "  batch {} failed ({} recordings): {}",
            failed.batch,
            failed.recording_ids.len(),
            failed.error
        );
        println!("    recordings: {:?}", failed.recording_ids);
    }
    println!("  expected coverage after processing: {expected:.1}%");
    println!();
    println!("Next steps:");
    println!("  - watch progress with: backfill-progress {} --watch", cli.user_id);
    println!("  - retry failures with: retry-failed <job_id>");

    if summary.has_failures() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
