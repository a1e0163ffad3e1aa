use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use callvault_indexer::config::DatabaseArgs;
use callvault_indexer::reconciler::ReconcilerConfig;
use callvault_indexer::{
    logging, BackfillPlanner, JobStore, PgStore, SideEffect, SyncStateReconciler,
};
use chrono::Utc;
use clap::Parser;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

const BAR_WIDTH: usize = 40;
const SECS_PER_RECORDING: i64 = 30;
const STUCK_AFTER_MINUTES: i64 = 5;
const STUCK_LIMIT: usize = 10;
const FAILURE_LIMIT: usize = 5;
const JOB_LOOKBACK_DAYS: i64 = 7;

#[derive(Parser, Debug)]
#[command(
    name = "backfill-progress",
    about = "Report queue, job and coverage status for a user's embedding backfill"
)]
struct ProgressCli {
    /// User whose backfill should be inspected
    user_id: Uuid,

    /// Keep running: reprint the report and stream job completions
    #[arg(long)]
    watch: bool,

    /// Seconds between reports in watch mode
    #[arg(long, default_value_t = 10)]
    interval: u64,

    #[command(flatten)]
    database: DatabaseArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("warn");
    let cli = ProgressCli::parse();
    let store = Arc::new(
        PgStore::connect(&cli.database.database_url, cli.database.tables()?)
            .await
            .context("failed to open call store")?,
    );

    print_report(store.as_ref(), cli.user_id).await?;
    if !cli.watch {
        return Ok(());
    }

    let interval = Duration::from_secs(cli.interval.max(1));
    let (reconciler, mut effects) = SyncStateReconciler::new(
        store.clone(),
        cli.user_id,
        ReconcilerConfig {
            slow_poll: interval,
            ..ReconcilerConfig::default()
        },
    );
    let reconciler = reconciler
        .track_open_jobs()
        .await
        .context("failed to load open jobs")?;
    let reconciler = match PgStore::listen_job_events(&cli.database.database_url).await {
        Ok(events) => reconciler.with_realtime(events),
        Err(err) => {
            warn!(error = %err, "realtime unavailable; polling only");
            reconciler
        }
    };
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let driver = tokio::spawn(reconciler.run(async move {
        let _ = stop_rx.await;
    }));

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {
                println!();
                if let Err(err) = print_report(store.as_ref(), cli.user_id).await {
                    warn!("progress report failed, retrying next tick: {err:#}");
                }
            }
            effect = effects.recv() => match effect {
                Some(effect) => print_effect(&effect),
                None => break,
            },
        }
    }

    let _ = stop_tx.send(());
    let _ = driver.await;
    Ok(())
}

async fn print_report(store: &PgStore, user_id: Uuid) -> Result<()> {
    let now = Utc::now();
    println!("Embedding backfill progress for {user_id} at {}", now.format("%Y-%m-%d %H:%M:%S UTC"));

    let counts = store.user_queue_counts(user_id).await?;
    println!();
    println!("Queue");
    println!("  pending     {}", counts.pending);
    println!("  processing  {}", counts.processing);
    println!("  completed   {}", counts.completed);
    println!("  failed      {}", counts.failed);
    println!("  total       {}", counts.total());
    if counts.total() > 0 {
        let percent = counts.completed as f64 / counts.total() as f64 * 100.0;
        println!(
            "  [{}] {percent:.1}%",
            progress_bar(counts.completed, counts.total())
        );
    }
    if counts.open() > 0 {
        println!(
            "  estimated time remaining: {}",
            format_seconds(counts.open() * SECS_PER_RECORDING)
        );
    }

    let jobs = store
        .jobs_started_since(user_id, now - chrono::Duration::days(JOB_LOOKBACK_DAYS))
        .await?;
    println!();
    println!("Jobs (last {JOB_LOOKBACK_DAYS} days)");
    if jobs.is_empty() {
        println!("  none");
    }
    let mut by_status: BTreeMap<&str, (usize, i64)> = BTreeMap::new();
    for job in &jobs {
        let entry = by_status.entry(job.status.as_str()).or_default();
        entry.0 += 1;
        entry.1 += job.chunks_created;
    }
    for (status, (count, chunks)) in by_status {
        println!("  {status:<22} {count} job(s), {chunks} chunks");
    }

    let coverage = BackfillPlanner::new(store).coverage(user_id).await?;
    println!();
    println!(
        "Coverage: {}/{} calls embedded ({:.1}%)",
        coverage.indexed, coverage.total, coverage.percent
    );

    let cutoff = now - chrono::Duration::minutes(STUCK_AFTER_MINUTES);
    let stuck = store.stuck_entries(user_id, cutoff, STUCK_LIMIT).await?;
    if !stuck.is_empty() {
        println!();
        println!("Stuck in processing (> {STUCK_AFTER_MINUTES}m)");
        for entry in &stuck {
            let held = entry
                .locked_at
                .map(|locked| (now - locked).num_seconds())
                .unwrap_or_default();
            println!(
                "  recording {} in job {}: {} (attempts {})",
                entry.recording_id,
                entry.job_id,
                format_seconds(held),
                entry.attempts
            );
        }
    }

    let failures = store.recent_failures(user_id, FAILURE_LIMIT).await?;
    if !failures.is_empty() {
        println!();
        println!("Recent failures");
        for entry in &failures {
            println!(
                "  recording {} (attempts {}): {}",
                entry.recording_id,
                entry.attempts,
                entry.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    Ok(())
}

fn print_effect(effect: &SideEffect) {
    match effect {
        SideEffect::JobCompleted(job) => println!(
            "job {} finished: {} ({} completed, {} failed, {} chunks)",
            job.id, job.status, job.queue_completed, job.queue_failed, job.chunks_created
        ),
        SideEffect::RecordingsSynced {
            job_id,
            recording_ids,
        } => println!("job {job_id}: indexed {recording_ids:?}"),
        SideEffect::CompletedDismissed(_) | SideEffect::ScheduleDismissal { .. } => {}
    }
}

fn progress_bar(done: i64, total: i64) -> String {
    let filled = if total <= 0 {
        0
    } else {
        ((done.max(0) as f64 / total as f64) * BAR_WIDTH as f64).round() as usize
    }
    .min(BAR_WIDTH);
    format!("{}{}", "█".repeat(filled), "░".repeat(BAR_WIDTH - filled))
}

fn format_seconds(total: i64) -> String {
    let total = total.max(0);
    let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m {seconds}s")
    }
}
