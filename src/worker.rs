//! Per-recording indexing and the queue worker that drives it.
//!
//! [`RecordingIndexer`] turns one recording into chunk rows: call metadata,
//! ordered segments, chunking, embedding, then a full replace of the stored
//! chunks. [`QueueWorker`] claims a job's pending entries, indexes each one in
//! isolation, records the outcome and finalizes the job once its queue drains.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunker::{chunk_transcript, ChunkingConfig};
use crate::embedder::{embed_texts, Embedder};
use crate::error::{PipelineError, RecordingError};
use crate::job::{EntryOutcome, JobStatus, QueueEntry};
use crate::rate_limiter::{RateLimiter, RequestGate, ScopedLimits};
use crate::store::{IndexStore, Store};
use crate::transcript::ChunkRow;

/// Stop claiming work after this long inside one invocation.
pub const DEFAULT_TIME_BUDGET: Duration = Duration::from_secs(90);
/// Claims older than this are considered abandoned by the sweep.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Indexes single recordings against an [`IndexStore`].
pub struct RecordingIndexer<S: ?Sized> {
    store: Arc<S>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    limits: Option<(RateLimiter, ScopedLimits)>,
}

impl<S> RecordingIndexer<S>
where
    S: IndexStore + ?Sized,
{
    /// Indexer without rate limiting.
    pub fn new(store: Arc<S>, embedder: Arc<dyn Embedder>, chunking: ChunkingConfig) -> Self {
        Self {
            store,
            embedder,
            chunking,
            limits: None,
        }
    }

    /// Throttles embedding requests by the global and per-user ceilings.
    pub fn with_rate_limits(mut self, limiter: RateLimiter, limits: ScopedLimits) -> Self {
        self.limits = Some((limiter, limits));
        self
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn gate(&self, user_id: Uuid) -> RequestGate {
        match &self.limits {
            Some((limiter, limits)) => limiter.gate_for_user(user_id, limits),
            None => RequestGate::unlimited(),
        }
    }

    /// Rebuilds every chunk of one recording. Returns the rows written.
    ///
    /// A transcript with no non-blank text writes nothing and is not an error.
    pub async fn index_recording(
        &self,
        user_id: Uuid,
        recording_id: i64,
    ) -> Result<usize, RecordingError> {
        let call = self
            .store
            .call_metadata(user_id, recording_id)
            .await
            .map_err(RecordingError::Metadata)?
            .ok_or(RecordingError::CallNotFound(recording_id))?;
        let segments = self
            .store
            .transcript_segments(user_id, recording_id)
            .await
            .map_err(RecordingError::Segments)?;

        let chunks = chunk_transcript(&segments, &self.chunking);
        if chunks.is_empty() {
            debug!(recording_id, segments = segments.len(), "transcript has no text to index");
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = embed_texts(self.embedder.as_ref(), &texts, &self.gate(user_id)).await?;
        let embedded_at = Utc::now();
        let rows: Vec<ChunkRow> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| {
                ChunkRow::assemble(user_id, &call, chunk, &segments, vector, embedded_at)
            })
            .collect();

        self.store
            .replace_chunks(user_id, recording_id, &rows)
            .await
            .map_err(RecordingError::Insert)
    }

    /// Indexes each recording in turn, collecting failures instead of stopping.
    pub async fn index_all(&self, user_id: Uuid, recording_ids: &[i64]) -> InlineReport {
        let mut report = InlineReport::default();
        for (idx, &recording_id) in recording_ids.iter().enumerate() {
            match self.index_recording(user_id, recording_id).await {
                Ok(chunks) => {
                    report.processed += 1;
                    report.chunks_created += chunks;
                    info!(
                        recording_id,
                        chunks,
                        done = idx + 1,
                        total = recording_ids.len(),
                        "indexed recording"
                    );
                }
                Err(source) => {
                    let err = PipelineError::Recording {
                        recording_id,
                        source,
                    };
                    warn!(error = %err, "inline indexing failed");
                    report.failures.push(RecordingFailure {
                        recording_id,
                        error: err.to_string(),
                    });
                }
            }
        }
        report
    }
}

/// One recording that could not be indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingFailure {
    /// Recording id.
    pub recording_id: i64,
    /// Failure message, naming the recording.
    pub error: String,
}

/// Outcome of an inline (queue-less) run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineReport {
    /// Recordings indexed successfully, including empty transcripts.
    pub processed: usize,
    /// Chunk rows written.
    pub chunks_created: usize,
    /// Recordings that failed, in processing order.
    pub failures: Vec<RecordingFailure>,
}

impl InlineReport {
    /// True when no recording failed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Queue worker tuning.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Stop starting new entries after this long.
    pub time_budget: Duration,
    /// Age at which a `processing` claim is considered abandoned.
    pub stale_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            time_budget: DEFAULT_TIME_BUDGET,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

/// Result of one worker invocation on one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Random id for correlating logs of this invocation.
    pub worker_id: Uuid,
    /// Job worked on.
    pub job_id: Uuid,
    /// Origin tag from the request.
    pub triggered_by: String,
    /// Entries completed.
    pub processed: usize,
    /// Entries failed.
    pub failed: usize,
    /// Claimed entries handed back unstarted.
    pub released: usize,
    /// Chunk rows written.
    pub chunks_created: usize,
    /// Wall time of the invocation.
    pub duration_ms: u64,
    /// Entries of the job still `pending` afterwards.
    pub pending_remaining: i64,
    /// Job status afterwards.
    pub job_status: JobStatus,
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Abandoned claims returned to `pending`.
    pub released_stale: u64,
    /// One report per job that had pending entries.
    pub jobs: Vec<WorkerReport>,
    /// Drained jobs moved to a terminal status, with that status.
    pub finalized: Vec<(Uuid, JobStatus)>,
}

/// Claims and processes queue entries.
pub struct QueueWorker<S: ?Sized> {
    indexer: RecordingIndexer<S>,
    config: WorkerConfig,
}

impl<S> QueueWorker<S>
where
    S: Store + ?Sized,
{
    /// Worker over `indexer`'s store.
    pub fn new(indexer: RecordingIndexer<S>, config: WorkerConfig) -> Self {
        Self { indexer, config }
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<S> {
        self.indexer.store()
    }

    /// Claims up to `batch_size` entries of `job_id` and processes them.
    ///
    /// Each recording succeeds or fails on its own. The job is finalized when
    /// no entry is left open.
    pub async fn process_job(
        &self,
        job_id: Uuid,
        batch_size: usize,
        triggered_by: &str,
    ) -> Result<WorkerReport, PipelineError> {
        let started = Instant::now();
        let worker_id = Uuid::new_v4();
        let store = self.store();
        let job = store
            .job(job_id)
            .await?
            .ok_or(PipelineError::UnknownJob(job_id))?;
        info!(%worker_id, %job_id, triggered_by, "worker starting");

        let mut report = WorkerReport {
            worker_id,
            job_id,
            triggered_by: triggered_by.to_string(),
            processed: 0,
            failed: 0,
            released: 0,
            chunks_created: 0,
            duration_ms: 0,
            pending_remaining: 0,
            job_status: job.status,
        };

        if !job.status.is_terminal() {
            let claimed = store
                .claim_entries(job_id, batch_size.max(1), Utc::now())
                .await?;
            debug!(%worker_id, claimed = claimed.len(), "claimed entries");
            self.work_claimed(&claimed, started, &mut report).await?;
        }

        let counts = store.queue_counts(job_id).await?;
        report.pending_remaining = counts.pending;
        if counts.open() == 0 {
            if let Some(status) = store.finalize_job(job_id, Utc::now()).await? {
                info!(%job_id, %status, "job finalized");
            }
        }
        report.job_status = store
            .job(job_id)
            .await?
            .map(|job| job.status)
            .unwrap_or(report.job_status);
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            %worker_id,
            %job_id,
            processed = report.processed,
            failed = report.failed,
            chunks = report.chunks_created,
            pending = report.pending_remaining,
            duration_ms = report.duration_ms,
            "worker finished"
        );
        Ok(report)
    }

    async fn work_claimed(
        &self,
        claimed: &[QueueEntry],
        started: Instant,
        report: &mut WorkerReport,
    ) -> Result<(), PipelineError> {
        for (idx, entry) in claimed.iter().enumerate() {
            if started.elapsed() >= self.config.time_budget {
                let unstarted = &claimed[idx..];
                warn!(
                    worker_id = %report.worker_id,
                    remaining = unstarted.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "time budget spent; releasing unstarted entries"
                );
                self.release(unstarted).await?;
                report.released = unstarted.len();
                break;
            }

            let outcome = match self
                .indexer
                .index_recording(entry.user_id, entry.recording_id)
                .await
            {
                Ok(chunks) => EntryOutcome::Completed { chunks },
                Err(err) => {
                    warn!(
                        job_id = %entry.job_id,
                        recording_id = entry.recording_id,
                        attempts = entry.attempts,
                        error = %err,
                        "recording failed"
                    );
                    EntryOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };

            match self.store().record_outcome(entry, &outcome, Utc::now()).await {
                Ok(true) => match outcome {
                    EntryOutcome::Completed { chunks } => {
                        report.processed += 1;
                        report.chunks_created += chunks;
                    }
                    EntryOutcome::Failed { .. } => report.failed += 1,
                },
                Ok(false) => {
                    debug!(entry_id = %entry.id, "entry no longer claimed; outcome dropped");
                }
                Err(err) => {
                    if let Err(release_err) = self.release(&claimed[idx + 1..]).await {
                        error!(error = %release_err, "could not release unstarted entries");
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    async fn release(&self, entries: &[QueueEntry]) -> Result<(), PipelineError> {
        if entries.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = entries.iter().map(|entry| entry.id).collect();
        self.store().release_entries(&ids).await?;
        Ok(())
    }

    /// Recovers abandoned claims, works every job with pending entries once,
    /// and finalizes drained jobs.
    pub async fn sweep(&self, batch_size: usize) -> Result<SweepReport, PipelineError> {
        let store = self.store();
        let stale = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let released_stale = store.release_stale_claims(Utc::now() - stale).await?;
        if released_stale > 0 {
            warn!(released = released_stale, "released abandoned claims");
        }

        let mut report = SweepReport {
            released_stale,
            ..SweepReport::default()
        };
        for job in store.open_jobs().await? {
            let counts = store.queue_counts(job.id).await?;
            if counts.pending > 0 {
                match self.process_job(job.id, batch_size, "sweep").await {
                    Ok(job_report) => report.jobs.push(job_report),
                    Err(err) => error!(job_id = %job.id, error = %err, "sweep could not process job"),
                }
            } else if counts.open() == 0 {
                if let Some(status) = store.finalize_job(job.id, Utc::now()).await? {
                    info!(job_id = %job.id, %status, "job finalized by sweep");
                    report.finalized.push((job.id, status));
                }
            }
        }
        Ok(report)
    }
}
