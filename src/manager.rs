//! Job creation, batched backfill submission and failed-entry retry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::job::{EmbeddingJob, QueueEntry};
use crate::store::JobStore;
use crate::trigger::{ProcessRequest, WorkerTrigger};

/// Recordings per job when a backfill is split.
pub const DEFAULT_JOB_BATCH_SIZE: usize = 50;
/// Pause between job submissions.
pub const DEFAULT_INTER_BATCH_DELAY: Duration = Duration::from_secs(1);
/// Entries a triggered worker claims per invocation.
pub const DEFAULT_WORKER_BATCH_SIZE: usize = 10;

/// How a backfill is split and submitted.
#[derive(Debug, Clone)]
pub struct BackfillOptions {
    /// Recordings per job.
    pub job_batch_size: usize,
    /// Pause between job submissions.
    pub inter_batch_delay: Duration,
    /// `batch_size` sent with each trigger.
    pub worker_batch_size: usize,
    /// `triggered_by` sent with each trigger.
    pub triggered_by: String,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            job_batch_size: DEFAULT_JOB_BATCH_SIZE,
            inter_batch_delay: DEFAULT_INTER_BATCH_DELAY,
            worker_batch_size: DEFAULT_WORKER_BATCH_SIZE,
            triggered_by: "backfill".to_string(),
        }
    }
}

/// A group whose job could not be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedBatch {
    /// 1-based batch number.
    pub batch: usize,
    /// Job id if the row was inserted before the failure.
    pub job_id: Option<Uuid>,
    /// Recordings in the group.
    pub recording_ids: Vec<i64>,
    /// Failure message.
    pub error: String,
}

/// Per-run backfill report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillSummary {
    /// Recordings placed on a queue.
    pub queued: usize,
    /// Groups whose job and queue entries were created.
    pub successful_job_batches: usize,
    /// Groups whose job could not be created.
    pub failed_job_batches: usize,
    /// Jobs created, in submission order.
    pub job_ids: Vec<Uuid>,
    /// Created jobs the worker trigger did not reach.
    pub untriggered_jobs: Vec<Uuid>,
    /// Details of failed groups.
    pub failed_batches: Vec<FailedBatch>,
}

impl BackfillSummary {
    /// True when any group failed to be created.
    pub fn has_failures(&self) -> bool {
        self.failed_job_batches > 0
    }
}

/// Result of requeueing a job's failed entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequeueSummary {
    /// Entries moved back to `pending`.
    pub requeued: u64,
    /// Whether the worker accepted the follow-up trigger.
    pub triggered: bool,
}

/// Creates jobs and hands them to the worker.
pub struct JobManager<S: ?Sized, T: ?Sized> {
    store: Arc<S>,
    trigger: Arc<T>,
}

impl<S, T> JobManager<S, T>
where
    S: JobStore + ?Sized,
    T: WorkerTrigger + ?Sized,
{
    /// Manager over `store`, triggering through `trigger`.
    pub fn new(store: Arc<S>, trigger: Arc<T>) -> Self {
        Self { store, trigger }
    }

    /// Inserts a `running` job and one `pending` entry per recording.
    ///
    /// If the entries cannot be inserted the job is marked `failed` before returning.
    pub async fn create_job(
        &self,
        user_id: Uuid,
        recording_ids: &[i64],
    ) -> Result<Uuid, PipelineError> {
        let now = Utc::now();
        let job = EmbeddingJob::new(user_id, recording_ids.to_vec(), now);
        self.store
            .insert_job(&job)
            .await
            .map_err(|cause| PipelineError::JobCreation {
                job_id: None,
                cause,
            })?;

        let entries: Vec<QueueEntry> = recording_ids
            .iter()
            .map(|&recording_id| QueueEntry::new(&job, recording_id, now))
            .collect();
        if let Err(cause) = self.store.insert_queue_entries(&entries).await {
            let message = format!("failed to enqueue recordings: {cause:#}");
            if let Err(mark_err) = self.store.fail_job(job.id, &message, Utc::now()).await {
                error!(job_id = %job.id, error = %mark_err, "could not mark orphaned job failed");
            }
            return Err(PipelineError::JobCreation {
                job_id: Some(job.id),
                cause,
            });
        }
        info!(job_id = %job.id, recordings = recording_ids.len(), "created embedding job");
        Ok(job.id)
    }

    /// Splits `recording_ids` into jobs, triggering the worker for each.
    ///
    /// Creation failures are recorded and the run moves on to the next group.
    /// Trigger failures are logged only; the sweep picks those jobs up.
    pub async fn backfill(
        &self,
        user_id: Uuid,
        recording_ids: &[i64],
        options: &BackfillOptions,
    ) -> BackfillSummary {
        let mut summary = BackfillSummary::default();
        let group_size = options.job_batch_size.max(1);
        let total_batches = recording_ids.len().div_ceil(group_size);

        for (idx, group) in recording_ids.chunks(group_size).enumerate() {
            let batch = idx + 1;
            info!(batch, total_batches, recordings = group.len(), "submitting batch");
            match self.create_job(user_id, group).await {
                Ok(job_id) => {
                    summary.queued += group.len();
                    summary.successful_job_batches += 1;
                    summary.job_ids.push(job_id);
                    let request = ProcessRequest {
                        job_id,
                        batch_size: options.worker_batch_size,
                        triggered_by: options.triggered_by.clone(),
                    };
                    if let Err(err) = self.trigger.trigger(&request).await {
                        warn!(%job_id, error = %err, "worker trigger failed; job left for sweep");
                        summary.untriggered_jobs.push(job_id);
                    }
                }
                Err(err) => {
                    error!(batch, error = %err, "batch failed");
                    let job_id = match &err {
                        PipelineError::JobCreation { job_id, .. } => *job_id,
                        _ => None,
                    };
                    summary.failed_job_batches += 1;
                    summary.failed_batches.push(FailedBatch {
                        batch,
                        job_id,
                        recording_ids: group.to_vec(),
                        error: err.to_string(),
                    });
                }
            }
            if batch < total_batches && !options.inter_batch_delay.is_zero() {
                tokio::time::sleep(options.inter_batch_delay).await;
            }
        }
        summary
    }

    /// Moves a job's failed entries back to `pending` and triggers the worker.
    pub async fn requeue_failed(
        &self,
        job_id: Uuid,
        worker_batch_size: usize,
    ) -> Result<RequeueSummary, PipelineError> {
        let requeued = self.store.requeue_failed(job_id, Utc::now()).await?;
        if requeued == 0 {
            return Ok(RequeueSummary {
                requeued,
                triggered: false,
            });
        }
        info!(%job_id, requeued, "requeued failed entries");
        let request = ProcessRequest {
            job_id,
            batch_size: worker_batch_size,
            triggered_by: "retry".to_string(),
        };
        let triggered = match self.trigger.trigger(&request).await {
            Ok(()) => true,
            Err(err) => {
                warn!(%job_id, error = %err, "worker trigger failed; job left for sweep");
                false
            }
        };
        Ok(RequeueSummary {
            requeued,
            triggered,
        })
    }
}
