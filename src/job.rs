//! Job and queue records plus their status state machines.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a bulk embedding job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created but not yet picked up.
    Pending,
    /// Queue entries are being processed.
    Running,
    /// Every entry completed.
    Completed,
    /// No entry completed and at least one failed, or the job could not be created.
    Failed,
    /// Some entries completed and some failed.
    CompletedWithErrors,
}

impl JobStatus {
    /// Database spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
        }
    }

    /// No further transition happens from a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::CompletedWithErrors
        )
    }

    /// Terminal status for a drained queue.
    pub fn from_counts(queue_completed: i64, queue_failed: i64) -> Self {
        match (queue_completed > 0, queue_failed > 0) {
            (false, true) => JobStatus::Failed,
            (true, true) => JobStatus::CompletedWithErrors,
            _ => JobStatus::Completed,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "pending" => JobStatus::Pending,
            "running" | "processing" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "completed_with_errors" => JobStatus::CompletedWithErrors,
            other => anyhow::bail!("unknown job status {other:?}"),
        })
    }
}

/// Lifecycle of one recording inside a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Chunks stored.
    Completed,
    /// Indexing failed; see `last_error`.
    Failed,
}

impl QueueStatus {
    /// Database spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    /// Still owes work.
    pub fn is_open(self) -> bool {
        matches!(self, QueueStatus::Pending | QueueStatus::Processing)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "pending" => QueueStatus::Pending,
            "processing" => QueueStatus::Processing,
            "completed" => QueueStatus::Completed,
            "failed" => QueueStatus::Failed,
            other => anyhow::bail!("unknown queue status {other:?}"),
        })
    }
}

/// Persisted `embedding_jobs` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingJob {
    /// Job id.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Recordings covered by the job.
    pub recording_ids: Vec<i64>,
    /// Current status.
    pub status: JobStatus,
    /// Recordings expected.
    pub progress_total: i64,
    /// Recordings finished, successfully or not.
    pub progress_current: i64,
    /// Chunk rows written so far.
    pub chunks_created: i64,
    /// Queue entries created.
    pub queue_total: i64,
    /// Queue entries completed.
    pub queue_completed: i64,
    /// Queue entries failed.
    pub queue_failed: i64,
    /// Creation time.
    pub started_at: DateTime<Utc>,
    /// Set once the job reaches a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last updated.
    pub updated_at: DateTime<Utc>,
    /// Failure summary.
    pub error_message: Option<String>,
}

impl EmbeddingJob {
    /// Fresh `running` job with zeroed counters.
    pub fn new(user_id: Uuid, recording_ids: Vec<i64>, now: DateTime<Utc>) -> Self {
        let total = recording_ids.len() as i64;
        Self {
            id: Uuid::new_v4(),
            user_id,
            recording_ids,
            status: JobStatus::Running,
            progress_total: total,
            progress_current: 0,
            chunks_created: 0,
            queue_total: total,
            queue_completed: 0,
            queue_failed: 0,
            started_at: now,
            completed_at: None,
            updated_at: now,
            error_message: None,
        }
    }

    /// Completion percentage of the queue.
    pub fn progress_percent(&self) -> f64 {
        if self.queue_total == 0 {
            return 100.0;
        }
        (self.queue_completed + self.queue_failed) as f64 / self.queue_total as f64 * 100.0
    }
}

/// Persisted `embedding_queue` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Entry id.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Parent job.
    pub job_id: Uuid,
    /// Recording to index.
    pub recording_id: i64,
    /// Current status.
    pub status: QueueStatus,
    /// Number of claims so far.
    pub attempts: i32,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// When the current claim was taken.
    pub locked_at: Option<DateTime<Utc>>,
    /// When the entry last finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Fresh `pending` entry.
    pub fn new(job: &EmbeddingJob, recording_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: job.user_id,
            job_id: job.id,
            recording_id,
            status: QueueStatus::Pending,
            attempts: 0,
            last_error: None,
            locked_at: None,
            completed_at: None,
            created_at: now,
        }
    }
}

/// Result of processing one claimed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Chunks replaced; carries the number written.
    Completed {
        /// Chunk rows written.
        chunks: usize,
    },
    /// Indexing failed.
    Failed {
        /// Operator-readable failure.
        error: String,
    },
}

/// Queue entries by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Waiting to be claimed.
    pub pending: i64,
    /// Claimed and in flight.
    pub processing: i64,
    /// Finished successfully.
    pub completed: i64,
    /// Finished with an error.
    pub failed: i64,
}

impl QueueCounts {
    /// Entries still owing work.
    pub fn open(&self) -> i64 {
        self.pending + self.processing
    }

    /// All entries.
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }

    /// Adds one entry with `status`.
    pub fn add(&mut self, status: QueueStatus, count: i64) {
        match status {
            QueueStatus::Pending => self.pending += count,
            QueueStatus::Processing => self.processing += count,
            QueueStatus::Completed => self.completed += count,
            QueueStatus::Failed => self.failed += count,
        }
    }
}
