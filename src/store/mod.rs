//! Storage seam for transcripts, chunks, jobs and queue entries.

pub mod memory;
pub mod postgres;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::job::{EmbeddingJob, EntryOutcome, JobStatus, QueueCounts, QueueEntry};
use crate::transcript::{CallMetadata, ChunkRow, TranscriptSegment};

pub use memory::{Fault, MemoryStore};
pub use postgres::PgStore;

/// Read side of synced calls plus the chunk table.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Recordings of `user_id` that have a transcript, in ascending order.
    async fn transcribed_recordings(&self, user_id: Uuid) -> Result<Vec<i64>>;

    /// Recordings of `user_id` with at least one chunk row.
    async fn indexed_recordings(&self, user_id: Uuid) -> Result<HashSet<i64>>;

    /// Call title/date/category, or `None` when the call is gone.
    async fn call_metadata(&self, user_id: Uuid, recording_id: i64)
        -> Result<Option<CallMetadata>>;

    /// Live transcript segments ordered by timestamp.
    async fn transcript_segments(
        &self,
        user_id: Uuid,
        recording_id: i64,
    ) -> Result<Vec<TranscriptSegment>>;

    /// Deletes every chunk of the recording, then inserts `rows`. Returns rows written.
    async fn replace_chunks(
        &self,
        user_id: Uuid,
        recording_id: i64,
        rows: &[ChunkRow],
    ) -> Result<usize>;
}

/// Jobs and their queue entries.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new job row.
    async fn insert_job(&self, job: &EmbeddingJob) -> Result<()>;

    /// Bulk-inserts queue entries; all or nothing.
    async fn insert_queue_entries(&self, entries: &[QueueEntry]) -> Result<()>;

    /// Marks a job `failed` with a message.
    async fn fail_job(&self, job_id: Uuid, message: &str, now: DateTime<Utc>) -> Result<()>;

    /// Loads one job.
    async fn job(&self, job_id: Uuid) -> Result<Option<EmbeddingJob>>;

    /// Moves up to `limit` entries of the job from `pending` to `processing`.
    ///
    /// Rows another caller already claimed are skipped, so two workers never
    /// receive the same entry.
    async fn claim_entries(
        &self,
        job_id: Uuid,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>>;

    /// Returns claimed entries to `pending` without counting an outcome.
    async fn release_entries(&self, entry_ids: &[Uuid]) -> Result<()>;

    /// Records the outcome of a claimed entry and bumps the job counters.
    ///
    /// Returns `false` (and changes nothing) if the entry is no longer `processing`.
    async fn record_outcome(
        &self,
        entry: &QueueEntry,
        outcome: &EntryOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Entry counts for one job.
    async fn queue_counts(&self, job_id: Uuid) -> Result<QueueCounts>;

    /// Sets the terminal status once no entry is open. Returns the status when it changed.
    async fn finalize_job(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Option<JobStatus>>;

    /// Jobs that are not yet terminal, oldest first.
    async fn open_jobs(&self) -> Result<Vec<EmbeddingJob>>;

    /// Puts `processing` entries locked before `cutoff` back to `pending`.
    async fn release_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Moves failed entries back to `pending` and reopens the job.
    async fn requeue_failed(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<u64>;

    /// Jobs updated at or after `since` plus every job that is still open.
    async fn recent_jobs(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<Vec<EmbeddingJob>>;

    /// Jobs started at or after `since`.
    async fn jobs_started_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<EmbeddingJob>>;

    /// Entry counts across all of a user's jobs.
    async fn user_queue_counts(&self, user_id: Uuid) -> Result<QueueCounts>;

    /// `processing` entries locked before `cutoff`.
    async fn stuck_entries(
        &self,
        user_id: Uuid,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>>;

    /// Most recently failed entries.
    async fn recent_failures(&self, user_id: Uuid, limit: usize) -> Result<Vec<QueueEntry>>;
}

/// Both storage halves behind one object, as the worker needs them.
pub trait Store: IndexStore + JobStore {}

impl<T: IndexStore + JobStore + ?Sized> Store for T {}

/// Schema-qualified, quoted table names.
#[derive(Debug, Clone)]
pub struct Tables {
    schema: String,
}

impl Tables {
    /// Tables living in `schema`.
    pub fn new(schema: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        anyhow::ensure!(!schema.trim().is_empty(), "schema name is required");
        Ok(Self { schema })
    }

    /// Raw schema name.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Quoted `schema.table` reference.
    pub fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }

    /// `embedding_jobs`.
    pub fn jobs(&self) -> String {
        self.qualified("embedding_jobs")
    }

    /// `embedding_queue`.
    pub fn queue(&self) -> String {
        self.qualified("embedding_queue")
    }

    /// `transcript_chunks`.
    pub fn chunks(&self) -> String {
        self.qualified("transcript_chunks")
    }

    /// `fathom_calls`.
    pub fn calls(&self) -> String {
        self.qualified("fathom_calls")
    }

    /// `fathom_transcripts`.
    pub fn transcripts(&self) -> String {
        self.qualified("fathom_transcripts")
    }

    /// `call_tag_assignments`.
    pub fn tag_assignments(&self) -> String {
        self.qualified("call_tag_assignments")
    }

    /// `call_tags`.
    pub fn tags(&self) -> String {
        self.qualified("call_tags")
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    format!("\"{}\"", input.replace('"', "\"\""))
}
