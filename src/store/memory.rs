//! In-process store with the same claim semantics as Postgres.
//!
//! Used by the integration tests and by dry runs. Faults can be injected per
//! recording or per operation to exercise the failure paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{IndexStore, JobStore};
use crate::job::{EmbeddingJob, EntryOutcome, JobStatus, QueueCounts, QueueEntry, QueueStatus};
use crate::transcript::{CallMetadata, ChunkRow, TranscriptSegment};

/// Operation that should fail on the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Listing transcribed recordings fails.
    TranscribedQuery,
    /// Listing indexed recordings fails.
    IndexedQuery,
    /// Bulk queue insert fails.
    QueueInsert,
    /// Fetching segments for this recording fails.
    SegmentFetch(i64),
    /// Replacing chunks for this recording fails.
    ChunkInsert(i64),
}

#[derive(Debug, Clone)]
struct StoredCall {
    metadata: CallMetadata,
    has_transcript: bool,
    segments: Vec<TranscriptSegment>,
}

#[derive(Debug, Default)]
struct Inner {
    calls: BTreeMap<(Uuid, i64), StoredCall>,
    chunks: Vec<ChunkRow>,
    jobs: HashMap<Uuid, EmbeddingJob>,
    queue: Vec<QueueEntry>,
    faults: HashSet<Fault>,
}

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a transcribed call with its segments.
    pub fn add_call(&self, user_id: Uuid, metadata: CallMetadata, segments: Vec<TranscriptSegment>) {
        let key = (user_id, metadata.recording_id);
        self.lock().calls.insert(
            key,
            StoredCall {
                metadata,
                has_transcript: true,
                segments,
            },
        );
    }

    /// Adds a call whose transcript has not been synced yet.
    pub fn add_untranscribed_call(&self, user_id: Uuid, metadata: CallMetadata) {
        let key = (user_id, metadata.recording_id);
        self.lock().calls.insert(
            key,
            StoredCall {
                metadata,
                has_transcript: false,
                segments: Vec::new(),
            },
        );
    }

    /// Inserts a chunk row directly, bypassing the pipeline.
    pub fn seed_chunk(&self, row: ChunkRow) {
        self.lock().chunks.push(row);
    }

    /// Arms a fault until [`MemoryStore::clear_fault`] is called.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.insert(fault);
    }

    /// Disarms a fault.
    pub fn clear_fault(&self, fault: Fault) {
        self.lock().faults.remove(&fault);
    }

    /// Chunk rows of a recording ordered by index.
    pub fn chunks_for(&self, user_id: Uuid, recording_id: i64) -> Vec<ChunkRow> {
        let mut rows: Vec<ChunkRow> = self
            .lock()
            .chunks
            .iter()
            .filter(|row| row.user_id == user_id && row.recording_id == recording_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.chunk_index);
        rows
    }

    /// Every queue entry of a job in creation order.
    pub fn entries_for(&self, job_id: Uuid) -> Vec<QueueEntry> {
        self.lock()
            .queue
            .iter()
            .filter(|entry| entry.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Every job, oldest first.
    pub fn jobs(&self) -> Vec<EmbeddingJob> {
        let mut jobs: Vec<EmbeddingJob> = self.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.started_at);
        jobs
    }
}

fn counts_for<'a>(entries: impl Iterator<Item = &'a QueueEntry>) -> QueueCounts {
    let mut counts = QueueCounts::default();
    for entry in entries {
        counts.add(entry.status, 1);
    }
    counts
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn transcribed_recordings(&self, user_id: Uuid) -> Result<Vec<i64>> {
        let inner = self.lock();
        if inner.faults.contains(&Fault::TranscribedQuery) {
            bail!("transcribed recordings query failed");
        }
        Ok(inner
            .calls
            .iter()
            .filter(|((owner, _), call)| *owner == user_id && call.has_transcript)
            .map(|((_, recording_id), _)| *recording_id)
            .collect())
    }

    async fn indexed_recordings(&self, user_id: Uuid) -> Result<HashSet<i64>> {
        let inner = self.lock();
        if inner.faults.contains(&Fault::IndexedQuery) {
            bail!("indexed recordings query failed");
        }
        Ok(inner
            .chunks
            .iter()
            .filter(|row| row.user_id == user_id)
            .map(|row| row.recording_id)
            .collect())
    }

    async fn call_metadata(
        &self,
        user_id: Uuid,
        recording_id: i64,
    ) -> Result<Option<CallMetadata>> {
        Ok(self
            .lock()
            .calls
            .get(&(user_id, recording_id))
            .map(|call| call.metadata.clone()))
    }

    async fn transcript_segments(
        &self,
        user_id: Uuid,
        recording_id: i64,
    ) -> Result<Vec<TranscriptSegment>> {
        let inner = self.lock();
        if inner.faults.contains(&Fault::SegmentFetch(recording_id)) {
            bail!("segment query for recording {recording_id} timed out");
        }
        let mut segments = inner
            .calls
            .get(&(user_id, recording_id))
            .map(|call| call.segments.clone())
            .unwrap_or_default();
        segments.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(segments)
    }

    async fn replace_chunks(
        &self,
        user_id: Uuid,
        recording_id: i64,
        rows: &[ChunkRow],
    ) -> Result<usize> {
        let mut inner = self.lock();
        if inner.faults.contains(&Fault::ChunkInsert(recording_id)) {
            bail!("chunk insert for recording {recording_id} rejected");
        }
        inner
            .chunks
            .retain(|row| !(row.user_id == user_id && row.recording_id == recording_id));
        inner.chunks.extend(rows.iter().cloned());
        Ok(rows.len())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &EmbeddingJob) -> Result<()> {
        let mut inner = self.lock();
        if inner.jobs.contains_key(&job.id) {
            bail!("job {} already exists", job.id);
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn insert_queue_entries(&self, entries: &[QueueEntry]) -> Result<()> {
        let mut inner = self.lock();
        if inner.faults.contains(&Fault::QueueInsert) {
            bail!("queue insert violated a constraint");
        }
        if let Some(orphan) = entries.iter().find(|e| !inner.jobs.contains_key(&e.job_id)) {
            bail!("queue entry references missing job {}", orphan.job_id);
        }
        inner.queue.extend(entries.iter().cloned());
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, message: &str, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            bail!("job {job_id} not found");
        };
        job.status = JobStatus::Failed;
        job.error_message = Some(message.to_string());
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<EmbeddingJob>> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn claim_entries(
        &self,
        job_id: Uuid,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>> {
        let mut inner = self.lock();
        let mut claimed = Vec::new();
        for entry in inner
            .queue
            .iter_mut()
            .filter(|entry| entry.job_id == job_id && entry.status == QueueStatus::Pending)
            .take(limit)
        {
            entry.status = QueueStatus::Processing;
            entry.attempts += 1;
            entry.locked_at = Some(now);
            claimed.push(entry.clone());
        }
        if !claimed.is_empty() {
            if let Some(job) = inner.jobs.get_mut(&job_id) {
                if job.status == JobStatus::Pending {
                    job.status = JobStatus::Running;
                }
                job.updated_at = now;
            }
        }
        Ok(claimed)
    }

    async fn release_entries(&self, entry_ids: &[Uuid]) -> Result<()> {
        let mut inner = self.lock();
        for entry in inner.queue.iter_mut().filter(|e| entry_ids.contains(&e.id)) {
            if entry.status == QueueStatus::Processing {
                entry.status = QueueStatus::Pending;
                entry.locked_at = None;
            }
        }
        Ok(())
    }

    async fn record_outcome(
        &self,
        entry: &QueueEntry,
        outcome: &EntryOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let Some(stored) = inner
            .queue
            .iter_mut()
            .find(|e| e.id == entry.id && e.status == QueueStatus::Processing)
        else {
            return Ok(false);
        };
        stored.locked_at = None;
        stored.completed_at = Some(now);
        let chunks = match outcome {
            EntryOutcome::Completed { chunks } => {
                stored.status = QueueStatus::Completed;
                stored.last_error = None;
                Some(*chunks as i64)
            }
            EntryOutcome::Failed { error } => {
                stored.status = QueueStatus::Failed;
                stored.last_error = Some(error.clone());
                None
            }
        };
        if let Some(job) = inner.jobs.get_mut(&entry.job_id) {
            job.progress_current += 1;
            match chunks {
                Some(created) => {
                    job.queue_completed += 1;
                    job.chunks_created += created;
                }
                None => job.queue_failed += 1,
            }
            job.updated_at = now;
        }
        Ok(true)
    }

    async fn queue_counts(&self, job_id: Uuid) -> Result<QueueCounts> {
        let inner = self.lock();
        Ok(counts_for(inner.queue.iter().filter(|e| e.job_id == job_id)))
    }

    async fn finalize_job(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Option<JobStatus>> {
        let mut inner = self.lock();
        let counts = counts_for(inner.queue.iter().filter(|e| e.job_id == job_id));
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            bail!("job {job_id} not found");
        };
        if job.status.is_terminal() || counts.open() > 0 {
            return Ok(None);
        }
        let status = JobStatus::from_counts(counts.completed, counts.failed);
        job.status = status;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(Some(status))
    }

    async fn open_jobs(&self) -> Result<Vec<EmbeddingJob>> {
        let mut jobs: Vec<EmbeddingJob> = self
            .lock()
            .jobs
            .values()
            .filter(|job| !job.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.started_at);
        Ok(jobs)
    }

    async fn release_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let mut released = 0;
        for entry in inner.queue.iter_mut() {
            let stale = entry.locked_at.is_some_and(|locked| locked < cutoff);
            if entry.status == QueueStatus::Processing && stale {
                entry.status = QueueStatus::Pending;
                entry.locked_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn requeue_failed(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let mut requeued = 0i64;
        for entry in inner
            .queue
            .iter_mut()
            .filter(|e| e.job_id == job_id && e.status == QueueStatus::Failed)
        {
            entry.status = QueueStatus::Pending;
            entry.completed_at = None;
            entry.locked_at = None;
            requeued += 1;
        }
        if requeued > 0 {
            if let Some(job) = inner.jobs.get_mut(&job_id) {
                job.queue_failed -= requeued;
                job.progress_current -= requeued;
                job.status = JobStatus::Running;
                job.completed_at = None;
                job.error_message = None;
                job.updated_at = now;
            }
        }
        Ok(requeued as u64)
    }

    async fn recent_jobs(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<Vec<EmbeddingJob>> {
        let mut jobs: Vec<EmbeddingJob> = self
            .lock()
            .jobs
            .values()
            .filter(|job| job.user_id == user_id)
            .filter(|job| job.updated_at >= since || !job.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(jobs)
    }

    async fn jobs_started_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<EmbeddingJob>> {
        let mut jobs: Vec<EmbeddingJob> = self
            .lock()
            .jobs
            .values()
            .filter(|job| job.user_id == user_id && job.started_at >= since)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(jobs)
    }

    async fn user_queue_counts(&self, user_id: Uuid) -> Result<QueueCounts> {
        let inner = self.lock();
        Ok(counts_for(inner.queue.iter().filter(|e| e.user_id == user_id)))
    }

    async fn stuck_entries(
        &self,
        user_id: Uuid,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>> {
        Ok(self
            .lock()
            .queue
            .iter()
            .filter(|e| e.user_id == user_id && e.status == QueueStatus::Processing)
            .filter(|e| e.locked_at.is_some_and(|locked| locked < cutoff))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn recent_failures(&self, user_id: Uuid, limit: usize) -> Result<Vec<QueueEntry>> {
        let mut failed: Vec<QueueEntry> = self
            .lock()
            .queue
            .iter()
            .filter(|e| e.user_id == user_id && e.status == QueueStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        failed.truncate(limit);
        Ok(failed)
    }
}
