//! Postgres-backed store built on tokio-postgres and pgvector.

use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use pgvector::Vector;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_postgres::{AsyncMessage, Client, NoTls, Row};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{IndexStore, JobStore, Tables};
use crate::job::{EmbeddingJob, EntryOutcome, JobStatus, QueueCounts, QueueEntry, QueueStatus};
use crate::reconciler::{JobSnapshot, RealtimeEvent};
use crate::transcript::{CallMetadata, ChunkRow, TranscriptSegment};

/// Channel the job/queue triggers notify on.
pub const NOTIFY_CHANNEL: &str = "callvault_embedding_events";
/// Largest row payload sent with `recording_ids`; pg_notify rejects payloads over 8000 bytes.
const NOTIFY_RECORD_BUDGET: usize = 7000;

const JOB_COLUMNS: &str = "id, user_id, recording_ids, status, progress_total, progress_current, \
    chunks_created, queue_total, queue_completed, queue_failed, started_at, completed_at, \
    updated_at, error_message";

const QUEUE_COLUMNS: &str = "id, user_id, job_id, recording_id, status, attempts, last_error, \
    locked_at, completed_at, created_at";

/// Store over a single Postgres connection.
pub struct PgStore {
    client: Mutex<Client>,
    tables: Tables,
}

impl PgStore {
    /// Connects and spawns the connection driver.
    pub async fn connect(database_url: &str, tables: Tables) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("failed to connect to Postgres")?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection error");
            }
        });
        Ok(Self::from_client(client, tables))
    }

    /// Wraps an existing client.
    pub fn from_client(client: Client, tables: Tables) -> Self {
        Self {
            client: Mutex::new(client),
            tables,
        }
    }

    /// Table names in use.
    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Creates the pgvector extension, the job/queue/chunk tables and the notify triggers.
    pub async fn ensure_schema(&self, dims: usize) -> Result<()> {
        anyhow::ensure!(dims > 0, "embedding dimension must be positive");
        let ddl = schema_ddl(&self.tables, dims);
        self.client
            .lock()
            .await
            .batch_execute(&ddl)
            .await
            .context("failed to prepare embedding schema")?;
        Ok(())
    }

    /// Opens a dedicated `LISTEN` connection and streams decoded job/queue events.
    ///
    /// The first event is [`RealtimeEvent::Subscribed`]; [`RealtimeEvent::Closed`]
    /// follows when the connection ends. Dropping the receiver closes the connection.
    pub async fn listen_job_events(database_url: &str) -> Result<mpsc::Receiver<RealtimeEvent>> {
        let (client, mut connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("failed to open LISTEN connection")?;
        let (payload_tx, mut payload_rx) = mpsc::unbounded_channel::<String>();
        let mut messages = futures_util::stream::poll_fn(move |cx| connection.poll_message(cx));
        tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(note)) => {
                        if payload_tx.send(note.payload().to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "realtime connection failed");
                        break;
                    }
                }
            }
        });

        client
            .batch_execute(&format!("LISTEN {NOTIFY_CHANNEL}"))
            .await
            .context("failed to subscribe to job events")?;

        let (events_tx, events_rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let _client = client;
            if events_tx.send(RealtimeEvent::Subscribed).await.is_err() {
                return;
            }
            while let Some(payload) = payload_rx.recv().await {
                let Some(event) = parse_notification(&payload) else {
                    debug!(payload = %payload, "ignoring unrecognised notification");
                    continue;
                };
                if events_tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = events_tx.send(RealtimeEvent::Closed).await;
        });
        Ok(events_rx)
    }
}

/// DDL for the extension, tables and notify triggers.
fn schema_ddl(t: &Tables, dims: usize) -> String {
    format!(
        "CREATE EXTENSION IF NOT EXISTS vector;
        CREATE TABLE IF NOT EXISTS {jobs} (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL,
            recording_ids BIGINT[] NOT NULL DEFAULT '{{}}',
            status TEXT NOT NULL,
            progress_total BIGINT NOT NULL DEFAULT 0,
            progress_current BIGINT NOT NULL DEFAULT 0,
            chunks_created BIGINT NOT NULL DEFAULT 0,
            queue_total BIGINT NOT NULL DEFAULT 0,
            queue_completed BIGINT NOT NULL DEFAULT 0,
            queue_failed BIGINT NOT NULL DEFAULT 0,
            started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            completed_at TIMESTAMPTZ,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            error_message TEXT
        );
        CREATE INDEX IF NOT EXISTS embedding_jobs_user_updated_idx ON {jobs} (user_id, updated_at);
        CREATE TABLE IF NOT EXISTS {queue} (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL,
            job_id UUID NOT NULL REFERENCES {jobs} (id) ON DELETE CASCADE,
            recording_id BIGINT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            locked_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        CREATE INDEX IF NOT EXISTS embedding_queue_job_status_idx ON {queue} (job_id, status);
        CREATE INDEX IF NOT EXISTS embedding_queue_user_status_idx ON {queue} (user_id, status);
        CREATE TABLE IF NOT EXISTS {chunks} (
            id BIGSERIAL PRIMARY KEY,
            user_id UUID NOT NULL,
            recording_id BIGINT NOT NULL,
            chunk_text TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            speaker_name TEXT,
            speaker_email TEXT,
            timestamp_start TEXT,
            timestamp_end TEXT,
            call_date TIMESTAMPTZ,
            call_title TEXT,
            call_category TEXT,
            embedding VECTOR({dims}) NOT NULL,
            embedded_at TIMESTAMPTZ NOT NULL,
            UNIQUE (user_id, recording_id, chunk_index)
        );
        CREATE OR REPLACE FUNCTION {notify_fn}() RETURNS trigger AS $$
        DECLARE
            payload JSONB := to_jsonb(NEW) - 'last_error' - 'error_message';
        BEGIN
            IF octet_length(payload::text) > {budget} THEN
                payload := payload - 'recording_ids';
            END IF;
            PERFORM pg_notify('{channel}', jsonb_build_object(
                'table', TG_TABLE_NAME,
                'record', payload
            )::text);
            RETURN NEW;
        END;
        $$ LANGUAGE plpgsql;
        DROP TRIGGER IF EXISTS embedding_jobs_notify ON {jobs};
        CREATE TRIGGER embedding_jobs_notify AFTER INSERT OR UPDATE ON {jobs}
            FOR EACH ROW EXECUTE FUNCTION {notify_fn}();
        DROP TRIGGER IF EXISTS embedding_queue_notify ON {queue};
        CREATE TRIGGER embedding_queue_notify AFTER UPDATE OF status ON {queue}
            FOR EACH ROW EXECUTE FUNCTION {notify_fn}();",
        jobs = t.jobs(),
        queue = t.queue(),
        chunks = t.chunks(),
        notify_fn = t.qualified("callvault_notify_embedding_event"),
        channel = NOTIFY_CHANNEL,
        budget = NOTIFY_RECORD_BUDGET,
    )
}

#[derive(Deserialize)]
struct Notification {
    table: String,
    record: serde_json::Value,
}

#[derive(Deserialize)]
struct JobRecord {
    id: Uuid,
    user_id: Uuid,
    status: String,
    #[serde(default)]
    progress_current: i64,
    #[serde(default)]
    progress_total: i64,
    #[serde(default)]
    queue_completed: i64,
    #[serde(default)]
    queue_failed: i64,
    #[serde(default)]
    chunks_created: i64,
    #[serde(default)]
    recording_ids: Vec<i64>,
}

#[derive(Deserialize)]
struct QueueRecord {
    job_id: Uuid,
    recording_id: i64,
    status: String,
}

/// Decodes a trigger payload into a realtime event.
pub fn parse_notification(payload: &str) -> Option<RealtimeEvent> {
    let note: Notification = serde_json::from_str(payload).ok()?;
    match note.table.as_str() {
        "embedding_jobs" => {
            let record: JobRecord = serde_json::from_value(note.record).ok()?;
            Some(RealtimeEvent::JobUpdated(JobSnapshot {
                id: record.id,
                user_id: record.user_id,
                status: record.status.parse().ok()?,
                progress_current: record.progress_current,
                progress_total: record.progress_total,
                queue_completed: record.queue_completed,
                queue_failed: record.queue_failed,
                chunks_created: record.chunks_created,
                recording_ids: record.recording_ids,
            }))
        }
        "embedding_queue" => {
            let record: QueueRecord = serde_json::from_value(note.record).ok()?;
            Some(RealtimeEvent::QueueUpdated {
                job_id: record.job_id,
                recording_id: record.recording_id,
                status: record.status.parse().ok()?,
            })
        }
        _ => None,
    }
}

fn job_from_row(row: &Row) -> Result<EmbeddingJob> {
    let status: String = row.try_get("status")?;
    Ok(EmbeddingJob {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        recording_ids: row.try_get("recording_ids")?,
        status: status.parse()?,
        progress_total: row.try_get("progress_total")?,
        progress_current: row.try_get("progress_current")?,
        chunks_created: row.try_get("chunks_created")?,
        queue_total: row.try_get("queue_total")?,
        queue_completed: row.try_get("queue_completed")?,
        queue_failed: row.try_get("queue_failed")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
        error_message: row.try_get("error_message")?,
    })
}

fn entry_from_row(row: &Row) -> Result<QueueEntry> {
    let status: String = row.try_get("status")?;
    Ok(QueueEntry {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        job_id: row.try_get("job_id")?,
        recording_id: row.try_get("recording_id")?,
        status: status.parse()?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        locked_at: row.try_get("locked_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn jobs_from_rows(rows: &[Row]) -> Result<Vec<EmbeddingJob>> {
    rows.iter().map(job_from_row).collect()
}

fn entries_from_rows(rows: &[Row]) -> Result<Vec<QueueEntry>> {
    rows.iter().map(entry_from_row).collect()
}

fn counts_from_rows(rows: &[Row]) -> Result<QueueCounts> {
    let mut counts = QueueCounts::default();
    for row in rows {
        let status: String = row.try_get(0)?;
        let count: i64 = row.try_get(1)?;
        counts.add(status.parse::<QueueStatus>()?, count);
    }
    Ok(counts)
}

#[async_trait]
impl IndexStore for PgStore {
    async fn transcribed_recordings(&self, user_id: Uuid) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT recording_id FROM {} WHERE user_id = $1 AND full_transcript IS NOT NULL \
             ORDER BY recording_id",
            self.tables.calls()
        );
        let rows = self
            .client
            .lock()
            .await
            .query(&sql, &[&user_id])
            .await
            .context("failed to list transcribed recordings")?;
        rows.iter()
            .map(|row| row.try_get(0).map_err(Into::into))
            .collect()
    }

    async fn indexed_recordings(&self, user_id: Uuid) -> Result<HashSet<i64>> {
        let sql = format!(
            "SELECT DISTINCT recording_id FROM {} WHERE user_id = $1",
            self.tables.chunks()
        );
        let rows = self
            .client
            .lock()
            .await
            .query(&sql, &[&user_id])
            .await
            .context("failed to list indexed recordings")?;
        rows.iter()
            .map(|row| row.try_get(0).map_err(Into::into))
            .collect()
    }

    async fn call_metadata(
        &self,
        user_id: Uuid,
        recording_id: i64,
    ) -> Result<Option<CallMetadata>> {
        let sql = format!(
            "SELECT c.recording_id, c.title, c.created_at, tag.name AS category
             FROM {calls} c
             LEFT JOIN LATERAL (
                 SELECT t.name FROM {assignments} a
                 JOIN {tags} t ON t.id = a.tag_id
                 WHERE a.call_recording_id = c.recording_id AND a.user_id = c.user_id
                 ORDER BY a.is_primary DESC NULLS LAST
                 LIMIT 1
             ) tag ON true
             WHERE c.user_id = $1 AND c.recording_id = $2",
            calls = self.tables.calls(),
            assignments = self.tables.tag_assignments(),
            tags = self.tables.tags(),
        );
        let row = self
            .client
            .lock()
            .await
            .query_opt(&sql, &[&user_id, &recording_id])
            .await
            .with_context(|| format!("failed to load call {recording_id}"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let title: Option<String> = row.try_get("title")?;
        Ok(Some(CallMetadata {
            recording_id: row.try_get("recording_id")?,
            title: title.unwrap_or_default(),
            created_at: row.try_get("created_at")?,
            category: row.try_get("category")?,
        }))
    }

    async fn transcript_segments(
        &self,
        user_id: Uuid,
        recording_id: i64,
    ) -> Result<Vec<TranscriptSegment>> {
        let sql = format!(
            "SELECT recording_id, speaker_name, speaker_email, text, timestamp
             FROM {} WHERE user_id = $1 AND recording_id = $2 AND is_deleted = false
             ORDER BY timestamp ASC",
            self.tables.transcripts()
        );
        let rows = self
            .client
            .lock()
            .await
            .query(&sql, &[&user_id, &recording_id])
            .await
            .with_context(|| format!("failed to fetch segments for {recording_id}"))?;
        rows.iter()
            .map(|row| {
                let text: Option<String> = row.try_get("text")?;
                Ok(TranscriptSegment {
                    recording_id: row.try_get("recording_id")?,
                    speaker_name: row.try_get("speaker_name")?,
                    speaker_email: row.try_get("speaker_email")?,
                    text: text.unwrap_or_default(),
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }

    async fn replace_chunks(
        &self,
        user_id: Uuid,
        recording_id: i64,
        rows: &[ChunkRow],
    ) -> Result<usize> {
        let chunks = self.tables.chunks();
        let delete_sql = format!("DELETE FROM {chunks} WHERE user_id = $1 AND recording_id = $2");
        let insert_sql = format!(
            "INSERT INTO {chunks} (user_id, recording_id, chunk_text, chunk_index, speaker_name, \
             speaker_email, timestamp_start, timestamp_end, call_date, call_title, call_category, \
             embedding, embedded_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        );

        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;
        transaction
            .execute(&delete_sql, &[&user_id, &recording_id])
            .await
            .with_context(|| format!("failed to delete chunks for {recording_id}"))?;
        let statement = transaction.prepare(&insert_sql).await?;
        for row in rows {
            let vector = Vector::from(row.embedding.clone());
            transaction
                .execute(
                    &statement,
                    &[
                        &row.user_id,
                        &row.recording_id,
                        &row.chunk_text,
                        &row.chunk_index,
                        &row.speaker_name,
                        &row.speaker_email,
                        &row.timestamp_start,
                        &row.timestamp_end,
                        &row.call_date,
                        &row.call_title,
                        &row.call_category,
                        &vector,
                        &row.embedded_at,
                    ],
                )
                .await
                .with_context(|| {
                    format!(
                        "failed to insert chunk {} of recording {recording_id}",
                        row.chunk_index
                    )
                })?;
        }
        transaction.commit().await?;
        Ok(rows.len())
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_job(&self, job: &EmbeddingJob) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            self.tables.jobs()
        );
        self.client
            .lock()
            .await
            .execute(
                &sql,
                &[
                    &job.id,
                    &job.user_id,
                    &job.recording_ids,
                    &job.status.as_str(),
                    &job.progress_total,
                    &job.progress_current,
                    &job.chunks_created,
                    &job.queue_total,
                    &job.queue_completed,
                    &job.queue_failed,
                    &job.started_at,
                    &job.completed_at,
                    &job.updated_at,
                    &job.error_message,
                ],
            )
            .await
            .with_context(|| format!("failed to insert job {}", job.id))?;
        Ok(())
    }

    async fn insert_queue_entries(&self, entries: &[QueueEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} ({QUEUE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            self.tables.queue()
        );
        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;
        let statement = transaction.prepare(&sql).await?;
        for entry in entries {
            transaction
                .execute(
                    &statement,
                    &[
                        &entry.id,
                        &entry.user_id,
                        &entry.job_id,
                        &entry.recording_id,
                        &entry.status.as_str(),
                        &entry.attempts,
                        &entry.last_error,
                        &entry.locked_at,
                        &entry.completed_at,
                        &entry.created_at,
                    ],
                )
                .await
                .with_context(|| format!("failed to queue recording {}", entry.recording_id))?;
        }
        transaction.commit().await?;
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, message: &str, now: DateTime<Utc>) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = 'failed', error_message = $2, completed_at = $3, updated_at = $3 \
             WHERE id = $1",
            self.tables.jobs()
        );
        self.client
            .lock()
            .await
            .execute(&sql, &[&job_id, &message, &now])
            .await
            .with_context(|| format!("failed to mark job {job_id} failed"))?;
        Ok(())
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<EmbeddingJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM {} WHERE id = $1", self.tables.jobs());
        let row = self
            .client
            .lock()
            .await
            .query_opt(&sql, &[&job_id])
            .await
            .with_context(|| format!("failed to load job {job_id}"))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_entries(
        &self,
        job_id: Uuid,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>> {
        let queue = self.tables.queue();
        let claim_sql = format!(
            "UPDATE {queue} SET status = 'processing', attempts = attempts + 1, locked_at = $3
             WHERE status = 'pending' AND id IN (
                 SELECT id FROM {queue}
                 WHERE job_id = $1 AND status = 'pending'
                 ORDER BY created_at, recording_id
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {QUEUE_COLUMNS}"
        );
        let start_sql = format!(
            "UPDATE {} SET status = CASE WHEN status = 'pending' THEN 'running' ELSE status END, \
             updated_at = $2 WHERE id = $1",
            self.tables.jobs()
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;
        let rows = transaction
            .query(&claim_sql, &[&job_id, &limit, &now])
            .await
            .with_context(|| format!("failed to claim entries for job {job_id}"))?;
        if !rows.is_empty() {
            transaction.execute(&start_sql, &[&job_id, &now]).await?;
        }
        transaction.commit().await?;
        entries_from_rows(&rows)
    }

    async fn release_entries(&self, entry_ids: &[Uuid]) -> Result<()> {
        if entry_ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {} SET status = 'pending', locked_at = NULL \
             WHERE id = ANY($1) AND status = 'processing'",
            self.tables.queue()
        );
        let ids = entry_ids.to_vec();
        self.client
            .lock()
            .await
            .execute(&sql, &[&ids])
            .await
            .context("failed to release claimed entries")?;
        Ok(())
    }

    async fn record_outcome(
        &self,
        entry: &QueueEntry,
        outcome: &EntryOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let (status, error, completed, failed, chunks) = match outcome {
            EntryOutcome::Completed { chunks } => {
                (QueueStatus::Completed, None, 1i64, 0i64, *chunks as i64)
            }
            EntryOutcome::Failed { error } => {
                (QueueStatus::Failed, Some(error.as_str()), 0, 1, 0)
            }
        };
        let sql = format!(
            "WITH updated AS (
                 UPDATE {queue} SET status = $2, last_error = $3, locked_at = NULL, completed_at = $4
                 WHERE id = $1 AND status = 'processing'
                 RETURNING job_id
             )
             UPDATE {jobs} j SET
                 progress_current = j.progress_current + 1,
                 queue_completed = j.queue_completed + $5,
                 queue_failed = j.queue_failed + $6,
                 chunks_created = j.chunks_created + $7,
                 updated_at = $4
             FROM updated WHERE j.id = updated.job_id
             RETURNING j.id",
            queue = self.tables.queue(),
            jobs = self.tables.jobs(),
        );
        let rows = self
            .client
            .lock()
            .await
            .query(
                &sql,
                &[
                    &entry.id,
                    &status.as_str(),
                    &error,
                    &now,
                    &completed,
                    &failed,
                    &chunks,
                ],
            )
            .await
            .with_context(|| format!("failed to record outcome for entry {}", entry.id))?;
        Ok(!rows.is_empty())
    }

    async fn queue_counts(&self, job_id: Uuid) -> Result<QueueCounts> {
        let sql = format!(
            "SELECT status, count(*) FROM {} WHERE job_id = $1 GROUP BY status",
            self.tables.queue()
        );
        let rows = self
            .client
            .lock()
            .await
            .query(&sql, &[&job_id])
            .await
            .with_context(|| format!("failed to count entries for job {job_id}"))?;
        counts_from_rows(&rows)
    }

    async fn finalize_job(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Option<JobStatus>> {
        let lock_sql = format!("SELECT status FROM {} WHERE id = $1 FOR UPDATE", self.tables.jobs());
        let counts_sql = format!(
            "SELECT status, count(*) FROM {} WHERE job_id = $1 GROUP BY status",
            self.tables.queue()
        );
        let finish_sql = format!(
            "UPDATE {} SET status = $2, completed_at = $3, updated_at = $3 WHERE id = $1",
            self.tables.jobs()
        );

        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;
        let Some(row) = transaction.query_opt(&lock_sql, &[&job_id]).await? else {
            anyhow::bail!("job {job_id} not found");
        };
        let current: String = row.try_get(0)?;
        let current: JobStatus = current.parse()?;
        let counts = counts_from_rows(&transaction.query(&counts_sql, &[&job_id]).await?)?;
        if current.is_terminal() || counts.open() > 0 {
            transaction.commit().await?;
            return Ok(None);
        }
        let status = JobStatus::from_counts(counts.completed, counts.failed);
        transaction
            .execute(&finish_sql, &[&job_id, &status.as_str(), &now])
            .await
            .with_context(|| format!("failed to finalize job {job_id}"))?;
        transaction.commit().await?;
        Ok(Some(status))
    }

    async fn open_jobs(&self) -> Result<Vec<EmbeddingJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} WHERE status IN ('pending', 'running') ORDER BY started_at",
            self.tables.jobs()
        );
        let rows = self
            .client
            .lock()
            .await
            .query(&sql, &[])
            .await
            .context("failed to list open jobs")?;
        jobs_from_rows(&rows)
    }

    async fn release_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET status = 'pending', locked_at = NULL \
             WHERE status = 'processing' AND locked_at < $1",
            self.tables.queue()
        );
        self.client
            .lock()
            .await
            .execute(&sql, &[&cutoff])
            .await
            .context("failed to release stale claims")
    }

    async fn requeue_failed(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let requeue_sql = format!(
            "UPDATE {} SET status = 'pending', locked_at = NULL, completed_at = NULL \
             WHERE job_id = $1 AND status = 'failed'",
            self.tables.queue()
        );
        let reopen_sql = format!(
            "UPDATE {} SET queue_failed = queue_failed - $2, progress_current = progress_current - $2, \
             status = 'running', completed_at = NULL, error_message = NULL, updated_at = $3 \
             WHERE id = $1",
            self.tables.jobs()
        );
        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;
        let requeued = transaction
            .execute(&requeue_sql, &[&job_id])
            .await
            .with_context(|| format!("failed to requeue entries of job {job_id}"))?;
        if requeued > 0 {
            let delta = requeued as i64;
            transaction
                .execute(&reopen_sql, &[&job_id, &delta, &now])
                .await
                .with_context(|| format!("failed to reopen job {job_id}"))?;
        }
        transaction.commit().await?;
        Ok(requeued)
    }

    async fn recent_jobs(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<Vec<EmbeddingJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} \
             WHERE user_id = $1 AND (updated_at >= $2 OR status IN ('pending', 'running')) \
             ORDER BY started_at DESC",
            self.tables.jobs()
        );
        let rows = self
            .client
            .lock()
            .await
            .query(&sql, &[&user_id, &since])
            .await
            .context("failed to list recent jobs")?;
        jobs_from_rows(&rows)
    }

    async fn jobs_started_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<EmbeddingJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} WHERE user_id = $1 AND started_at >= $2 \
             ORDER BY started_at DESC",
            self.tables.jobs()
        );
        let rows = self
            .client
            .lock()
            .await
            .query(&sql, &[&user_id, &since])
            .await
            .context("failed to list jobs")?;
        jobs_from_rows(&rows)
    }

    async fn user_queue_counts(&self, user_id: Uuid) -> Result<QueueCounts> {
        let sql = format!(
            "SELECT status, count(*) FROM {} WHERE user_id = $1 GROUP BY status",
            self.tables.queue()
        );
        let rows = self
            .client
            .lock()
            .await
            .query(&sql, &[&user_id])
            .await
            .context("failed to count queue entries")?;
        counts_from_rows(&rows)
    }

    async fn stuck_entries(
        &self,
        user_id: Uuid,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM {} \
             WHERE user_id = $1 AND status = 'processing' AND locked_at < $2 \
             ORDER BY locked_at LIMIT $3",
            self.tables.queue()
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client
            .lock()
            .await
            .query(&sql, &[&user_id, &cutoff, &limit])
            .await
            .context("failed to list stuck entries")?;
        entries_from_rows(&rows)
    }

    async fn recent_failures(&self, user_id: Uuid, limit: usize) -> Result<Vec<QueueEntry>> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM {} WHERE user_id = $1 AND status = 'failed' \
             ORDER BY completed_at DESC NULLS LAST LIMIT $2",
            self.tables.queue()
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client
            .lock()
            .await
            .query(&sql, &[&user_id, &limit])
            .await
            .context("failed to list failed entries")?;
        entries_from_rows(&rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_job_notifications() {
        let id = Uuid::new_v4();
        let user = Uuid::new_v4();
        let payload = serde_json::json!({
            "table": "embedding_jobs",
            "record": {
                "id": id,
                "user_id": user,
                "status": "completed_with_errors",
                "progress_current": 4,
                "progress_total": 4,
                "queue_completed": 3,
                "queue_failed": 1,
                "chunks_created": 18,
                "recording_ids": [7, 8, 9, 10],
                "started_at": "2026-01-05T10:00:00.123456+00:00"
            }
        })
        .to_string();

        let Some(RealtimeEvent::JobUpdated(snapshot)) = parse_notification(&payload) else {
            panic!("expected job update");
        };
        assert_eq!(snapshot.id, id);
        assert_eq!(snapshot.status, JobStatus::CompletedWithErrors);
        assert_eq!(snapshot.queue_failed, 1);
        assert_eq!(snapshot.recording_ids, vec![7, 8, 9, 10]);
    }

    #[test]
    fn job_notifications_without_recordings_still_decode() {
        let payload = serde_json::json!({
            "table": "embedding_jobs",
            "record": { "id": Uuid::nil(), "user_id": Uuid::nil(), "status": "running" }
        })
        .to_string();
        let Some(RealtimeEvent::JobUpdated(snapshot)) = parse_notification(&payload) else {
            panic!("expected job update");
        };
        assert!(snapshot.recording_ids.is_empty());
    }

    #[test]
    fn notify_payload_leaves_out_error_text() {
        let ddl = schema_ddl(&Tables::new("public").expect("tables"), 1536);
        assert!(ddl.contains("to_jsonb(NEW) - 'last_error' - 'error_message'"));
        assert!(ddl.contains(&format!("octet_length(payload::text) > {NOTIFY_RECORD_BUDGET}")));
        assert!(ddl.contains("VECTOR(1536)"));
    }

    #[test]
    fn decodes_queue_notifications_and_ignores_others() {
        let job_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "table": "embedding_queue",
            "record": { "job_id": job_id, "recording_id": 42, "status": "completed" }
        })
        .to_string();
        assert!(matches!(
            parse_notification(&payload),
            Some(RealtimeEvent::QueueUpdated {
                recording_id: 42,
                status: QueueStatus::Completed,
                ..
            })
        ));

        assert!(parse_notification(r#"{"table":"fathom_calls","record":{}}"#).is_none());
        assert!(parse_notification("not json").is_none());
    }
}
