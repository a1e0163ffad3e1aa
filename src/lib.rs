#![warn(missing_docs)]
//! Semantic indexing pipeline for synced call transcripts.
//!
//! Transcripts are split into token-budgeted chunks, embedded, and written to a
//! pgvector table. Bulk runs go through jobs and a claimable queue processed by
//! an HTTP worker; progress is reconciled from polling plus Postgres `NOTIFY`.

pub mod chunker;
pub mod config;
pub mod embedder;
pub mod error;
pub mod job;
pub mod logging;
pub mod manager;
pub mod planner;
pub mod rate_limiter;
pub mod reconciler;
pub mod server;
pub mod store;
pub mod transcript;
pub mod trigger;
pub mod worker;

pub use chunker::{chunk_transcript, estimate_tokens, ChunkingConfig, TranscriptChunk};
pub use embedder::openai::OpenAiEmbedder;
pub use embedder::Embedder;
pub use error::{EmbeddingError, PipelineError, RecordingError};
pub use job::{EmbeddingJob, EntryOutcome, JobStatus, QueueCounts, QueueEntry, QueueStatus};
pub use manager::{BackfillOptions, BackfillSummary, JobManager};
pub use planner::{BackfillPlan, BackfillPlanner, Coverage};
pub use rate_limiter::{RateLimit, RateLimiter, RequestGate, ScopedLimits};
pub use reconciler::{
    apply_job_observation, JobSnapshot, Observation, RealtimeEvent, SideEffect, SyncState,
    SyncStateReconciler,
};
pub use store::{IndexStore, JobStore, MemoryStore, PgStore, Store, Tables};
pub use transcript::{CallMetadata, ChunkRow, TranscriptSegment};
pub use trigger::{HttpWorkerTrigger, ProcessRequest, WorkerTrigger};
pub use worker::{QueueWorker, RecordingIndexer, WorkerConfig, WorkerReport};
