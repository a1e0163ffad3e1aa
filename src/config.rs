//! Command-line and environment configuration shared by the binaries.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;

use crate::chunker::{ChunkingConfig, DEFAULT_MAX_TOKENS, DEFAULT_OVERLAP_TOKENS};
use crate::embedder::openai::OpenAiEmbedder;
use crate::embedder::MAX_EMBEDDING_BATCH;
use crate::error::EmbeddingError;
use crate::rate_limiter::{RateLimit, RateLimiter, ScopedLimits, TokioClock};
use crate::store::Tables;
use crate::trigger::HttpWorkerTrigger;

/// Postgres connection settings.
#[derive(Args, Debug, Clone)]
pub struct DatabaseArgs {
    /// Postgres connection string with service-role privileges
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Schema holding call, job, queue and chunk tables
    #[arg(long, env = "CALLVAULT_SCHEMA", default_value = "public")]
    pub schema: String,
}

impl DatabaseArgs {
    /// Qualified table names for the configured schema.
    pub fn tables(&self) -> anyhow::Result<Tables> {
        Tables::new(&self.schema)
    }
}

/// Embedding API settings.
#[derive(Args, Debug, Clone)]
pub struct EmbeddingArgs {
    /// OpenAI API key used for embedding calls
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: String,

    /// Base URL for the OpenAI-compatible API
    #[arg(
        long,
        env = "CALLVAULT_OPENAI_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    pub openai_base_url: String,

    /// Embedding model identifier
    #[arg(
        long,
        env = "CALLVAULT_OPENAI_MODEL",
        default_value = "text-embedding-3-small"
    )]
    pub openai_model: String,

    /// Optional dimension override when supported by the model
    #[arg(long, env = "CALLVAULT_OPENAI_DIMENSIONS")]
    pub openai_dimensions: Option<usize>,

    /// Max texts per embedding request (capped at 100)
    #[arg(long, env = "CALLVAULT_OPENAI_BATCH", default_value_t = MAX_EMBEDDING_BATCH)]
    pub openai_batch: usize,

    /// Max seconds to wait for each embedding request
    #[arg(long, env = "CALLVAULT_OPENAI_TIMEOUT_SECS", default_value_t = 30)]
    pub openai_timeout_secs: u64,

    /// Attempts per request for rate limits or transient errors
    #[arg(long, env = "CALLVAULT_OPENAI_MAX_RETRIES", default_value_t = 3)]
    pub openai_max_retries: usize,
}

impl EmbeddingArgs {
    /// Builds the HTTP embedding client.
    pub fn build(&self) -> Result<OpenAiEmbedder, EmbeddingError> {
        OpenAiEmbedder::new(
            &self.openai_api_key,
            &self.openai_base_url,
            &self.openai_model,
            self.openai_dimensions,
            Duration::from_secs(self.openai_timeout_secs.max(1)),
            self.openai_max_retries.max(1),
            self.openai_batch.clamp(1, MAX_EMBEDDING_BATCH),
        )
    }
}

/// Upstream request ceilings.
#[derive(Args, Debug, Clone)]
pub struct RateLimitArgs {
    /// Requests per window across all users
    #[arg(long, env = "CALLVAULT_RATE_GLOBAL_MAX", default_value_t = 90)]
    pub rate_global_max: u32,

    /// Requests per window for a single user
    #[arg(long, env = "CALLVAULT_RATE_USER_MAX", default_value_t = 30)]
    pub rate_user_max: u32,

    /// Window length in milliseconds
    #[arg(long, env = "CALLVAULT_RATE_WINDOW_MS", default_value_t = 60_000)]
    pub rate_window_ms: u64,

    /// Upper bound on random delay added to each wait, in milliseconds
    #[arg(long, env = "CALLVAULT_RATE_JITTER_MS", default_value_t = 200)]
    pub rate_jitter_ms: u64,
}

impl RateLimitArgs {
    /// Per-scope ceilings.
    pub fn limits(&self) -> ScopedLimits {
        ScopedLimits {
            global: RateLimit::per_window_ms(self.rate_global_max.max(1), self.rate_window_ms.max(1)),
            per_user: RateLimit::per_window_ms(self.rate_user_max.max(1), self.rate_window_ms.max(1)),
        }
    }

    /// Limiter on the tokio clock with the configured jitter.
    pub fn limiter(&self) -> RateLimiter {
        RateLimiter::with_clock(
            Arc::new(TokioClock),
            Duration::from_millis(self.rate_jitter_ms),
        )
    }
}

/// Chunk sizing.
#[derive(Args, Debug, Clone)]
pub struct ChunkingArgs {
    /// Chunk ceiling in estimated tokens
    #[arg(long, env = "CALLVAULT_CHUNK_MAX_TOKENS", default_value_t = DEFAULT_MAX_TOKENS)]
    pub chunk_max_tokens: usize,

    /// Tokens carried from one chunk into the next
    #[arg(long, env = "CALLVAULT_CHUNK_OVERLAP_TOKENS", default_value_t = DEFAULT_OVERLAP_TOKENS)]
    pub chunk_overlap_tokens: usize,
}

impl ChunkingArgs {
    /// Chunker settings.
    pub fn config(&self) -> ChunkingConfig {
        ChunkingConfig {
            max_tokens: self.chunk_max_tokens,
            overlap_tokens: self.chunk_overlap_tokens,
        }
    }
}

/// Where and how to reach the queue worker.
#[derive(Args, Debug, Clone)]
pub struct WorkerTriggerArgs {
    /// Worker endpoint that processes queued recordings
    #[arg(
        long,
        env = "CALLVAULT_WORKER_URL",
        default_value = "http://127.0.0.1:8787/process-embeddings"
    )]
    pub worker_url: String,

    /// Recordings the worker claims per invocation
    #[arg(long, env = "CALLVAULT_WORKER_BATCH", default_value_t = 10)]
    pub worker_batch_size: usize,

    /// Max seconds to wait for the worker to answer a trigger (longer than its time budget)
    #[arg(long, env = "CALLVAULT_WORKER_TIMEOUT_SECS", default_value_t = 120)]
    pub worker_timeout_secs: u64,
}

impl WorkerTriggerArgs {
    /// HTTP trigger for the configured endpoint.
    pub fn trigger(&self) -> anyhow::Result<HttpWorkerTrigger> {
        HttpWorkerTrigger::new(
            &self.worker_url,
            Duration::from_secs(self.worker_timeout_secs.max(1)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Harness {
        #[command(flatten)]
        rate: RateLimitArgs,
        #[command(flatten)]
        chunking: ChunkingArgs,
    }

    #[derive(Parser, Debug)]
    struct TriggerHarness {
        #[command(flatten)]
        worker: WorkerTriggerArgs,
    }

    #[test]
    fn trigger_waits_longer_than_a_worker_batch() {
        let harness = TriggerHarness::try_parse_from(["harness"]).expect("defaults parse");
        let timeout = Duration::from_secs(harness.worker.worker_timeout_secs);
        assert!(timeout > crate::worker::DEFAULT_TIME_BUDGET);
    }

    #[test]
    fn defaults_match_pipeline_constants() {
        let harness = Harness::try_parse_from(["harness"]).expect("defaults parse");
        assert_eq!(harness.chunking.config(), ChunkingConfig::default());
        let limits = harness.rate.limits();
        assert_eq!(limits.global, RateLimit::per_window_ms(90, 60_000));
        assert_eq!(limits.per_user, RateLimit::per_window_ms(30, 60_000));
    }

    #[test]
    fn flags_override_defaults() {
        let harness = Harness::try_parse_from([
            "harness",
            "--chunk-max-tokens",
            "300",
            "--chunk-overlap-tokens",
            "50",
            "--rate-user-max",
            "0",
        ])
        .expect("flags parse");
        assert_eq!(
            harness.chunking.config(),
            ChunkingConfig {
                max_tokens: 300,
                overlap_tokens: 50
            }
        );
        assert_eq!(harness.rate.limits().per_user.max_requests, 1);
    }
}
