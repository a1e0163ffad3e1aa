#![allow(dead_code)]

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use callvault_indexer::error::{EmbeddingError, PipelineError};
use callvault_indexer::trigger::{ProcessRequest, WorkerTrigger};
use callvault_indexer::{CallMetadata, Embedder, MemoryStore, TranscriptSegment};
use chrono::{TimeZone, Utc};
use uuid::Uuid;

/// Embeds each text as `[chars, words, 1.0]`.
pub struct FakeEmbedder;

#[async_trait]
impl Embedder for FakeEmbedder {
    fn max_batch_size(&self) -> usize {
        4
    }

    async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(inputs
            .iter()
            .map(|text| {
                vec![
                    text.chars().count() as f32,
                    text.split_whitespace().count() as f32,
                    1.0,
                ]
            })
            .collect())
    }
}

/// [`FakeEmbedder`] that sleeps before every batch.
pub struct SlowEmbedder(pub Duration);

#[async_trait]
impl Embedder for SlowEmbedder {
    fn max_batch_size(&self) -> usize {
        FakeEmbedder.max_batch_size()
    }

    async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        tokio::time::sleep(self.0).await;
        FakeEmbedder.embed_batch(inputs).await
    }
}

/// Records every request; optionally fails all of them.
#[derive(Default)]
pub struct RecordingTrigger {
    pub requests: Mutex<Vec<ProcessRequest>>,
    pub fail: bool,
}

impl RecordingTrigger {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn job_ids(&self) -> Vec<Uuid> {
        self.requests
            .lock()
            .expect("requests")
            .iter()
            .map(|r| r.job_id)
            .collect()
    }
}

#[async_trait]
impl WorkerTrigger for RecordingTrigger {
    async fn trigger(&self, request: &ProcessRequest) -> Result<(), PipelineError> {
        self.requests.lock().expect("requests").push(request.clone());
        if self.fail {
            return Err(PipelineError::Trigger {
                job_id: request.job_id,
                message: "connection refused".into(),
            });
        }
        Ok(())
    }
}

pub fn call(recording_id: i64) -> CallMetadata {
    CallMetadata {
        recording_id,
        title: format!("Discovery call #{recording_id}"),
        created_at: Utc
            .with_ymd_and_hms(2024, 5, 1, 15, 0, 0)
            .single()
            .expect("valid date"),
        category: Some("discovery".into()),
    }
}

/// A short two-speaker exchange.
pub fn conversation(recording_id: i64) -> Vec<TranscriptSegment> {
    vec![
        TranscriptSegment::new(recording_id, Some("Morgan"), "Thanks for making time today.")
            .at("00:00:02")
            .with_email("morgan@example.com"),
        TranscriptSegment::new(recording_id, Some("Riley"), "Happy to. Where should we start?")
            .at("00:00:06"),
        TranscriptSegment::new(recording_id, Some("Morgan"), "Let's walk through onboarding.")
            .at("00:00:11"),
    ]
}

/// Seeds `count` transcribed calls numbered from 1.
pub fn seed_calls(store: &MemoryStore, user_id: Uuid, count: i64) {
    for id in 1..=count {
        store.add_call(user_id, call(id), conversation(id));
    }
}
