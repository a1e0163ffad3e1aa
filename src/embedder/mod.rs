//! Embedding clients and batched submission.

pub mod openai;

use async_trait::async_trait;
use tracing::debug;

use crate::error::EmbeddingError;
use crate::rate_limiter::RequestGate;

/// Hard ceiling on texts per upstream request.
pub const MAX_EMBEDDING_BATCH: usize = 100;

/// Anything that turns texts into vectors, one per input, in order.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Largest batch accepted by [`Embedder::embed_batch`].
    fn max_batch_size(&self) -> usize;

    /// Embeds one batch. Any upstream failure fails the whole batch.
    async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Embeds one batch once `gate` admits it.
    ///
    /// Clients that retry internally override this so every attempt passes the gate.
    async fn embed_gated(
        &self,
        inputs: &[&str],
        gate: &RequestGate,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let waited = gate.acquire().await;
        if !waited.is_zero() {
            debug!(waited_ms = waited.as_millis() as u64, "rate limited before batch");
        }
        self.embed_batch(inputs).await
    }
}

/// Embeds `texts` in batches, passing each request through `gate` first.
pub async fn embed_texts<E>(
    embedder: &E,
    texts: &[String],
    gate: &RequestGate,
) -> Result<Vec<Vec<f32>>, EmbeddingError>
where
    E: Embedder + ?Sized,
{
    let batch_size = embedder.max_batch_size().clamp(1, MAX_EMBEDDING_BATCH);
    let mut vectors = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size) {
        let inputs: Vec<&str> = batch.iter().map(String::as_str).collect();
        let embedded = embedder.embed_gated(&inputs, gate).await?;
        if embedded.len() != inputs.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: inputs.len(),
                received: embedded.len(),
            });
        }
        debug!(batch = inputs.len(), "embedded batch");
        vectors.extend(embedded);
    }
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CountingEmbedder {
        batch: usize,
        calls: Mutex<Vec<usize>>,
        short_by: usize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn max_batch_size(&self) -> usize {
            self.batch
        }

        async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.lock().expect("calls lock").push(inputs.len());
            let count = inputs.len().saturating_sub(self.short_by);
            Ok(inputs[..count]
                .iter()
                .map(|text| vec![text.len() as f32])
                .collect())
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn splits_into_capped_batches_and_keeps_order() {
        let embedder = CountingEmbedder {
            batch: 500,
            calls: Mutex::new(Vec::new()),
            short_by: 0,
        };
        let texts: Vec<String> = (0..250).map(|i| "x".repeat(i + 1)).collect();

        let vectors = embed_texts(&embedder, &texts, &RequestGate::unlimited())
            .await
            .expect("embed");

        assert_eq!(*embedder.calls.lock().expect("calls lock"), vec![100, 100, 50]);
        assert_eq!(vectors.len(), 250);
        assert_eq!(vectors[249], vec![250.0]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn short_response_is_an_error() {
        let embedder = CountingEmbedder {
            batch: 10,
            calls: Mutex::new(Vec::new()),
            short_by: 1,
        };
        let texts = vec!["a".to_string(), "b".to_string()];

        let err = embed_texts(&embedder, &texts, &RequestGate::unlimited())
            .await
            .expect_err("mismatch");
        assert!(matches!(
            err,
            EmbeddingError::CountMismatch {
                expected: 2,
                received: 1
            }
        ));
    }
}
