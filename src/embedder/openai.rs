//! OpenAI-compatible embeddings client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Embedder, MAX_EMBEDDING_BATCH};
use crate::error::EmbeddingError;
use crate::rate_limiter::RequestGate;

/// Async embeddings client for `POST {base}/embeddings`.
#[derive(Clone, Debug)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
    max_attempts: usize,
    batch_size: usize,
    backoff_base: Duration,
}

impl OpenAiEmbedder {
    /// Builds a client. `timeout` bounds every request; `max_attempts` counts the first try.
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        dimensions: Option<usize>,
        timeout: Duration,
        max_attempts: usize,
        batch_size: usize,
    ) -> Result<Self, EmbeddingError> {
        if api_key.trim().is_empty() {
            return Err(EmbeddingError::InvalidConfig("missing API key".into()));
        }
        if model.trim().is_empty() {
            return Err(EmbeddingError::InvalidConfig("missing model name".into()));
        }
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|_| EmbeddingError::InvalidConfig("API key is not a valid header".into()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.trim().to_string(),
            dimensions,
            max_attempts: max_attempts.max(1),
            batch_size: batch_size.clamp(1, MAX_EMBEDDING_BATCH),
            backoff_base: Duration::from_millis(500),
        })
    }

    /// Overrides the first retry delay (doubles on each further attempt).
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Configured model identifier.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn retry_backoff(&self, attempt: usize) -> Duration {
        let capped = attempt.min(5) as u32;
        self.backoff_base * (1 << capped)
    }

    /// Sends one batch, retrying 429/5xx and transport failures. Every attempt passes `gate`.
    async fn send_batch(
        &self,
        inputs: &[&str],
        gate: &RequestGate,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        if inputs.len() > self.batch_size {
            return Err(EmbeddingError::InvalidConfig(format!(
                "batch of {} exceeds configured max {}",
                inputs.len(),
                self.batch_size
            )));
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
            dimensions: self.dimensions,
        };
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let retries_left = attempt < self.max_attempts;
            gate.acquire().await;
            match self.client.post(&self.endpoint).json(&request).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let mut parsed: EmbeddingResponse = resp.json().await?;
                        parsed.data.sort_by_key(|entry| entry.index);
                        if parsed.data.len() != inputs.len() {
                            return Err(EmbeddingError::CountMismatch {
                                expected: inputs.len(),
                                received: parsed.data.len(),
                            });
                        }
                        return Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect());
                    }

                    let body = resp
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && retries_left {
                        let delay = self.retry_backoff(attempt);
                        warn!(
                            status = status.as_u16(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying embedding request"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(EmbeddingError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(err) => {
                    if is_retryable_error(&err) && retries_left {
                        let delay = self.retry_backoff(attempt);
                        warn!(
                            error = %err,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying embedding request"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn max_batch_size(&self) -> usize {
        self.batch_size
    }

    async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.send_batch(inputs, &RequestGate::unlimited()).await
    }

    async fn embed_gated(
        &self,
        inputs: &[&str],
        gate: &RequestGate,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.send_batch(inputs, gate).await
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_credentials() {
        let err = OpenAiEmbedder::new(
            "  ",
            "https://api.openai.com/v1",
            "text-embedding-3-small",
            None,
            Duration::from_secs(5),
            3,
            100,
        )
        .expect_err("blank key");
        assert!(matches!(err, EmbeddingError::InvalidConfig(_)));
    }

    #[test]
    fn clamps_batch_and_normalizes_endpoint() {
        let embedder = OpenAiEmbedder::new(
            "sk-test",
            "http://localhost:9000/v1/",
            "text-embedding-3-small",
            Some(512),
            Duration::from_secs(5),
            3,
            1_000,
        )
        .expect("client");
        assert_eq!(embedder.max_batch_size(), MAX_EMBEDDING_BATCH);
        assert_eq!(embedder.endpoint, "http://localhost:9000/v1/embeddings");
        assert_eq!(embedder.retry_backoff(1), Duration::from_millis(1_000));
        assert_eq!(embedder.retry_backoff(9), Duration::from_millis(16_000));
    }
}
