//! Fire-and-report calls to the queue worker endpoint.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

/// Body of `POST /process-embeddings`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRequest {
    /// Job to work on.
    pub job_id: Uuid,
    /// Entries to claim in this invocation.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Free-form origin tag for logs (`backfill`, `sweep`, `chain`, ...).
    #[serde(default = "default_triggered_by")]
    pub triggered_by: String,
}

fn default_batch_size() -> usize {
    10
}

fn default_triggered_by() -> String {
    "api".to_string()
}

/// Something that can ask a worker to process a job.
#[async_trait]
pub trait WorkerTrigger: Send + Sync {
    /// Sends the request. Failure leaves the job for the sweep.
    async fn trigger(&self, request: &ProcessRequest) -> Result<(), PipelineError>;
}

/// Trigger over HTTP.
#[derive(Debug, Clone)]
pub struct HttpWorkerTrigger {
    client: Client,
    endpoint: String,
}

impl HttpWorkerTrigger {
    /// Trigger posting to `endpoint`.
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        anyhow::ensure!(!endpoint.trim().is_empty(), "worker endpoint is required");
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build worker HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim().to_string(),
        })
    }
}

#[async_trait]
impl WorkerTrigger for HttpWorkerTrigger {
    async fn trigger(&self, request: &ProcessRequest) -> Result<(), PipelineError> {
        let failed = |message: String| PipelineError::Trigger {
            job_id: request.job_id,
            message,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|err| failed(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(failed(format!("{status}: {}", body.trim())))
    }
}

/// Trigger that does nothing; used when jobs are left for the sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTrigger;

#[async_trait]
impl WorkerTrigger for NoopTrigger {
    async fn trigger(&self, _request: &ProcessRequest) -> Result<(), PipelineError> {
        Ok(())
    }
}
