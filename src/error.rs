//! Error taxonomy for the indexing pipeline.

use thiserror::Error;
use uuid::Uuid;

/// Failures raised by embedding clients.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// The upstream API answered with a non-2xx status.
    #[error("embedding request failed ({status}): {body}")]
    Status {
        /// HTTP status code returned by the upstream API.
        status: u16,
        /// Response body, surfaced verbatim for operators.
        body: String,
    },
    /// Transport-level failure, including caller-side timeouts.
    #[error("embedding request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The upstream API returned a different number of vectors than inputs.
    #[error("embedding service returned {received} vectors for {expected} inputs")]
    CountMismatch {
        /// Number of inputs submitted.
        expected: usize,
        /// Number of vectors received.
        received: usize,
    },
    /// The client was built with unusable settings.
    #[error("invalid embedding client configuration: {0}")]
    InvalidConfig(String),
}

/// Failures isolated to a single recording.
#[derive(Debug, Error)]
pub enum RecordingError {
    /// The call row for the recording no longer exists.
    #[error("call {0} not found")]
    CallNotFound(i64),
    /// Reading call metadata failed.
    #[error("failed to read call metadata: {0:#}")]
    Metadata(anyhow::Error),
    /// Reading transcript segments failed.
    #[error("failed to fetch transcript segments: {0:#}")]
    Segments(anyhow::Error),
    /// The embedding API rejected or timed out on a batch.
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    /// Replacing the recording's chunk rows failed.
    #[error("failed to store chunks: {0:#}")]
    Insert(anyhow::Error),
}

/// Pipeline-level failures, one variant per stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Storage read failure while diffing transcribed against indexed recordings.
    #[error("failed to plan backfill for user {user_id}: {cause:#}")]
    Planning {
        /// User whose recordings were being planned.
        user_id: Uuid,
        /// Underlying storage error.
        cause: anyhow::Error,
    },
    /// Job row or queue entries could not be created.
    #[error("failed to create embedding job{}: {cause:#}", job_label(.job_id))]
    JobCreation {
        /// Job id when the job row was inserted before the failure.
        job_id: Option<Uuid>,
        /// Underlying storage error.
        cause: anyhow::Error,
    },
    /// The worker endpoint could not be reached or answered non-2xx.
    #[error("failed to trigger worker for job {job_id}: {message}")]
    Trigger {
        /// Job the trigger was meant for.
        job_id: Uuid,
        /// Transport error or response body.
        message: String,
    },
    /// The requested job does not exist.
    #[error("embedding job {0} not found")]
    UnknownJob(Uuid),
    /// A single recording failed to index.
    #[error("recording {recording_id} failed: {source}")]
    Recording {
        /// Recording that failed.
        recording_id: i64,
        /// Stage-specific failure.
        #[source]
        source: RecordingError,
    },
    /// Any other storage failure.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

fn job_label(job_id: &Option<Uuid>) -> String {
    job_id.map(|id| format!(" {id}")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_creation_message_names_job_when_known() {
        let job_id = Uuid::nil();
        let err = PipelineError::JobCreation {
            job_id: Some(job_id),
            cause: anyhow::anyhow!("insert rejected"),
        };
        assert_eq!(
            err.to_string(),
            format!("failed to create embedding job {job_id}: insert rejected")
        );

        let err = PipelineError::JobCreation {
            job_id: None,
            cause: anyhow::anyhow!("connection reset"),
        };
        assert_eq!(
            err.to_string(),
            "failed to create embedding job: connection reset"
        );
    }

    #[test]
    fn status_error_surfaces_body() {
        let err = EmbeddingError::Status {
            status: 429,
            body: "slow down".into(),
        };
        assert_eq!(err.to_string(), "embedding request failed (429): slow down");
    }
}
