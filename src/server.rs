//! HTTP surface of the queue worker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::store::Store;
use crate::trigger::ProcessRequest;
use crate::worker::{QueueWorker, SweepReport, WorkerReport};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    worker: Arc<QueueWorker<dyn Store>>,
    sweep_batch_size: usize,
    chain: bool,
}

impl AppState {
    /// State whose handlers chain follow-up batches while work remains.
    pub fn new(worker: Arc<QueueWorker<dyn Store>>, sweep_batch_size: usize) -> Self {
        Self {
            worker,
            sweep_batch_size: sweep_batch_size.max(1),
            chain: true,
        }
    }

    /// Turns background chaining on or off.
    pub fn with_chaining(mut self, chain: bool) -> Self {
        self.chain = chain;
        self
    }
}

/// JSON error payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable failure.
    pub message: String,
}

/// Routes: `GET /healthz`, `POST /process-embeddings`, `POST /sweep`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/process-embeddings", post(process_embeddings))
        .route("/sweep", post(sweep))
        .with_state(state)
}

/// Serves `router(state)` on `listener` until the process exits.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .await
        .context("server shutdown")
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn process_embeddings(
    State(state): State<AppState>,
    Json(request): Json<ProcessRequest>,
) -> Result<Json<WorkerReport>, (StatusCode, Json<ErrorBody>)> {
    let job_id = request.job_id;
    // Detached so a caller hanging up cannot cancel a batch with entries claimed.
    let batch = tokio::spawn(run_batch(state.worker.clone(), request, state.chain));
    match batch.await {
        Ok(result) => result.map(Json).map_err(pipeline_error),
        Err(err) => {
            error!(%job_id, error = %err, "worker batch task failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    message: format!("worker batch for job {job_id} aborted"),
                }),
            ))
        }
    }
}

async fn run_batch(
    worker: Arc<QueueWorker<dyn Store>>,
    request: ProcessRequest,
    chain: bool,
) -> Result<WorkerReport, PipelineError> {
    let batch_size = request.batch_size.max(1);
    let report = worker
        .process_job(request.job_id, batch_size, &request.triggered_by)
        .await?;
    if chain && made_progress(&report) && report.pending_remaining > 0 {
        spawn_chain(worker, request.job_id, batch_size);
    }
    Ok(report)
}

async fn sweep(
    State(state): State<AppState>,
) -> Result<Json<SweepReport>, (StatusCode, Json<ErrorBody>)> {
    state
        .worker
        .sweep(state.sweep_batch_size)
        .await
        .map(Json)
        .map_err(pipeline_error)
}

fn made_progress(report: &WorkerReport) -> bool {
    report.processed + report.failed > 0
}

/// Keeps working a job in the background until its queue stops shrinking.
fn spawn_chain(worker: Arc<QueueWorker<dyn Store>>, job_id: Uuid, batch_size: usize) {
    info!(%job_id, "chaining next batch");
    tokio::spawn(async move {
        loop {
            match worker.process_job(job_id, batch_size, "chain").await {
                Ok(report) if made_progress(&report) && report.pending_remaining > 0 => continue,
                Ok(_) => break,
                Err(err) => {
                    warn!(%job_id, error = %err, "chained batch failed; job left for sweep");
                    break;
                }
            }
        }
    });
}

/// Runs [`QueueWorker::sweep`] every `interval` until the handle is aborted.
pub fn spawn_sweeper(
    worker: Arc<QueueWorker<dyn Store>>,
    interval: Duration,
    batch_size: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match worker.sweep(batch_size).await {
                Ok(report) => info!(
                    released = report.released_stale,
                    jobs = report.jobs.len(),
                    finalized = report.finalized.len(),
                    "sweep finished"
                ),
                Err(err) => error!(error = %err, "sweep failed"),
            }
        }
    })
}

fn pipeline_error(err: PipelineError) -> (StatusCode, Json<ErrorBody>) {
    let status = match &err {
        PipelineError::UnknownJob(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "worker request failed");
    }
    (
        status,
        Json(ErrorBody {
            message: err.to_string(),
        }),
    )
}
