mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use callvault_indexer::server::{self, AppState, ErrorBody};
use callvault_indexer::trigger::{HttpWorkerTrigger, ProcessRequest, WorkerTrigger};
use callvault_indexer::worker::SweepReport;
use callvault_indexer::{
    ChunkingConfig, Embedder, JobManager, JobStatus, JobStore, MemoryStore, PipelineError,
    QueueStatus, QueueWorker, RecordingIndexer, Store, WorkerConfig, WorkerReport,
};
use common::{seed_calls, FakeEmbedder, RecordingTrigger, SlowEmbedder};
use uuid::Uuid;

async fn spawn_worker(memory: Arc<MemoryStore>, chain: bool) -> SocketAddr {
    spawn_worker_with(memory, Arc::new(FakeEmbedder), chain).await
}

async fn spawn_worker_with(
    memory: Arc<MemoryStore>,
    embedder: Arc<dyn Embedder>,
    chain: bool,
) -> SocketAddr {
    let store: Arc<dyn Store> = memory;
    let indexer = RecordingIndexer::new(store, embedder, ChunkingConfig::default());
    let worker = Arc::new(QueueWorker::new(indexer, WorkerConfig::default()));
    let state = AppState::new(worker, 10).with_chaining(chain);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = server::serve(listener, state).await;
    });
    addr
}

async fn wait_for_terminal(store: &MemoryStore, job_id: Uuid) -> JobStatus {
    let mut status = JobStatus::Running;
    for _ in 0..200 {
        status = store.job(job_id).await.expect("load").expect("job").status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    status
}

async fn queued_job(store: &Arc<MemoryStore>, user: Uuid, ids: &[i64]) -> Uuid {
    let manager = JobManager::new(store.clone(), Arc::new(RecordingTrigger::default()));
    manager.create_job(user, ids).await.expect("job")
}

#[tokio::test(flavor = "current_thread")]
async fn healthz_answers_ok() {
    let addr = spawn_worker(Arc::new(MemoryStore::new()), false).await;
    let status = reqwest::get(format!("http://{addr}/healthz"))
        .await
        .expect("request")
        .status();
    assert_eq!(status, reqwest::StatusCode::OK);
}

#[tokio::test(flavor = "current_thread")]
async fn process_endpoint_reports_batch_results() {
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();
    seed_calls(&store, user, 3);
    let job_id = queued_job(&store, user, &[1, 2, 3]).await;
    let addr = spawn_worker(store.clone(), false).await;

    let report: WorkerReport = reqwest::Client::new()
        .post(format!("http://{addr}/process-embeddings"))
        .json(&ProcessRequest {
            job_id,
            batch_size: 2,
            triggered_by: "test".into(),
        })
        .send()
        .await
        .expect("request")
        .error_for_status()
        .expect("2xx")
        .json()
        .await
        .expect("report json");

    assert_eq!(report.job_id, job_id);
    assert_eq!(report.triggered_by, "test");
    assert_eq!(report.processed, 2);
    assert_eq!(report.pending_remaining, 1);
    assert_eq!(report.job_status, JobStatus::Running);
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_job_is_not_found() {
    let addr = spawn_worker(Arc::new(MemoryStore::new()), false).await;
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/process-embeddings"))
        .json(&serde_json::json!({ "job_id": Uuid::new_v4() }))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: ErrorBody = response.json().await.expect("error json");
    assert!(body.message.contains("not found"));
}

#[tokio::test(flavor = "current_thread")]
async fn chained_batches_drain_the_job() {
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();
    seed_calls(&store, user, 4);
    let job_id = queued_job(&store, user, &[1, 2, 3, 4]).await;
    let addr = spawn_worker(store.clone(), true).await;
    let trigger = HttpWorkerTrigger::new(
        &format!("http://{addr}/process-embeddings"),
        Duration::from_secs(5),
    )
    .expect("trigger");

    trigger
        .trigger(&ProcessRequest {
            job_id,
            batch_size: 1,
            triggered_by: "test".into(),
        })
        .await
        .expect("accepted");

    assert_eq!(wait_for_terminal(&store, job_id).await, JobStatus::Completed);
    assert_eq!(store.chunks_for(user, 4).len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn trigger_surfaces_error_status_and_body() {
    let addr = spawn_worker(Arc::new(MemoryStore::new()), false).await;
    let trigger = HttpWorkerTrigger::new(
        &format!("http://{addr}/process-embeddings"),
        Duration::from_secs(5),
    )
    .expect("trigger");
    let job_id = Uuid::new_v4();

    let err = trigger
        .trigger(&ProcessRequest {
            job_id,
            batch_size: 10,
            triggered_by: "test".into(),
        })
        .await
        .expect_err("404");

    match err {
        PipelineError::Trigger { job_id: failed, message } => {
            assert_eq!(failed, job_id);
            assert!(message.starts_with("404"), "{message}");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn sweep_endpoint_processes_untriggered_jobs() {
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();
    seed_calls(&store, user, 2);
    let job_id = queued_job(&store, user, &[1, 2]).await;
    let addr = spawn_worker(store.clone(), false).await;

    let report: SweepReport = reqwest::Client::new()
        .post(format!("http://{addr}/sweep"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("sweep json");

    assert_eq!(report.jobs.len(), 1);
    assert_eq!(report.jobs[0].job_id, job_id);
    assert_eq!(report.jobs[0].job_status, JobStatus::Completed);
}

#[tokio::test(flavor = "current_thread")]
async fn caller_timeout_does_not_strand_claimed_entries() {
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();
    seed_calls(&store, user, 3);
    let job_id = queued_job(&store, user, &[1, 2, 3]).await;
    let embedder = Arc::new(SlowEmbedder(Duration::from_millis(200)));
    let addr = spawn_worker_with(store.clone(), embedder, false).await;
    let trigger = HttpWorkerTrigger::new(
        &format!("http://{addr}/process-embeddings"),
        Duration::from_millis(100),
    )
    .expect("trigger");

    trigger
        .trigger(&ProcessRequest {
            job_id,
            batch_size: 3,
            triggered_by: "test".into(),
        })
        .await
        .expect_err("caller gives up before the batch finishes");

    assert_eq!(wait_for_terminal(&store, job_id).await, JobStatus::Completed);
    let entries = store.entries_for(job_id);
    assert_eq!(entries.len(), 3);
    assert!(entries
        .iter()
        .all(|e| e.status == QueueStatus::Completed && e.attempts == 1));
}

#[tokio::test(flavor = "current_thread")]
async fn concurrent_requests_never_share_an_entry() {
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();
    seed_calls(&store, user, 6);
    let job_id = queued_job(&store, user, &[1, 2, 3, 4, 5, 6]).await;
    let embedder = Arc::new(SlowEmbedder(Duration::from_millis(10)));
    let addr = spawn_worker_with(store.clone(), embedder, false).await;
    let client = reqwest::Client::new();
    let post = |triggered_by: &'static str| {
        client
            .post(format!("http://{addr}/process-embeddings"))
            .json(&ProcessRequest {
                job_id,
                batch_size: 3,
                triggered_by: triggered_by.into(),
            })
            .send()
    };

    let (first, second) = tokio::join!(post("first"), post("second"));
    let first: WorkerReport = first.expect("first").json().await.expect("first json");
    let second: WorkerReport = second.expect("second").json().await.expect("second json");

    assert_eq!(first.processed + second.processed, 6);
    assert_eq!(first.processed, 3);
    let entries = store.entries_for(job_id);
    assert!(entries
        .iter()
        .all(|e| e.status == QueueStatus::Completed && e.attempts == 1));
    for recording_id in 1..=6 {
        assert_eq!(store.chunks_for(user, recording_id).len(), 1);
    }
    assert_eq!(wait_for_terminal(&store, job_id).await, JobStatus::Completed);
}
