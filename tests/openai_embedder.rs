use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use callvault_indexer::rate_limiter::{user_scope, ManualClock, GLOBAL_SCOPE};
use callvault_indexer::{
    Embedder, EmbeddingError, OpenAiEmbedder, RateLimit, RateLimiter, ScopedLimits,
};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Clone)]
struct Mock {
    calls: Arc<AtomicUsize>,
    /// Status returned for the first `failures` calls.
    failure: StatusCode,
    failures: usize,
}

async fn embeddings(
    State(mock): State<Mock>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let call = mock.calls.fetch_add(1, Ordering::SeqCst);
    if call < mock.failures {
        return (mock.failure, Json(json!({ "error": { "message": "slow down" } })));
    }
    let inputs = body["input"].as_array().cloned().unwrap_or_default();
    // Reverse order to check the client sorts by index.
    let data: Vec<Value> = inputs
        .iter()
        .enumerate()
        .rev()
        .map(|(index, text)| {
            let len = text.as_str().map(str::len).unwrap_or_default();
            json!({ "index": index, "embedding": [len as f32, index as f32] })
        })
        .collect();
    (StatusCode::OK, Json(json!({ "data": data })))
}

async fn spawn_mock(mock: Mock) -> SocketAddr {
    let app = Router::new()
        .route("/v1/embeddings", post(embeddings))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

fn client(addr: SocketAddr, attempts: usize) -> OpenAiEmbedder {
    OpenAiEmbedder::new(
        "sk-test",
        &format!("http://{addr}/v1"),
        "text-embedding-3-small",
        None,
        Duration::from_secs(5),
        attempts,
        100,
    )
    .expect("client")
    .with_backoff_base(Duration::from_millis(1))
}

#[tokio::test(flavor = "current_thread")]
async fn retries_rate_limits_and_restores_input_order() {
    let calls = Arc::new(AtomicUsize::new(0));
    let addr = spawn_mock(Mock {
        calls: calls.clone(),
        failure: StatusCode::TOO_MANY_REQUESTS,
        failures: 2,
    })
    .await;

    let vectors = client(addr, 3)
        .embed_batch(&["a", "bbb", "cc"])
        .await
        .expect("embed");

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        vectors,
        vec![vec![1.0, 0.0], vec![3.0, 1.0], vec![2.0, 2.0]]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn client_errors_fail_without_retry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let addr = spawn_mock(Mock {
        calls: calls.clone(),
        failure: StatusCode::BAD_REQUEST,
        failures: usize::MAX,
    })
    .await;

    let err = client(addr, 3)
        .embed_batch(&["hello"])
        .await
        .expect_err("400");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    match err {
        EmbeddingError::Status { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("slow down"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn exhausted_retries_surface_the_last_status() {
    let calls = Arc::new(AtomicUsize::new(0));
    let addr = spawn_mock(Mock {
        calls: calls.clone(),
        failure: StatusCode::SERVICE_UNAVAILABLE,
        failures: usize::MAX,
    })
    .await;

    let err = client(addr, 2)
        .embed_batch(&["hello"])
        .await
        .expect_err("503");

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(matches!(err, EmbeddingError::Status { status: 503, .. }));
}

#[tokio::test(flavor = "current_thread")]
async fn every_retry_passes_the_rate_limiter() {
    let calls = Arc::new(AtomicUsize::new(0));
    let addr = spawn_mock(Mock {
        calls: calls.clone(),
        failure: StatusCode::TOO_MANY_REQUESTS,
        failures: 2,
    })
    .await;
    let limiter = RateLimiter::with_clock(Arc::new(ManualClock::new()), Duration::ZERO);
    let limits = ScopedLimits {
        global: RateLimit::per_window_ms(100, 60_000),
        per_user: RateLimit::per_window_ms(100, 60_000),
    };
    let user = Uuid::new_v4();

    client(addr, 3)
        .embed_gated(&["hello"], &limiter.gate_for_user(user, &limits))
        .await
        .expect("embed");

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(limiter.admitted_in_window(GLOBAL_SCOPE), 3);
    assert_eq!(limiter.admitted_in_window(&user_scope(user)), 3);
}
