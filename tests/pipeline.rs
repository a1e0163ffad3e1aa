mod common;

use std::sync::Arc;
use std::time::Duration;

use callvault_indexer::manager::BackfillOptions;
use callvault_indexer::store::Fault;
use callvault_indexer::{
    chunk_transcript, BackfillPlanner, ChunkingConfig, JobManager, JobStatus, JobStore,
    MemoryStore, QueueWorker, RecordingIndexer, TranscriptSegment, WorkerConfig,
};
use common::{seed_calls, FakeEmbedder, RecordingTrigger};
use pretty_assertions::assert_eq;
use uuid::Uuid;

fn indexer(store: &Arc<MemoryStore>) -> RecordingIndexer<MemoryStore> {
    RecordingIndexer::new(store.clone(), Arc::new(FakeEmbedder), ChunkingConfig::default())
}

fn worker(store: &Arc<MemoryStore>) -> QueueWorker<MemoryStore> {
    QueueWorker::new(indexer(store), WorkerConfig::default())
}

fn options(job_batch_size: usize) -> BackfillOptions {
    BackfillOptions {
        job_batch_size,
        inter_batch_delay: Duration::ZERO,
        ..BackfillOptions::default()
    }
}

#[tokio::test(flavor = "current_thread")]
async fn backfill_and_worker_reach_full_coverage() {
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();
    seed_calls(&store, user, 7);
    store.add_untranscribed_call(user, common::call(8));
    indexer(&store).index_recording(user, 3).await.expect("pre-index");

    let plan = BackfillPlanner::new(store.as_ref())
        .plan_with_coverage(user)
        .await
        .expect("plan");
    assert_eq!(plan.missing, vec![1, 2, 4, 5, 6, 7]);
    assert_eq!(plan.coverage.percent, 14.3);

    let trigger = Arc::new(RecordingTrigger::default());
    let manager = JobManager::new(store.clone(), trigger.clone());
    let summary = manager.backfill(user, &plan.missing, &options(4)).await;
    assert_eq!(summary.queued, 6);
    assert_eq!(summary.successful_job_batches, 2);
    assert_eq!(trigger.job_ids(), summary.job_ids);

    let worker = worker(&store);
    for job_id in &summary.job_ids {
        let report = worker.process_job(*job_id, 10, "test").await.expect("process");
        assert_eq!(report.failed, 0);
        assert_eq!(report.job_status, JobStatus::Completed);
    }

    let after = BackfillPlanner::new(store.as_ref())
        .plan_with_coverage(user)
        .await
        .expect("replan");
    assert!(after.missing.is_empty());
    assert_eq!(after.coverage.percent, 100.0);

    let rows = store.chunks_for(user, 5);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].call_title, "Discovery call #5");
    assert_eq!(rows[0].speaker_name.as_deref(), Some("Morgan"));
    assert_eq!(rows[0].speaker_email.as_deref(), Some("morgan@example.com"));
    assert_eq!(rows[0].call_category.as_deref(), Some("discovery"));
}

#[tokio::test(flavor = "current_thread")]
async fn failed_recordings_can_be_requeued() {
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();
    seed_calls(&store, user, 3);
    store.inject(Fault::ChunkInsert(2));

    let trigger = Arc::new(RecordingTrigger::default());
    let manager = JobManager::new(store.clone(), trigger.clone());
    let job_id = manager.create_job(user, &[1, 2, 3]).await.expect("job");
    let worker = worker(&store);

    let first = worker.process_job(job_id, 10, "test").await.expect("first pass");
    assert_eq!((first.processed, first.failed), (2, 1));
    assert_eq!(first.job_status, JobStatus::CompletedWithErrors);

    store.clear_fault(Fault::ChunkInsert(2));
    let requeue = manager.requeue_failed(job_id, 10).await.expect("requeue");
    assert_eq!(requeue.requeued, 1);
    assert!(requeue.triggered);
    let job = store.job(job_id).await.expect("load").expect("job");
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.queue_failed, 0);

    let second = worker.process_job(job_id, 10, "retry").await.expect("second pass");
    assert_eq!(second.processed, 1);
    assert_eq!(second.job_status, JobStatus::Completed);
    let job = store.job(job_id).await.expect("load").expect("job");
    assert_eq!(job.queue_completed, 3);
    assert_eq!(job.progress_current, 3);
    assert_eq!(store.chunks_for(user, 2).len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn inline_run_lists_failures_and_is_repeatable() {
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();
    seed_calls(&store, user, 4);
    store.inject(Fault::SegmentFetch(4));
    let indexer = indexer(&store);

    let first = indexer.index_all(user, &[1, 2, 3, 4]).await;
    assert_eq!(first.processed, 3);
    assert_eq!(first.failures.len(), 1);
    assert_eq!(first.failures[0].recording_id, 4);
    assert!(!first.is_clean());

    let snapshot = |id| {
        store
            .chunks_for(user, id)
            .into_iter()
            .map(|row| (row.chunk_index, row.chunk_text))
            .collect::<Vec<_>>()
    };
    let before = snapshot(1);
    let second = indexer.index_all(user, &[1]).await;
    assert!(second.is_clean());
    assert_eq!(snapshot(1), before);
}

#[test]
fn oversized_overlap_segment_is_not_carried() {
    let segments: Vec<TranscriptSegment> = (0..3)
        .map(|i| TranscriptSegment::new(9, None, format!("{i}").repeat(600)))
        .collect();

    let narrow = chunk_transcript(
        &segments,
        &ChunkingConfig {
            max_tokens: 300,
            overlap_tokens: 100,
        },
    );
    let spans: Vec<Vec<usize>> = narrow.iter().map(|c| c.segments.clone()).collect();
    assert_eq!(spans, vec![vec![0, 1], vec![2]]);
    assert_eq!(narrow[0].token_estimate, 300);

    let wide = chunk_transcript(
        &segments,
        &ChunkingConfig {
            max_tokens: 300,
            overlap_tokens: 150,
        },
    );
    let spans: Vec<Vec<usize>> = wide.iter().map(|c| c.segments.clone()).collect();
    assert_eq!(spans, vec![vec![0, 1], vec![1, 2]]);
}
