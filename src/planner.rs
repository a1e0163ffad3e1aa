//! Finds transcribed recordings that have no chunks yet.

use serde::Serialize;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::store::IndexStore;

/// Indexing coverage for one user.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coverage {
    /// Recordings with a transcript.
    pub total: usize,
    /// Recordings with at least one chunk.
    pub indexed: usize,
    /// `indexed / total * 100`, rounded to one decimal; 0 when there is nothing to index.
    pub percent: f64,
}

impl Coverage {
    fn new(total: usize, indexed: usize) -> Self {
        let percent = if total == 0 {
            0.0
        } else {
            (indexed as f64 / total as f64 * 1000.0).round() / 10.0
        };
        Self {
            total,
            indexed,
            percent,
        }
    }
}

/// Work list plus the coverage it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillPlan {
    /// Recordings that still need chunks, ascending.
    pub missing: Vec<i64>,
    /// Coverage before the backfill.
    pub coverage: Coverage,
}

/// Diffs transcribed recordings against indexed ones.
pub struct BackfillPlanner<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S> BackfillPlanner<'a, S>
where
    S: IndexStore + ?Sized,
{
    /// Planner over `store`.
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Recordings with a transcript and zero chunks.
    pub async fn plan(&self, user_id: Uuid) -> Result<Vec<i64>, PipelineError> {
        Ok(self.plan_with_coverage(user_id).await?.missing)
    }

    /// Coverage of transcribed recordings by chunks.
    pub async fn coverage(&self, user_id: Uuid) -> Result<Coverage, PipelineError> {
        Ok(self.plan_with_coverage(user_id).await?.coverage)
    }

    /// Work list and coverage from the same two reads.
    pub async fn plan_with_coverage(&self, user_id: Uuid) -> Result<BackfillPlan, PipelineError> {
        let planning = |cause| PipelineError::Planning { user_id, cause };
        let transcribed = self
            .store
            .transcribed_recordings(user_id)
            .await
            .map_err(planning)?;
        let indexed = self
            .store
            .indexed_recordings(user_id)
            .await
            .map_err(planning)?;

        let mut missing: Vec<i64> = transcribed
            .iter()
            .copied()
            .filter(|id| !indexed.contains(id))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        let covered = transcribed.len() - missing.len();
        Ok(BackfillPlan {
            missing,
            coverage: Coverage::new(transcribed.len(), covered),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Fault, MemoryStore};
    use crate::transcript::{CallMetadata, ChunkRow, TranscriptSegment};
    use chrono::Utc;

    fn call(recording_id: i64) -> CallMetadata {
        CallMetadata {
            recording_id,
            title: format!("Call {recording_id}"),
            created_at: Utc::now(),
            category: None,
        }
    }

    fn chunk(user_id: Uuid, recording_id: i64) -> ChunkRow {
        ChunkRow {
            user_id,
            recording_id,
            chunk_text: "Ada: hi".into(),
            chunk_index: 0,
            speaker_name: Some("Ada".into()),
            speaker_email: None,
            timestamp_start: None,
            timestamp_end: None,
            call_date: Utc::now(),
            call_title: "Call".into(),
            call_category: None,
            embedding: vec![0.0; 3],
            embedded_at: Utc::now(),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn plans_transcribed_recordings_without_chunks() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();
        for id in 1..=4 {
            store.add_call(user, call(id), vec![TranscriptSegment::new(id, None, "hello")]);
        }
        store.add_untranscribed_call(user, call(5));
        store.seed_chunk(chunk(user, 2));
        // Another user's chunk for the same recording id does not count.
        store.seed_chunk(chunk(other, 3));

        let plan = BackfillPlanner::new(&store)
            .plan_with_coverage(user)
            .await
            .expect("plan");

        assert_eq!(plan.missing, vec![1, 3, 4]);
        assert_eq!(plan.coverage.total, 4);
        assert_eq!(plan.coverage.indexed, 1);
        assert_eq!(plan.coverage.percent, 25.0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn coverage_rounds_to_one_decimal() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        for id in 1..=3 {
            store.add_call(user, call(id), Vec::new());
        }
        store.seed_chunk(chunk(user, 1));

        let coverage = BackfillPlanner::new(&store).coverage(user).await.expect("coverage");
        assert_eq!(coverage.percent, 33.3);

        let empty = BackfillPlanner::new(&store)
            .coverage(Uuid::new_v4())
            .await
            .expect("coverage");
        assert_eq!(empty.percent, 0.0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn read_failures_are_planning_errors() {
        let store = MemoryStore::new();
        store.inject(Fault::IndexedQuery);
        let user = Uuid::new_v4();

        let err = BackfillPlanner::new(&store).plan(user).await.expect_err("fault");
        assert!(matches!(err, PipelineError::Planning { user_id, .. } if user_id == user));
    }
}
