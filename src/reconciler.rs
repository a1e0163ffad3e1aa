//! Client-visible job state fed by polling and a realtime channel.
//!
//! Both producers feed [`apply_job_observation`], a pure reducer keyed by job
//! id. The reducer decides which side effects fire, so the same completion seen
//! twice (once by push, once by poll) only fires once.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::job::{EmbeddingJob, JobStatus, QueueStatus};
use crate::store::JobStore;

/// Default time a completed job stays in the recent list.
pub const DEFAULT_COMPLETION_GRACE: Duration = Duration::from_secs(8);

/// Job fields the reconciler tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Job id.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Status at observation time.
    pub status: JobStatus,
    /// Recordings finished.
    pub progress_current: i64,
    /// Recordings expected.
    pub progress_total: i64,
    /// Entries completed.
    pub queue_completed: i64,
    /// Entries failed.
    pub queue_failed: i64,
    /// Chunks written.
    pub chunks_created: i64,
    /// Recordings queued under the job. Empty when the producer omitted them.
    #[serde(default)]
    pub recording_ids: Vec<i64>,
}

impl From<&EmbeddingJob> for JobSnapshot {
    fn from(job: &EmbeddingJob) -> Self {
        Self {
            id: job.id,
            user_id: job.user_id,
            status: job.status,
            progress_current: job.progress_current,
            progress_total: job.progress_total,
            queue_completed: job.queue_completed,
            queue_failed: job.queue_failed,
            chunks_created: job.chunks_created,
            recording_ids: job.recording_ids.clone(),
        }
    }
}

/// Input to the reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// A job row as seen by a poll or a push.
    Job(JobSnapshot),
    /// A recording's queue entry completed.
    RecordingSynced {
        /// Owning job.
        job_id: Uuid,
        /// Recording that now has chunks.
        recording_id: i64,
    },
    /// A completed job's grace period elapsed.
    DismissCompleted(Uuid),
}

/// Output of the reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// A job the client saw running has reached a terminal status.
    JobCompleted(JobSnapshot),
    /// Recordings removed from the pending list.
    RecordingsSynced {
        /// Owning job.
        job_id: Uuid,
        /// Recordings removed.
        recording_ids: Vec<i64>,
    },
    /// Start the timer that later yields [`Observation::DismissCompleted`].
    ScheduleDismissal {
        /// Job to dismiss.
        job_id: Uuid,
        /// Delay before dismissal.
        after: Duration,
    },
    /// A completed job left the recent list.
    CompletedDismissed(Uuid),
}

/// Events decoded from the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    /// The subscription is live.
    Subscribed,
    /// A job row changed.
    JobUpdated(JobSnapshot),
    /// A queue entry changed status.
    QueueUpdated {
        /// Owning job.
        job_id: Uuid,
        /// Recording of the entry.
        recording_id: i64,
        /// New status.
        status: QueueStatus,
    },
    /// The subscription ended.
    Closed,
}

/// Reducer state.
#[derive(Debug, Clone)]
pub struct SyncState {
    known: HashMap<Uuid, JobStatus>,
    active: BTreeMap<Uuid, JobSnapshot>,
    recently_completed: BTreeMap<Uuid, JobSnapshot>,
    pending_recordings: BTreeSet<i64>,
    synced: HashMap<Uuid, HashSet<i64>>,
    job_recordings: HashMap<Uuid, Vec<i64>>,
    grace: Duration,
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new(DEFAULT_COMPLETION_GRACE)
    }
}

impl SyncState {
    /// Empty state with the given completion grace period.
    pub fn new(grace: Duration) -> Self {
        Self {
            known: HashMap::new(),
            active: BTreeMap::new(),
            recently_completed: BTreeMap::new(),
            pending_recordings: BTreeSet::new(),
            synced: HashMap::new(),
            job_recordings: HashMap::new(),
            grace,
        }
    }

    /// Adds recordings the client shows as waiting for indexing.
    pub fn track_pending(mut self, recording_ids: impl IntoIterator<Item = i64>) -> Self {
        self.extend_pending(recording_ids);
        self
    }

    fn extend_pending(&mut self, recording_ids: impl IntoIterator<Item = i64>) {
        self.pending_recordings.extend(recording_ids);
    }

    /// Jobs still running.
    pub fn active_jobs(&self) -> impl Iterator<Item = &JobSnapshot> {
        self.active.values()
    }

    /// Jobs completed within the grace period.
    pub fn recently_completed(&self) -> impl Iterator<Item = &JobSnapshot> {
        self.recently_completed.values()
    }

    /// Recordings still waiting.
    pub fn pending_recordings(&self) -> &BTreeSet<i64> {
        &self.pending_recordings
    }
}

/// Folds one observation into `previous`, returning the next state and the effects to fire.
pub fn apply_job_observation(
    previous: &SyncState,
    observed: Observation,
) -> (SyncState, Vec<SideEffect>) {
    let mut next = previous.clone();
    let mut effects = Vec::new();

    match observed {
        Observation::Job(snapshot) => {
            let before = next.known.insert(snapshot.id, snapshot.status);
            if !snapshot.recording_ids.is_empty() {
                next.job_recordings.insert(snapshot.id, snapshot.recording_ids.clone());
            }
            if snapshot.status.is_terminal() {
                next.active.remove(&snapshot.id);
                let was_open = before.is_some_and(|status| !status.is_terminal());
                let recordings = next.job_recordings.remove(&snapshot.id).unwrap_or_default();
                if was_open {
                    // Recordings the realtime channel never reported are settled now too.
                    let synced = next.synced.remove(&snapshot.id).unwrap_or_default();
                    let settled: Vec<i64> = recordings
                        .into_iter()
                        .filter(|id| !synced.contains(id))
                        .filter(|id| next.pending_recordings.remove(id))
                        .collect();
                    if !settled.is_empty() {
                        effects.push(SideEffect::RecordingsSynced {
                            job_id: snapshot.id,
                            recording_ids: settled,
                        });
                    }
                    next.recently_completed.insert(snapshot.id, snapshot.clone());
                    effects.push(SideEffect::JobCompleted(snapshot.clone()));
                    effects.push(SideEffect::ScheduleDismissal {
                        job_id: snapshot.id,
                        after: next.grace,
                    });
                }
            } else {
                next.active.insert(snapshot.id, snapshot);
            }
        }
        Observation::RecordingSynced {
            job_id,
            recording_id,
        } => {
            let first_time = next.synced.entry(job_id).or_default().insert(recording_id);
            if first_time && next.pending_recordings.remove(&recording_id) {
                effects.push(SideEffect::RecordingsSynced {
                    job_id,
                    recording_ids: vec![recording_id],
                });
            }
        }
        Observation::DismissCompleted(job_id) => {
            if next.recently_completed.remove(&job_id).is_some() {
                effects.push(SideEffect::CompletedDismissed(job_id));
            }
        }
    }

    (next, effects)
}

/// Poll cadence and windows for the driver.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// Poll interval while realtime is unconfirmed.
    pub fast_poll: Duration,
    /// Poll interval once realtime is subscribed.
    pub slow_poll: Duration,
    /// How far back a poll looks for recently updated jobs.
    pub recent_window: Duration,
    /// How long completed jobs stay listed.
    pub completion_grace: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            fast_poll: Duration::from_secs(2),
            slow_poll: Duration::from_secs(10),
            recent_window: Duration::from_secs(60),
            completion_grace: DEFAULT_COMPLETION_GRACE,
        }
    }
}

/// Async driver running the poll loop and the realtime consumer against one [`SyncState`].
pub struct SyncStateReconciler<S: ?Sized> {
    store: Arc<S>,
    user_id: Uuid,
    config: ReconcilerConfig,
    state: SyncState,
    realtime: Option<mpsc::Receiver<RealtimeEvent>>,
    subscribed: bool,
    effects: mpsc::UnboundedSender<SideEffect>,
    dismiss_tx: mpsc::UnboundedSender<Uuid>,
    dismiss_rx: mpsc::UnboundedReceiver<Uuid>,
    timers: HashMap<Uuid, JoinHandle<()>>,
}

impl<S> SyncStateReconciler<S>
where
    S: JobStore + ?Sized,
{
    /// Builds a driver and the receiver its side effects are delivered on.
    pub fn new(
        store: Arc<S>,
        user_id: Uuid,
        config: ReconcilerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SideEffect>) {
        let (effects, effects_rx) = mpsc::unbounded_channel();
        let (dismiss_tx, dismiss_rx) = mpsc::unbounded_channel();
        let reconciler = Self {
            store,
            user_id,
            config,
            state: SyncState::new(config.completion_grace),
            realtime: None,
            subscribed: false,
            effects,
            dismiss_tx,
            dismiss_rx,
            timers: HashMap::new(),
        };
        (reconciler, effects_rx)
    }

    /// Attaches a realtime event source.
    pub fn with_realtime(mut self, events: mpsc::Receiver<RealtimeEvent>) -> Self {
        self.realtime = Some(events);
        self
    }

    /// Seeds the pending-recordings list.
    pub fn track_pending(mut self, recording_ids: impl IntoIterator<Item = i64>) -> Self {
        self.state.extend_pending(recording_ids);
        self
    }

    /// Seeds the pending list with every recording of the user's open jobs.
    pub async fn track_open_jobs(mut self) -> anyhow::Result<Self> {
        let jobs = self.store.recent_jobs(self.user_id, Utc::now()).await?;
        let pending: Vec<i64> = jobs
            .into_iter()
            .filter(|job| !job.status.is_terminal())
            .flat_map(|job| job.recording_ids)
            .collect();
        debug!(recordings = pending.len(), "tracking recordings of open jobs");
        self.state.extend_pending(pending);
        Ok(self)
    }

    /// Current reducer state.
    pub fn state(&self) -> &SyncState {
        &self.state
    }

    fn poll_interval(&self) -> Duration {
        if self.subscribed {
            self.config.slow_poll
        } else {
            self.config.fast_poll
        }
    }

    /// Runs until `shutdown` resolves.
    pub async fn run<F>(mut self, shutdown: F) -> SyncState
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut next_poll = Instant::now();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep_until(next_poll) => {
                    self.poll().await;
                    next_poll = Instant::now() + self.poll_interval();
                }
                event = next_event(&mut self.realtime) => {
                    self.on_realtime(event.unwrap_or(RealtimeEvent::Closed));
                }
                Some(job_id) = self.dismiss_rx.recv() => {
                    self.timers.remove(&job_id);
                    self.apply(Observation::DismissCompleted(job_id));
                }
            }
        }
        std::mem::take(&mut self.timers)
            .into_values()
            .for_each(|timer| timer.abort());
        self.state.clone()
    }

    async fn poll(&mut self) {
        let window = chrono::Duration::from_std(self.config.recent_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let since = Utc::now() - window;
        match self.store.recent_jobs(self.user_id, since).await {
            Ok(jobs) => {
                debug!(jobs = jobs.len(), "polled job state");
                for job in &jobs {
                    self.apply(Observation::Job(JobSnapshot::from(job)));
                }
            }
            Err(err) => warn!(error = %err, "job poll failed; retrying next tick"),
        }
    }

    fn on_realtime(&mut self, event: RealtimeEvent) {
        match event {
            RealtimeEvent::Subscribed => {
                info!("realtime subscription confirmed; slowing poll cadence");
                self.subscribed = true;
            }
            RealtimeEvent::JobUpdated(snapshot) if snapshot.user_id == self.user_id => {
                self.apply(Observation::Job(snapshot));
            }
            RealtimeEvent::JobUpdated(_) => {}
            RealtimeEvent::QueueUpdated {
                job_id,
                recording_id,
                status: QueueStatus::Completed,
            } => {
                self.apply(Observation::RecordingSynced {
                    job_id,
                    recording_id,
                });
            }
            RealtimeEvent::QueueUpdated { .. } => {}
            RealtimeEvent::Closed => {
                if self.realtime.take().is_some() {
                    warn!("realtime channel closed; falling back to polling");
                }
                self.subscribed = false;
            }
        }
    }

    fn apply(&mut self, observation: Observation) {
        let (next, effects) = apply_job_observation(&self.state, observation);
        self.state = next;
        for effect in effects {
            match effect {
                SideEffect::ScheduleDismissal { job_id, after } => {
                    let tx = self.dismiss_tx.clone();
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(job_id);
                    });
                    if let Some(previous) = self.timers.insert(job_id, timer) {
                        previous.abort();
                    }
                }
                other => {
                    let _ = self.effects.send(other);
                }
            }
        }
    }
}

impl<S: ?Sized> Drop for SyncStateReconciler<S> {
    fn drop(&mut self) {
        for timer in self.timers.values() {
            timer.abort();
        }
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<RealtimeEvent>>) -> Option<RealtimeEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
