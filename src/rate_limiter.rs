//! Fixed-window request throttle with independent scopes.
//!
//! Every caller of the upstream API shares one [`RateLimiter`]. Each scope
//! (for example `"global"` and `"user:<id>"`) keeps its own window start and
//! request count, so one identity exhausting its allowance never consumes
//! another scope's budget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Scope name shared by every caller.
pub const GLOBAL_SCOPE: &str = "global";
/// Upper bound (exclusive) on the random delay added to each wait.
pub const DEFAULT_JITTER: Duration = Duration::from_millis(200);

/// Scope name for a single user.
pub fn user_scope(user_id: Uuid) -> String {
    format!("user:{user_id}")
}

/// Source of time for the limiter.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;
    /// Suspends the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio's timer (honours paused test time).
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Deterministic clock: sleeping advances time instantly and is recorded.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    now: Instant,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    /// Starts the clock at the current instant.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: Instant::now(),
                sleeps: Vec::new(),
            }),
        }
    }

    /// Moves time forward without recording a sleep.
    pub fn advance(&self, by: Duration) {
        lock(&self.state).now += by;
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.state).sleeps.clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        lock(&self.state).now
    }

    async fn sleep(&self, duration: Duration) {
        let mut state = lock(&self.state);
        state.now += duration;
        state.sleeps.push(duration);
    }
}

/// Request ceiling for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Requests admitted per window.
    pub max_requests: u32,
    /// Window length.
    pub window: Duration,
}

impl RateLimit {
    /// Builds a limit from a count and a window in milliseconds.
    pub fn per_window_ms(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_millis(window_ms),
        }
    }
}

#[derive(Debug)]
struct ScopeWindow {
    started: Instant,
    count: u32,
    window: Duration,
    last_touched: Instant,
}

#[derive(Debug)]
struct LimiterState {
    windows: HashMap<String, ScopeWindow>,
    last_sweep: Instant,
}

/// Shared, clonable throttle.
#[derive(Clone)]
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<LimiterState>>,
    jitter: Duration,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("scopes", &self.tracked_scopes())
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Limiter on the tokio clock with the default jitter.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(TokioClock), DEFAULT_JITTER)
    }

    /// Limiter with an injected clock and jitter ceiling (zero disables jitter).
    pub fn with_clock(clock: Arc<dyn Clock>, jitter: Duration) -> Self {
        let now = clock.now();
        Self {
            clock,
            state: Arc::new(Mutex::new(LimiterState {
                windows: HashMap::new(),
                last_sweep: now,
            })),
            jitter,
        }
    }

    /// Waits until `scope` has a free slot, then reserves it.
    ///
    /// Returns the total time spent waiting.
    pub async fn throttle(&self, scope: &str, limit: RateLimit) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            let Err(remaining) = self.try_acquire(scope, limit) else {
                return waited;
            };
            let pause = remaining + self.jitter_sample();
            debug!(
                scope,
                wait_ms = pause.as_millis() as u64,
                "rate limit reached; waiting for next window"
            );
            self.clock.sleep(pause).await;
            waited += pause;
        }
    }

    /// Reserves a slot without waiting; on refusal returns the time left in the window.
    pub fn try_acquire(&self, scope: &str, limit: RateLimit) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut state = lock(&self.state);
        sweep_idle(&mut state, now, limit.window);

        let entry = state
            .windows
            .entry(scope.to_string())
            .or_insert_with(|| ScopeWindow {
                started: now,
                count: 0,
                window: limit.window,
                last_touched: now,
            });
        entry.window = limit.window;
        entry.last_touched = now;

        let elapsed = now.saturating_duration_since(entry.started);
        if elapsed >= limit.window {
            entry.started = now;
            entry.count = 0;
        }
        if entry.count >= limit.max_requests.max(1) {
            let elapsed = now.saturating_duration_since(entry.started);
            return Err(limit.window.saturating_sub(elapsed));
        }
        entry.count += 1;
        Ok(())
    }

    /// Number of scopes currently holding window state.
    pub fn tracked_scopes(&self) -> usize {
        lock(&self.state).windows.len()
    }

    /// Requests already admitted in the scope's current window.
    pub fn admitted_in_window(&self, scope: &str) -> u32 {
        lock(&self.state)
            .windows
            .get(scope)
            .map(|window| window.count)
            .unwrap_or(0)
    }

    /// Gate throttled by the user's own scope, then the global scope.
    ///
    /// A user waiting out their own window holds no global slot.
    pub fn gate_for_user(&self, user_id: Uuid, limits: &ScopedLimits) -> RequestGate {
        RequestGate {
            limiter: Some(self.clone()),
            scopes: vec![
                (user_scope(user_id), limits.per_user),
                (GLOBAL_SCOPE.to_string(), limits.global),
            ],
        }
    }

    fn jitter_sample(&self) -> Duration {
        let ceiling = self.jitter.as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..ceiling))
    }
}

/// Drops scopes idle for at least twice their window, at most once per window.
fn sweep_idle(state: &mut LimiterState, now: Instant, window: Duration) {
    if now.saturating_duration_since(state.last_sweep) < window {
        return;
    }
    state.last_sweep = now;
    state
        .windows
        .retain(|_, scope| now.saturating_duration_since(scope.last_touched) < scope.window * 2);
}

// Counters stay valid even if a holder panicked mid-update.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ceilings applied to every upstream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopedLimits {
    /// Shared ceiling across all users.
    pub global: RateLimit,
    /// Ceiling per user.
    pub per_user: RateLimit,
}

/// A set of scopes that must all admit a request before it is sent.
#[derive(Debug, Clone, Default)]
pub struct RequestGate {
    limiter: Option<RateLimiter>,
    scopes: Vec<(String, RateLimit)>,
}

impl RequestGate {
    /// Gate that never waits.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Throttles against every scope in order.
    pub async fn acquire(&self) -> Duration {
        let Some(limiter) = &self.limiter else {
            return Duration::ZERO;
        };
        let mut waited = Duration::ZERO;
        for (scope, limit) in &self.scopes {
            waited += limiter.throttle(scope, *limit).await;
        }
        waited
    }
}
