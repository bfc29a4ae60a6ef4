//! Cluster-wide request budget.
//!
//! [`TokenBudgetLimiter`] enforces the remote provider's quota across every
//! process that shares a [`CoordinationStore`]. The whole budget lives in one
//! JSON value:
//!
//! ```json
//! {"window_ends_at_ms": 1700000060000, "remaining": 118,
//!  "next_dispatch_at_ms": 1700000000100, "blocked_until_ms": 0}
//! ```
//!
//! and every mutation is a compare-and-swap of that value against the copy the
//! caller read, so concurrent processes never double-spend a unit.
//!
//! ## Rules
//!
//! - **Fixed windows**: `remaining` refills to `capacity` once the window ends
//! - **Spacing**: consecutive grants are at least `min_spacing` apart, cluster-wide
//! - **Throttle backoff**: a provider 429 blocks every grant until `blocked_until`
//! - **Serialized dispatch**: a [`DispatchPermit`] holds a process-local FIFO
//!   gate, so one limiter instance has at most one call in flight
//!
//! Store failures are returned to the caller. Failing the call is the only
//! safe answer when the shared budget cannot be read.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use statsync_core::clock::{self, Clock, SystemClock};
use statsync_core::kv::CoordinationStore;

use crate::error::{Error, Result};
use crate::metrics::SyncMetrics;

/// Upper bound on compare-and-swap retries for one budget mutation.
const MAX_CAS_ATTEMPTS: usize = 64;

/// Budget configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetConfig {
    /// Units granted per window.
    pub capacity: u32,
    /// Window length; the budget refills to `capacity` at each boundary.
    pub refill_interval: Duration,
    /// Minimum time between two dispatch starts.
    pub min_spacing: Duration,
    /// First throttle backoff when the provider gives no hint.
    pub backoff_base: Duration,
    /// Cap on computed throttle backoff.
    pub backoff_max: Duration,
    /// Cap on provider-supplied `Retry-After` hints.
    pub max_retry_after: Duration,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            capacity: 120,
            refill_interval: Duration::from_secs(60),
            min_spacing: Duration::from_millis(100),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            max_retry_after: Duration::from_secs(300),
        }
    }
}

impl BudgetConfig {
    /// Returns the delay to apply after the provider throttled a call.
    ///
    /// A server hint wins (capped at `max_retry_after`); otherwise the delay
    /// is `backoff_base * 2^attempt`, capped at `backoff_max`.
    #[must_use]
    pub fn throttle_delay(&self, retry_after: Option<Duration>, attempt: u32) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.max_retry_after),
            None => {
                let factor = 2_u32.saturating_pow(attempt.min(31));
                self.backoff_base
                    .saturating_mul(factor)
                    .min(self.backoff_max)
            }
        }
    }
}

/// Result of a non-blocking acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// One unit was consumed.
    Granted {
        /// Units left in the current window.
        remaining: u32,
    },
    /// No unit can be granted before this much time has passed.
    Wait(Duration),
}

impl Acquire {
    /// Returns true if a unit was granted.
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

/// Shared budget state, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct BudgetState {
    window_ends_at_ms: i64,
    remaining: u32,
    next_dispatch_at_ms: i64,
    blocked_until_ms: i64,
}

impl BudgetState {
    fn fresh(now: DateTime<Utc>, config: &BudgetConfig) -> Self {
        Self {
            window_ends_at_ms: ceil_millis(clock::after(now, config.refill_interval)),
            remaining: config.capacity,
            next_dispatch_at_ms: 0,
            blocked_until_ms: 0,
        }
    }

    /// Starts a new window if the current one has ended.
    fn refill(&mut self, now: DateTime<Utc>, config: &BudgetConfig) {
        if now.timestamp_millis() >= self.window_ends_at_ms {
            self.window_ends_at_ms = ceil_millis(clock::after(now, config.refill_interval));
            self.remaining = config.capacity;
        }
        // Tolerate a capacity lowered by configuration.
        self.remaining = self.remaining.min(config.capacity);
    }

    /// Returns how long a grant must wait, or `None` if it can be made now.
    fn wait_for_grant(&self, now: DateTime<Utc>) -> Option<Duration> {
        let now_ms = now.timestamp_millis();
        let mut ready_at_ms = self.blocked_until_ms.max(self.next_dispatch_at_ms);
        if self.remaining == 0 {
            ready_at_ms = ready_at_ms.max(self.window_ends_at_ms);
        }
        (ready_at_ms > now_ms).then(|| millis_between(now, ready_at_ms))
    }
}

/// Rounds a timestamp up to whole milliseconds, so stored deadlines are never early.
fn ceil_millis(at: DateTime<Utc>) -> i64 {
    let floor = at.timestamp_millis();
    if at.timestamp_subsec_nanos() % 1_000_000 == 0 {
        floor
    } else {
        floor.saturating_add(1)
    }
}

fn millis_between(now: DateTime<Utc>, deadline_ms: i64) -> Duration {
    DateTime::<Utc>::from_timestamp_millis(deadline_ms)
        .map_or(Duration::ZERO, |deadline| clock::until(now, deadline))
}

/// Proof of a granted budget unit.
///
/// Holds the limiter's dispatch gate; drop it when the outbound call finishes.
#[derive(Debug)]
pub struct DispatchPermit {
    _gate: OwnedMutexGuard<()>,
    remaining: u32,
}

impl DispatchPermit {
    /// Units left in the window right after this grant.
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.remaining
    }
}

/// Token budget shared through a coordination store.
pub struct TokenBudgetLimiter {
    store: Arc<dyn CoordinationStore>,
    key: String,
    config: BudgetConfig,
    clock: Arc<dyn Clock>,
    gate: Arc<Mutex<()>>,
    metrics: SyncMetrics,
}

impl std::fmt::Debug for TokenBudgetLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBudgetLimiter")
            .field("key", &self.key)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TokenBudgetLimiter {
    /// Creates a limiter whose state lives under `budget:{name}`.
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, name: &str, config: BudgetConfig) -> Self {
        Self {
            store,
            key: format!("budget:{name}"),
            config,
            clock: Arc::new(SystemClock),
            gate: Arc::new(Mutex::new(())),
            metrics: SyncMetrics::new(),
        }
    }

    /// Uses the given clock for windows and deadlines.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the limiter configuration.
    #[must_use]
    pub const fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Attempts to take one unit without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or the budget is under
    /// persistent write contention.
    pub async fn try_acquire(&self) -> Result<Acquire> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let (raw, mut state) = self.load(now).await?;
            state.refill(now, &self.config);

            if let Some(wait) = state.wait_for_grant(now) {
                return Ok(Acquire::Wait(wait));
            }

            state.remaining -= 1;
            state.next_dispatch_at_ms = ceil_millis(clock::after(now, self.config.min_spacing));

            if self.swap(raw.as_deref(), &state).await? {
                return Ok(Acquire::Granted {
                    remaining: state.remaining,
                });
            }
            tracing::trace!(budget = %self.key, "budget CAS conflict; retrying");
        }

        Err(contention(&self.key))
    }

    /// Waits until a unit is granted and returns the dispatch permit.
    ///
    /// Callers queue in FIFO order on the process-local gate; the gate stays
    /// held by the returned permit.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails while waiting.
    pub async fn acquire(&self) -> Result<DispatchPermit> {
        let started = tokio::time::Instant::now();
        let gate = Arc::clone(&self.gate).lock_owned().await;

        loop {
            match self.try_acquire().await? {
                Acquire::Granted { remaining } => {
                    self.metrics.record_grant(started.elapsed(), remaining);
                    return Ok(DispatchPermit {
                        _gate: gate,
                        remaining,
                    });
                }
                Acquire::Wait(wait) => {
                    tracing::trace!(budget = %self.key, wait_ms = wait.as_millis(), "waiting for budget");
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Returns the units left in the current window, counting a due refill.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn remaining(&self) -> Result<u32> {
        let now = self.clock.now();
        let (_, mut state) = self.load(now).await?;
        state.refill(now, &self.config);
        Ok(state.remaining)
    }

    /// Records a provider throttling signal and blocks grants accordingly.
    ///
    /// Returns the applied delay.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn report_throttled(
        &self,
        retry_after: Option<Duration>,
        attempt: u32,
    ) -> Result<Duration> {
        let delay = self.config.throttle_delay(retry_after, attempt);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let (raw, mut state) = self.load(now).await?;
            let until_ms = ceil_millis(clock::after(now, delay));
            if state.blocked_until_ms >= until_ms && raw.is_some() {
                return Ok(delay);
            }
            state.blocked_until_ms = state.blocked_until_ms.max(until_ms);

            if self.swap(raw.as_deref(), &state).await? {
                tracing::warn!(
                    budget = %self.key,
                    delay_ms = delay.as_millis(),
                    attempt,
                    hinted = retry_after.is_some(),
                    "remote API throttled; blocking dispatch"
                );
                return Ok(delay);
            }
        }

        Err(contention(&self.key))
    }

    /// Reads the stored state, along with the raw value for the later CAS.
    async fn load(&self, now: DateTime<Utc>) -> Result<(Option<String>, BudgetState)> {
        let raw = self.store.get(&self.key).await?;
        let state = match raw.as_deref() {
            Some(value) => serde_json::from_str(value).unwrap_or_else(|err| {
                tracing::warn!(budget = %self.key, error = %err, "unreadable budget state; resetting");
                BudgetState::fresh(now, &self.config)
            }),
            None => BudgetState::fresh(now, &self.config),
        };
        Ok((raw, state))
    }

    async fn swap(&self, expected: Option<&str>, state: &BudgetState) -> Result<bool> {
        let value = serde_json::to_string(state)?;
        let outcome = self
            .store
            .compare_and_swap(&self.key, expected, &value)
            .await?;
        Ok(outcome.is_swapped())
    }
}

fn contention(key: &str) -> Error {
    statsync_core::Error::PreconditionFailed {
        message: format!("budget '{key}' under persistent write contention"),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use statsync_core::clock::TokioClock;
    use statsync_core::kv::memory::MemoryStore;

    use super::*;

    fn limiter(store: Arc<MemoryStore>, config: BudgetConfig) -> TokenBudgetLimiter {
        TokenBudgetLimiter::new(store, "test", config).with_clock(Arc::new(TokioClock::new()))
    }

    fn unspaced(capacity: u32) -> BudgetConfig {
        BudgetConfig {
            capacity,
            min_spacing: Duration::ZERO,
            ..BudgetConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn grants_consume_the_reservoir() -> Result<()> {
        let limiter = limiter(Arc::new(MemoryStore::new()), unspaced(2));

        assert_eq!(limiter.remaining().await?, 2);
        assert_eq!(limiter.try_acquire().await?, Acquire::Granted { remaining: 1 });
        assert_eq!(limiter.try_acquire().await?, Acquire::Granted { remaining: 0 });
        assert!(!limiter.try_acquire().await?.is_granted());
        assert_eq!(limiter.remaining().await?, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn refills_fully_at_window_boundary() -> Result<()> {
        let limiter = limiter(Arc::new(MemoryStore::new()), unspaced(3));
        for _ in 0..3 {
            assert!(limiter.try_acquire().await?.is_granted());
        }

        let Acquire::Wait(wait) = limiter.try_acquire().await? else {
            panic!("reservoir should be empty");
        };
        assert!(wait <= Duration::from_secs(60));

        tokio::time::sleep(wait).await;
        assert_eq!(limiter.remaining().await?, 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_respect_min_spacing() -> Result<()> {
        let limiter = limiter(
            Arc::new(MemoryStore::new()),
            BudgetConfig {
                min_spacing: Duration::from_millis(100),
                ..BudgetConfig::default()
            },
        );
        let started = tokio::time::Instant::now();

        let limiter = &limiter;
        let acquire = move || async move { limiter.acquire().await.map(drop) };
        let results = tokio::join!(acquire(), acquire(), acquire(), acquire(), acquire());
        results.0?;
        results.1?;
        results.2?;
        results.3?;
        results.4?;

        assert!(started.elapsed() >= Duration::from_millis(400));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn third_caller_waits_for_refill() -> Result<()> {
        let limiter = Arc::new(limiter(Arc::new(MemoryStore::new()), unspaced(2)));
        let started = tokio::time::Instant::now();
        let immediate = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = Arc::clone(&limiter);
            let immediate = Arc::clone(&immediate);
            handles.push(tokio::spawn(async move {
                let permit = limiter.acquire().await?;
                if started.elapsed() < Duration::from_secs(1) {
                    immediate.fetch_add(1, Ordering::SeqCst);
                }
                drop(permit);
                Ok::<_, Error>(())
            }));
        }
        for handle in handles {
            handle.await.expect("task panicked")?;
        }

        assert_eq!(immediate.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(59));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_blocks_all_grants_until_deadline() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(TokioClock::new());
        let first = TokenBudgetLimiter::new(store.clone(), "test", unspaced(100))
            .with_clock(clock.clone());
        let second = TokenBudgetLimiter::new(store, "test", unspaced(100)).with_clock(clock);

        let delay = first.report_throttled(Some(Duration::from_secs(2)), 0).await?;
        assert_eq!(delay, Duration::from_secs(2));

        // Another process sharing the store observes the block.
        assert!(!second.try_acquire().await?.is_granted());

        let started = tokio::time::Instant::now();
        drop(second.acquire().await?);
        assert!(started.elapsed() >= Duration::from_secs(2));
        Ok(())
    }

    #[test]
    fn throttle_delay_prefers_hint_and_caps_backoff() {
        let config = BudgetConfig {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            max_retry_after: Duration::from_secs(30),
            ..BudgetConfig::default()
        };

        assert_eq!(config.throttle_delay(None, 0), Duration::from_secs(1));
        assert_eq!(config.throttle_delay(None, 3), Duration::from_secs(8));
        assert_eq!(config.throttle_delay(None, 40), Duration::from_secs(10));
        assert_eq!(
            config.throttle_delay(Some(Duration::from_secs(5)), 3),
            Duration::from_secs(5)
        );
        assert_eq!(
            config.throttle_delay(Some(Duration::from_secs(600)), 0),
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn unreachable_store_fails_instead_of_granting() {
        let store = Arc::new(MemoryStore::new());
        let limiter = TokenBudgetLimiter::new(store.clone(), "test", BudgetConfig::default());
        store.set_unreachable(true);

        let err = limiter.try_acquire().await.expect_err("store is down");
        assert!(err.is_store_unreachable());
        assert!(limiter.remaining().await.is_err());
    }

    #[tokio::test]
    async fn corrupt_state_is_reset() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.set("budget:test", "{not json").await?;
        let limiter = TokenBudgetLimiter::new(store, "test", unspaced(5));

        assert_eq!(limiter.try_acquire().await?, Acquire::Granted { remaining: 4 });
        Ok(())
    }
}
