//! Refresh job consumer pool.
//!
//! [`RefreshConsumer`] drains the refresh queue with bounded concurrency.
//! Each job goes through the same pipeline:
//!
//! 1. Re-check the remaining budget against the job kind's floor; too low
//!    means the job is released untouched for later
//! 2. Fetch through the [`RemoteApiGateway`] and persist, dispatched by kind
//! 3. Remove on success or "not found"; otherwise retry with exponential
//!    backoff until `max_attempts`, then drop
//!
//! Failures end here. They are logged and counted, never returned to whoever
//! submitted the job.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use statsync_core::clock::{Clock, SystemClock};
use statsync_core::observability::refresh_span;

use crate::error::Result;
use crate::gateway::RemoteApiGateway;
use crate::metrics::SyncMetrics;
use crate::model::RefreshKind;
use crate::persist;
use crate::queue::{LeasedJob, QueueStore, RefreshJob};
use crate::repository::Repository;

/// Consumer pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Jobs processed concurrently.
    pub concurrency: usize,
    /// Minimum remaining budget to run a ranked job.
    pub ranked_budget_floor: u32,
    /// Minimum remaining budget to run a stats job.
    pub stats_budget_floor: u32,
    /// Delay before a job skipped for budget is pollable again.
    pub budget_skip_delay: Duration,
    /// First retry delay; doubles per failed attempt.
    pub backoff_base: Duration,
    /// Attempts before a job is given up.
    pub max_attempts: u32,
    /// Keep exhausted jobs in the failed state instead of removing them.
    pub keep_failed: bool,
    /// Sleep between polls of an empty queue.
    pub idle_poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            ranked_budget_floor: 20,
            stats_budget_floor: 60,
            budget_skip_delay: Duration::from_secs(30),
            backoff_base: Duration::from_secs(5),
            max_attempts: 3,
            keep_failed: false,
            idle_poll_interval: Duration::from_secs(1),
        }
    }
}

impl ConsumerConfig {
    /// Returns the budget floor of `kind`.
    #[must_use]
    pub const fn budget_floor(&self, kind: RefreshKind) -> u32 {
        match kind {
            RefreshKind::Ranked => self.ranked_budget_floor,
            RefreshKind::Stats => self.stats_budget_floor,
        }
    }

    /// Returns the retry delay after `attempts_made` earlier failures.
    #[must_use]
    pub fn retry_delay(&self, attempts_made: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2_u32.saturating_pow(attempts_made.min(31)))
    }
}

/// How one job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Fetched, persisted and removed.
    Completed,
    /// Budget below the kind's floor; released for a later pass.
    SkippedLowBudget,
    /// Failed and scheduled for another attempt.
    Retrying {
        /// Attempts made so far.
        attempts: u32,
        /// Delay before the next attempt.
        delay: Duration,
    },
    /// Failed `max_attempts` times and given up.
    Exhausted,
    /// The remote API has no such player; removed.
    Dropped,
}

impl JobOutcome {
    /// Returns the outcome label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::SkippedLowBudget => "skipped_low_budget",
            Self::Retrying { .. } => "retrying",
            Self::Exhausted => "exhausted",
            Self::Dropped => "dropped",
        }
    }
}

/// Pulls refresh jobs and runs them against the remote API.
pub struct RefreshConsumer {
    queue: Arc<dyn QueueStore>,
    gateway: Arc<RemoteApiGateway>,
    repository: Arc<dyn Repository>,
    config: ConsumerConfig,
    clock: Arc<dyn Clock>,
    metrics: SyncMetrics,
}

impl std::fmt::Debug for RefreshConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshConsumer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RefreshConsumer {
    /// Creates a consumer.
    #[must_use]
    pub fn new(
        queue: Arc<dyn QueueStore>,
        gateway: Arc<RemoteApiGateway>,
        repository: Arc<dyn Repository>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            gateway,
            repository,
            config,
            clock: Arc::new(SystemClock),
            metrics: SyncMetrics::new(),
        }
    }

    /// Uses the given clock for persisted timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Polls and processes a single job, if one is ready.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue store fails.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        let Some(leased) = self.queue.poll().await? else {
            return Ok(None);
        };
        self.process(leased).await.map(Some)
    }

    /// Runs one leased job to its outcome.
    ///
    /// A job that cannot be settled (queue store error, panic, or the future
    /// being dropped) is released after `backoff_base` instead of staying
    /// active, which would block its key forever.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue store fails while settling the job.
    pub async fn process(&self, leased: LeasedJob) -> Result<JobOutcome> {
        let guard = ActiveJob {
            queue: Arc::clone(&self.queue),
            key: Some(leased.job.dedupe_key.clone()),
            delay: self.config.backoff_base,
        };

        match self.settle(leased).await {
            Ok(outcome) => {
                guard.disarm();
                Ok(outcome)
            }
            Err(err) => {
                guard.release().await;
                Err(err)
            }
        }
    }

    async fn settle(&self, leased: LeasedJob) -> Result<JobOutcome> {
        let job = leased.job;
        let key = job.dedupe_key.clone();

        let floor = self.config.budget_floor(job.kind);
        let budget_ok = match self.gateway.remaining().await {
            Ok(remaining) if remaining >= floor => true,
            Ok(remaining) => {
                tracing::debug!(key = %key, remaining, floor, "budget below floor; deferring job");
                false
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "budget unavailable; deferring job");
                false
            }
        };
        if !budget_ok {
            self.queue.release(&key, self.config.budget_skip_delay).await?;
            return Ok(self.finish(&job, JobOutcome::SkippedLowBudget));
        }

        let outcome = match self.execute(&job).await {
            Ok(()) => {
                self.queue.remove(&key).await?;
                JobOutcome::Completed
            }
            Err(err) if err.is_not_found() => {
                tracing::info!(key = %key, "remote has no such player; dropping job");
                self.queue.remove(&key).await?;
                JobOutcome::Dropped
            }
            Err(err) => {
                let attempts = leased.attempts_made.saturating_add(1);
                if attempts >= self.config.max_attempts {
                    tracing::warn!(key = %key, attempts, error = %err, "refresh failed permanently");
                    if self.config.keep_failed {
                        self.queue.fail(&key, &err.to_string()).await?;
                    } else {
                        self.queue.remove(&key).await?;
                    }
                    JobOutcome::Exhausted
                } else {
                    let delay = self.config.retry_delay(leased.attempts_made);
                    tracing::debug!(key = %key, attempts, error = %err, "refresh failed; retrying");
                    let attempts = self.queue.retry(&key, delay).await?;
                    JobOutcome::Retrying { attempts, delay }
                }
            }
        };

        Ok(self.finish(&job, outcome))
    }

    /// Fetches and persists one job, by kind.
    async fn execute(&self, job: &RefreshJob) -> Result<()> {
        let now = self.clock.now();
        match job.kind {
            RefreshKind::Ranked => {
                let profile = self.gateway.fetch_player_ranked(&job.target_id).await?;
                persist::persist_ranked_profile(self.repository.as_ref(), profile, now).await?;
            }
            RefreshKind::Stats => {
                let stats = self.gateway.fetch_player_stats(&job.target_id).await?;
                persist::persist_stats(self.repository.as_ref(), stats, now).await?;
            }
        }
        Ok(())
    }

    fn finish(&self, job: &RefreshJob, outcome: JobOutcome) -> JobOutcome {
        self.metrics.record_job(job.kind.as_str(), outcome.as_str());
        outcome
    }

    /// Drains the queue until `shutdown` is cancelled.
    ///
    /// At most `concurrency` jobs run at once. In-flight jobs finish before
    /// this returns.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        tracing::info!(concurrency = self.config.concurrency, "refresh consumer started");

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(err) = joined {
                    tracing::error!(error = %err, "refresh task panicked");
                }
            }

            let permit = tokio::select! {
                () = shutdown.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let leased = match self.queue.poll().await {
                Ok(Some(leased)) => leased,
                Ok(None) => {
                    drop(permit);
                    self.idle(&shutdown).await;
                    continue;
                }
                Err(err) => {
                    drop(permit);
                    tracing::warn!(error = %err, "queue poll failed");
                    self.idle(&shutdown).await;
                    continue;
                }
            };

            let consumer = Arc::clone(&self);
            let span = refresh_span(leased.job.kind.as_str(), &leased.job.target_id);
            tasks.spawn(
                async move {
                    let key = leased.job.dedupe_key.clone();
                    match consumer.process(leased).await {
                        Ok(outcome) => tracing::debug!(key = %key, outcome = outcome.as_str(), "job settled"),
                        Err(err) => tracing::warn!(key = %key, error = %err, "failed to settle job"),
                    }
                    drop(permit);
                }
                .instrument(span),
            );
        }

        tracing::info!(in_flight = tasks.len(), "refresh consumer stopping");
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "refresh task panicked");
            }
        }
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            () = shutdown.cancelled() => {}
            () = tokio::time::sleep(self.config.idle_poll_interval) => {}
        }
    }
}

/// An active job not yet settled.
///
/// Dropping it armed (panic or cancellation) hands the release to a detached
/// task.
struct ActiveJob {
    queue: Arc<dyn QueueStore>,
    key: Option<String>,
    delay: Duration,
}

impl ActiveJob {
    fn disarm(mut self) {
        self.key = None;
    }

    async fn release(mut self) {
        if let Some(key) = self.key.take() {
            release_unsettled(self.queue.as_ref(), &key, self.delay).await;
        }
    }
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let queue = Arc::clone(&self.queue);
        let delay = self.delay;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { release_unsettled(queue.as_ref(), &key, delay).await });
        }
    }
}

async fn release_unsettled(queue: &dyn QueueStore, key: &str, delay: Duration) {
    match queue.release(key, delay).await {
        Ok(()) => tracing::warn!(key = %key, "job left unsettled; released for another attempt"),
        Err(err) => tracing::error!(key = %key, error = %err, "failed to release unsettled job"),
    }
}

#[cfg(test)]
mod tests {
    use statsync_core::clock::TokioClock;
    use statsync_core::kv::memory::MemoryStore;

    use super::*;
    use crate::budget::{BudgetConfig, TokenBudgetLimiter};
    use crate::gateway::scripted::ScriptedRemoteApi;
    use crate::gateway::{ApiResponse, GatewayConfig};
    use crate::queue::memory::InMemoryQueueStore;
    use crate::queue::{AddOptions, AddResult, JobState, RefreshQueue, StoredJob};
    use crate::repository::memory::InMemoryRepository;

    const PROFILE: &str =
        r#"{"player_id": "p1", "display_name": "Alice", "region": "eu", "ratings": {"3v3": 2400}}"#;

    struct Harness {
        api: Arc<ScriptedRemoteApi>,
        queue_store: Arc<InMemoryQueueStore>,
        queue: RefreshQueue,
        repository: Arc<InMemoryRepository>,
        consumer: RefreshConsumer,
    }

    fn harness(capacity: u32, config: ConsumerConfig) -> Harness {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let api = Arc::new(ScriptedRemoteApi::new());
        let limiter = TokenBudgetLimiter::new(
            Arc::new(MemoryStore::new()),
            "remote",
            BudgetConfig {
                capacity,
                ..BudgetConfig::default()
            },
        )
        .with_clock(Arc::clone(&clock));
        let gateway = Arc::new(RemoteApiGateway::new(
            api.clone(),
            Arc::new(limiter),
            GatewayConfig::default(),
        ));
        let queue_store = Arc::new(InMemoryQueueStore::with_clock(Arc::clone(&clock)));
        let repository = Arc::new(InMemoryRepository::new());
        let consumer = RefreshConsumer::new(
            queue_store.clone(),
            gateway,
            repository.clone(),
            config,
        )
        .with_clock(clock);

        Harness {
            api,
            queue: RefreshQueue::new(queue_store.clone()),
            queue_store,
            repository,
            consumer,
        }
    }

    fn job(kind: RefreshKind) -> RefreshJob {
        RefreshJob::new(kind, "p1", 50, chrono::Utc::now())
    }

    #[tokio::test(start_paused = true)]
    async fn ranked_job_is_fetched_persisted_and_removed() -> Result<()> {
        let h = harness(100, ConsumerConfig::default());
        h.api.push("/player/p1/ranked", ApiResponse::new(200, PROFILE));
        h.queue.enqueue(job(RefreshKind::Ranked)).await?;

        assert_eq!(h.consumer.run_once().await?, Some(JobOutcome::Completed));

        let record = h.repository.find_player("p1").await?.expect("persisted");
        assert_eq!(record.display_name, "Alice");
        assert!(record.ranked_updated_at.is_some());
        assert_eq!(h.queue.depth().await?, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stats_job_below_its_floor_is_released_without_fetching() -> Result<()> {
        // Enough budget for ranked jobs, not for stats jobs.
        let config = ConsumerConfig {
            ranked_budget_floor: 10,
            stats_budget_floor: 50,
            ..ConsumerConfig::default()
        };
        let h = harness(30, config);
        h.queue.enqueue(job(RefreshKind::Stats)).await?;

        assert_eq!(
            h.consumer.run_once().await?,
            Some(JobOutcome::SkippedLowBudget)
        );

        assert_eq!(h.api.total_attempts(), 0);
        let stored = h.queue_store.get_by_key("stats:p1").await?.expect("kept");
        assert!(matches!(stored.state, JobState::Delayed { .. }));
        assert_eq!(stored.attempts_made, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_retries_with_backoff_then_is_removed() -> Result<()> {
        let config = ConsumerConfig {
            backoff_base: Duration::from_secs(5),
            max_attempts: 3,
            ..ConsumerConfig::default()
        };
        let h = harness(100, config);
        for _ in 0..6 {
            h.api.push("/player/p1/ranked", ApiResponse::new(503, ""));
        }
        h.queue.enqueue(job(RefreshKind::Ranked)).await?;

        assert_eq!(
            h.consumer.run_once().await?,
            Some(JobOutcome::Retrying {
                attempts: 1,
                delay: Duration::from_secs(5)
            })
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            h.consumer.run_once().await?,
            Some(JobOutcome::Retrying {
                attempts: 2,
                delay: Duration::from_secs(10)
            })
        );
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.consumer.run_once().await?, Some(JobOutcome::Exhausted));

        assert!(h.queue_store.get_by_key("ranked:p1").await?.is_none());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_job_kept_as_failed_can_be_resubmitted() -> Result<()> {
        let config = ConsumerConfig {
            max_attempts: 1,
            keep_failed: true,
            ..ConsumerConfig::default()
        };
        let h = harness(100, config);
        h.api.push("/player/p1/ranked", ApiResponse::new(500, ""));
        h.api.push("/player/p1/ranked", ApiResponse::new(500, ""));
        h.queue.enqueue(job(RefreshKind::Ranked)).await?;

        assert_eq!(h.consumer.run_once().await?, Some(JobOutcome::Exhausted));
        let stored = h.queue_store.get_by_key("ranked:p1").await?.expect("kept");
        assert!(stored.state.is_failed());

        assert_eq!(
            h.queue.enqueue(job(RefreshKind::Ranked)).await?,
            crate::queue::EnqueueOutcome::Resubmitted
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_player_is_dropped() -> Result<()> {
        let h = harness(100, ConsumerConfig::default());
        h.queue.enqueue(job(RefreshKind::Stats)).await?;

        assert_eq!(h.consumer.run_once().await?, Some(JobOutcome::Dropped));
        assert_eq!(h.queue.depth().await?, 0);
        Ok(())
    }

    /// Delegates to the in-memory store but cannot remove jobs.
    struct StuckRemoveStore(InMemoryQueueStore);

    #[async_trait::async_trait]
    impl QueueStore for StuckRemoveStore {
        async fn add(&self, job: RefreshJob, options: AddOptions) -> Result<AddResult> {
            self.0.add(job, options).await
        }
        async fn get_by_key(&self, key: &str) -> Result<Option<StoredJob>> {
            self.0.get_by_key(key).await
        }
        async fn remove(&self, _key: &str) -> Result<bool> {
            Err(crate::error::Error::queue("remove unavailable"))
        }
        async fn poll(&self) -> Result<Option<LeasedJob>> {
            self.0.poll().await
        }
        async fn release(&self, key: &str, delay: Duration) -> Result<()> {
            self.0.release(key, delay).await
        }
        async fn retry(&self, key: &str, delay: Duration) -> Result<u32> {
            self.0.retry(key, delay).await
        }
        async fn fail(&self, key: &str, reason: &str) -> Result<()> {
            self.0.fail(key, reason).await
        }
        async fn depth(&self) -> Result<usize> {
            self.0.depth().await
        }
    }

    fn consumer_over(queue: Arc<dyn QueueStore>, api: Arc<ScriptedRemoteApi>) -> RefreshConsumer {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let limiter = TokenBudgetLimiter::new(
            Arc::new(MemoryStore::new()),
            "remote",
            BudgetConfig::default(),
        )
        .with_clock(Arc::clone(&clock));
        let gateway = Arc::new(RemoteApiGateway::new(
            api,
            Arc::new(limiter),
            GatewayConfig::default(),
        ));
        RefreshConsumer::new(
            queue,
            gateway,
            Arc::new(InMemoryRepository::new()),
            ConsumerConfig::default(),
        )
        .with_clock(clock)
    }

    #[tokio::test(start_paused = true)]
    async fn unsettled_job_is_released_instead_of_staying_active() -> Result<()> {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let store = Arc::new(StuckRemoveStore(InMemoryQueueStore::with_clock(clock)));
        let api = Arc::new(ScriptedRemoteApi::new());
        api.push("/player/p1/ranked", ApiResponse::new(200, PROFILE));
        let queue = RefreshQueue::new(store.clone());
        queue.enqueue(job(RefreshKind::Ranked)).await?;
        let consumer = consumer_over(store.clone(), api);

        assert!(consumer.run_once().await.is_err());

        let stored = store.get_by_key("ranked:p1").await?.expect("kept");
        assert!(matches!(stored.state, JobState::Delayed { .. }));
        tokio::time::sleep(ConsumerConfig::default().backoff_base).await;
        assert!(store.poll().await?.is_some());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_job_is_released() -> Result<()> {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let store = Arc::new(InMemoryQueueStore::with_clock(clock));
        let api = Arc::new(ScriptedRemoteApi::new().with_latency(Duration::from_secs(60)));
        api.push("/player/p1/ranked", ApiResponse::new(200, PROFILE));
        let queue = RefreshQueue::new(store.clone());
        queue.enqueue(job(RefreshKind::Ranked)).await?;
        let consumer = consumer_over(store.clone(), api);

        let cancelled = tokio::time::timeout(Duration::from_secs(1), consumer.run_once()).await;
        assert!(cancelled.is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stored = store.get_by_key("ranked:p1").await?.expect("kept");
        assert_ne!(stored.state, JobState::Active);
        tokio::time::sleep(ConsumerConfig::default().backoff_base).await;
        assert!(store.poll().await?.is_some());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_queue_until_shutdown() -> Result<()> {
        let h = harness(100, ConsumerConfig::default());
        for id in ["a", "b", "c"] {
            h.api.push(
                &format!("/player/{id}/stats"),
                ApiResponse::new(200, format!(r#"{{"player_id": "{id}", "stats": {{}}}}"#)),
            );
            h.queue
                .enqueue(RefreshJob::new(RefreshKind::Stats, id, 50, chrono::Utc::now()))
                .await?;
        }

        let consumer = Arc::new(h.consumer);
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&consumer).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.cancel();
        worker.await.expect("consumer task panicked");

        assert_eq!(h.queue.depth().await?, 0);
        assert_eq!(h.repository.player_count()?, 3);
        Ok(())
    }
}
