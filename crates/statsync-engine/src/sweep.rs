//! Tiered leaderboard sweep.
//!
//! Every tick, at most one process in the cluster visits a handful of
//! leaderboard partitions and persists what it reads:
//!
//! 1. Skip the tick if the shared budget is below `idle_budget_threshold`
//! 2. Skip the tick if another process holds the sweep lease
//! 3. One hot page per bracket
//! 4. One cold page per bracket, on ticks divisible by `cold_every`
//! 5. One regional page per bracket
//! 6. A bounded stats backfill pass
//!
//! The lease is renewed before every step. Once it is lost the tick stops;
//! whatever was already persisted stays. A failed partition is counted and
//! skipped: its cursor has already moved on, and the page comes round again
//! on the next lap.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use statsync_core::clock::{Clock, SystemClock};
use statsync_core::lock::{DistributedLock, LeaseHandle, LockOutcome};
use statsync_core::observability::sweep_span;

use crate::backfill::Backfill;
use crate::cursor::{CursorStore, Scope};
use crate::error::{Error, Result};
use crate::gateway::RemoteApiGateway;
use crate::metrics::{SyncMetrics, TimingGuard};
use crate::model::Bracket;
use crate::persist;
use crate::repository::Repository;

/// Sweep configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    /// Brackets visited each tick, in order.
    pub brackets: Vec<Bracket>,
    /// Minimum remaining budget to start a tick.
    pub idle_budget_threshold: u32,
    /// Time between ticks.
    pub tick_interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            brackets: vec![Bracket::new("2v2"), Bracket::new("3v3")],
            idle_budget_threshold: 30,
            tick_interval: Duration::from_secs(60),
        }
    }
}

/// Why a tick did no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The shared budget was below the idle threshold.
    LowBudget {
        /// Budget left when checked.
        remaining: u32,
    },
    /// Another process holds the sweep lease.
    LockHeld,
    /// The coordination store could not be reached.
    StoreUnavailable,
}

/// What a completed tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Shared tick number.
    pub tick: u64,
    /// Partitions fetched and persisted.
    pub partitions_ok: usize,
    /// Partitions whose fetch or persist failed.
    pub partitions_failed: usize,
    /// Players written, partners included.
    pub players_persisted: usize,
    /// Stats jobs enqueued by backfill.
    pub backfilled: usize,
    /// The lease was lost and the tick stopped early.
    pub lease_lost: bool,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The sweep body ran.
    Completed(TickSummary),
    /// The tick was skipped before touching any cursor.
    Skipped(SkipReason),
}

impl TickOutcome {
    /// Returns true if the sweep body ran.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Returns the outcome label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed(summary) if summary.lease_lost => "lease_lost",
            Self::Completed(_) => "completed",
            Self::Skipped(SkipReason::LowBudget { .. }) => "low_budget",
            Self::Skipped(SkipReason::LockHeld) => "lock_held",
            Self::Skipped(SkipReason::StoreUnavailable) => "store_unavailable",
        }
    }
}

/// Drives sweep ticks.
pub struct SweepScheduler {
    gateway: Arc<RemoteApiGateway>,
    cursors: Arc<CursorStore>,
    lock: DistributedLock,
    repository: Arc<dyn Repository>,
    backfill: Option<Arc<Backfill>>,
    config: SweepConfig,
    clock: Arc<dyn Clock>,
    metrics: SyncMetrics,
}

impl std::fmt::Debug for SweepScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepScheduler")
            .field("lock", &self.lock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SweepScheduler {
    /// Creates a scheduler without backfill.
    #[must_use]
    pub fn new(
        gateway: Arc<RemoteApiGateway>,
        cursors: Arc<CursorStore>,
        lock: DistributedLock,
        repository: Arc<dyn Repository>,
        config: SweepConfig,
    ) -> Self {
        Self {
            gateway,
            cursors,
            lock,
            repository,
            backfill: None,
            config,
            clock: Arc::new(SystemClock),
            metrics: SyncMetrics::new(),
        }
    }

    /// Runs a backfill pass at the end of every tick.
    #[must_use]
    pub fn with_backfill(mut self, backfill: Arc<Backfill>) -> Self {
        self.backfill = Some(backfill);
        self
    }

    /// Uses the given clock for persisted timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs ticks every `tick_interval` until `shutdown` is cancelled.
    ///
    /// A tick in progress finishes before this returns. Ticks missed while a
    /// slow tick ran are skipped, not replayed.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.config.tick_interval.as_secs(),
            brackets = self.config.brackets.len(),
            "sweep scheduler started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.tick().await {
                Ok(TickOutcome::Completed(summary)) => tracing::info!(
                    tick = summary.tick,
                    ok = summary.partitions_ok,
                    failed = summary.partitions_failed,
                    players = summary.players_persisted,
                    backfilled = summary.backfilled,
                    lease_lost = summary.lease_lost,
                    "sweep tick completed"
                ),
                Ok(TickOutcome::Skipped(reason)) => {
                    tracing::debug!(reason = ?reason, "sweep tick skipped");
                }
                Err(err) => tracing::warn!(error = %err, "sweep tick aborted"),
            }
        }

        tracing::info!("sweep scheduler stopped");
    }

    /// Runs a single tick.
    ///
    /// # Errors
    ///
    /// Returns an error if a shared store fails while the sweep body runs.
    /// Failures before the lease is taken are reported as
    /// [`SkipReason::StoreUnavailable`].
    pub async fn tick(&self) -> Result<TickOutcome> {
        let metrics = self.metrics.clone();
        let _timing = TimingGuard::new(move |duration| metrics.observe_tick_duration(duration));

        let outcome = self.try_tick().await;
        match &outcome {
            Ok(outcome) => self.metrics.record_tick(outcome.as_str()),
            Err(_) => self.metrics.record_tick("failed"),
        }
        outcome
    }

    async fn try_tick(&self) -> Result<TickOutcome> {
        let remaining = match self.gateway.remaining().await {
            Ok(remaining) => remaining,
            Err(err) => {
                tracing::warn!(error = %err, "budget unavailable; skipping tick");
                return Ok(TickOutcome::Skipped(SkipReason::StoreUnavailable));
            }
        };
        if remaining < self.config.idle_budget_threshold {
            tracing::info!(
                remaining,
                threshold = self.config.idle_budget_threshold,
                "budget below idle threshold; skipping tick"
            );
            return Ok(TickOutcome::Skipped(SkipReason::LowBudget { remaining }));
        }

        match self.lock.run_exclusive(|lease| self.sweep(lease)).await {
            Ok(LockOutcome::Completed(summary)) => summary.map(TickOutcome::Completed),
            Ok(LockOutcome::Unavailable) => Ok(TickOutcome::Skipped(SkipReason::LockHeld)),
            Err(err) => {
                tracing::warn!(lock_key = %self.lock.key(), error = %err, "lease acquisition failed; skipping tick");
                Ok(TickOutcome::Skipped(SkipReason::StoreUnavailable))
            }
        }
    }

    /// Sweep body; runs while holding the lease.
    async fn sweep(&self, lease: LeaseHandle) -> Result<TickSummary> {
        let tick = self.cursors.next_tick().await?;
        let mut summary = TickSummary {
            tick,
            ..TickSummary::default()
        };

        let span = sweep_span(i64::try_from(tick).unwrap_or(i64::MAX));
        match self.steps(&lease, &mut summary).instrument(span).await {
            Ok(()) => {}
            Err(Error::LockLost { key }) => {
                tracing::warn!(lock_key = %key, tick, "lease lost; stopping tick");
                summary.lease_lost = true;
            }
            Err(err) => return Err(err),
        }
        Ok(summary)
    }

    async fn steps(&self, lease: &LeaseHandle, summary: &mut TickSummary) -> Result<()> {
        for bracket in &self.config.brackets {
            self.checkpoint(lease).await?;
            self.visit(bracket, Scope::Hot, summary).await?;
        }

        if self.cursors.tiers().is_cold_tick(summary.tick) {
            for bracket in &self.config.brackets {
                self.checkpoint(lease).await?;
                self.visit(bracket, Scope::Cold, summary).await?;
            }
        }

        if !self.cursors.regions().is_empty() {
            for bracket in &self.config.brackets {
                self.checkpoint(lease).await?;
                self.visit(bracket, Scope::Regional, summary).await?;
            }
        }

        if let Some(backfill) = &self.backfill {
            self.checkpoint(lease).await?;
            match backfill.run_once().await {
                Ok(enqueued) => summary.backfilled = enqueued,
                Err(err) => tracing::warn!(error = %err, "backfill pass failed"),
            }
        }

        Ok(())
    }

    /// Renews the lease, failing with [`Error::LockLost`] once it is gone.
    ///
    /// A store error during renewal is not a loss; the lease TTL still
    /// bounds ownership.
    async fn checkpoint(&self, lease: &LeaseHandle) -> Result<()> {
        let owned = match lease.renew().await {
            Ok(renewed) => renewed,
            Err(err) => {
                tracing::warn!(lock_key = %lease.key(), error = %err, "lease renewal failed");
                !lease.is_lost()
            }
        };
        if owned {
            Ok(())
        } else {
            Err(Error::LockLost {
                key: lease.key().to_string(),
            })
        }
    }

    /// Advances one cursor and processes the partition it pointed at.
    async fn visit(&self, bracket: &Bracket, scope: Scope, summary: &mut TickSummary) -> Result<()> {
        let position = self.cursors.advance(bracket, scope).await?;

        let fetched = match scope {
            Scope::Hot | Scope::Cold => self.gateway.fetch_leaderboard(bracket, position.page).await,
            Scope::Regional => {
                let Some(region) = self.cursors.region(position.region_index) else {
                    return Ok(());
                };
                self.gateway
                    .fetch_regional_leaderboard(bracket, region, position.page)
                    .await
            }
        };
        let persisted = match fetched {
            Ok(page) => {
                persist::persist_ranking_page(self.repository.as_ref(), page, self.clock.now()).await
            }
            Err(err) => Err(err),
        };

        match persisted {
            Ok(written) => {
                summary.partitions_ok += 1;
                summary.players_persisted += written.players;
                self.metrics.record_partition(scope.as_str(), "ok");
                tracing::debug!(
                    bracket = %bracket,
                    scope = scope.as_str(),
                    page = position.page,
                    players = written.players,
                    teams = written.teams,
                    "partition persisted"
                );
                Ok(())
            }
            Err(err) if err.is_store_unreachable() => Err(err),
            Err(err) => {
                summary.partitions_failed += 1;
                self.metrics.record_partition(scope.as_str(), "failed");
                tracing::warn!(
                    bracket = %bracket,
                    scope = scope.as_str(),
                    page = position.page,
                    error = %err,
                    "partition failed; moving on"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use statsync_core::clock::TokioClock;
    use statsync_core::kv::memory::MemoryStore;
    use statsync_core::kv::CoordinationStore;

    use super::*;
    use crate::budget::{BudgetConfig, TokenBudgetLimiter};
    use crate::cursor::TierConfig;
    use crate::gateway::scripted::ScriptedRemoteApi;
    use crate::gateway::GatewayConfig;
    use crate::model::{RankingEntry, RankingPage, Region};
    use crate::repository::memory::InMemoryRepository;

    struct Harness {
        store: Arc<MemoryStore>,
        api: Arc<ScriptedRemoteApi>,
        cursors: Arc<CursorStore>,
        repository: Arc<InMemoryRepository>,
        scheduler: SweepScheduler,
    }

    fn harness(api: ScriptedRemoteApi, capacity: u32, tiers: TierConfig) -> Result<Harness> {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let store = Arc::new(MemoryStore::with_clock(Arc::clone(&clock)));
        let api = Arc::new(api);
        let limiter = TokenBudgetLimiter::new(
            store.clone(),
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
        let cursors = Arc::new(CursorStore::new(
            store.clone(),
            tiers,
            vec![Region::new("eu"), Region::new("us")],
        )?);
        let repository = Arc::new(InMemoryRepository::new());
        let config = SweepConfig {
            brackets: vec![Bracket::new("2v2"), Bracket::new("3v3")],
            idle_budget_threshold: 10,
            tick_interval: Duration::from_secs(60),
        };
        let scheduler = SweepScheduler::new(
            gateway,
            cursors.clone(),
            DistributedLock::new(store.clone(), "sweep:lock"),
            repository.clone(),
            config,
        )
        .with_clock(clock);

        Ok(Harness {
            store,
            api,
            cursors,
            repository,
            scheduler,
        })
    }

    fn tiers(cold_every: u64) -> TierConfig {
        TierConfig {
            hot_pages: 2,
            max_page: 4,
            cold_every,
        }
    }

    fn page(bracket: &str, page: u32, player: &str) -> RankingPage {
        RankingPage {
            bracket: Bracket::new(bracket),
            region: None,
            page,
            entries: vec![RankingEntry {
                player_id: player.to_string(),
                display_name: player.to_uppercase(),
                region: Region::new("eu"),
                rating: 2000,
                rank: 1,
                clan: None,
                partner: None,
            }],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn low_budget_skips_without_touching_cursors() -> Result<()> {
        let h = harness(ScriptedRemoteApi::new(), 5, tiers(8))?;

        let outcome = h.scheduler.tick().await?;

        assert_eq!(
            outcome,
            TickOutcome::Skipped(SkipReason::LowBudget { remaining: 5 })
        );
        assert_eq!(h.api.total_attempts(), 0);
        assert_eq!(h.store.get(crate::cursor::TICK_KEY).await?, None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn held_lease_skips_tick() -> Result<()> {
        let h = harness(ScriptedRemoteApi::new(), 100, tiers(8))?;
        h.store
            .set_if_absent("sweep:lock", "other-process", Some(Duration::from_secs(300)))
            .await?;

        assert_eq!(
            h.scheduler.tick().await?,
            TickOutcome::Skipped(SkipReason::LockHeld)
        );
        assert_eq!(h.api.total_attempts(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn full_tick_visits_every_tier_and_isolates_failures() -> Result<()> {
        let api = ScriptedRemoteApi::new();
        for (path, body) in [
            ("/leaderboard/2v2/1", page("2v2", 1, "a")),
            ("/leaderboard/3v3/1", page("3v3", 1, "b")),
            ("/leaderboard/2v2/3", page("2v2", 3, "c")),
            ("/leaderboard/2v2/eu/1", page("2v2", 1, "d")),
            ("/leaderboard/3v3/eu/1", page("3v3", 1, "e")),
        ] {
            api.push_json(path, &body)?;
        }
        // Cold tier runs on every tick; the 3v3 cold page is unscripted (404).
        let h = harness(api, 100, tiers(1))?;

        let TickOutcome::Completed(summary) = h.scheduler.tick().await? else {
            panic!("tick should run");
        };

        assert_eq!(summary.tick, 1);
        assert_eq!(summary.partitions_ok, 5);
        assert_eq!(summary.partitions_failed, 1);
        assert_eq!(summary.players_persisted, 5);
        assert!(!summary.lease_lost);
        assert_eq!(h.repository.player_count()?, 5);

        // The failed partition's cursor still moved on.
        let cold = h.cursors.peek(&Bracket::new("3v3"), Scope::Cold).await?;
        assert_eq!(cold.page, 4);
        // The lease was released.
        assert_eq!(h.store.get("sweep:lock").await?, None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cold_tier_waits_for_its_tick() -> Result<()> {
        let h = harness(ScriptedRemoteApi::new(), 100, tiers(2))?;

        h.scheduler.tick().await?;
        let cold = h.cursors.peek(&Bracket::new("2v2"), Scope::Cold).await?;
        assert_eq!(cold.page, 3, "tick 1 leaves the cold tier alone");

        h.scheduler.tick().await?;
        let cold = h.cursors.peek(&Bracket::new("2v2"), Scope::Cold).await?;
        assert_eq!(cold.page, 4, "tick 2 advances it");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_stops_the_tick() -> Result<()> {
        let api = ScriptedRemoteApi::new().with_latency(Duration::from_secs(1));
        api.push_json("/leaderboard/2v2/1", &page("2v2", 1, "a"))?;
        api.push_json("/leaderboard/3v3/1", &page("3v3", 1, "b"))?;
        let h = harness(api, 100, tiers(8))?;

        let store = h.store.clone();
        let intruder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            store.set("sweep:lock", "intruder").await
        });

        let TickOutcome::Completed(summary) = h.scheduler.tick().await? else {
            panic!("tick should run");
        };
        intruder.await.expect("intruder task panicked")?;

        assert!(summary.lease_lost);
        assert_eq!(summary.partitions_ok, 1);
        assert_eq!(h.api.attempts("/leaderboard/3v3/1"), 0);
        // The other owner's lease is left alone.
        assert_eq!(h.store.get("sweep:lock").await?.as_deref(), Some("intruder"));
        Ok(())
    }
}
