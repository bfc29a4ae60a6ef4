//! Bounded stats backfill.
//!
//! Leaderboard sweeps discover team members whose extended stats were never
//! fetched. Each pass queues a few of them at the lowest priority, so
//! demand-driven jobs always go first and the backlog stays bounded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use statsync_core::clock::{self, Clock, SystemClock};

use crate::error::Result;
use crate::metrics::SyncMetrics;
use crate::model::RefreshKind;
use crate::queue::{EnqueueOutcome, RefreshJob, RefreshQueue, PRIORITY_MAX};
use crate::repository::{CandidateFilter, Repository};

/// Backfill limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillConfig {
    /// Jobs enqueued per pass at most.
    pub per_tick_limit: usize,
    /// Queue depth at or above which a pass enqueues nothing.
    pub backlog_ceiling: usize,
    /// Candidates read from the repository per pass.
    pub scan_limit: usize,
    /// Only teams seen within this window are scanned.
    pub lookback: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            per_tick_limit: 25,
            backlog_ceiling: 500,
            scan_limit: 200,
            lookback: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Enqueues stats jobs for recently seen players that lack stats.
pub struct Backfill {
    repository: Arc<dyn Repository>,
    queue: Arc<RefreshQueue>,
    config: BackfillConfig,
    clock: Arc<dyn Clock>,
    metrics: SyncMetrics,
}

impl std::fmt::Debug for Backfill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backfill")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Backfill {
    /// Creates a backfill pass runner.
    #[must_use]
    pub fn new(
        repository: Arc<dyn Repository>,
        queue: Arc<RefreshQueue>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            repository,
            queue,
            config,
            clock: Arc::new(SystemClock),
            metrics: SyncMetrics::new(),
        }
    }

    /// Uses the given clock for the lookback window.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs one pass and returns the number of jobs newly enqueued.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue or repository fails.
    pub async fn run_once(&self) -> Result<usize> {
        let depth = self.queue.depth().await?;
        if depth >= self.config.backlog_ceiling {
            tracing::debug!(depth, ceiling = self.config.backlog_ceiling, "backlog full; skipping backfill");
            return Ok(0);
        }
        let budget = self
            .config
            .per_tick_limit
            .min(self.config.backlog_ceiling - depth);

        let now = self.clock.now();
        let filter = CandidateFilter {
            seen_since: now
                .checked_sub_signed(clock::to_chrono(self.config.lookback))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            limit: self.config.scan_limit,
        };
        let candidates = self.repository.find_stale_candidates(filter).await?;

        let mut enqueued = 0;
        for player_id in candidates {
            if enqueued >= budget {
                break;
            }
            let job = RefreshJob::new(RefreshKind::Stats, player_id, PRIORITY_MAX, now);
            if self.queue.enqueue(job).await? != EnqueueOutcome::AlreadyPending {
                enqueued += 1;
            }
        }

        if enqueued > 0 {
            tracing::info!(enqueued, depth, "backfill enqueued stats jobs");
        }
        self.metrics.record_backfill(enqueued);
        Ok(enqueued)
    }
}
