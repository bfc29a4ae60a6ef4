//! On-demand read-path hook.
//!
//! A lookup that finds a stored player calls [`DemandRefresher::observe`],
//! which counts the view and queues whatever refreshes the
//! [`DemandRefreshPolicy`] considers due. Both side effects run detached; the
//! caller answers from storage immediately.
//!
//! A lookup that finds nothing costs a synchronous remote call, so it is
//! gated by [`DemandRefresher::ensure_first_fetch_allowed`].

use std::sync::Arc;

use statsync_core::clock::{Clock, SystemClock};

use crate::error::{Error, Result};
use crate::gateway::RemoteApiGateway;
use crate::model::PlayerRecord;
use crate::persist;
use crate::policy::{DemandRefreshPolicy, PlannedRefresh};
use crate::queue::{RefreshJob, RefreshQueue};
use crate::repository::Repository;

/// Default budget floor below which first fetches are refused.
pub const DEFAULT_FIRST_FETCH_FLOOR: u32 = 10;

/// Turns player lookups into background refresh jobs.
pub struct DemandRefresher {
    policy: DemandRefreshPolicy,
    queue: Arc<RefreshQueue>,
    repository: Arc<dyn Repository>,
    gateway: Arc<RemoteApiGateway>,
    clock: Arc<dyn Clock>,
    first_fetch_floor: u32,
}

impl std::fmt::Debug for DemandRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemandRefresher")
            .field("policy", &self.policy)
            .field("first_fetch_floor", &self.first_fetch_floor)
            .finish_non_exhaustive()
    }
}

impl DemandRefresher {
    /// Creates a refresher.
    #[must_use]
    pub fn new(
        policy: DemandRefreshPolicy,
        queue: Arc<RefreshQueue>,
        repository: Arc<dyn Repository>,
        gateway: Arc<RemoteApiGateway>,
    ) -> Self {
        Self {
            policy,
            queue,
            repository,
            gateway,
            clock: Arc::new(SystemClock),
            first_fetch_floor: DEFAULT_FIRST_FETCH_FLOOR,
        }
    }

    /// Sets the budget floor for first fetches.
    #[must_use]
    pub const fn with_first_fetch_floor(mut self, floor: u32) -> Self {
        self.first_fetch_floor = floor;
        self
    }

    /// Uses the given clock for staleness and timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Records a view of `record` and queues its due refreshes.
    ///
    /// Returns the planned refreshes without waiting for them to be stored.
    /// Failures of the detached work are logged at debug level.
    ///
    /// Must be called from within a tokio runtime.
    pub fn observe(&self, record: &PlayerRecord) -> Vec<PlannedRefresh> {
        let now = self.clock.now();
        let planned = self.policy.plan(record, now);

        let repository = Arc::clone(&self.repository);
        let player_id = record.player_id.clone();
        tokio::spawn(async move {
            if let Err(err) = repository.increment_view_count(&player_id).await {
                tracing::debug!(player_id = %player_id, error = %err, "view count update failed");
            }
        });

        for refresh in &planned {
            let queue = Arc::clone(&self.queue);
            let job = RefreshJob::new(refresh.kind, &record.player_id, refresh.priority, now);
            tokio::spawn(async move {
                let key = job.dedupe_key.clone();
                match queue.enqueue(job).await {
                    Ok(outcome) => tracing::debug!(key = %key, outcome = outcome.as_str(), "demand refresh submitted"),
                    Err(err) => tracing::debug!(key = %key, error = %err, "demand refresh not submitted"),
                }
            });
        }

        planned
    }

    /// Fails fast when the budget cannot spare a synchronous first fetch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QuotaExhausted`] below the floor, or the budget
    /// store's error.
    pub async fn ensure_first_fetch_allowed(&self) -> Result<()> {
        let remaining = self.gateway.remaining().await?;
        if remaining < self.first_fetch_floor {
            return Err(Error::QuotaExhausted {
                remaining,
                floor: self.first_fetch_floor,
            });
        }
        Ok(())
    }

    /// Looks a player up, fetching it from the remote API on first sight.
    ///
    /// A stored player is returned as-is and observed. An unknown player is
    /// fetched and persisted synchronously, budget permitting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QuotaExhausted`] if an unknown player cannot be
    /// fetched within budget, [`Error::RemoteNotFound`] if the remote API
    /// does not know it either, or any repository or gateway error.
    pub async fn lookup(&self, player_id: &str) -> Result<PlayerRecord> {
        if let Some(record) = self.repository.find_player(player_id).await? {
            self.observe(&record);
            return Ok(record);
        }

        self.ensure_first_fetch_allowed().await?;
        let profile = self.gateway.fetch_player_ranked(player_id).await?;
        persist::persist_ranked_profile(self.repository.as_ref(), profile, self.clock.now())
            .await?;

        let record = self
            .repository
            .find_player(player_id)
            .await?
            .ok_or_else(|| Error::repository(format!("player '{player_id}' missing after upsert")))?;
        self.observe(&record);
        Ok(record)
    }
}
