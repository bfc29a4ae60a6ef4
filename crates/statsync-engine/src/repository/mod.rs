//! Persistence boundary.
//!
//! The engine never speaks a storage library's vocabulary. It calls the
//! intention-revealing operations of [`Repository`]; a relational backend or
//! the shipped [`memory::InMemoryRepository`] implements them.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Bracket, PlayerRecord, PlayerStats, PlayerUpdate, TeamKey};

/// Selects candidates for stats backfill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFilter {
    /// Only members of teams seen at or after this time.
    pub seen_since: DateTime<Utc>,
    /// Maximum number of ids to return.
    pub limit: usize,
}

/// Storage operations the engine relies on.
///
/// All writes are idempotent upserts, so a step repeated after a lost lease
/// or a retried job leaves the same state.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Reads a player.
    async fn find_player(&self, player_id: &str) -> Result<Option<PlayerRecord>>;

    /// Creates or merges a player's ranked data.
    ///
    /// Does not archive names; callers use [`Repository::archive_old_name`]
    /// first when the display name changed.
    async fn upsert_player(&self, update: PlayerUpdate) -> Result<()>;

    /// Stores a player's extended statistics.
    async fn upsert_player_stats(
        &self,
        stats: PlayerStats,
        observed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Creates or refreshes a two-player team.
    async fn upsert_team(
        &self,
        key: TeamKey,
        bracket: Bracket,
        rating: i64,
        seen_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Records a player's former display name as a searchable alias.
    async fn archive_old_name(&self, player_id: &str, old_name: &str) -> Result<()>;

    /// Returns ids of recently seen team members that have no stats yet.
    async fn find_stale_candidates(&self, filter: CandidateFilter) -> Result<Vec<String>>;

    /// Counts one on-demand view of a player.
    async fn increment_view_count(&self, player_id: &str) -> Result<()>;
}
