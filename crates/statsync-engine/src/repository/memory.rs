//! In-memory repository.
//!
//! This module provides [`InMemoryRepository`], a thread-safe implementation
//! of the [`Repository`] trait for tests and single-process deployments.
//!
//! ## Limitations
//!
//! - **No persistence**: All state is lost when the process exits
//! - **Linear scans**: Candidate search walks every team

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CandidateFilter, Repository};
use crate::error::{Error, Result};
use crate::model::{Bracket, PlayerRecord, PlayerStats, PlayerUpdate, TeamKey, TeamRecord};

#[derive(Debug, Default)]
struct RepoState {
    players: HashMap<String, PlayerRecord>,
    teams: HashMap<TeamKey, TeamRecord>,
}

/// In-memory repository.
///
/// ## Example
///
/// ```rust
/// use statsync_engine::repository::memory::InMemoryRepository;
///
/// let repository = InMemoryRepository::new();
/// assert_eq!(repository.player_count().unwrap(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: RwLock<RepoState>,
}

/// Converts a lock poison error to a repository error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::repository("repository lock poisoned")
}

impl InMemoryRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a full player record.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn insert_player(&self, record: PlayerRecord) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.players.insert(record.player_id.clone(), record);
        drop(state);
        Ok(())
    }

    /// Returns a team, if stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn team(&self, key: &TeamKey) -> Result<Option<TeamRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.teams.get(key).cloned())
    }

    /// Returns the number of stored players.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn player_count(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.players.len())
    }

    /// Returns the number of stored teams.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn team_count(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.teams.len())
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn find_player(&self, player_id: &str) -> Result<Option<PlayerRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.players.get(player_id).cloned())
    }

    async fn upsert_player(&self, update: PlayerUpdate) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let record = state
            .players
            .entry(update.player_id.clone())
            .or_insert_with(|| PlayerRecord::new(&update.player_id, &update.display_name));

        record.display_name = update.display_name;
        if update.region.is_some() {
            record.region = update.region;
        }
        if update.clan.is_some() {
            record.clan = update.clan;
        }
        record.ratings.extend(update.ratings);
        record.ranked_updated_at = Some(update.observed_at);
        drop(state);
        Ok(())
    }

    async fn upsert_player_stats(
        &self,
        stats: PlayerStats,
        observed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let record = state
            .players
            .entry(stats.player_id.clone())
            .or_insert_with(|| PlayerRecord::new(&stats.player_id, &stats.player_id));
        record.stats = Some(stats.stats);
        record.stats_updated_at = Some(observed_at);
        drop(state);
        Ok(())
    }

    async fn upsert_team(
        &self,
        key: TeamKey,
        bracket: Bracket,
        rating: i64,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let team = state.teams.entry(key.clone()).or_insert_with(|| TeamRecord {
            key,
            ratings: std::collections::BTreeMap::new(),
            last_seen_at: seen_at,
        });
        team.ratings.insert(bracket, rating);
        team.last_seen_at = team.last_seen_at.max(seen_at);
        drop(state);
        Ok(())
    }

    async fn archive_old_name(&self, player_id: &str, old_name: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(record) = state.players.get_mut(player_id) else {
            return Err(Error::repository(format!(
                "cannot archive name of unknown player '{player_id}'"
            )));
        };
        if !record.aliases.iter().any(|alias| alias == old_name) {
            record.aliases.push(old_name.to_string());
        }
        drop(state);
        Ok(())
    }

    async fn find_stale_candidates(&self, filter: CandidateFilter) -> Result<Vec<String>> {
        let state = self.state.read().map_err(poison_err)?;

        let mut teams: Vec<&TeamRecord> = state
            .teams
            .values()
            .filter(|team| team.last_seen_at >= filter.seen_since)
            .collect();
        // Most recently seen first.
        teams.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at).then(a.key.cmp(&b.key)));

        let mut seen = BTreeSet::new();
        let mut candidates = Vec::new();
        for member in teams.iter().flat_map(|team| team.key.members.iter()) {
            if candidates.len() >= filter.limit {
                break;
            }
            let has_stats = state
                .players
                .get(member)
                .is_some_and(|p| p.stats_updated_at.is_some());
            if !has_stats && seen.insert(member.clone()) {
                candidates.push(member.clone());
            }
        }
        drop(state);
        Ok(candidates)
    }

    async fn increment_view_count(&self, player_id: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if let Some(record) = state.players.get_mut(player_id) {
            record.view_count = record.view_count.saturating_add(1);
        }
        drop(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Duration;

    use super::*;
    use crate::model::Region;

    fn update(id: &str, name: &str, at: DateTime<Utc>) -> PlayerUpdate {
        PlayerUpdate {
            player_id: id.to_string(),
            display_name: name.to_string(),
            region: Some(Region::new("eu")),
            clan: None,
            ratings: BTreeMap::from([(Bracket::new("2v2"), 2000)]),
            observed_at: at,
        }
    }

    #[tokio::test]
    async fn upsert_merges_ratings_and_keeps_clan() -> Result<()> {
        let repo = InMemoryRepository::new();
        let now = Utc::now();

        let mut first = update("p1", "Alice", now);
        first.clan = Some("KEK".into());
        repo.upsert_player(first).await?;

        let mut second = update("p1", "Alice", now);
        second.ratings = BTreeMap::from([(Bracket::new("3v3"), 1800)]);
        repo.upsert_player(second).await?;

        let record = repo.find_player("p1").await?.expect("player stored");
        assert_eq!(record.clan.as_deref(), Some("KEK"));
        assert_eq!(record.ratings.len(), 2);
        assert_eq!(record.ranked_updated_at, Some(now));
        Ok(())
    }

    #[tokio::test]
    async fn archive_is_idempotent() -> Result<()> {
        let repo = InMemoryRepository::new();
        repo.upsert_player(update("p1", "Alice", Utc::now())).await?;

        repo.archive_old_name("p1", "Alicia").await?;
        repo.archive_old_name("p1", "Alicia").await?;

        let record = repo.find_player("p1").await?.expect("player stored");
        assert_eq!(record.aliases, vec!["Alicia".to_string()]);
        assert!(repo.archive_old_name("ghost", "x").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn stale_candidates_are_recent_members_without_stats() -> Result<()> {
        let repo = InMemoryRepository::new();
        let now = Utc::now();
        let eu = Region::new("eu");
        let bracket = Bracket::new("2v2");

        repo.upsert_team(TeamKey::new(eu.clone(), "a", "b"), bracket.clone(), 2000, now)
            .await?;
        repo.upsert_team(
            TeamKey::new(eu.clone(), "c", "d"),
            bracket.clone(),
            1900,
            now - Duration::days(3),
        )
        .await?;
        repo.upsert_team(TeamKey::new(eu, "a", "e"), bracket, 1950, now)
            .await?;
        repo.upsert_player_stats(
            PlayerStats {
                player_id: "b".into(),
                stats: serde_json::json!({"games": 10}),
            },
            now,
        )
        .await?;

        let mut candidates = repo
            .find_stale_candidates(CandidateFilter {
                seen_since: now - Duration::hours(1),
                limit: 10,
            })
            .await?;
        candidates.sort();

        assert_eq!(candidates, vec!["a".to_string(), "e".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn view_count_ignores_unknown_players() -> Result<()> {
        let repo = InMemoryRepository::new();
        repo.upsert_player(update("p1", "Alice", Utc::now())).await?;

        repo.increment_view_count("p1").await?;
        repo.increment_view_count("ghost").await?;

        assert_eq!(repo.find_player("p1").await?.map(|p| p.view_count), Some(1));
        assert_eq!(repo.player_count()?, 1);
        Ok(())
    }
}
