//! Writing fetched remote data through the [`Repository`].
//!
//! Every write is an upsert keyed by remote identity. A display name is never
//! silently overwritten: when it changes, the old one is archived as an alias
//! first.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{PlayerRankedProfile, PlayerStats, PlayerUpdate, RankingPage, TeamKey};
use crate::repository::Repository;

/// Counts of what one ranking page wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSummary {
    /// Players upserted (partners included).
    pub players: usize,
    /// Teams upserted.
    pub teams: usize,
    /// Display names archived as aliases.
    pub renamed: usize,
}

/// Upserts a player, archiving the stored display name if it changed.
///
/// Returns true if a name was archived.
///
/// # Errors
///
/// Returns an error if a repository call fails.
pub async fn upsert_with_alias(repository: &dyn Repository, update: PlayerUpdate) -> Result<bool> {
    let previous = repository.find_player(&update.player_id).await?;
    let renamed = match previous {
        Some(record) if record.display_name != update.display_name => {
            repository
                .archive_old_name(&record.player_id, &record.display_name)
                .await?;
            tracing::debug!(
                player_id = %record.player_id,
                old_name = %record.display_name,
                new_name = %update.display_name,
                "display name changed; archived alias"
            );
            true
        }
        _ => false,
    };

    repository.upsert_player(update).await?;
    Ok(renamed)
}

/// Persists every entry of a leaderboard page.
///
/// # Errors
///
/// Returns the first repository error. Entries before it stay written.
pub async fn persist_ranking_page(
    repository: &dyn Repository,
    page: RankingPage,
    observed_at: DateTime<Utc>,
) -> Result<PersistSummary> {
    let mut summary = PersistSummary::default();

    for entry in page.entries {
        let update = PlayerUpdate {
            player_id: entry.player_id.clone(),
            display_name: entry.display_name,
            region: Some(entry.region.clone()),
            clan: entry.clan,
            ratings: BTreeMap::from([(page.bracket.clone(), entry.rating)]),
            observed_at,
        };
        summary.renamed += usize::from(upsert_with_alias(repository, update).await?);
        summary.players += 1;

        let Some(partner) = entry.partner else {
            continue;
        };

        let partner_update = PlayerUpdate {
            player_id: partner.player_id.clone(),
            display_name: partner.display_name,
            region: Some(entry.region.clone()),
            clan: None,
            ratings: BTreeMap::from([(page.bracket.clone(), entry.rating)]),
            observed_at,
        };
        summary.renamed += usize::from(upsert_with_alias(repository, partner_update).await?);
        summary.players += 1;

        let key = TeamKey::new(entry.region, entry.player_id, partner.player_id);
        repository
            .upsert_team(key, page.bracket.clone(), entry.rating, observed_at)
            .await?;
        summary.teams += 1;
    }

    Ok(summary)
}

/// Persists a player's ranked profile.
///
/// Returns true if the display name changed.
///
/// # Errors
///
/// Returns an error if a repository call fails.
pub async fn persist_ranked_profile(
    repository: &dyn Repository,
    profile: PlayerRankedProfile,
    observed_at: DateTime<Utc>,
) -> Result<bool> {
    let update = PlayerUpdate {
        player_id: profile.player_id,
        display_name: profile.display_name,
        region: Some(profile.region),
        clan: profile.clan,
        ratings: profile.ratings,
        observed_at,
    };
    upsert_with_alias(repository, update).await
}

/// Persists a player's extended statistics.
///
/// # Errors
///
/// Returns an error if the repository call fails.
pub async fn persist_stats(
    repository: &dyn Repository,
    stats: PlayerStats,
    observed_at: DateTime<Utc>,
) -> Result<()> {
    repository.upsert_player_stats(stats, observed_at).await
}
