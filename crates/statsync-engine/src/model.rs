//! Domain types shared by the sweep, the refresh pipeline and the repository.
//!
//! Wire types (`RankingPage`, `PlayerRankedProfile`, `PlayerStats`) mirror the
//! remote API's JSON. `PlayerRecord` and `TeamRecord` are the repository's
//! view of what has been persisted.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A ranking bracket, for example `2v2` or `3v3`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bracket(String);

impl Bracket {
    /// Creates a bracket identifier.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the bracket name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Bracket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A geographic region of the remote service, for example `eu` or `us`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Region(String);

impl Region {
    /// Creates a region identifier.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the region name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a refresh job re-fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshKind {
    /// Ranked profile: ratings, display name, clan. Volatile.
    Ranked,
    /// Extended statistics. Expensive and slow-changing.
    Stats,
}

impl RefreshKind {
    /// All kinds, most valuable first.
    pub const ALL: [Self; 2] = [Self::Ranked, Self::Stats];

    /// Returns the kind's label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ranked => "ranked",
            Self::Stats => "stats",
        }
    }
}

impl fmt::Display for RefreshKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a leaderboard page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingEntry {
    /// Remote player identifier.
    pub player_id: String,
    /// Current display name.
    pub display_name: String,
    /// Player's home region.
    pub region: Region,
    /// Rating in the page's bracket.
    pub rating: i64,
    /// Position on the leaderboard.
    pub rank: u32,
    /// Clan tag, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clan: Option<String>,
    /// Team partner, for team brackets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner: Option<Partner>,
}

/// The other member of a two-player team entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partner {
    /// Remote player identifier.
    pub player_id: String,
    /// Current display name.
    pub display_name: String,
}

/// One leaderboard page as returned by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingPage {
    /// Bracket of the page.
    pub bracket: Bracket,
    /// Region filter, for regional leaderboards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    /// Page number (1-based).
    pub page: u32,
    /// Page rows.
    #[serde(default)]
    pub entries: Vec<RankingEntry>,
}

/// A player's ranked profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRankedProfile {
    /// Remote player identifier.
    pub player_id: String,
    /// Current display name.
    pub display_name: String,
    /// Player's home region.
    pub region: Region,
    /// Clan tag, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clan: Option<String>,
    /// Rating per bracket.
    #[serde(default)]
    pub ratings: BTreeMap<Bracket, i64>,
}

/// A player's extended statistics.
///
/// The payload is stored as delivered; shaping it for display is not the
/// engine's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStats {
    /// Remote player identifier.
    pub player_id: String,
    /// Raw statistics document.
    #[serde(default)]
    pub stats: serde_json::Value,
}

/// A player as stored in the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    /// Remote player identifier.
    pub player_id: String,
    /// Current display name.
    pub display_name: String,
    /// Player's home region, once known.
    pub region: Option<Region>,
    /// Clan tag, if any.
    pub clan: Option<String>,
    /// Last seen rating per bracket.
    pub ratings: BTreeMap<Bracket, i64>,
    /// When ranked data was last written.
    pub ranked_updated_at: Option<DateTime<Utc>>,
    /// When extended statistics were last written.
    pub stats_updated_at: Option<DateTime<Utc>>,
    /// Extended statistics, if fetched.
    pub stats: Option<serde_json::Value>,
    /// Number of on-demand lookups of this player.
    pub view_count: u64,
    /// Former display names, oldest first.
    pub aliases: Vec<String>,
}

impl PlayerRecord {
    /// Creates a record with only an identity.
    #[must_use]
    pub fn new(player_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            player_id: player_id.into(),
            display_name: display_name.into(),
            region: None,
            clan: None,
            ratings: BTreeMap::new(),
            ranked_updated_at: None,
            stats_updated_at: None,
            stats: None,
            view_count: 0,
            aliases: Vec::new(),
        }
    }

    /// Returns when data of `kind` was last written.
    #[must_use]
    pub const fn updated_at(&self, kind: RefreshKind) -> Option<DateTime<Utc>> {
        match kind {
            RefreshKind::Ranked => self.ranked_updated_at,
            RefreshKind::Stats => self.stats_updated_at,
        }
    }
}

/// Ranked data to merge into a player record.
///
/// Present values replace stored ones; absent ones leave them untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerUpdate {
    /// Remote player identifier.
    pub player_id: String,
    /// Current display name.
    pub display_name: String,
    /// Player's home region.
    pub region: Option<Region>,
    /// Clan tag.
    pub clan: Option<String>,
    /// Ratings to merge, per bracket.
    pub ratings: BTreeMap<Bracket, i64>,
    /// Snapshot time.
    pub observed_at: DateTime<Utc>,
}

/// Identity of a two-player team: region plus the sorted member pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TeamKey {
    /// Team region.
    pub region: Region,
    /// Member ids, sorted ascending.
    pub members: [String; 2],
}

impl TeamKey {
    /// Creates a key; member order does not matter.
    #[must_use]
    pub fn new(region: Region, a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        let members = if a <= b { [a, b] } else { [b, a] };
        Self { region, members }
    }
}

/// A team as stored in the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamRecord {
    /// Team identity.
    pub key: TeamKey,
    /// Last seen rating per bracket.
    pub ratings: BTreeMap<Bracket, i64>,
    /// When the team last appeared on a leaderboard.
    pub last_seen_at: DateTime<Utc>,
}
