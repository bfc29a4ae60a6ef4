//! Demand-driven refresh policy.
//!
//! Pure decisions: whether a record is due for refresh, and how urgent the
//! refresh is. Popular and very stale records are served first; extended
//! stats yield to ranked data.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::{PlayerRecord, RefreshKind};
use crate::queue::{PRIORITY_MAX, PRIORITY_MIN};

/// Policy knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyConfig {
    /// Urgency gained per square root of view count.
    pub view_weight: f64,
    /// Urgency gained once a record is older than `very_stale`.
    pub stale_boost: f64,
    /// Urgency lost by stats jobs relative to ranked jobs.
    pub stats_offset: f64,
    /// Age beyond which a record counts as very stale.
    pub very_stale: Duration,
    /// Freshness window of ranked data.
    pub ranked_ttl: Duration,
    /// Freshness window of extended stats.
    pub stats_ttl: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            view_weight: 1.0,
            stale_boost: 20.0,
            stats_offset: 10.0,
            very_stale: Duration::from_secs(7 * 24 * 60 * 60),
            ranked_ttl: Duration::from_secs(60 * 60),
            stats_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// A refresh the policy wants queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRefresh {
    /// What to refresh.
    pub kind: RefreshKind,
    /// Queue priority, 1 (most urgent) to 100.
    pub priority: u8,
}

/// Computes refresh necessity and priority.
#[derive(Debug, Clone, Default)]
pub struct DemandRefreshPolicy {
    config: PolicyConfig,
}

impl DemandRefreshPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Returns the freshness window of `kind`.
    #[must_use]
    pub const fn ttl(&self, kind: RefreshKind) -> Duration {
        match kind {
            RefreshKind::Ranked => self.config.ranked_ttl,
            RefreshKind::Stats => self.config.stats_ttl,
        }
    }

    /// Returns the queue priority for a record with `view_count` views and
    /// data of `kind` aged `age`.
    ///
    /// `100 - view_weight * sqrt(views) - stale_boost (if very stale)
    /// + stats_offset (if stats)`, rounded and clamped to `1..=100`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // View counts far below 2^52
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // Clamped first
    pub fn priority(&self, view_count: u64, age: Duration, kind: RefreshKind) -> u8 {
        let mut score = f64::from(PRIORITY_MAX) - self.config.view_weight * (view_count as f64).sqrt();
        if age > self.config.very_stale {
            score -= self.config.stale_boost;
        }
        if kind == RefreshKind::Stats {
            score += self.config.stats_offset;
        }

        let clamped = score
            .round()
            .clamp(f64::from(PRIORITY_MIN), f64::from(PRIORITY_MAX));
        if clamped.is_nan() {
            return PRIORITY_MAX;
        }
        clamped as u8
    }

    /// Returns true if data last written at `last_updated` needs a refresh.
    ///
    /// Never-written data is always due.
    #[must_use]
    pub fn is_due(
        &self,
        kind: RefreshKind,
        last_updated: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        last_updated.is_none_or(|at| age_of(at, now) > self.ttl(kind))
    }

    /// Returns the refreshes `record` needs, with their priorities.
    #[must_use]
    pub fn plan(&self, record: &PlayerRecord, now: DateTime<Utc>) -> Vec<PlannedRefresh> {
        RefreshKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let last_updated = record.updated_at(kind);
                if !self.is_due(kind, last_updated, now) {
                    return None;
                }
                let age = last_updated.map_or(Duration::MAX, |at| age_of(at, now));
                Some(PlannedRefresh {
                    kind,
                    priority: self.priority(record.view_count, age, kind),
                })
            })
            .collect()
    }
}

fn age_of(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - at).to_std().unwrap_or(Duration::ZERO)
}
