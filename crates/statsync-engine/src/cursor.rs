//! Shared sweep cursors.
//!
//! A cursor records the next leaderboard page a tier will visit. Cursors live
//! in the [`CoordinationStore`], so a sweep resumes where the previous owner
//! of the lease stopped, whichever process that was.
//!
//! ## Tiers
//!
//! | Scope | Pages | Advances | Stored value |
//! |-------|-------|----------|--------------|
//! | hot | `1..=H` | every tick | `"{page}"` |
//! | cold | `H+1..=MAX` | every `cold_every`-th tick | `"{page}"` |
//! | regional | `1..=MAX` | every tick; region rotates after `MAX` | `"{region_index}:{page}"` |
//!
//! Stored values that are unparseable or out of range are clamped to the
//! scope minimum before use, so a hand-edited or half-written cursor never
//! wedges the sweep. Every advance is a compare-and-swap loop.

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

use statsync_core::kv::CoordinationStore;

use crate::error::{Error, Result};
use crate::model::{Bracket, Region};

/// Key of the shared tick counter.
pub const TICK_KEY: &str = "sweep:tick";

const MAX_CAS_ATTEMPTS: usize = 32;

/// Sweep tier of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Top pages, visited every tick.
    Hot,
    /// Remaining pages, visited every `cold_every` ticks.
    Cold,
    /// All pages of one region at a time, rotating through regions.
    Regional,
}

impl Scope {
    /// Returns the scope label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Cold => "cold",
            Self::Regional => "regional",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier sizes and frequencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierConfig {
    /// Last page of the hot tier (`H`).
    pub hot_pages: u32,
    /// Last page of any leaderboard (`MAX`).
    pub max_page: u32,
    /// The cold tier runs on ticks divisible by this.
    pub cold_every: u64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            hot_pages: 20,
            max_page: 200,
            cold_every: 8,
        }
    }
}

impl TierConfig {
    /// Checks that the tiers are non-empty and ordered.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if self.hot_pages == 0 {
            return Err(Error::configuration("hot tier must contain at least one page"));
        }
        if self.max_page <= self.hot_pages {
            return Err(Error::configuration(format!(
                "max page {} must exceed hot pages {}",
                self.max_page, self.hot_pages
            )));
        }
        if self.cold_every == 0 {
            return Err(Error::configuration("cold_every must be positive"));
        }
        Ok(())
    }

    /// Returns the inclusive page range of a scope.
    #[must_use]
    pub fn pages(&self, scope: Scope) -> RangeInclusive<u32> {
        match scope {
            Scope::Hot => 1..=self.hot_pages,
            Scope::Cold => self.hot_pages.saturating_add(1)..=self.max_page,
            Scope::Regional => 1..=self.max_page,
        }
    }

    /// Returns true if the cold tier runs on `tick`.
    #[must_use]
    pub const fn is_cold_tick(&self, tick: u64) -> bool {
        self.cold_every != 0 && tick % self.cold_every == 0
    }
}

/// A cursor position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPosition {
    /// Index into the region rotation; always 0 outside the regional scope.
    pub region_index: usize,
    /// Page number.
    pub page: u32,
}

impl CursorPosition {
    /// Parses a stored value, clamping anything invalid into range.
    #[must_use]
    pub fn parse(scope: Scope, raw: Option<&str>, tiers: &TierConfig, region_count: usize) -> Self {
        let pages = tiers.pages(scope);
        let min = *pages.start();
        let clamp_page =
            |text: &str| text.trim().parse::<u32>().ok().filter(|p| pages.contains(p)).unwrap_or(min);

        let Some(raw) = raw else {
            return Self {
                region_index: 0,
                page: min,
            };
        };

        match scope {
            Scope::Hot | Scope::Cold => Self {
                region_index: 0,
                page: clamp_page(raw),
            },
            Scope::Regional => {
                let (index, page) = raw.split_once(':').unwrap_or(("0", raw));
                let region_index = index
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .filter(|i| *i < region_count.max(1))
                    .unwrap_or(0);
                Self {
                    region_index,
                    page: clamp_page(page),
                }
            }
        }
    }

    /// Returns the position after this one.
    #[must_use]
    pub fn successor(self, scope: Scope, tiers: &TierConfig, region_count: usize) -> Self {
        let pages = tiers.pages(scope);
        if self.page < *pages.end() {
            return Self {
                page: self.page + 1,
                ..self
            };
        }

        let region_index = match scope {
            Scope::Regional => (self.region_index + 1) % region_count.max(1),
            Scope::Hot | Scope::Cold => 0,
        };
        Self {
            region_index,
            page: *pages.start(),
        }
    }

    fn encode(self, scope: Scope) -> String {
        match scope {
            Scope::Hot | Scope::Cold => self.page.to_string(),
            Scope::Regional => format!("{}:{}", self.region_index, self.page),
        }
    }
}

/// Persisted cursors for every (bracket, scope).
pub struct CursorStore {
    store: Arc<dyn CoordinationStore>,
    tiers: TierConfig,
    regions: Vec<Region>,
}

impl fmt::Debug for CursorStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorStore")
            .field("tiers", &self.tiers)
            .field("regions", &self.regions)
            .finish_non_exhaustive()
    }
}

impl CursorStore {
    /// Creates a cursor store.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the tiers are invalid.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        tiers: TierConfig,
        regions: Vec<Region>,
    ) -> Result<Self> {
        tiers.validate()?;
        Ok(Self {
            store,
            tiers,
            regions,
        })
    }

    /// Returns the tier configuration.
    #[must_use]
    pub const fn tiers(&self) -> &TierConfig {
        &self.tiers
    }

    /// Returns the region rotation.
    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Returns the region at `index` of the rotation.
    #[must_use]
    pub fn region(&self, index: usize) -> Option<&Region> {
        self.regions.get(index)
    }

    /// Returns the store key of a cursor.
    #[must_use]
    pub fn key(bracket: &Bracket, scope: Scope) -> String {
        format!("cursor:{bracket}:{scope}")
    }

    /// Reads a cursor without advancing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn peek(&self, bracket: &Bracket, scope: Scope) -> Result<CursorPosition> {
        let raw = self.store.get(&Self::key(bracket, scope)).await?;
        Ok(CursorPosition::parse(
            scope,
            raw.as_deref(),
            &self.tiers,
            self.regions.len(),
        ))
    }

    /// Claims the current position and persists its successor.
    ///
    /// Returns the position to process now.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or the cursor is under
    /// persistent write contention.
    pub async fn advance(&self, bracket: &Bracket, scope: Scope) -> Result<CursorPosition> {
        let key = Self::key(bracket, scope);
        let region_count = self.regions.len();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self.store.get(&key).await?;
            let current = CursorPosition::parse(scope, raw.as_deref(), &self.tiers, region_count);
            let next = current.successor(scope, &self.tiers, region_count);

            let outcome = self
                .store
                .compare_and_swap(&key, raw.as_deref(), &next.encode(scope))
                .await?;
            if outcome.is_swapped() {
                return Ok(current);
            }
        }

        Err(statsync_core::Error::PreconditionFailed {
            message: format!("cursor '{key}' under persistent write contention"),
        }
        .into())
    }

    /// Advances the shared tick counter and returns the new tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or the counter is corrupt.
    pub async fn next_tick(&self) -> Result<u64> {
        let tick = self.store.increment(TICK_KEY, 1).await?;
        Ok(u64::try_from(tick).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use statsync_core::kv::memory::MemoryStore;

    use super::*;

    fn small_tiers() -> TierConfig {
        TierConfig {
            hot_pages: 3,
            max_page: 5,
            cold_every: 2,
        }
    }

    fn cursors(store: Arc<MemoryStore>, regions: &[&str]) -> Result<CursorStore> {
        CursorStore::new(
            store,
            small_tiers(),
            regions.iter().map(|r| Region::new(*r)).collect(),
        )
    }

    #[tokio::test]
    async fn hot_cursor_wraps_exactly_at_max() -> Result<()> {
        let cursors = cursors(Arc::new(MemoryStore::new()), &[])?;
        let bracket = Bracket::new("2v2");

        let mut pages = Vec::new();
        for _ in 0..4 {
            pages.push(cursors.advance(&bracket, Scope::Hot).await?.page);
        }

        assert_eq!(pages, vec![1, 2, 3, 1]);
        Ok(())
    }

    #[tokio::test]
    async fn cold_cursor_wraps_to_cold_start() -> Result<()> {
        let cursors = cursors(Arc::new(MemoryStore::new()), &[])?;
        let bracket = Bracket::new("2v2");

        let mut pages = Vec::new();
        for _ in 0..4 {
            pages.push(cursors.advance(&bracket, Scope::Cold).await?.page);
        }

        assert_eq!(pages, vec![4, 5, 4, 5]);
        Ok(())
    }

    #[tokio::test]
    async fn regional_cursor_rotates_region_after_max() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let cursors = cursors(store.clone(), &["eu", "us", "kr"])?;
        let bracket = Bracket::new("3v3");
        store
            .set(&CursorStore::key(&bracket, Scope::Regional), "2:5")
            .await?;

        let at_max = cursors.advance(&bracket, Scope::Regional).await?;
        let wrapped = cursors.advance(&bracket, Scope::Regional).await?;

        assert_eq!(
            at_max,
            CursorPosition {
                region_index: 2,
                page: 5
            }
        );
        assert_eq!(
            wrapped,
            CursorPosition {
                region_index: 0,
                page: 1
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_values_are_clamped_to_scope_minimum() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let cursors = cursors(store.clone(), &["eu"])?;
        let bracket = Bracket::new("2v2");

        store.set(&CursorStore::key(&bracket, Scope::Hot), "999").await?;
        store.set(&CursorStore::key(&bracket, Scope::Cold), "garbage").await?;
        store
            .set(&CursorStore::key(&bracket, Scope::Regional), "7:-1")
            .await?;

        assert_eq!(cursors.advance(&bracket, Scope::Hot).await?.page, 1);
        assert_eq!(cursors.advance(&bracket, Scope::Cold).await?.page, 4);
        assert_eq!(
            cursors.advance(&bracket, Scope::Regional).await?,
            CursorPosition {
                region_index: 0,
                page: 1
            }
        );
        assert_eq!(
            store.get(&CursorStore::key(&bracket, Scope::Hot)).await?,
            Some("2".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn brackets_have_independent_cursors() -> Result<()> {
        let cursors = cursors(Arc::new(MemoryStore::new()), &[])?;

        cursors.advance(&Bracket::new("2v2"), Scope::Hot).await?;
        cursors.advance(&Bracket::new("2v2"), Scope::Hot).await?;

        assert_eq!(cursors.peek(&Bracket::new("2v2"), Scope::Hot).await?.page, 3);
        assert_eq!(cursors.peek(&Bracket::new("3v3"), Scope::Hot).await?.page, 1);
        Ok(())
    }

    #[tokio::test]
    async fn tick_counter_is_shared() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let first = cursors(store.clone(), &[])?;
        let second = cursors(store, &[])?;

        assert_eq!(first.next_tick().await?, 1);
        assert_eq!(second.next_tick().await?, 2);
        assert!(first.tiers().is_cold_tick(2));
        assert!(!first.tiers().is_cold_tick(3));
        Ok(())
    }

    #[test]
    fn invalid_tiers_are_rejected() {
        let tiers = TierConfig {
            hot_pages: 10,
            max_page: 10,
            cold_every: 4,
        };
        assert!(tiers.validate().is_err());
        assert!(TierConfig::default().validate().is_ok());
    }

    fn any_scope() -> impl Strategy<Value = Scope> {
        prop_oneof![Just(Scope::Hot), Just(Scope::Cold), Just(Scope::Regional)]
    }

    fn any_tiers() -> impl Strategy<Value = TierConfig> {
        (1_u32..50, 1_u32..200, 1_u64..16).prop_map(|(hot_pages, extra, cold_every)| TierConfig {
            hot_pages,
            max_page: hot_pages + extra,
            cold_every,
        })
    }

    proptest! {
        #[test]
        fn parse_always_lands_in_range(
            scope in any_scope(),
            tiers in any_tiers(),
            raw in proptest::option::of(".{0,12}"),
            region_count in 0_usize..5,
        ) {
            let position = CursorPosition::parse(scope, raw.as_deref(), &tiers, region_count);
            prop_assert!(tiers.pages(scope).contains(&position.page));
            prop_assert!(position.region_index < region_count.max(1));
        }

        #[test]
        fn successor_stays_in_range_and_wraps_after_a_full_lap(
            scope in any_scope(),
            tiers in any_tiers(),
            region_count in 1_usize..5,
        ) {
            let pages = tiers.pages(scope);
            let lap = pages.end() - pages.start() + 1;
            let start = CursorPosition::parse(scope, None, &tiers, region_count);

            let mut position = start;
            for _ in 0..lap {
                position = position.successor(scope, &tiers, region_count);
                prop_assert!(pages.contains(&position.page));
                prop_assert!(position.region_index < region_count);
            }
            prop_assert_eq!(position.page, start.page);
        }
    }
}
