//! Process configuration.
//!
//! Every setting comes from a `STATSYNC_`-prefixed environment variable.
//! Only the remote API location and key are required; everything else falls
//! back to the component defaults. Present-but-invalid values are errors,
//! never silently replaced.

use std::fmt;
use std::time::Duration;

use statsync_core::lock::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_LEASE_TTL};

use crate::backfill::BackfillConfig;
use crate::budget::BudgetConfig;
use crate::consumer::ConsumerConfig;
use crate::cursor::TierConfig;
use crate::demand::DEFAULT_FIRST_FETCH_FLOOR;
use crate::error::{Error, Result};
use crate::gateway::GatewayConfig;
use crate::model::{Bracket, Region};
use crate::policy::PolicyConfig;
use crate::sweep::SweepConfig;

/// Remote API base URL (required).
pub const ENV_API_BASE_URL: &str = "STATSYNC_API_BASE_URL";
/// Remote API key (required).
pub const ENV_API_KEY: &str = "STATSYNC_API_KEY";
/// Coordination store location.
pub const ENV_STORE_URL: &str = "STATSYNC_STORE_URL";
/// Budget units per window.
pub const ENV_BUDGET_CAPACITY: &str = "STATSYNC_BUDGET_CAPACITY";
/// Budget window length in seconds.
pub const ENV_BUDGET_REFILL_SECS: &str = "STATSYNC_BUDGET_REFILL_SECS";
/// Minimum spacing between dispatches in milliseconds.
pub const ENV_MIN_SPACING_MS: &str = "STATSYNC_MIN_SPACING_MS";
/// Per-attempt HTTP timeout in seconds.
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "STATSYNC_REQUEST_TIMEOUT_SECS";
/// Retries after 429 responses.
pub const ENV_MAX_THROTTLE_RETRIES: &str = "STATSYNC_MAX_THROTTLE_RETRIES";
/// Retries after transient failures.
pub const ENV_MAX_TRANSIENT_RETRIES: &str = "STATSYNC_MAX_TRANSIENT_RETRIES";
/// Sweep tick interval in seconds.
pub const ENV_TICK_SECS: &str = "STATSYNC_TICK_SECS";
/// Comma-separated brackets.
pub const ENV_BRACKETS: &str = "STATSYNC_BRACKETS";
/// Comma-separated regions; empty disables the regional tier.
pub const ENV_REGIONS: &str = "STATSYNC_REGIONS";
/// Last page of the hot tier.
pub const ENV_HOT_PAGES: &str = "STATSYNC_HOT_PAGES";
/// Last leaderboard page.
pub const ENV_MAX_PAGE: &str = "STATSYNC_MAX_PAGE";
/// Cold tier tick modulus.
pub const ENV_COLD_EVERY: &str = "STATSYNC_COLD_EVERY";
/// Minimum budget to start a sweep tick.
pub const ENV_IDLE_BUDGET: &str = "STATSYNC_IDLE_BUDGET";
/// Sweep lease TTL in seconds.
pub const ENV_LOCK_TTL_SECS: &str = "STATSYNC_LOCK_TTL_SECS";
/// Sweep lease heartbeat interval in seconds.
pub const ENV_HEARTBEAT_SECS: &str = "STATSYNC_HEARTBEAT_SECS";
/// Concurrent refresh jobs.
pub const ENV_CONSUMER_CONCURRENCY: &str = "STATSYNC_CONSUMER_CONCURRENCY";
/// Attempts per refresh job.
pub const ENV_MAX_ATTEMPTS: &str = "STATSYNC_MAX_ATTEMPTS";
/// Budget floor for ranked jobs.
pub const ENV_RANKED_BUDGET_FLOOR: &str = "STATSYNC_RANKED_BUDGET_FLOOR";
/// Budget floor for stats jobs.
pub const ENV_STATS_BUDGET_FLOOR: &str = "STATSYNC_STATS_BUDGET_FLOOR";
/// Ranked data freshness in seconds.
pub const ENV_RANKED_TTL_SECS: &str = "STATSYNC_RANKED_TTL_SECS";
/// Stats freshness in seconds.
pub const ENV_STATS_TTL_SECS: &str = "STATSYNC_STATS_TTL_SECS";
/// Backfill jobs per tick.
pub const ENV_BACKFILL_PER_TICK: &str = "STATSYNC_BACKFILL_PER_TICK";
/// Queue depth that pauses backfill.
pub const ENV_BACKFILL_CEILING: &str = "STATSYNC_BACKFILL_CEILING";

/// The only coordination store this workspace ships.
pub const MEMORY_STORE_URL: &str = "memory://";
/// Coordination key of the sweep lease.
pub const SWEEP_LOCK_KEY: &str = "sweep:lock";
/// Name of the shared remote API budget.
pub const BUDGET_NAME: &str = "remote-api";

/// Full configuration of a statsync process.
#[derive(Clone)]
pub struct SyncConfig {
    /// Remote API base URL.
    pub api_base_url: String,
    /// Remote API key. Never logged.
    pub api_key: String,
    /// Coordination store location.
    pub store_url: String,
    /// Shared budget.
    pub budget: BudgetConfig,
    /// Gateway retries and timeout.
    pub gateway: GatewayConfig,
    /// Sweep schedule and brackets.
    pub sweep: SweepConfig,
    /// Sweep tiers.
    pub tiers: TierConfig,
    /// Regional rotation.
    pub regions: Vec<Region>,
    /// Sweep lease TTL.
    pub lock_ttl: Duration,
    /// Sweep lease heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Refresh consumer pool.
    pub consumer: ConsumerConfig,
    /// Demand refresh policy.
    pub policy: PolicyConfig,
    /// Budget floor for synchronous first fetches.
    pub first_fetch_floor: u32,
    /// Stats backfill.
    pub backfill: BackfillConfig,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("api_base_url", &self.api_base_url)
            .field("api_key", &"[REDACTED]")
            .field("store_url", &self.store_url)
            .field("budget", &self.budget)
            .field("gateway", &self.gateway)
            .field("sweep", &self.sweep)
            .field("tiers", &self.tiers)
            .field("regions", &self.regions)
            .field("lock_ttl", &self.lock_ttl)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("consumer", &self.consumer)
            .field("policy", &self.policy)
            .field("first_fetch_floor", &self.first_fetch_floor)
            .field("backfill", &self.backfill)
            .finish()
    }
}

impl SyncConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a required variable is missing or
    /// any variable is present but invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a required variable is missing or
    /// any variable is present but invalid.
    #[allow(clippy::too_many_lines)]
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_base_url = required(&get_env, ENV_API_BASE_URL)?;
        let api_key = required(&get_env, ENV_API_KEY)?;
        let store_url = get_env(ENV_STORE_URL)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .unwrap_or_else(|| MEMORY_STORE_URL.to_string());
        if store_url != MEMORY_STORE_URL {
            return Err(Error::configuration(format!(
                "{ENV_STORE_URL} '{store_url}' is not supported; use '{MEMORY_STORE_URL}'"
            )));
        }

        let budget_defaults = BudgetConfig::default();
        let budget = BudgetConfig {
            capacity: parse_positive_u32_env(
                &get_env,
                ENV_BUDGET_CAPACITY,
                budget_defaults.capacity,
            )?,
            refill_interval: Duration::from_secs(parse_positive_u64_env(
                &get_env,
                ENV_BUDGET_REFILL_SECS,
                budget_defaults.refill_interval.as_secs(),
            )?),
            min_spacing: Duration::from_millis(parse_u64_env(
                &get_env,
                ENV_MIN_SPACING_MS,
                u64::try_from(budget_defaults.min_spacing.as_millis()).unwrap_or(u64::MAX),
            )?),
            ..budget_defaults
        };

        let gateway_defaults = GatewayConfig::default();
        let gateway = GatewayConfig {
            request_timeout: Duration::from_secs(parse_positive_u64_env(
                &get_env,
                ENV_REQUEST_TIMEOUT_SECS,
                gateway_defaults.request_timeout.as_secs(),
            )?),
            max_throttle_retries: narrow(
                ENV_MAX_THROTTLE_RETRIES,
                parse_u64_env(
                    &get_env,
                    ENV_MAX_THROTTLE_RETRIES,
                    u64::from(gateway_defaults.max_throttle_retries),
                )?,
            )?,
            max_transient_retries: narrow(
                ENV_MAX_TRANSIENT_RETRIES,
                parse_u64_env(
                    &get_env,
                    ENV_MAX_TRANSIENT_RETRIES,
                    u64::from(gateway_defaults.max_transient_retries),
                )?,
            )?,
        };

        let sweep_defaults = SweepConfig::default();
        let sweep = SweepConfig {
            brackets: match parse_list_env(&get_env, ENV_BRACKETS) {
                Some(names) if names.is_empty() => {
                    return Err(Error::configuration(format!(
                        "{ENV_BRACKETS} must name at least one bracket"
                    )));
                }
                Some(names) => names.into_iter().map(Bracket::new).collect(),
                None => sweep_defaults.brackets,
            },
            idle_budget_threshold: parse_u32_env(
                &get_env,
                ENV_IDLE_BUDGET,
                sweep_defaults.idle_budget_threshold,
            )?,
            tick_interval: Duration::from_secs(parse_positive_u64_env(
                &get_env,
                ENV_TICK_SECS,
                sweep_defaults.tick_interval.as_secs(),
            )?),
        };

        let tier_defaults = TierConfig::default();
        let tiers = TierConfig {
            hot_pages: parse_positive_u32_env(&get_env, ENV_HOT_PAGES, tier_defaults.hot_pages)?,
            max_page: parse_positive_u32_env(&get_env, ENV_MAX_PAGE, tier_defaults.max_page)?,
            cold_every: parse_positive_u64_env(&get_env, ENV_COLD_EVERY, tier_defaults.cold_every)?,
        };
        tiers.validate()?;

        let regions = parse_list_env(&get_env, ENV_REGIONS)
            .unwrap_or_default()
            .into_iter()
            .map(Region::new)
            .collect();

        let lock_ttl = Duration::from_secs(parse_positive_u64_env(
            &get_env,
            ENV_LOCK_TTL_SECS,
            DEFAULT_LEASE_TTL.as_secs(),
        )?);
        let heartbeat_interval = Duration::from_secs(parse_positive_u64_env(
            &get_env,
            ENV_HEARTBEAT_SECS,
            DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
        )?);
        if heartbeat_interval >= lock_ttl {
            return Err(Error::configuration(format!(
                "{ENV_HEARTBEAT_SECS} must be shorter than {ENV_LOCK_TTL_SECS}"
            )));
        }

        let consumer_defaults = ConsumerConfig::default();
        let concurrency = parse_usize_env(
            &get_env,
            ENV_CONSUMER_CONCURRENCY,
            consumer_defaults.concurrency,
        )?;
        if concurrency == 0 {
            return Err(Error::configuration(format!(
                "{ENV_CONSUMER_CONCURRENCY} must be greater than zero"
            )));
        }
        let consumer = ConsumerConfig {
            concurrency,
            max_attempts: parse_positive_u32_env(
                &get_env,
                ENV_MAX_ATTEMPTS,
                consumer_defaults.max_attempts,
            )?,
            ranked_budget_floor: parse_u32_env(
                &get_env,
                ENV_RANKED_BUDGET_FLOOR,
                consumer_defaults.ranked_budget_floor,
            )?,
            stats_budget_floor: parse_u32_env(
                &get_env,
                ENV_STATS_BUDGET_FLOOR,
                consumer_defaults.stats_budget_floor,
            )?,
            ..consumer_defaults
        };

        let policy_defaults = PolicyConfig::default();
        let policy = PolicyConfig {
            ranked_ttl: Duration::from_secs(parse_positive_u64_env(
                &get_env,
                ENV_RANKED_TTL_SECS,
                policy_defaults.ranked_ttl.as_secs(),
            )?),
            stats_ttl: Duration::from_secs(parse_positive_u64_env(
                &get_env,
                ENV_STATS_TTL_SECS,
                policy_defaults.stats_ttl.as_secs(),
            )?),
            ..policy_defaults
        };

        let backfill_defaults = BackfillConfig::default();
        let backfill = BackfillConfig {
            per_tick_limit: parse_usize_env(
                &get_env,
                ENV_BACKFILL_PER_TICK,
                backfill_defaults.per_tick_limit,
            )?,
            backlog_ceiling: parse_usize_env(
                &get_env,
                ENV_BACKFILL_CEILING,
                backfill_defaults.backlog_ceiling,
            )?,
            ..backfill_defaults
        };

        Ok(Self {
            api_base_url,
            api_key,
            store_url,
            budget,
            gateway,
            sweep,
            tiers,
            regions,
            lock_ttl,
            heartbeat_interval,
            consumer,
            policy,
            first_fetch_floor: DEFAULT_FIRST_FETCH_FLOOR,
            backfill,
        })
    }
}

fn required<F>(get_env: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    get_env(key)
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| Error::configuration(format!("{key} is required")))
}

fn parse_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    raw.trim().parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a non-negative integer, got '{raw}'"))
    })
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let parsed = parse_u64_env(get_env, key, default)?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}

fn parse_u32_env<F>(get_env: &F, key: &str, default: u32) -> Result<u32>
where
    F: Fn(&str) -> Option<String>,
{
    narrow(key, parse_u64_env(get_env, key, u64::from(default))?)
}

fn parse_positive_u32_env<F>(get_env: &F, key: &str, default: u32) -> Result<u32>
where
    F: Fn(&str) -> Option<String>,
{
    narrow(key, parse_positive_u64_env(get_env, key, u64::from(default))?)
}

fn parse_usize_env<F>(get_env: &F, key: &str, default: usize) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let default = u64::try_from(default).unwrap_or(u64::MAX);
    usize::try_from(parse_u64_env(get_env, key, default)?).map_err(|_| out_of_range(key))
}

/// Splits a comma-separated list, dropping empty items.
fn parse_list_env<F>(get_env: &F, key: &str) -> Option<Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    get_env(key).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(ToString::to_string)
            .collect()
    })
}

fn narrow(key: &str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| out_of_range(key))
}

fn out_of_range(key: &str) -> Error {
    Error::configuration(format!("{key} exceeds supported range"))
}
