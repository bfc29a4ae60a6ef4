//! # statsync-engine
//!
//! Synchronization engine that keeps local storage in step with a
//! hard-quota-limited game statistics API.
//!
//! This crate implements the engine domain, providing:
//!
//! - **Budget**: A cluster-wide token budget with dispatch spacing and throttle backoff
//! - **Gateway**: Outbound calls routed through the budget with bounded retries
//! - **Sweep**: A tiered, cursor-driven round-robin over leaderboard partitions
//! - **Refresh Queue**: Deduplicated priority jobs fed by on-demand lookups and backfill
//!
//! ## Core Concepts
//!
//! - **Partition**: One leaderboard page of one bracket, optionally scoped to a region
//! - **Cursor**: The persisted next partition of a tier, shared by every process
//! - **Refresh Job**: A request to re-fetch one player's ranked profile or stats
//!
//! ## Guarantees
//!
//! - **Budgeted**: Every network call first obtains a grant from the shared budget
//! - **Single sweeper**: One process at a time runs the sweep body, under a lease
//! - **No duplicate work**: At most one pending refresh job per player and kind
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use statsync_core::kv::memory::MemoryStore;
//! use statsync_engine::budget::{BudgetConfig, TokenBudgetLimiter};
//!
//! # async fn demo() -> statsync_engine::error::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let limiter = TokenBudgetLimiter::new(store, "remote-api", BudgetConfig::default());
//!
//! let permit = limiter.acquire().await?;
//! // ... perform exactly one outbound call while holding the permit ...
//! drop(permit);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backfill;
pub mod budget;
pub mod config;
pub mod consumer;
pub mod cursor;
pub mod demand;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod model;
pub mod persist;
pub mod policy;
pub mod queue;
pub mod repository;
pub mod sweep;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::backfill::{Backfill, BackfillConfig};
    pub use crate::budget::{Acquire, BudgetConfig, DispatchPermit, TokenBudgetLimiter};
    pub use crate::config::SyncConfig;
    pub use crate::consumer::{ConsumerConfig, JobOutcome, RefreshConsumer};
    pub use crate::cursor::{CursorPosition, CursorStore, Scope, TierConfig};
    pub use crate::demand::DemandRefresher;
    pub use crate::error::{Error, Result};
    pub use crate::gateway::{Endpoint, GatewayConfig, RemoteApi, RemoteApiGateway};
    pub use crate::model::{Bracket, PlayerRecord, RefreshKind, Region};
    pub use crate::policy::{DemandRefreshPolicy, PolicyConfig};
    pub use crate::queue::{EnqueueOutcome, QueueStore, RefreshJob, RefreshQueue};
    pub use crate::repository::Repository;
    pub use crate::sweep::{SweepConfig, SweepScheduler, TickOutcome};
}
