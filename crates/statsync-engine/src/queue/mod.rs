//! Refresh job queue.
//!
//! This module provides:
//!
//! - [`RefreshJob`]: A request to re-fetch one player's data of one kind
//! - [`QueueStore`]: Trait for durable priority queue backends
//! - [`RefreshQueue`]: Idempotent submission on top of a store
//! - [`memory::InMemoryQueueStore`]: In-memory store for tests and single-process use
//!
//! ## Design Principles
//!
//! - **One job per key**: The dedupe key `"{kind}:{target_id}"` admits at most
//!   one non-failed job
//! - **Priority then FIFO**: Lower priority values are served first, ties by
//!   insertion order
//! - **Failed jobs are resubmittable**: A terminal failure is purged on the
//!   next submission for the same key

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::metrics::SyncMetrics;
use crate::model::RefreshKind;

/// Most urgent priority.
pub const PRIORITY_MIN: u8 = 1;
/// Least urgent priority.
pub const PRIORITY_MAX: u8 = 100;

/// A refresh request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshJob {
    /// Identity used for de-duplication.
    pub dedupe_key: String,
    /// What to refresh.
    pub kind: RefreshKind,
    /// Remote player identifier.
    pub target_id: String,
    /// 1 (most urgent) to 100 (least urgent).
    pub priority: u8,
    /// Submission time.
    pub created_at: DateTime<Utc>,
}

impl RefreshJob {
    /// Creates a job; the priority is clamped into `1..=100`.
    #[must_use]
    pub fn new(
        kind: RefreshKind,
        target_id: impl Into<String>,
        priority: u8,
        created_at: DateTime<Utc>,
    ) -> Self {
        let target_id = target_id.into();
        Self {
            dedupe_key: Self::key_for(kind, &target_id),
            kind,
            target_id,
            priority: priority.clamp(PRIORITY_MIN, PRIORITY_MAX),
            created_at,
        }
    }

    /// Returns the dedupe key for a kind and target.
    #[must_use]
    pub fn key_for(kind: RefreshKind, target_id: &str) -> String {
        format!("{kind}:{target_id}")
    }
}

/// Lifecycle state of a stored job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Ready to be polled.
    Waiting,
    /// Not pollable before `ready_at`.
    Delayed {
        /// When the job becomes pollable again.
        ready_at: DateTime<Utc>,
    },
    /// Handed to a consumer.
    Active,
    /// Terminally failed; kept for inspection.
    Failed {
        /// Last failure.
        reason: String,
    },
}

impl JobState {
    /// Returns true for the terminal failed state.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// A job as held by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredJob {
    /// The job.
    pub job: RefreshJob,
    /// Current state.
    pub state: JobState,
    /// Failed processing attempts so far.
    pub attempts_made: u32,
}

/// A job handed to a consumer by [`QueueStore::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedJob {
    /// The job.
    pub job: RefreshJob,
    /// Failed processing attempts before this one.
    pub attempts_made: u32,
}

/// Result of [`QueueStore::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    /// The job was stored.
    Added,
    /// A failed job under the same key was replaced by this one.
    Replaced,
    /// A job with the same key already exists.
    Duplicate,
}

/// Options for [`QueueStore::add`].
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Delay before the job becomes pollable.
    pub delay: Option<Duration>,
    /// Replace an existing job under the same key if it has failed.
    pub replace_failed: bool,
}

impl AddOptions {
    /// Sets the delay before the job becomes pollable.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Lets the new job replace a failed one under the same key.
    #[must_use]
    pub const fn replacing_failed(mut self) -> Self {
        self.replace_failed = true;
        self
    }
}

/// Durable priority queue keyed by dedupe key.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` so producers and the consumer pool can share
/// one store.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Stores a job unless one with the same key exists (in any state).
    ///
    /// With [`AddOptions::replace_failed`], a failed job under the key is
    /// swapped for the new one in the same atomic step.
    async fn add(&self, job: RefreshJob, options: AddOptions) -> Result<AddResult>;

    /// Returns the job stored under `key`.
    async fn get_by_key(&self, key: &str) -> Result<Option<StoredJob>>;

    /// Removes the job stored under `key`. Returns true if one existed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Takes the most urgent pollable job and marks it active.
    async fn poll(&self) -> Result<Option<LeasedJob>>;

    /// Returns an active job to the queue without counting an attempt.
    async fn release(&self, key: &str, delay: Duration) -> Result<()>;

    /// Returns an active job to the queue after a failed attempt.
    ///
    /// Returns the attempt count after this failure.
    async fn retry(&self, key: &str, delay: Duration) -> Result<u32>;

    /// Marks a job terminally failed.
    async fn fail(&self, key: &str, reason: &str) -> Result<()>;

    /// Returns the number of non-failed jobs.
    async fn depth(&self) -> Result<usize>;
}

/// Result of [`RefreshQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job was stored.
    Enqueued,
    /// A job for the same key is already waiting or running; nothing changed.
    AlreadyPending,
    /// A failed job for the same key was purged and replaced.
    Resubmitted,
}

impl EnqueueOutcome {
    /// Returns the outcome label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::AlreadyPending => "already_pending",
            Self::Resubmitted => "resubmitted",
        }
    }
}

/// Idempotent submission of refresh jobs.
pub struct RefreshQueue {
    store: std::sync::Arc<dyn QueueStore>,
    metrics: SyncMetrics,
}

impl std::fmt::Debug for RefreshQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshQueue").finish_non_exhaustive()
    }
}

impl RefreshQueue {
    /// Creates a queue over `store`.
    #[must_use]
    pub fn new(store: std::sync::Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            metrics: SyncMetrics::new(),
        }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &std::sync::Arc<dyn QueueStore> {
        &self.store
    }

    /// Submits a job unless an equivalent one is pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue store fails.
    pub async fn enqueue(&self, job: RefreshJob) -> Result<EnqueueOutcome> {
        let kind = job.kind;
        let outcome = self.submit(job).await?;
        self.metrics.record_enqueue(kind.as_str(), outcome.as_str());
        Ok(outcome)
    }

    async fn submit(&self, job: RefreshJob) -> Result<EnqueueOutcome> {
        let key = job.dedupe_key.clone();
        match self
            .store
            .add(job, AddOptions::default().replacing_failed())
            .await?
        {
            AddResult::Added => Ok(EnqueueOutcome::Enqueued),
            AddResult::Replaced => {
                tracing::debug!(key = %key, "replaced failed job");
                Ok(EnqueueOutcome::Resubmitted)
            }
            AddResult::Duplicate => Ok(EnqueueOutcome::AlreadyPending),
        }
    }

    /// Returns the number of non-failed jobs.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue store fails.
    pub async fn depth(&self) -> Result<usize> {
        let depth = self.store.depth().await?;
        self.metrics.set_queue_depth(depth);
        Ok(depth)
    }
}
