//! Distributed lock with heartbeat renewal.
//!
//! [`DistributedLock`] grants single-owner execution of a body across every
//! process sharing a [`CoordinationStore`]. The protocol uses three atomic
//! primitives:
//!
//! 1. **Acquire**: `set_if_absent(key, token, ttl)` with a fresh ULID owner token
//! 2. **Renew**: `compare_and_extend(key, token, ttl)`, so an instance whose
//!    lease already expired cannot extend a lease now held by someone else
//! 3. **Release**: `compare_and_delete(key, token)`, for the same reason
//!
//! While the body runs, a heartbeat task renews the lease periodically. If a
//! renewal finds a different owner, the lease is marked lost and the body
//! observes it through [`LeaseHandle::is_lost`] / [`LeaseHandle::lost`]. Losing
//! the lease is a soft cancellation: work already committed stays committed,
//! the body is expected to stop starting new side effects.
//!
//! # Example
//!
//! ```rust,ignore
//! let lock = DistributedLock::new(store, "sweep-lock");
//!
//! match lock.run_exclusive(|lease| async move { sweep(lease).await }).await? {
//!     LockOutcome::Completed(summary) => { /* we ran the sweep */ }
//!     LockOutcome::Unavailable => { /* another instance holds the lease */ }
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::error::Result;
use crate::kv::CoordinationStore;

/// Default lease TTL (5 minutes).
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);

/// Default heartbeat interval (30 seconds).
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Result of [`DistributedLock::run_exclusive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// The lease was acquired and the body ran to completion.
    Completed(T),
    /// Another owner holds the lease; the body did not run.
    Unavailable,
}

impl<T> LockOutcome<T> {
    /// Returns true if the body ran.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// A lease held by the running body.
///
/// Cheap to clone; all clones observe the same loss signal.
#[derive(Clone)]
pub struct LeaseHandle {
    store: Arc<dyn CoordinationStore>,
    key: String,
    token: String,
    ttl: Duration,
    lost: CancellationToken,
}

impl std::fmt::Debug for LeaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseHandle")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("ttl", &self.ttl)
            .field("lost", &self.lost.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl LeaseHandle {
    /// The lock key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The opaque owner token of this lease.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns true once the lease is known to be lost.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Completes when the lease is lost.
    pub async fn lost(&self) {
        self.lost.cancelled().await;
    }

    /// Extends the lease if this instance still owns it.
    ///
    /// Returns `Ok(false)` (and marks the lease lost) if another owner holds
    /// the key or the lease expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached. A store error does not
    /// by itself mark the lease lost; the TTL still bounds ownership.
    pub async fn renew(&self) -> Result<bool> {
        if self.is_lost() {
            return Ok(false);
        }

        let renewed = self
            .store
            .compare_and_extend(&self.key, &self.token, self.ttl)
            .await?;
        if !renewed {
            tracing::warn!(lock_key = %self.key, "lease lost: owner token no longer matches");
            self.lost.cancel();
        }
        Ok(renewed)
    }

    async fn release(&self) {
        match self.store.compare_and_delete(&self.key, &self.token).await {
            Ok(true) => tracing::debug!(lock_key = %self.key, "lease released"),
            Ok(false) => {
                tracing::debug!(lock_key = %self.key, "lease already expired or taken over");
            }
            Err(err) => {
                tracing::warn!(lock_key = %self.key, error = %err, "failed to release lease");
            }
        }
    }
}

/// Distributed lock backed by a [`CoordinationStore`].
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
    key: String,
    ttl: Duration,
    heartbeat_interval: Duration,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

impl DistributedLock {
    /// Creates a lock on `key` with the default TTL and heartbeat interval.
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            ttl: DEFAULT_LEASE_TTL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Sets the lease TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// The lock key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Attempts to acquire the lease once, without retries.
    ///
    /// Returns `None` if another owner holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    pub async fn try_acquire(&self) -> Result<Option<LeaseHandle>> {
        let token = Ulid::new().to_string();
        let acquired = self
            .store
            .set_if_absent(&self.key, &token, Some(self.ttl))
            .await?;

        if !acquired {
            return Ok(None);
        }

        Ok(Some(LeaseHandle {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            token,
            ttl: self.ttl,
            lost: CancellationToken::new(),
        }))
    }

    /// Runs `body` only if this instance acquires the lease.
    ///
    /// The lease is renewed by a heartbeat while `body` runs and released
    /// (owner-checked) when it finishes, whatever its result.
    ///
    /// # Errors
    ///
    /// Returns an error only if the acquisition attempt itself fails. Errors
    /// produced by the body are part of `T`.
    pub async fn run_exclusive<F, Fut, T>(&self, body: F) -> Result<LockOutcome<T>>
    where
        F: FnOnce(LeaseHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(lease) = self.try_acquire().await? else {
            tracing::debug!(lock_key = %self.key, "lease held elsewhere; skipping");
            return Ok(LockOutcome::Unavailable);
        };

        tracing::debug!(lock_key = %self.key, token = %lease.token, "lease acquired");

        let mut guard = HeartbeatGuard {
            heartbeat: tokio::spawn(heartbeat(lease.clone(), self.heartbeat_interval)),
            lease: Some(lease.clone()),
        };
        let output = body(lease).await;

        guard.heartbeat.abort();
        if let Some(lease) = guard.lease.take() {
            lease.release().await;
        }
        Ok(LockOutcome::Completed(output))
    }
}

/// Stops the heartbeat when the body unwinds or the caller drops the
/// `run_exclusive` future.
///
/// An armed guard still owns the lease and hands its release to a detached
/// task; if no runtime is left the TTL reclaims the key.
struct HeartbeatGuard {
    heartbeat: tokio::task::JoinHandle<()>,
    lease: Option<LeaseHandle>,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.heartbeat.abort();

        let Some(lease) = self.lease.take() else {
            return;
        };
        lease.lost.cancel();
        tracing::warn!(lock_key = %lease.key, "lease body abandoned; releasing");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { lease.release().await });
        }
    }
}

/// Renews `lease` every `interval` until it is lost or the task is aborted.
async fn heartbeat(lease: LeaseHandle, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; the lease was just written.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = lease.lost() => return,
            _ = ticker.tick() => {}
        }

        match lease.renew().await {
            Ok(true) => tracing::trace!(lock_key = %lease.key, "lease renewed"),
            Ok(false) => return,
            Err(err) => {
                tracing::warn!(lock_key = %lease.key, error = %err, "lease renewal failed; retrying on next beat");
            }
        }
    }
}
