//! Coordination store contract.
//!
//! The [`CoordinationStore`] trait is the only channel through which processes
//! share mutable state. It is deliberately small: every operation is atomic on
//! a single key, and anything richer (budgets, cursors, leases) is built from
//! compare-and-swap loops on top of it.
//!
//! ## Design Principles
//!
//! - **No blind read-modify-write**: Mutations are conditional on the value the
//!   caller last observed
//! - **TTL-aware**: Expired entries behave exactly like absent ones
//! - **Owner-checked leases**: `compare_and_extend` / `compare_and_delete` only
//!   succeed for the holder of the expected value
//!
//! Any backend with native CAS or atomic scripting can implement this trait.
//! [`memory::MemoryStore`] is the in-process implementation used by tests and
//! single-process deployments.

pub mod memory;
pub mod reconnect;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Result of a compare-and-swap operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The value matched and was replaced.
    Swapped,
    /// The stored value did not match the expected value.
    Mismatch {
        /// The value that was found (`None` if absent or expired).
        current: Option<String>,
    },
}

impl CasOutcome {
    /// Returns true if the swap was applied.
    #[must_use]
    pub const fn is_swapped(&self) -> bool {
        matches!(self, Self::Swapped)
    }
}

/// Shared key-value store with atomic single-key operations.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` so a single store can back the limiter, the
/// lock and the cursors of one process concurrently.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Reads a value. Returns `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes a value unconditionally, clearing any TTL.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Writes a value only if the key is absent (or expired).
    ///
    /// Returns `true` if the value was written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Replaces the value only if the current value equals `expected`.
    ///
    /// `expected = None` means "only if absent". A successful swap keeps the
    /// existing TTL, if any.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<CasOutcome>;

    /// Resets the TTL to `ttl` only if the current value equals `expected`.
    ///
    /// Returns `true` if the TTL was extended.
    async fn compare_and_extend(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    /// Deletes the key only if the current value equals `expected`.
    ///
    /// Returns `true` if the key was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Atomically adds `by` to an integer counter and returns the new value.
    ///
    /// Absent keys count as zero. Fails if the stored value is not an integer.
    async fn increment(&self, key: &str, by: i64) -> Result<i64>;

    /// Deletes a key. Succeeds even if the key does not exist.
    async fn delete(&self, key: &str) -> Result<()>;
}
