//! In-memory coordination store.
//!
//! This module provides [`MemoryStore`], a thread-safe implementation of the
//! [`CoordinationStore`] trait suitable for tests and single-process
//! deployments.
//!
//! ## Limitations
//!
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits
//!
//! [`MemoryStore::set_unreachable`] simulates a lost connection: while set,
//! every operation fails with [`Error::StoreUnreachable`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CasOutcome, CoordinationStore};
use crate::clock::{self, Clock, SystemClock};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-memory coordination store.
///
/// ## Example
///
/// ```rust
/// use statsync_core::kv::memory::MemoryStore;
///
/// let store = MemoryStore::new();
/// // Share it between a limiter, a lock and cursors in tests...
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    unreachable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("coordination store lock poisoned")
}

impl MemoryStore {
    /// Creates a store that uses the system clock for TTLs.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a store that uses the given clock for TTLs.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            unreachable: AtomicBool::new(false),
        }
    }

    /// Simulates (or clears) a lost connection.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Returns the remaining TTL of a key, if it is live and has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = self.clock.now();
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| clock::until(now, at)))
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::unreachable("memory store marked unreachable"));
        }
        Ok(())
    }

    fn live_value<'a>(
        entries: &'a HashMap<String, Entry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a Entry> {
        entries.get(key).filter(|entry| entry.is_live(now))
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_reachable()?;
        let now = self.clock.now();
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(Self::live_value(&entries, key, now).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check_reachable()?;
        let mut entries = self.entries.write().map_err(poison_err)?;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        drop(entries);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.check_reachable()?;
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(poison_err)?;

        if Self::live_value(&entries, key, now).is_some() {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| clock::after(now, ttl)),
            },
        );
        drop(entries);
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<CasOutcome> {
        self.check_reachable()?;
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(poison_err)?;

        let current = Self::live_value(&entries, key, now);
        let current_value = current.map(|entry| entry.value.as_str());
        if current_value != expected {
            let current = current_value.map(str::to_string);
            drop(entries);
            return Ok(CasOutcome::Mismatch { current });
        }

        let expires_at = current.and_then(|entry| entry.expires_at);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        drop(entries);
        Ok(CasOutcome::Swapped)
    }

    async fn compare_and_extend(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        self.check_reachable()?;
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(poison_err)?;

        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };
        if !entry.is_live(now) || entry.value != expected {
            return Ok(false);
        }

        entry.expires_at = Some(clock::after(now, ttl));
        drop(entries);
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.check_reachable()?;
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(poison_err)?;

        let matches = Self::live_value(&entries, key, now).is_some_and(|e| e.value == expected);
        if matches {
            entries.remove(key);
        }
        drop(entries);
        Ok(matches)
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        self.check_reachable()?;
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(poison_err)?;

        let (current, expires_at) = match Self::live_value(&entries, key, now) {
            Some(entry) => {
                let parsed = entry.value.parse::<i64>().map_err(|_| {
                    Error::InvalidInput(format!("value at '{key}' is not an integer"))
                })?;
                (parsed, entry.expires_at)
            }
            None => (0, None),
        };

        let next = current.saturating_add(by);
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        drop(entries);
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_reachable()?;
        let mut entries = self.entries.write().map_err(poison_err)?;
        entries.remove(key);
        drop(entries);
        Ok(())
    }
}
