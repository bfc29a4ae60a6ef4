//! In-memory refresh queue store.
//!
//! This module provides [`InMemoryQueueStore`], a thread-safe implementation
//! of the [`QueueStore`] trait suitable for testing and single-process
//! deployments.
//!
//! ## Limitations
//!
//! - **No persistence**: Jobs are lost when the process exits
//! - **Single-process only**: Jobs are not visible across process boundaries
//!
//! Ready jobs are indexed by `(priority, sequence)` in a `BTreeSet`, so a poll
//! takes the most urgent, oldest job in logarithmic time. Delayed jobs are
//! moved into the index once their `ready_at` has passed.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use statsync_core::clock::{self, Clock, SystemClock};

use super::{AddOptions, AddResult, JobState, LeasedJob, QueueStore, RefreshJob, StoredJob};
use crate::error::{Error, Result};

#[derive(Debug)]
struct Slot {
    stored: StoredJob,
    seq: u64,
}

/// Internal queue state protected by a single lock.
#[derive(Debug, Default)]
struct QueueState {
    slots: HashMap<String, Slot>,
    ready: BTreeSet<(u8, u64, String)>,
    next_seq: u64,
}

impl QueueState {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        for (key, slot) in &mut self.slots {
            if let JobState::Delayed { ready_at } = slot.stored.state {
                if ready_at <= now {
                    slot.stored.state = JobState::Waiting;
                    self.ready
                        .insert((slot.stored.job.priority, slot.seq, key.clone()));
                }
            }
        }
    }

    fn requeue(&mut self, key: &str, delay: Duration, now: DateTime<Utc>) -> Result<&mut Slot> {
        let slot = self
            .slots
            .get_mut(key)
            .ok_or_else(|| Error::queue(format!("no job under key '{key}'")))?;
        if slot.stored.state != JobState::Active {
            return Err(Error::queue(format!("job '{key}' is not active")));
        }

        if delay.is_zero() {
            slot.stored.state = JobState::Waiting;
            self.ready
                .insert((slot.stored.job.priority, slot.seq, key.to_string()));
        } else {
            slot.stored.state = JobState::Delayed {
                ready_at: clock::after(now, delay),
            };
        }
        Ok(slot)
    }
}

/// In-memory refresh queue store.
///
/// ## Example
///
/// ```rust
/// use statsync_engine::queue::memory::InMemoryQueueStore;
///
/// let store = InMemoryQueueStore::new();
/// // Share it between a RefreshQueue and a RefreshConsumer in tests...
/// ```
#[derive(Debug)]
pub struct InMemoryQueueStore {
    state: RwLock<QueueState>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a lock poison error to a queue error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::queue("queue store lock poisoned")
}

impl InMemoryQueueStore {
    /// Creates an empty store using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store using the given clock for delays.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(QueueState::default()),
            clock,
        }
    }

    /// Returns every stored job, most urgent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn snapshot(&self) -> Result<Vec<StoredJob>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut slots: Vec<&Slot> = state.slots.values().collect();
        slots.sort_by_key(|slot| (slot.stored.job.priority, slot.seq));
        Ok(slots.into_iter().map(|slot| slot.stored.clone()).collect())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn add(&self, job: RefreshJob, options: AddOptions) -> Result<AddResult> {
        let now = self.clock.now();
        let mut state = self.state.write().map_err(poison_err)?;

        let result = match state.slots.get(&job.dedupe_key) {
            None => AddResult::Added,
            Some(slot) if options.replace_failed && slot.stored.state.is_failed() => {
                AddResult::Replaced
            }
            Some(_) => return Ok(AddResult::Duplicate),
        };

        let seq = state.next_seq;
        state.next_seq += 1;

        let job_state = match options.delay {
            Some(delay) if !delay.is_zero() => JobState::Delayed {
                ready_at: clock::after(now, delay),
            },
            _ => {
                state
                    .ready
                    .insert((job.priority, seq, job.dedupe_key.clone()));
                JobState::Waiting
            }
        };

        state.slots.insert(
            job.dedupe_key.clone(),
            Slot {
                stored: StoredJob {
                    job,
                    state: job_state,
                    attempts_made: 0,
                },
                seq,
            },
        );
        drop(state);
        Ok(result)
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<StoredJob>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.slots.get(key).map(|slot| slot.stored.clone()))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(slot) = state.slots.remove(key) else {
            return Ok(false);
        };
        state
            .ready
            .remove(&(slot.stored.job.priority, slot.seq, key.to_string()));
        drop(state);
        Ok(true)
    }

    async fn poll(&self) -> Result<Option<LeasedJob>> {
        let now = self.clock.now();
        let mut state = self.state.write().map_err(poison_err)?;
        state.promote_due(now);

        let Some((_, _, key)) = state.ready.pop_first() else {
            return Ok(None);
        };
        let leased = state.slots.get_mut(&key).map(|slot| {
            slot.stored.state = JobState::Active;
            LeasedJob {
                job: slot.stored.job.clone(),
                attempts_made: slot.stored.attempts_made,
            }
        });
        drop(state);
        Ok(leased)
    }

    async fn release(&self, key: &str, delay: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.write().map_err(poison_err)?;
        state.requeue(key, delay, now)?;
        drop(state);
        Ok(())
    }

    async fn retry(&self, key: &str, delay: Duration) -> Result<u32> {
        let now = self.clock.now();
        let mut state = self.state.write().map_err(poison_err)?;
        let slot = state.requeue(key, delay, now)?;
        slot.stored.attempts_made = slot.stored.attempts_made.saturating_add(1);
        let attempts = slot.stored.attempts_made;
        drop(state);
        Ok(attempts)
    }

    async fn fail(&self, key: &str, reason: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(slot) = state.slots.get_mut(key) else {
            return Err(Error::queue(format!("no job under key '{key}'")));
        };
        let ready_entry = (slot.stored.job.priority, slot.seq, key.to_string());
        slot.stored.state = JobState::Failed {
            reason: reason.to_string(),
        };
        state.ready.remove(&ready_entry);
        drop(state);
        Ok(())
    }

    async fn depth(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .slots
            .values()
            .filter(|slot| !slot.stored.state.is_failed())
            .count())
    }
}
