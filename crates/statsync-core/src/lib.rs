//! # statsync-core
//!
//! Shared coordination primitives for the statsync synchronization engine.
//!
//! Every piece of cross-process mutable state (request budget, sweep lease,
//! sweep cursors) lives in a [`kv::CoordinationStore`]. This crate defines that
//! contract and the primitives built directly on it:
//!
//! - **Clock**: Wall-clock abstraction so TTLs and budgets are testable
//! - **Coordination Store**: Atomic KV operations (set-if-absent, CAS, extend, delete)
//! - **Reconnecting Store**: Connection reinitialization on "store unreachable"
//! - **Distributed Lock**: Single-owner execution with heartbeat renewal
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use statsync_core::kv::memory::MemoryStore;
//! use statsync_core::lock::{DistributedLock, LockOutcome};
//!
//! # async fn demo() -> statsync_core::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let lock = DistributedLock::new(store, "sweep").with_ttl(Duration::from_secs(300));
//!
//! let outcome = lock.run_exclusive(|_lease| async { 42 }).await?;
//! assert!(matches!(outcome, LockOutcome::Completed(42)));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod error;
pub mod kv;
pub mod lock;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::clock::{Clock, SystemClock, TokioClock};
    pub use crate::error::{Error, Result};
    pub use crate::kv::memory::MemoryStore;
    pub use crate::kv::reconnect::{ReconnectingStore, StoreConnector};
    pub use crate::kv::{CasOutcome, CoordinationStore};
    pub use crate::lock::{DistributedLock, LeaseHandle, LockOutcome};
}

pub use clock::{Clock, SystemClock, TokioClock};
pub use error::{Error, Result};
pub use kv::{CasOutcome, CoordinationStore};
pub use lock::{DistributedLock, LeaseHandle, LockOutcome};
pub use observability::{LogFormat, init_logging};
