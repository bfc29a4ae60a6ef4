//! Self-healing store connection.
//!
//! [`ReconnectingStore`] wraps a [`StoreConnector`] and implements
//! [`CoordinationStore`] itself. A connection is opened lazily; when an
//! operation fails with [`Error::StoreUnreachable`], the connection is dropped
//! and the *next* operation opens a fresh one. The failing operation still
//! fails: nothing is answered from a cache, so callers never bypass shared
//! state (in particular the request budget) while the store is down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CasOutcome, CoordinationStore};
use crate::error::Result;

/// Opens connections to a coordination store backend.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Opens a new connection.
    ///
    /// Returns [`crate::Error::StoreUnreachable`] if the backend cannot be reached.
    async fn connect(&self) -> Result<Arc<dyn CoordinationStore>>;

    /// Human-readable backend description for logs.
    fn describe(&self) -> String;
}

/// Connector that always hands out the same store.
///
/// Used for in-process stores, where "reconnecting" means reusing the
/// existing instance.
#[derive(Clone)]
pub struct SharedConnector {
    store: Arc<dyn CoordinationStore>,
    name: String,
}

impl SharedConnector {
    /// Creates a connector around an existing store.
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }
}

#[async_trait]
impl StoreConnector for SharedConnector {
    async fn connect(&self) -> Result<Arc<dyn CoordinationStore>> {
        Ok(Arc::clone(&self.store))
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Coordination store that reinitializes its connection after it is lost.
pub struct ReconnectingStore {
    connector: Arc<dyn StoreConnector>,
    current: RwLock<Option<Arc<dyn CoordinationStore>>>,
}

impl std::fmt::Debug for ReconnectingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingStore")
            .field("backend", &self.connector.describe())
            .finish_non_exhaustive()
    }
}

impl ReconnectingStore {
    /// Creates a store that connects lazily through `connector`.
    #[must_use]
    pub fn new(connector: Arc<dyn StoreConnector>) -> Self {
        Self {
            connector,
            current: RwLock::new(None),
        }
    }

    /// Returns the live connection, opening one if needed.
    async fn connection(&self) -> Result<Arc<dyn CoordinationStore>> {
        // Fast path: reuse the open connection
        {
            let read_guard = self.current.read().await;
            if let Some(store) = read_guard.as_ref() {
                return Ok(Arc::clone(store));
            }
        }

        let mut write_guard = self.current.write().await;

        // Double-check after acquiring write lock
        if let Some(store) = write_guard.as_ref() {
            return Ok(Arc::clone(store));
        }

        let store = self.connector.connect().await?;
        tracing::info!(backend = %self.connector.describe(), "coordination store connected");
        *write_guard = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Drops `used` if it is still the current connection and the result
    /// reports an unreachable store.
    async fn observe<T>(&self, used: &Arc<dyn CoordinationStore>, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_store_unreachable() {
                let mut write_guard = self.current.write().await;
                let is_current = write_guard
                    .as_ref()
                    .is_some_and(|store| Arc::ptr_eq(store, used));
                if is_current {
                    *write_guard = None;
                    tracing::warn!(
                        backend = %self.connector.describe(),
                        error = %err,
                        "coordination store unreachable; connection will be reinitialized"
                    );
                }
            }
        }
        result
    }

    /// Returns true if a connection is currently open.
    pub async fn is_connected(&self) -> bool {
        self.current.read().await.is_some()
    }
}

#[async_trait]
impl CoordinationStore for ReconnectingStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let store = self.connection().await?;
        let result = store.get(key).await;
        self.observe(&store, result).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let store = self.connection().await?;
        let result = store.set(key, value).await;
        self.observe(&store, result).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let store = self.connection().await?;
        let result = store.set_if_absent(key, value, ttl).await;
        self.observe(&store, result).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<CasOutcome> {
        let store = self.connection().await?;
        let result = store.compare_and_swap(key, expected, value).await;
        self.observe(&store, result).await
    }

    async fn compare_and_extend(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let store = self.connection().await?;
        let result = store.compare_and_extend(key, expected, ttl).await;
        self.observe(&store, result).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let store = self.connection().await?;
        let result = store.compare_and_delete(key, expected).await;
        self.observe(&store, result).await
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        let store = self.connection().await?;
        let result = store.increment(key, by).await;
        self.observe(&store, result).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let store = self.connection().await?;
        let result = store.delete(key).await;
        self.observe(&store, result).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::kv::memory::MemoryStore;

    /// Connector that hands out a new healthy store on every connect.
    struct CountingConnector {
        connects: AtomicUsize,
        last: std::sync::Mutex<Option<Arc<MemoryStore>>>,
    }

    impl CountingConnector {
        fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
                last: std::sync::Mutex::new(None),
            }
        }

        fn last(&self) -> Arc<MemoryStore> {
            self.last
                .lock()
                .unwrap()
                .clone()
                .expect("connected at least once")
        }
    }

    #[async_trait]
    impl StoreConnector for CountingConnector {
        async fn connect(&self) -> Result<Arc<dyn CoordinationStore>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let store = Arc::new(MemoryStore::new());
            *self.last.lock().unwrap() = Some(Arc::clone(&store));
            Ok(store)
        }

        fn describe(&self) -> String {
            "counting".to_string()
        }
    }

    #[tokio::test]
    async fn connects_lazily_once() -> Result<()> {
        let connector = Arc::new(CountingConnector::new());
        let store = ReconnectingStore::new(connector.clone());
        assert!(!store.is_connected().await);

        store.set("a", "1").await?;
        store.set("b", "2").await?;

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(store.is_connected().await);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_error_fails_call_and_reconnects_next_time() -> Result<()> {
        let connector = Arc::new(CountingConnector::new());
        let store = ReconnectingStore::new(connector.clone());

        store.set("a", "1").await?;
        connector.last().set_unreachable(true);

        let err = store.get("a").await.expect_err("connection lost");
        assert!(err.is_store_unreachable());
        assert!(!store.is_connected().await);

        // The next call opens a fresh connection instead of wedging.
        assert_eq!(store.get("a").await?, None);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn shared_connector_reuses_store() -> Result<()> {
        let inner = Arc::new(MemoryStore::new());
        inner.set("k", "v").await?;
        let store = ReconnectingStore::new(Arc::new(SharedConnector::new(inner, "memory")));

        assert_eq!(store.get("k").await?, Some("v".to_string()));
        Ok(())
    }
}
