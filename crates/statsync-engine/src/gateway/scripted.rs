//! Scripted in-memory transport.
//!
//! [`ScriptedRemoteApi`] replays responses queued per path and counts every
//! attempt, so tests can assert exactly how many HTTP calls a logical call
//! made. Paths with nothing queued answer 404.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ApiResponse, RemoteApi, TransportError};

#[derive(Debug, Default)]
struct Script {
    queued: HashMap<String, VecDeque<std::result::Result<ApiResponse, TransportError>>>,
    attempts: HashMap<String, usize>,
}

/// Remote API double driven by queued responses.
#[derive(Debug, Default)]
pub struct ScriptedRemoteApi {
    script: Mutex<Script>,
    latency: Option<Duration>,
}

impl ScriptedRemoteApi {
    /// Creates an API with nothing queued.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every response by `latency` (uses tokio time).
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queues a response for `path`.
    pub fn push(&self, path: &str, response: ApiResponse) {
        self.push_result(path, Ok(response));
    }

    /// Queues a transport failure for `path`.
    pub fn push_error(&self, path: &str, error: TransportError) {
        self.push_result(path, Err(error));
    }

    /// Queues a `200` response whose body is `body` serialized as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if `body` cannot be serialized.
    pub fn push_json<T: serde::Serialize>(&self, path: &str, body: &T) -> serde_json::Result<()> {
        let encoded = serde_json::to_string(body)?;
        self.push(path, ApiResponse::new(200, encoded));
        Ok(())
    }

    /// Returns how many attempts were made against `path`.
    #[must_use]
    pub fn attempts(&self, path: &str) -> usize {
        self.lock().attempts.get(path).copied().unwrap_or(0)
    }

    /// Returns the total number of attempts across all paths.
    #[must_use]
    pub fn total_attempts(&self) -> usize {
        self.lock().attempts.values().sum()
    }

    fn push_result(&self, path: &str, result: std::result::Result<ApiResponse, TransportError>) {
        self.lock()
            .queued
            .entry(path.to_string())
            .or_default()
            .push_back(result);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl RemoteApi for ScriptedRemoteApi {
    async fn get(&self, path: &str) -> std::result::Result<ApiResponse, TransportError> {
        let next = {
            let mut script = self.lock();
            *script.attempts.entry(path.to_string()).or_insert(0) += 1;
            script
                .queued
                .get_mut(path)
                .and_then(VecDeque::pop_front)
        };

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        next.unwrap_or_else(|| Ok(ApiResponse::new(404, "")))
    }
}
