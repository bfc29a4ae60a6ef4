//! Budgeted access to the remote statistics API.
//!
//! This module provides:
//!
//! - [`RemoteApi`]: Transport trait for one HTTP attempt
//! - [`Endpoint`]: The remote resources the engine reads
//! - [`RemoteApiGateway`]: Budget acquisition, timeout and retry policy around a transport
//!
//! ## Retry Policy
//!
//! | Response | Action |
//! |----------|--------|
//! | 2xx | Decode body |
//! | 429 | Report to limiter, retry up to `max_throttle_retries` times |
//! | 5xx, network error, timeout | Retry up to `max_transient_retries` times |
//! | 404 | [`Error::RemoteNotFound`], never retried |
//! | other 4xx | [`Error::RemoteStatus`], never retried |
//!
//! Every attempt, retries included, first waits for a budget grant.

pub mod http;
pub mod scripted;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::budget::TokenBudgetLimiter;
use crate::error::{Error, Result};
use crate::metrics::SyncMetrics;
use crate::model::{Bracket, PlayerRankedProfile, PlayerStats, RankingPage, Region};

/// A resource of the remote API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Global leaderboard page of a bracket.
    Leaderboard {
        /// Bracket.
        bracket: Bracket,
        /// Page number (1-based).
        page: u32,
    },
    /// Leaderboard page of a bracket within one region.
    RegionalLeaderboard {
        /// Bracket.
        bracket: Bracket,
        /// Region.
        region: Region,
        /// Page number (1-based).
        page: u32,
    },
    /// A player's ranked profile.
    PlayerRanked {
        /// Remote player identifier.
        player_id: String,
    },
    /// A player's extended statistics.
    PlayerStats {
        /// Remote player identifier.
        player_id: String,
    },
}

impl Endpoint {
    /// Returns the request path, without query string.
    #[must_use]
    pub fn path(&self) -> String {
        match self {
            Self::Leaderboard { bracket, page } => format!("/leaderboard/{bracket}/{page}"),
            Self::RegionalLeaderboard {
                bracket,
                region,
                page,
            } => format!("/leaderboard/{bracket}/{region}/{page}"),
            Self::PlayerRanked { player_id } => format!("/player/{player_id}/ranked"),
            Self::PlayerStats { player_id } => format!("/player/{player_id}/stats"),
        }
    }
}

/// Response of one HTTP attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
    /// Parsed `Retry-After` header, if present.
    pub retry_after: Option<Duration>,
}

impl ApiResponse {
    /// Creates a response with no `Retry-After` hint.
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    /// Sets the `Retry-After` hint.
    #[must_use]
    pub const fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Failure below the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be established or broke.
    #[error("network error: {0}")]
    Network(String),
    /// The transport gave up waiting for a response.
    #[error("request timed out")]
    Timeout,
}

/// Performs single HTTP attempts against the remote API.
///
/// Implementations do not retry; the gateway owns retry policy.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Sends `GET {path}` and returns the raw response.
    async fn get(&self, path: &str) -> std::result::Result<ApiResponse, TransportError>;
}

/// Gateway retry and timeout configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Fixed timeout for each HTTP attempt.
    pub request_timeout: Duration,
    /// Retries allowed after 429 responses.
    pub max_throttle_retries: u32,
    /// Retries allowed after 5xx, network errors or timeouts.
    pub max_transient_retries: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_throttle_retries: 3,
            max_transient_retries: 1,
        }
    }
}

/// What to do with one attempt's result.
enum Attempt {
    Done(String),
    Throttled(Option<Duration>),
    Transient(String),
}

/// Routes every remote call through the shared budget.
pub struct RemoteApiGateway {
    api: Arc<dyn RemoteApi>,
    limiter: Arc<TokenBudgetLimiter>,
    config: GatewayConfig,
    metrics: SyncMetrics,
}

impl std::fmt::Debug for RemoteApiGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteApiGateway")
            .field("limiter", &self.limiter)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RemoteApiGateway {
    /// Creates a gateway.
    #[must_use]
    pub fn new(
        api: Arc<dyn RemoteApi>,
        limiter: Arc<TokenBudgetLimiter>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            api,
            limiter,
            config,
            metrics: SyncMetrics::new(),
        }
    }

    /// Returns the budget units left in the current window.
    ///
    /// # Errors
    ///
    /// Returns an error if the budget store is unreachable.
    pub async fn remaining(&self) -> Result<u32> {
        self.limiter.remaining().await
    }

    /// Calls an endpoint and returns the decoded JSON body.
    ///
    /// # Errors
    ///
    /// See the module-level retry table. Budget store failures propagate as
    /// [`Error::Core`].
    pub async fn call(&self, endpoint: &Endpoint) -> Result<serde_json::Value> {
        let body = self.call_raw(endpoint).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Fetches a global leaderboard page.
    ///
    /// # Errors
    ///
    /// See [`RemoteApiGateway::call`].
    pub async fn fetch_leaderboard(&self, bracket: &Bracket, page: u32) -> Result<RankingPage> {
        self.call_typed(&Endpoint::Leaderboard {
            bracket: bracket.clone(),
            page,
        })
        .await
    }

    /// Fetches a regional leaderboard page.
    ///
    /// # Errors
    ///
    /// See [`RemoteApiGateway::call`].
    pub async fn fetch_regional_leaderboard(
        &self,
        bracket: &Bracket,
        region: &Region,
        page: u32,
    ) -> Result<RankingPage> {
        self.call_typed(&Endpoint::RegionalLeaderboard {
            bracket: bracket.clone(),
            region: region.clone(),
            page,
        })
        .await
    }

    /// Fetches a player's ranked profile.
    ///
    /// # Errors
    ///
    /// See [`RemoteApiGateway::call`].
    pub async fn fetch_player_ranked(&self, player_id: &str) -> Result<PlayerRankedProfile> {
        self.call_typed(&Endpoint::PlayerRanked {
            player_id: player_id.to_string(),
        })
        .await
    }

    /// Fetches a player's extended statistics.
    ///
    /// # Errors
    ///
    /// See [`RemoteApiGateway::call`].
    pub async fn fetch_player_stats(&self, player_id: &str) -> Result<PlayerStats> {
        self.call_typed(&Endpoint::PlayerStats {
            player_id: player_id.to_string(),
        })
        .await
    }

    async fn call_typed<T: DeserializeOwned>(&self, endpoint: &Endpoint) -> Result<T> {
        let body = self.call_raw(endpoint).await?;
        serde_json::from_str(&body).map_err(|err| {
            Error::serialization(format!("decoding {}: {err}", endpoint.path()))
        })
    }

    async fn call_raw(&self, endpoint: &Endpoint) -> Result<String> {
        let path = endpoint.path();
        let mut attempts = 0_u32;
        let mut throttle_retries = 0_u32;
        let mut transient_retries = 0_u32;

        loop {
            attempts += 1;
            let permit = self.limiter.acquire().await?;
            let sent = tokio::time::timeout(self.config.request_timeout, self.api.get(&path)).await;
            drop(permit);

            match self.classify(&path, sent)? {
                Attempt::Done(body) => return Ok(body),
                Attempt::Throttled(retry_after) => {
                    // Every 429 blocks the shared budget, including the last one.
                    self.limiter
                        .report_throttled(retry_after, throttle_retries)
                        .await?;
                    if throttle_retries >= self.config.max_throttle_retries {
                        return Err(Error::RemoteThrottled { path, attempts });
                    }
                    throttle_retries += 1;
                }
                Attempt::Transient(message) => {
                    if transient_retries >= self.config.max_transient_retries {
                        return Err(Error::RemoteTransient { path, message });
                    }
                    tracing::debug!(path = %path, attempt = attempts, error = %message, "transient failure; retrying");
                    transient_retries += 1;
                }
            }
        }
    }

    fn classify(
        &self,
        path: &str,
        sent: std::result::Result<
            std::result::Result<ApiResponse, TransportError>,
            tokio::time::error::Elapsed,
        >,
    ) -> Result<Attempt> {
        let response = match sent {
            Err(_) => {
                self.metrics.record_gateway_attempt("timeout");
                return Ok(Attempt::Transient(TransportError::Timeout.to_string()));
            }
            Ok(Err(err)) => {
                self.metrics.record_gateway_attempt("network");
                return Ok(Attempt::Transient(err.to_string()));
            }
            Ok(Ok(response)) => response,
        };

        match response.status {
            200..=299 => {
                self.metrics.record_gateway_attempt("ok");
                Ok(Attempt::Done(response.body))
            }
            429 => {
                self.metrics.record_gateway_attempt("throttled");
                Ok(Attempt::Throttled(response.retry_after))
            }
            404 => {
                self.metrics.record_gateway_attempt("not_found");
                Err(Error::RemoteNotFound {
                    path: path.to_string(),
                })
            }
            status if status >= 500 => {
                self.metrics.record_gateway_attempt("server_error");
                Ok(Attempt::Transient(format!("server returned {status}")))
            }
            status => {
                self.metrics.record_gateway_attempt("rejected");
                Err(Error::RemoteStatus {
                    path: path.to_string(),
                    status,
                })
            }
        }
    }
}
