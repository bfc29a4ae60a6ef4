//! HTTP transport for the remote statistics API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{ApiResponse, RemoteApi, TransportError};
use crate::error::{Error, Result};

/// [`RemoteApi`] implementation backed by `reqwest`.
///
/// Appends the API key as the `api_key` query parameter to every request.
pub struct HttpRemoteApi {
    client: Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for HttpRemoteApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteApi")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl HttpRemoteApi {
    /// Creates a transport for `base_url`.
    ///
    /// `timeout` bounds each request at the socket level; the gateway applies
    /// its own per-attempt timeout on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| Error::configuration(format!("failed to create HTTP client: {err}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn get(&self, path: &str) -> std::result::Result<ApiResponse, TransportError> {
        let url = format!("{}{path}", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("api_key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Network(err.without_url().to_string())
                }
            })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response
            .text()
            .await
            .map_err(|err| TransportError::Network(err.without_url().to_string()))?;

        Ok(ApiResponse {
            status,
            body,
            retry_after,
        })
    }
}

/// Parses a `Retry-After` header given in delta-seconds.
///
/// HTTP-date values are ignored; the limiter then falls back to its own
/// exponential backoff.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after("1"), Some(Duration::from_secs(1)));
        assert_eq!(parse_retry_after(" 120 "), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn debug_redacts_api_key() -> Result<()> {
        let api = HttpRemoteApi::new("https://api.example.com/", "secret", Duration::from_secs(5))?;
        let rendered = format!("{api:?}");

        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("https://api.example.com"));
        Ok(())
    }
}
