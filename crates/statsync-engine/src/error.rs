//! Error types for the synchronization engine.
//!
//! Outcomes that are part of normal operation (a skipped tick, a busy lock, a
//! job deferred for budget) are modelled as enums by the components that
//! produce them, not as errors.

/// The result type used throughout statsync-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Remaining budget is too low to safely attempt the operation.
    #[error("request budget exhausted: {remaining} remaining, {floor} required")]
    QuotaExhausted {
        /// Budget units currently remaining.
        remaining: u32,
        /// Minimum budget the operation requires.
        floor: u32,
    },

    /// The remote API kept throttling after all permitted retries.
    #[error("remote API throttled {path} after {attempts} attempts")]
    RemoteThrottled {
        /// Request path.
        path: String,
        /// Number of HTTP attempts made.
        attempts: u32,
    },

    /// The remote API has no such resource.
    #[error("remote resource not found: {path}")]
    RemoteNotFound {
        /// Request path.
        path: String,
    },

    /// A server error, network failure or timeout outlasted the retry budget.
    #[error("transient remote failure on {path}: {message}")]
    RemoteTransient {
        /// Request path.
        path: String,
        /// Description of the last failure.
        message: String,
    },

    /// The remote API rejected the request with a non-retryable status.
    #[error("remote API returned {status} for {path}")]
    RemoteStatus {
        /// Request path.
        path: String,
        /// HTTP status code.
        status: u16,
    },

    /// The sweep lease was lost to another owner.
    #[error("lease lost on '{key}'")]
    LockLost {
        /// Lock key.
        key: String,
    },

    /// A repository operation failed.
    #[error("repository error: {message}")]
    Repository {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A queue store operation failed.
    #[error("queue error: {message}")]
    Queue {
        /// Description of the failure.
        message: String,
    },

    /// A payload could not be decoded or encoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Configuration is missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error from statsync-core.
    #[error("core error: {0}")]
    Core(#[from] statsync_core::Error),
}

impl Error {
    /// Creates a new repository error.
    #[must_use]
    pub fn repository(message: impl Into<String>) -> Self {
        Self::Repository {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new queue error.
    #[must_use]
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns true if the shared coordination store could not be reached.
    #[must_use]
    pub const fn is_store_unreachable(&self) -> bool {
        matches!(self, Self::Core(err) if err.is_store_unreachable())
    }

    /// Returns true if the remote API reported the resource as absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::RemoteNotFound { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_unreachable_is_detected_through_core() {
        let err: Error = statsync_core::Error::unreachable("reset by peer").into();
        assert!(err.is_store_unreachable());
        assert!(!Error::queue("boom").is_store_unreachable());
    }

    #[test]
    fn quota_exhausted_message_names_floor() {
        let err = Error::QuotaExhausted {
            remaining: 3,
            floor: 50,
        };
        assert_eq!(
            err.to_string(),
            "request budget exhausted: 3 remaining, 50 required"
        );
    }

    #[test]
    fn serde_errors_convert() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
