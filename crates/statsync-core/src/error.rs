//! Error types and result aliases for statsync coordination primitives.
//!
//! Store failures are split in two classes: [`Error::StoreUnreachable`] means
//! the connection itself is gone and must be reinitialized, while
//! [`Error::Storage`] covers everything else the store can reject.

/// The result type used throughout statsync-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in coordination operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The shared coordination store cannot be reached.
    ///
    /// Callers should fail the current operation; the connection is
    /// reinitialized on the next call.
    #[error("coordination store unreachable: {message}")]
    StoreUnreachable {
        /// Description of the connection failure.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A precondition for the operation was not met.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new "store unreachable" error.
    #[must_use]
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::StoreUnreachable {
            message: message.into(),
        }
    }

    /// Returns true if the error means the store connection is gone.
    #[must_use]
    pub const fn is_store_unreachable(&self) -> bool {
        matches!(self, Self::StoreUnreachable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn unreachable_is_classified() {
        let err = Error::unreachable("connection reset");
        assert!(err.is_store_unreachable());
        assert!(err.to_string().contains("connection reset"));
        assert!(!Error::storage("boom").is_store_unreachable());
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = Error::storage_with_source("write failed", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }
}
