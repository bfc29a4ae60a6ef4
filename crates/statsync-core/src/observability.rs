//! Observability infrastructure for statsync.
//!
//! Structured logging with consistent spans. This module provides the
//! initialization helper and span constructors shared by every statsync
//! process.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name; anything other than `json` is pretty.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `statsync_engine=debug`)
///
/// # Example
///
/// ```rust
/// use statsync_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one sweep tick.
///
/// # Example
///
/// ```rust
/// use statsync_core::observability::sweep_span;
///
/// let span = sweep_span(42);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn sweep_span(tick: i64) -> Span {
    tracing::info_span!("sweep", tick = tick)
}

/// Creates a span for one refresh job.
#[must_use]
pub fn refresh_span(kind: &str, target_id: &str) -> Span {
    tracing::info_span!("refresh", kind = kind, target = target_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn log_format_from_name() {
        assert_eq!(LogFormat::from_name("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from_name("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_name(""), LogFormat::Pretty);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = refresh_span("ranked", "player-1");
        let _guard = span.enter();
        tracing::info!("refresh message in span");
    }
}
