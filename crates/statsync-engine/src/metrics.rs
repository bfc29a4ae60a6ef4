//! Observability metrics for the synchronization engine.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `statsync_sweep_ticks_total` | Counter | `outcome` | Sweep tick outcomes |
//! | `statsync_sweep_tick_duration_seconds` | Histogram | - | Sweep tick processing time |
//! | `statsync_sweep_partitions_total` | Counter | `scope`, `result` | Partitions visited |
//! | `statsync_gateway_attempts_total` | Counter | `result` | HTTP attempts by classification |
//! | `statsync_limiter_wait_seconds` | Histogram | - | Time spent waiting for a grant |
//! | `statsync_budget_remaining` | Gauge | - | Budget remaining after the last grant |
//! | `statsync_enqueue_total` | Counter | `kind`, `outcome` | Refresh enqueue outcomes |
//! | `statsync_refresh_jobs_total` | Counter | `kind`, `outcome` | Refresh job outcomes |
//! | `statsync_queue_depth` | Gauge | - | Non-terminal refresh jobs |
//! | `statsync_backfill_enqueued_total` | Counter | - | Jobs enqueued by backfill |
//!
//! ## Integration
//!
//! Metrics go through the `metrics` crate facade. The worker binary installs
//! a Prometheus exporter when started with `--metrics-port`.

use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Sweep ticks by outcome.
    pub const SWEEP_TICKS_TOTAL: &str = "statsync_sweep_ticks_total";
    /// Histogram: Sweep tick processing time in seconds.
    pub const SWEEP_TICK_DURATION_SECONDS: &str = "statsync_sweep_tick_duration_seconds";
    /// Counter: Sweep partitions by scope and result.
    pub const SWEEP_PARTITIONS_TOTAL: &str = "statsync_sweep_partitions_total";
    /// Counter: Gateway HTTP attempts by result.
    pub const GATEWAY_ATTEMPTS_TOTAL: &str = "statsync_gateway_attempts_total";
    /// Histogram: Time spent waiting for a budget grant in seconds.
    pub const LIMITER_WAIT_SECONDS: &str = "statsync_limiter_wait_seconds";
    /// Gauge: Budget units remaining after the last grant.
    pub const BUDGET_REMAINING: &str = "statsync_budget_remaining";
    /// Counter: Refresh enqueue outcomes.
    pub const ENQUEUE_TOTAL: &str = "statsync_enqueue_total";
    /// Counter: Refresh job outcomes.
    pub const REFRESH_JOBS_TOTAL: &str = "statsync_refresh_jobs_total";
    /// Gauge: Non-terminal refresh jobs.
    pub const QUEUE_DEPTH: &str = "statsync_queue_depth";
    /// Counter: Jobs enqueued by backfill.
    pub const BACKFILL_ENQUEUED_TOTAL: &str = "statsync_backfill_enqueued_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Outcome (completed, `low_budget`, `lock_held`, ...).
    pub const OUTCOME: &str = "outcome";
    /// Cursor scope (hot, cold, regional).
    pub const SCOPE: &str = "scope";
    /// Result classification (ok, failed, throttled, ...).
    pub const RESULT: &str = "result";
    /// Refresh kind (ranked, stats).
    pub const KIND: &str = "kind";
}

/// Registers descriptions for every engine metric with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(names::SWEEP_TICKS_TOTAL, "Sweep ticks by outcome");
    describe_histogram!(
        names::SWEEP_TICK_DURATION_SECONDS,
        "Duration of sweep ticks in seconds"
    );
    describe_counter!(
        names::SWEEP_PARTITIONS_TOTAL,
        "Leaderboard partitions visited by scope and result"
    );
    describe_counter!(
        names::GATEWAY_ATTEMPTS_TOTAL,
        "Remote API attempts by classification"
    );
    describe_histogram!(
        names::LIMITER_WAIT_SECONDS,
        "Time spent waiting for a budget grant in seconds"
    );
    describe_gauge!(names::BUDGET_REMAINING, "Budget units left after the last grant");
    describe_counter!(names::ENQUEUE_TOTAL, "Refresh submissions by kind and outcome");
    describe_counter!(names::REFRESH_JOBS_TOTAL, "Refresh jobs by kind and outcome");
    describe_gauge!(names::QUEUE_DEPTH, "Non-terminal refresh jobs");
    describe_counter!(names::BACKFILL_ENQUEUED_TOTAL, "Stats jobs enqueued by backfill");
}

/// High-level interface for recording engine metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct SyncMetrics;

impl SyncMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a sweep tick outcome.
    pub fn record_tick(&self, outcome: &'static str) {
        counter!(names::SWEEP_TICKS_TOTAL, labels::OUTCOME => outcome).increment(1);
    }

    /// Records sweep tick duration.
    pub fn observe_tick_duration(&self, duration: Duration) {
        histogram!(names::SWEEP_TICK_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records one visited partition.
    pub fn record_partition(&self, scope: &'static str, result: &'static str) {
        counter!(
            names::SWEEP_PARTITIONS_TOTAL,
            labels::SCOPE => scope,
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records one HTTP attempt made by the gateway.
    pub fn record_gateway_attempt(&self, result: &'static str) {
        counter!(names::GATEWAY_ATTEMPTS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Records a completed budget acquisition.
    pub fn record_grant(&self, waited: Duration, remaining: u32) {
        histogram!(names::LIMITER_WAIT_SECONDS).record(waited.as_secs_f64());
        gauge!(names::BUDGET_REMAINING).set(f64::from(remaining));
    }

    /// Records a refresh enqueue outcome.
    pub fn record_enqueue(&self, kind: &'static str, outcome: &'static str) {
        counter!(
            names::ENQUEUE_TOTAL,
            labels::KIND => kind,
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }

    /// Records a refresh job outcome.
    pub fn record_job(&self, kind: &'static str, outcome: &'static str) {
        counter!(
            names::REFRESH_JOBS_TOTAL,
            labels::KIND => kind,
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }

    /// Sets the refresh queue depth.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_queue_depth(&self, depth: usize) {
        gauge!(names::QUEUE_DEPTH).set(depth as f64);
    }

    /// Records jobs enqueued by one backfill pass.
    pub fn record_backfill(&self, enqueued: usize) {
        counter!(names::BACKFILL_ENQUEUED_TOTAL)
            .increment(u64::try_from(enqueued).unwrap_or(u64::MAX));
    }
}

/// Guard that records elapsed time when dropped.
///
/// ## Example
///
/// ```rust
/// use statsync_engine::metrics::{SyncMetrics, TimingGuard};
///
/// let metrics = SyncMetrics::new();
///
/// {
///     let _guard = TimingGuard::new(|duration| {
///         metrics.observe_tick_duration(duration);
///     });
///
///     // Do work...
/// } // Duration recorded automatically on drop
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_noop() {
        describe_metrics();
        let metrics = SyncMetrics::new();
        metrics.record_tick("completed");
        metrics.record_partition("hot", "ok");
        metrics.record_grant(Duration::from_millis(5), 42);
        metrics.set_queue_depth(3);
        metrics.record_backfill(2);
    }

    #[test]
    fn timing_guard_reports_on_drop() {
        let mut recorded = None;
        {
            let _guard = TimingGuard::new(|d| recorded = Some(d));
        }
        assert!(recorded.is_some());
    }
}
