//! Pipeline metrics.
//!
//! Recorded through the `metrics` facade; installing an exporter is left to
//! the embedding process.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `postflow_lease_acquisitions_total` | Counter | `domain`, `result` |
//! | `postflow_assignments_total` | Counter | `channel`, `result` |
//! | `postflow_stage_duration_seconds` | Histogram | `stage` |
//! | `postflow_messages_total` | Counter | `result` |
//! | `postflow_publishes_total` | Counter | `channel`, `result` |
//! | `postflow_stalled_items` | Gauge | - |
//! | `postflow_ingestions_total` | Counter | `source`, `result` |
//! | `postflow_queue_depth` | Gauge | `queue` |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    /// Counter: lease acquisition attempts.
    pub const LEASE_ACQUISITIONS_TOTAL: &str = "postflow_lease_acquisitions_total";
    /// Counter: publisher assignment outcomes.
    pub const ASSIGNMENTS_TOTAL: &str = "postflow_assignments_total";
    /// Histogram: orchestrator stage duration in seconds.
    pub const STAGE_DURATION_SECONDS: &str = "postflow_stage_duration_seconds";
    /// Counter: change-stream message outcomes.
    pub const MESSAGES_TOTAL: &str = "postflow_messages_total";
    /// Counter: publish outcomes.
    pub const PUBLISHES_TOTAL: &str = "postflow_publishes_total";
    /// Gauge: items reported stalled by the last sweep.
    pub const STALLED_ITEMS: &str = "postflow_stalled_items";
    /// Counter: ingestion outcomes.
    pub const INGESTIONS_TOTAL: &str = "postflow_ingestions_total";
    /// Gauge: change queue depth.
    pub const QUEUE_DEPTH: &str = "postflow_queue_depth";
}

/// Label keys.
pub mod labels {
    /// Lock domain (assignment, publish, daemon).
    pub const DOMAIN: &str = "domain";
    /// Outcome.
    pub const RESULT: &str = "result";
    /// Distribution channel.
    pub const CHANNEL: &str = "channel";
    /// Orchestrator stage.
    pub const STAGE: &str = "stage";
    /// Ingestion source.
    pub const SOURCE: &str = "source";
    /// Queue name.
    pub const QUEUE: &str = "queue";
}

/// Records pipeline metrics with consistent labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a lease acquisition attempt.
    pub fn record_lease_acquisition(&self, domain: &str, result: &str) {
        counter!(
            names::LEASE_ACQUISITIONS_TOTAL,
            labels::DOMAIN => domain.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a publisher assignment outcome.
    pub fn record_assignment(&self, channel: &str, result: &str) {
        counter!(
            names::ASSIGNMENTS_TOTAL,
            labels::CHANNEL => channel.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records how long a stage took.
    pub fn observe_stage_duration(&self, stage: &str, duration: Duration) {
        histogram!(
            names::STAGE_DURATION_SECONDS,
            labels::STAGE => stage.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records a change-stream message outcome (acked, failed, malformed).
    pub fn record_message(&self, result: &str) {
        counter!(names::MESSAGES_TOTAL, labels::RESULT => result.to_string()).increment(1);
    }

    /// Records a publish outcome.
    pub fn record_publish(&self, channel: &str, result: &str) {
        counter!(
            names::PUBLISHES_TOTAL,
            labels::CHANNEL => channel.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Sets the number of stalled items found by the last sweep.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_stalled_items(&self, count: usize) {
        gauge!(names::STALLED_ITEMS).set(count as f64);
    }

    /// Records an ingestion outcome.
    pub fn record_ingest(&self, source: &str, result: &str) {
        counter!(
            names::INGESTIONS_TOTAL,
            labels::SOURCE => source.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Sets the observed change queue depth.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_queue_depth(&self, queue: &str, depth: u64) {
        gauge!(names::QUEUE_DEPTH, labels::QUEUE => queue.to_string()).set(depth as f64);
    }
}

/// RAII guard that reports elapsed time when dropped.
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
    /// Creates a guard that calls `on_drop` with the elapsed duration.
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

/// Times one orchestrator stage.
#[must_use]
pub fn time_stage(stage: &'static str) -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(move |duration| PipelineMetrics.observe_stage_duration(stage, duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn recording_without_exporter_is_noop() {
        let metrics = PipelineMetrics::new();
        metrics.record_lease_acquisition("assignment", "granted");
        metrics.record_assignment("youtube", "assigned");
        metrics.record_message("acked");
        metrics.record_publish("blog", "complete");
        metrics.set_stalled_items(2);
        metrics.record_ingest("rss", "accepted");
        metrics.set_queue_depth("ledger-changes", 12);
    }

    #[test]
    fn timing_guard_fires_on_drop() {
        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = fired.clone();
            let _guard = TimingGuard::new(move |_| fired.store(true, Ordering::SeqCst));
        }
        assert!(fired.load(Ordering::SeqCst));
        drop(time_stage("script"));
    }
}
