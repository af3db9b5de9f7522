//! Backlog-based load shedding with soft/hard thresholds.
//!
//! Ingestion consults the change-queue depth before writing a new ledger item.
//! An overflowing backlog rejects new work instead of queueing it without bound.
//!
//! | Stage  | Backlog range          | Behavior                              |
//! |--------|------------------------|---------------------------------------|
//! | Normal | `depth < soft`         | Accept                                |
//! | Soft   | `soft <= depth < hard` | Accept with warning                   |
//! | Hard   | `depth >= hard`        | Reject with `retry_after`             |

use std::time::Duration;

use serde::{Deserialize, Serialize};

const BASE_RETRY_SECS: u64 = 5;
const MAX_RETRY_SECS: u64 = 60;

/// Backlog snapshot for one queue, evaluated against thresholds.
///
/// # Example
///
/// ```rust
/// use postflow_core::backpressure::{BackpressureDecision, BacklogState};
///
/// let state = BacklogState::new("ledger-changes")
///     .with_depth(250)
///     .with_thresholds(100, 500);
///
/// assert_eq!(
///     state.evaluate(),
///     BackpressureDecision::AcceptWithWarning { backlog: 250 }
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogState {
    /// Queue identifier, used in logs.
    pub queue: String,
    /// Messages currently waiting or in flight.
    pub backlog_depth: u64,
    /// Depth at which new work is accepted with a warning.
    pub soft_threshold: u64,
    /// Depth at which new work is rejected.
    pub hard_threshold: u64,
}

impl BacklogState {
    /// Creates an empty backlog with default thresholds.
    #[must_use]
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            backlog_depth: 0,
            soft_threshold: 1_000,
            hard_threshold: 10_000,
        }
    }

    /// Sets the observed backlog depth.
    #[must_use]
    pub fn with_depth(mut self, depth: u64) -> Self {
        self.backlog_depth = depth;
        self
    }

    /// Sets the soft/hard thresholds.
    #[must_use]
    pub fn with_thresholds(mut self, soft: u64, hard: u64) -> Self {
        self.soft_threshold = soft;
        self.hard_threshold = hard;
        self
    }

    /// Evaluates the load-shedding decision for the current depth.
    #[must_use]
    pub fn evaluate(&self) -> BackpressureDecision {
        let depth = self.backlog_depth;

        if depth >= self.hard_threshold {
            BackpressureDecision::Reject {
                retry_after: retry_after_for(depth, self.hard_threshold),
            }
        } else if depth >= self.soft_threshold {
            BackpressureDecision::AcceptWithWarning { backlog: depth }
        } else {
            BackpressureDecision::Accept
        }
    }
}

// The further past the hard threshold, the longer the caller should wait.
fn retry_after_for(depth: u64, hard_threshold: u64) -> Duration {
    let overage = depth
        .saturating_sub(hard_threshold)
        .checked_div(hard_threshold)
        .unwrap_or(0);
    Duration::from_secs(BASE_RETRY_SECS.saturating_add(overage).min(MAX_RETRY_SECS))
}

/// Load-shedding decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackpressureDecision {
    /// Accept (normal operation).
    Accept,
    /// Accept, but the backlog is past the soft threshold.
    AcceptWithWarning {
        /// Current backlog depth.
        backlog: u64,
    },
    /// Reject; the caller should retry later.
    Reject {
        /// How long the caller should wait before retrying.
        retry_after: Duration,
    },
}

impl BackpressureDecision {
    /// Returns true if the request should be rejected.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Reject { .. })
    }

    /// Returns the retry-after duration if rejected.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Reject { retry_after } => Some(*retry_after),
            Self::Accept | Self::AcceptWithWarning { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_soft_accepts() {
        let state = BacklogState::new("q").with_depth(99).with_thresholds(100, 500);
        assert_eq!(state.evaluate(), BackpressureDecision::Accept);
    }

    #[test]
    fn soft_boundary_warns() {
        let state = BacklogState::new("q").with_depth(100).with_thresholds(100, 500);
        assert_eq!(
            state.evaluate(),
            BackpressureDecision::AcceptWithWarning { backlog: 100 }
        );
    }

    #[test]
    fn hard_boundary_rejects() {
        let decision = BacklogState::new("q")
            .with_depth(500)
            .with_thresholds(100, 500)
            .evaluate();
        assert!(decision.is_rejected());
        assert_eq!(decision.retry_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn retry_after_scales_and_caps() {
        let decision = BacklogState::new("q")
            .with_depth(1_500)
            .with_thresholds(100, 500)
            .evaluate();
        assert_eq!(decision.retry_after(), Some(Duration::from_secs(7)));

        let decision = BacklogState::new("q")
            .with_depth(u64::MAX)
            .with_thresholds(1, 2)
            .evaluate();
        assert_eq!(decision.retry_after(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn zero_hard_threshold_rejects_everything() {
        let decision = BacklogState::new("q").with_thresholds(0, 0).evaluate();
        assert_eq!(decision.retry_after(), Some(Duration::from_secs(5)));
    }
}
