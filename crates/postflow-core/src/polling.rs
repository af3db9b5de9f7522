//! Bounded waiting for external completion.
//!
//! Render completion and channel upload confirmation are observed by polling a
//! collaborator. [`poll_until`] runs the check with exponential backoff until it
//! reports a value, returns an error, or the deadline passes. The check always
//! runs at least once and once more at the deadline itself.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Deadline and backoff bounds for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Total time budget, measured from the first poll.
    #[serde(with = "millis")]
    pub deadline: Duration,
    /// Delay after the first unsuccessful poll.
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    /// Upper bound on the delay between polls.
    #[serde(with = "millis")]
    pub max_backoff: Duration,
}

impl PollPolicy {
    /// Creates a policy with a 1s initial and 30s maximum backoff.
    #[must_use]
    pub const fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Overrides the backoff bounds.
    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }
}

/// Result of a bounded polling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T, E> {
    /// The check produced a value.
    Ready(T),
    /// The deadline passed without a value.
    TimedOut {
        /// Number of polls executed.
        attempts: u32,
    },
    /// The check failed.
    Failed(E),
}

impl<T, E> PollOutcome<T, E> {
    /// Returns true if the check produced a value.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// Polls `check` until it yields `Some`, fails, or `policy.deadline` elapses.
pub async fn poll_until<T, E, F, Fut>(policy: &PollPolicy, mut check: F) -> PollOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + policy.deadline;
    let mut backoff = policy.initial_backoff;
    let mut attempts: u32 = 0;

    loop {
        attempts = attempts.saturating_add(1);
        match check().await {
            Ok(Some(value)) => return PollOutcome::Ready(value),
            Err(err) => return PollOutcome::Failed(err),
            Ok(None) => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut { attempts };
        }

        tokio::time::sleep(backoff.min(deadline - now)).await;
        backoff = backoff.saturating_mul(2).min(policy.max_backoff);
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> PollPolicy {
        PollPolicy::new(Duration::from_secs(10))
            .with_backoff(Duration::from_secs(1), Duration::from_secs(4))
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_deadline_with_backoff() {
        let started = Instant::now();
        let outcome: PollOutcome<(), ()> = poll_until(&policy(), || async { Ok(None) }).await;

        // Polls at t = 0, 1, 3, 7, 10.
        assert_eq!(outcome, PollOutcome::TimedOut { attempts: 5 });
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome: PollOutcome<u32, ()> = poll_until(&policy(), || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok((n == 3).then_some(n))
            }
        })
        .await;

        assert_eq!(outcome, PollOutcome::Ready(3));
    }

    #[tokio::test(start_paused = true)]
    async fn error_short_circuits() {
        let outcome: PollOutcome<(), &str> = poll_until(&policy(), || async { Err("boom") }).await;
        assert_eq!(outcome, PollOutcome::Failed("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_deadline_polls_once() {
        let outcome: PollOutcome<(), ()> =
            poll_until(&PollPolicy::new(Duration::ZERO), || async { Ok(None) }).await;
        assert_eq!(outcome, PollOutcome::TimedOut { attempts: 1 });
    }

    #[test]
    fn policy_serializes_as_millis() {
        let json = serde_json::to_value(policy()).expect("serialize");
        assert_eq!(json["deadline"], 10_000);
        assert_eq!(json["max_backoff"], 4_000);
    }
}
