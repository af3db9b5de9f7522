//! Pipeline configuration.
//!
//! All durations are stored as integer seconds or milliseconds so the same
//! structure deserializes from JSON files and maps directly onto CLI flags.

use std::time::Duration;

use postflow_core::PollPolicy;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration for a worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Change-stream consumer settings.
    pub consumer: ConsumerConfig,
    /// Publisher lock TTLs.
    pub locks: LockConfig,
    /// Orchestrator stage settings.
    pub stages: StageConfig,
    /// Heartbeat reaper settings.
    pub reaper: ReaperConfig,
    /// Ingestion load-shedding thresholds.
    pub ingest: IngestConfig,
}

impl PipelineConfig {
    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let consumer = &self.consumer;
        if consumer.max_concurrent_consumers == 0 {
            return Err(Error::configuration("max_concurrent_consumers must be at least 1"));
        }
        if consumer.max_messages_per_poll == 0 {
            return Err(Error::configuration("max_messages_per_poll must be at least 1"));
        }
        if self.locks.assignment_lock_ttl_secs == 0 || self.locks.publish_lock_ttl_secs == 0 {
            return Err(Error::configuration("lock TTLs must be non-zero"));
        }

        // Renders of one item are awaited together, then its uploads; one
        // advance therefore blocks for at most one render wait plus one
        // confirmation wait.
        let longest_wait = self
            .stages
            .render_wait_secs
            .saturating_add(self.stages.publish_confirm_wait_secs);
        if consumer.visibility_timeout_secs < longest_wait {
            return Err(Error::configuration(format!(
                "visibility_timeout_secs ({}) is shorter than render + publish waits ({longest_wait}); \
                 messages would be redelivered mid-processing",
                consumer.visibility_timeout_secs
            )));
        }

        if self.stages.max_assignment_attempts == 0 || self.stages.cas_retry_budget == 0 {
            return Err(Error::configuration(
                "max_assignment_attempts and cas_retry_budget must be at least 1",
            ));
        }
        if self.stages.resolver_page_size == 0 {
            return Err(Error::configuration("resolver_page_size must be at least 1"));
        }

        let reaper = &self.reaper;
        if reaper.bucket_width_secs == 0 || reaper.page_size == 0 || reaper.stall_threshold == 0 {
            return Err(Error::configuration(
                "reaper bucket width, page size and stall threshold must be non-zero",
            ));
        }
        if reaper.sweep_interval_secs >= reaper.bucket_width_secs {
            return Err(Error::configuration(format!(
                "reaper sweep_interval_secs ({}) must be below bucket_width_secs ({})",
                reaper.sweep_interval_secs, reaper.bucket_width_secs
            )));
        }
        if reaper.entry_ttl_secs <= reaper.bucket_width_secs {
            return Err(Error::configuration(
                "reaper entry_ttl_secs must exceed bucket_width_secs",
            ));
        }
        if reaper.lease_ttl_secs <= reaper.sweep_interval_secs {
            return Err(Error::configuration(
                "reaper lease_ttl_secs must exceed sweep_interval_secs",
            ));
        }

        if self.ingest.soft_backlog >= self.ingest.hard_backlog {
            return Err(Error::configuration(format!(
                "soft_backlog ({}) must be below hard_backlog ({})",
                self.ingest.soft_backlog, self.ingest.hard_backlog
            )));
        }
        Ok(())
    }
}

/// Change-stream consumer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Seconds a received message stays invisible to other consumers.
    pub visibility_timeout_secs: u64,
    /// Delay between polls in milliseconds.
    pub poll_period_ms: u64,
    /// Messages requested per poll.
    pub max_messages_per_poll: usize,
    /// Messages processed concurrently.
    pub max_concurrent_consumers: usize,
    /// Topic name written into notification envelopes.
    pub topic: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 1_800,
            poll_period_ms: 1_000,
            max_messages_per_poll: 10,
            max_concurrent_consumers: 4,
            topic: "ledger-changes".to_string(),
        }
    }
}

impl ConsumerConfig {
    /// Visibility timeout as a duration.
    #[must_use]
    pub const fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Poll period as a duration.
    #[must_use]
    pub const fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }
}

/// Publisher lock TTLs. The two locks are configured independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Assignment lock TTL in seconds; also the publish event deadline.
    pub assignment_lock_ttl_secs: u64,
    /// Publish lock TTL in seconds.
    pub publish_lock_ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            assignment_lock_ttl_secs: 3_600,
            publish_lock_ttl_secs: 900,
        }
    }
}

impl LockConfig {
    /// Assignment lock TTL as a duration.
    #[must_use]
    pub const fn assignment_ttl(&self) -> Duration {
        Duration::from_secs(self.assignment_lock_ttl_secs)
    }

    /// Publish lock TTL as a duration.
    #[must_use]
    pub const fn publish_ttl(&self) -> Duration {
        Duration::from_secs(self.publish_lock_ttl_secs)
    }
}

/// Orchestrator stage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Bounded wait for render completion, in seconds.
    pub render_wait_secs: u64,
    /// Bounded wait for channel upload confirmation, in seconds.
    pub publish_confirm_wait_secs: u64,
    /// First polling backoff in milliseconds.
    pub poll_initial_backoff_ms: u64,
    /// Polling backoff ceiling in milliseconds.
    pub poll_max_backoff_ms: u64,
    /// Expired assignments after which a (root, channel) pair is abandoned.
    pub max_assignment_attempts: u32,
    /// Ledger version conflicts tolerated per mutation.
    pub cas_retry_budget: u32,
    /// Profiles requested per resolver page.
    pub resolver_page_size: usize,
    /// Scan restarts after a lost lock race before reporting contention.
    pub resolver_race_retries: u32,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            render_wait_secs: 1_200,
            publish_confirm_wait_secs: 300,
            poll_initial_backoff_ms: 1_000,
            poll_max_backoff_ms: 30_000,
            max_assignment_attempts: 3,
            cas_retry_budget: 5,
            resolver_page_size: 25,
            resolver_race_retries: 5,
        }
    }
}

impl StageConfig {
    /// Polling policy for render completion.
    #[must_use]
    pub const fn render_poll(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_secs(self.render_wait_secs)).with_backoff(
            Duration::from_millis(self.poll_initial_backoff_ms),
            Duration::from_millis(self.poll_max_backoff_ms),
        )
    }

    /// Polling policy for publish confirmation.
    #[must_use]
    pub const fn publish_confirm_poll(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_secs(self.publish_confirm_wait_secs)).with_backoff(
            Duration::from_millis(self.poll_initial_backoff_ms),
            Duration::from_millis(self.poll_max_backoff_ms),
        )
    }
}

/// Heartbeat reaper configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Lock domain name of the reaper daemon.
    pub daemon_name: String,
    /// Seconds between sweeps.
    pub sweep_interval_secs: u64,
    /// Heartbeat bucket width in seconds.
    pub bucket_width_secs: u64,
    /// Lifetime of a heartbeat entry in seconds.
    pub entry_ttl_secs: u64,
    /// Consecutive cycles without progress before an item is reported stalled.
    pub stall_threshold: u32,
    /// Entries read per page.
    pub page_size: usize,
    /// Daemon lease TTL in seconds.
    pub lease_ttl_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            daemon_name: "heartbeat-reaper".to_string(),
            sweep_interval_secs: 60,
            bucket_width_secs: 300,
            entry_ttl_secs: 1_800,
            stall_threshold: 3,
            page_size: 100,
            lease_ttl_secs: 120,
        }
    }
}

impl ReaperConfig {
    /// Bucket width as a duration.
    #[must_use]
    pub const fn bucket_width(&self) -> Duration {
        Duration::from_secs(self.bucket_width_secs)
    }

    /// Entry TTL as a duration.
    #[must_use]
    pub const fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }

    /// Sweep interval as a duration.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Daemon lease TTL as a duration.
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

/// Ingestion backlog thresholds, measured in change-queue messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Backlog at which ingestion logs a warning.
    pub soft_backlog: u64,
    /// Backlog at which ingestion rejects new triggers.
    pub hard_backlog: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            soft_backlog: 1_000,
            hard_backlog: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PipelineConfig::default().validate().expect("defaults validate");
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut config = PipelineConfig::default();
        config.consumer.max_concurrent_consumers = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration { .. })));
    }

    #[test]
    fn rejects_visibility_shorter_than_waits() {
        let mut config = PipelineConfig::default();
        config.consumer.visibility_timeout_secs = 60;
        let err = config.validate().expect_err("must fail");
        assert!(err.to_string().contains("visibility_timeout_secs"));
    }

    #[test]
    fn rejects_sweeps_slower_than_buckets() {
        let mut config = PipelineConfig::default();
        config.reaper.sweep_interval_secs = config.reaper.bucket_width_secs;
        config.reaper.lease_ttl_secs = config.reaper.sweep_interval_secs * 2;
        let err = config.validate().expect_err("sweep interval too long");
        assert!(err.to_string().contains("sweep_interval_secs"));
    }

    #[test]
    fn rejects_inverted_backlog_thresholds() {
        let mut config = PipelineConfig::default();
        config.ingest.soft_backlog = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"locks": {"publish_lock_ttl_secs": 60}}"#).expect("parse");
        assert_eq!(config.locks.publish_lock_ttl_secs, 60);
        assert_eq!(config.locks.assignment_lock_ttl_secs, 3_600);
        assert_eq!(config.consumer, ConsumerConfig::default());
    }

    #[test]
    fn poll_policies_follow_stage_settings() {
        let stages = StageConfig::default();
        assert_eq!(stages.render_poll().deadline, Duration::from_secs(1_200));
        assert_eq!(stages.publish_confirm_poll().max_backoff, Duration::from_secs(30));
    }
}
