//! Heartbeat reaper daemon.
//!
//! One process at a time sweeps, chosen through a [`DaemonLease`]. A sweep
//! reads every bucket from one entry TTL ago up to the current one, page by
//! page, so buckets missed while no reaper ran are caught up. For each entry:
//!
//! - drops it if the ledger item is gone or `FINISHED`
//! - otherwise compares progress, schedules the next entry one bucket ahead
//!   and re-enqueues a heartbeat notification for the item
//!
//! Items whose progress counter has not moved for `stall_threshold`
//! consecutive sweeps are reported as stalled. Remediation is left to the
//! orchestrator's own expiry paths, which the nudge re-triggers.

use std::sync::Arc;

use postflow_core::Clock;
use postflow_core::clock::duration_millis;
use postflow_core::keys::time_bucket;
use postflow_core::observability::daemon_span;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{HeartbeatEntry, HeartbeatStore};
use crate::config::ReaperConfig;
use crate::error::Result;
use crate::leader::{DaemonLease, LeadershipResult};
use crate::ledger::LedgerStore;
use crate::metrics::PipelineMetrics;
use crate::stream::{ChangeFeed, ChangeKind};

/// Tally of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Latest bucket swept, the one containing the sweep time.
    pub bucket: i64,
    /// Entries read.
    pub scanned: usize,
    /// Entries moved to the next bucket.
    pub rearmed: usize,
    /// Entries dropped because the item finished.
    pub finished: usize,
    /// Entries dropped because the item no longer exists.
    pub missing: usize,
    /// Items without progress for the stall threshold.
    pub stalled: Vec<String>,
    /// Heartbeat notifications enqueued.
    pub nudged: usize,
}

/// Result of one sweep attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// This process owned the daemon and swept.
    Swept(SweepReport),
    /// Another process owns the daemon.
    NotLeader {
        /// Current owner, if known.
        current_leader: Option<String>,
    },
}

/// Sweeps heartbeat buckets under a daemon lease.
#[derive(Clone)]
pub struct HeartbeatReaper {
    lease: DaemonLease,
    heartbeats: Arc<dyn HeartbeatStore>,
    ledger: Arc<dyn LedgerStore>,
    feed: ChangeFeed,
    clock: Arc<dyn Clock>,
    config: ReaperConfig,
    metrics: PipelineMetrics,
}

impl std::fmt::Debug for HeartbeatReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatReaper")
            .field("lease", &self.lease)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HeartbeatReaper {
    /// Creates a reaper.
    #[must_use]
    pub fn new(
        lease: DaemonLease,
        heartbeats: Arc<dyn HeartbeatStore>,
        ledger: Arc<dyn LedgerStore>,
        feed: ChangeFeed,
        clock: Arc<dyn Clock>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            lease,
            heartbeats,
            ledger,
            feed,
            clock,
            config,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Runs one sweep if this process owns the daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease, heartbeat or ledger store fails.
    /// Nudge failures are logged and do not abort the sweep.
    pub async fn sweep_once(&self) -> Result<SweepOutcome> {
        match self.lease.acquire().await? {
            LeadershipResult::Acquired { .. } => {}
            LeadershipResult::NotLeader { current_leader } => {
                tracing::debug!(?current_leader, "reaper owned elsewhere; skipping sweep");
                return Ok(SweepOutcome::NotLeader { current_leader });
            }
        }

        let now = self.clock.now_millis();
        let width = self.config.bucket_width();
        let current = time_bucket(now, width);
        let mut report = SweepReport {
            bucket: current,
            ..SweepReport::default()
        };

        // Entries expire one TTL after they were written; older buckets are empty.
        let oldest = now.saturating_sub(duration_millis(self.config.entry_ttl()));
        let mut bucket = time_bucket(oldest, width);
        while bucket <= current {
            self.sweep_bucket(bucket, now, &mut report).await?;
            bucket = bucket.saturating_add(duration_millis(width).max(1));
        }

        self.metrics.set_stalled_items(report.stalled.len());
        tracing::info!(
            bucket = current,
            scanned = report.scanned,
            rearmed = report.rearmed,
            stalled = report.stalled.len(),
            "heartbeat sweep finished"
        );
        Ok(SweepOutcome::Swept(report))
    }

    async fn sweep_bucket(&self, bucket: i64, now: i64, report: &mut SweepReport) -> Result<()> {
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .heartbeats
                .list_bucket(bucket, cursor.as_deref(), self.config.page_size)
                .await?;
            for entry in page.items {
                report.scanned += 1;
                self.process_entry(entry, now, report).await?;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }
    }

    async fn process_entry(
        &self,
        entry: HeartbeatEntry,
        now: i64,
        report: &mut SweepReport,
    ) -> Result<()> {
        let Some(item) = self.ledger.get(&entry.ledger_id).await? else {
            tracing::warn!(ledger_id = %entry.ledger_id, "heartbeat for unknown ledger item");
            report.missing += 1;
            return self.heartbeats.delete(entry.bucket, &entry.ledger_id).await;
        };

        if item.is_finished() {
            report.finished += 1;
            return self.heartbeats.delete(entry.bucket, &entry.ledger_id).await;
        }

        let progress = item.progress_counter();
        let stalled_cycles = if progress > entry.progress_counter {
            0
        } else {
            entry.stalled_cycles.saturating_add(1)
        };
        if stalled_cycles >= self.config.stall_threshold {
            tracing::warn!(
                ledger_id = %entry.ledger_id,
                progress_counter = progress,
                stalled_cycles,
                "ledger item stalled"
            );
            report.stalled.push(entry.ledger_id.clone());
        }

        self.heartbeats
            .put(HeartbeatEntry::next(
                entry.ledger_id.clone(),
                progress,
                stalled_cycles,
                now,
                self.config.bucket_width(),
                self.config.entry_ttl(),
            ))
            .await?;
        self.heartbeats.delete(entry.bucket, &entry.ledger_id).await?;
        report.rearmed += 1;

        match self.feed.emit(&entry.ledger_id, ChangeKind::Heartbeat).await {
            Ok(_) => report.nudged += 1,
            Err(err) => {
                tracing::warn!(ledger_id = %entry.ledger_id, error = %err, "heartbeat nudge failed");
            }
        }
        Ok(())
    }

    /// Sweeps every `sweep_interval` until `cancel` fires, then releases the
    /// daemon lease.
    ///
    /// # Errors
    ///
    /// Returns an error only if the final release fails; sweep errors are
    /// logged and retried next interval.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let span = daemon_span(self.lease.name(), self.lease.process_id());
        let sweeps = async {
            loop {
                if let Err(err) = self.sweep_once().await {
                    tracing::warn!(error = %err, "heartbeat sweep failed");
                }
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.sweep_interval()) => {}
                }
            }
        };
        sweeps.instrument(span.clone()).await;

        self.lease.release().instrument(span).await?;
        tracing::info!(daemon = %self.lease.name(), "heartbeat reaper stopped");
        Ok(())
    }
}
