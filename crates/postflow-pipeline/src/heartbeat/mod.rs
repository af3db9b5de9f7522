//! Heartbeat entries and the reaper that sweeps them.
//!
//! Every live ledger item has one entry scheduled in a future time bucket.
//! When wall time reaches that bucket the reaper reads the entry, compares the
//! item's progress counter with the recorded one, and schedules a fresh entry
//! one bucket further ahead. Entries carry their own expiry so a dead item's
//! trail disappears without explicit cleanup.

pub mod memory;
pub mod reaper;

use std::time::Duration;

use async_trait::async_trait;
use postflow_core::Page;
use postflow_core::clock::duration_millis;
use postflow_core::keys::next_bucket;
use serde::{Deserialize, Serialize};

pub use memory::MemoryHeartbeatStore;
pub use reaper::{HeartbeatReaper, SweepOutcome, SweepReport};

use crate::error::Result;

/// A forward-scheduled liveness record for one ledger item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatEntry {
    /// Bucket start in epoch milliseconds.
    pub bucket: i64,
    /// Tracked ledger item.
    pub ledger_id: String,
    /// Progress counter observed when the entry was written.
    pub progress_counter: u64,
    /// Consecutive sweeps without progress.
    pub stalled_cycles: u32,
    /// Entry expiry in epoch milliseconds.
    pub expires_at: i64,
}

impl HeartbeatEntry {
    /// Builds the entry for the bucket after the one containing `now`.
    #[must_use]
    pub fn next(
        ledger_id: impl Into<String>,
        progress_counter: u64,
        stalled_cycles: u32,
        now_millis: i64,
        bucket_width: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            bucket: next_bucket(now_millis, bucket_width),
            ledger_id: ledger_id.into(),
            progress_counter,
            stalled_cycles,
            expires_at: now_millis.saturating_add(duration_millis(ttl)),
        }
    }
}

/// Storage for heartbeat entries, partitioned by bucket.
#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    /// Writes an entry, replacing any entry for the same bucket and item.
    async fn put(&self, entry: HeartbeatEntry) -> Result<()>;

    /// Lists live entries of one bucket ordered by ledger id.
    ///
    /// `cursor` is the `next_cursor` of the previous page.
    async fn list_bucket(
        &self,
        bucket: i64,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<HeartbeatEntry>>;

    /// Removes an entry.
    async fn delete(&self, bucket: i64, ledger_id: &str) -> Result<()>;
}
