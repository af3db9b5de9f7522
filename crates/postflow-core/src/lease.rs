//! Lease-based mutual exclusion over versioned records.
//!
//! The [`LeaseManager`] is the single locking primitive in postflow. It guards
//! per-resource locks (publisher-profile assignment and publishing) and singleton
//! daemon ownership alike; the lock domain key selects the record.
//!
//! # Acquisition
//!
//! A lease is granted when the stored record:
//!
//! 1. does not exist or has no holder recorded,
//! 2. is held by the calling process (re-entrant renewal), or
//! 3. has expired (`now > expiry`).
//!
//! The write that grants the lease is a compare-and-swap against the version
//! observed at read time. If another process transferred the lease in between,
//! the write is rejected and the caller receives [`AcquireOutcome::Conflict`]. The
//! caller must then redo its whole selection step; it never assumes ownership.
//!
//! # Release
//!
//! Release is conditional on the caller still being the recorded holder. Once a
//! lease has lapsed and been taken over, a late release by the previous holder is
//! a no-op and leaves the new holder's lease intact.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, duration_millis};
use crate::error::Result;
use crate::versioned::{CasOutcome, VersionedRecordStore};

/// Persisted lease state for one lock domain key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    /// Current holder, `None` when released.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    /// Lease deadline in epoch milliseconds.
    pub expiry_time_epoch_milli: i64,
    /// When the current holder first acquired the lease.
    pub acquired_at_epoch_milli: i64,
}

impl LeaseRecord {
    /// A record with no holder.
    #[must_use]
    pub const fn free() -> Self {
        Self {
            process_id: None,
            expiry_time_epoch_milli: 0,
            acquired_at_epoch_milli: 0,
        }
    }

    /// Returns the live holder at `now`, treating an expired lease as free.
    #[must_use]
    pub fn holder_at(&self, now_millis: i64) -> Option<&str> {
        match &self.process_id {
            Some(holder) if now_millis <= self.expiry_time_epoch_milli => Some(holder),
            _ => None,
        }
    }

    /// Returns true if nobody holds a live lease at `now`.
    #[must_use]
    pub fn is_free_at(&self, now_millis: i64) -> bool {
        self.holder_at(now_millis).is_none()
    }
}

/// A granted lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseEntry {
    /// Lock domain key.
    pub system_id: String,
    /// Holder of the lease.
    pub process_id: String,
    /// Lease deadline in epoch milliseconds.
    pub expiry_time_epoch_milli: i64,
    /// Record version after the granting write; strictly increases per transfer.
    pub version: u64,
}

/// Result of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lease was granted to the caller.
    Granted(LeaseEntry),
    /// Another process holds a live lease.
    Held {
        /// Current holder.
        holder: String,
        /// When the holder's lease lapses.
        expiry_time_epoch_milli: i64,
    },
    /// A concurrent writer changed the record between read and write.
    Conflict,
}

impl AcquireOutcome {
    /// Returns true if the lease was granted.
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    /// Returns the granted lease, if any.
    #[must_use]
    pub const fn lease(&self) -> Option<&LeaseEntry> {
        match self {
            Self::Granted(entry) => Some(entry),
            Self::Held { .. } | Self::Conflict => None,
        }
    }
}

/// Grants and releases leases through compare-and-swap writes.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn VersionedRecordStore<LeaseRecord>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager").finish_non_exhaustive()
    }
}

impl LeaseManager {
    /// Creates a lease manager over the given record store.
    #[must_use]
    pub fn new(store: Arc<dyn VersionedRecordStore<LeaseRecord>>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Attempts to acquire (or renew) the lease for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the backing store fails. Losing a race is
    /// reported as [`AcquireOutcome::Conflict`].
    #[tracing::instrument(skip(self), fields(lock_key = %key, process_id = %process_id))]
    pub async fn try_acquire(
        &self,
        key: &str,
        process_id: &str,
        ttl: Duration,
    ) -> Result<AcquireOutcome> {
        let now = self.clock.now_millis();
        let current = self.store.load(key).await?;

        let (expected_version, acquired_at) = match &current {
            None => (None, now),
            Some(record) => match record.value.holder_at(now) {
                Some(holder) if holder != process_id => {
                    tracing::debug!(holder, "lease held by another process");
                    return Ok(AcquireOutcome::Held {
                        holder: holder.to_string(),
                        expiry_time_epoch_milli: record.value.expiry_time_epoch_milli,
                    });
                }
                Some(_) => (Some(record.version), record.value.acquired_at_epoch_milli),
                None => (Some(record.version), now),
            },
        };

        let expiry = now.saturating_add(duration_millis(ttl));
        let record = LeaseRecord {
            process_id: Some(process_id.to_string()),
            expiry_time_epoch_milli: expiry,
            acquired_at_epoch_milli: acquired_at,
        };

        match self
            .store
            .try_compare_and_swap(key, expected_version, record)
            .await?
        {
            CasOutcome::Applied { version } => {
                tracing::debug!(version, expiry, "lease granted");
                Ok(AcquireOutcome::Granted(LeaseEntry {
                    system_id: key.to_string(),
                    process_id: process_id.to_string(),
                    expiry_time_epoch_milli: expiry,
                    version,
                }))
            }
            CasOutcome::Conflict { current_version } => {
                tracing::debug!(?current_version, "lease transferred concurrently");
                Ok(AcquireOutcome::Conflict)
            }
        }
    }

    /// Releases the lease for `key` if `process_id` is still the recorded holder.
    ///
    /// Returns `true` if this call cleared the lease. A release by a process that
    /// no longer holds the lease is a no-op and returns `false`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    pub async fn release(&self, key: &str, process_id: &str) -> Result<bool> {
        self.release_matching(key, process_id, None).await
    }

    /// Releases the lease only if it is still the grant made at `version`.
    ///
    /// Process ids are shared by every task in a worker, so a release issued on
    /// behalf of one assignment must not clear a later grant to the same process.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    pub async fn release_at(&self, key: &str, process_id: &str, version: u64) -> Result<bool> {
        self.release_matching(key, process_id, Some(version)).await
    }

    #[tracing::instrument(skip(self), fields(lock_key = %key, process_id = %process_id))]
    async fn release_matching(
        &self,
        key: &str,
        process_id: &str,
        version: Option<u64>,
    ) -> Result<bool> {
        let Some(current) = self.store.load(key).await? else {
            return Ok(false);
        };

        if current.value.process_id.as_deref() != Some(process_id) {
            tracing::debug!(
                holder = ?current.value.process_id,
                "release skipped: lease owned by another process"
            );
            return Ok(false);
        }

        if version.is_some_and(|v| v != current.version) {
            tracing::debug!(
                stored_version = current.version,
                "release skipped: lease re-granted since"
            );
            return Ok(false);
        }

        let released = LeaseRecord {
            acquired_at_epoch_milli: current.value.acquired_at_epoch_milli,
            ..LeaseRecord::free()
        };

        let outcome = self
            .store
            .try_compare_and_swap(key, Some(current.version), released)
            .await?;
        Ok(outcome.is_applied())
    }

    /// Returns the live lease for `key`, treating an expired lease as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    pub async fn current(&self, key: &str) -> Result<Option<LeaseEntry>> {
        let now = self.clock.now_millis();
        let current = self.store.load(key).await?;

        Ok(current.and_then(|record| {
            record.value.holder_at(now).map(|holder| LeaseEntry {
                system_id: key.to_string(),
                process_id: holder.to_string(),
                expiry_time_epoch_milli: record.value.expiry_time_epoch_milli,
                version: record.version,
            })
        }))
    }

    /// Returns true if `process_id` holds a live lease on `key` at `version`.
    ///
    /// Used to re-validate ownership before committing side effects.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    pub async fn is_held_by(&self, key: &str, process_id: &str, version: u64) -> Result<bool> {
        Ok(self
            .current(key)
            .await?
            .is_some_and(|lease| lease.process_id == process_id && lease.version == version))
    }
}
