//! Singleton daemon ownership.
//!
//! A [`DaemonLease`] is an ordinary lease under the `daemon/{name}` lock
//! domain. Renewal is re-entrant acquisition by the same process; a crashed
//! owner is replaced once its lease lapses.
//!
//! ## Fencing
//!
//! Every transfer of ownership bumps the record version. The version returned
//! in [`LeadershipResult::Acquired`] identifies this tenure: a process that was
//! paused past its TTL sees a different version on its next renewal.

use std::time::Duration;

use postflow_core::keys::daemon_lock_key;
use postflow_core::{AcquireOutcome, LeaseManager};

use crate::error::Result;
use crate::metrics::PipelineMetrics;

/// Result of a leadership acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipResult {
    /// This process owns the daemon.
    Acquired {
        /// Lease record version of this tenure.
        fencing_version: u64,
        /// Time until the lease lapses without renewal.
        lease_duration: Duration,
    },
    /// Another process owns the daemon.
    NotLeader {
        /// Current owner, if known.
        current_leader: Option<String>,
    },
}

impl LeadershipResult {
    /// Returns true if leadership was acquired.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }
}

/// Lease on a named singleton daemon.
#[derive(Debug, Clone)]
pub struct DaemonLease {
    leases: LeaseManager,
    name: String,
    process_id: String,
    ttl: Duration,
    metrics: PipelineMetrics,
}

impl DaemonLease {
    /// Creates a lease handle for `name` held on behalf of `process_id`.
    #[must_use]
    pub fn new(
        leases: LeaseManager,
        name: impl Into<String>,
        process_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            leases,
            name: name.into(),
            process_id: process_id.into(),
            ttl,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Daemon name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning process id.
    #[must_use]
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Acquires or renews ownership.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease store fails.
    pub async fn acquire(&self) -> Result<LeadershipResult> {
        let key = daemon_lock_key(&self.name);
        let result = match self.leases.try_acquire(&key, &self.process_id, self.ttl).await? {
            AcquireOutcome::Granted(lease) => LeadershipResult::Acquired {
                fencing_version: lease.version,
                lease_duration: self.ttl,
            },
            AcquireOutcome::Held { holder, .. } => LeadershipResult::NotLeader {
                current_leader: Some(holder),
            },
            AcquireOutcome::Conflict => LeadershipResult::NotLeader {
                current_leader: None,
            },
        };
        self.metrics.record_lease_acquisition(
            "daemon",
            if result.is_leader() { "granted" } else { "held" },
        );
        Ok(result)
    }

    /// Gives up ownership if this process still holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease store fails.
    pub async fn release(&self) -> Result<bool> {
        let released = self
            .leases
            .release(&daemon_lock_key(&self.name), &self.process_id)
            .await?;
        if released {
            tracing::info!(daemon = %self.name, process_id = %self.process_id, "daemon lease released");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use postflow_core::{LeaseRecord, ManualClock, MemoryVersionedStore};

    fn leases() -> (LeaseManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryVersionedStore::<LeaseRecord>::new());
        (LeaseManager::new(store, clock.clone()), clock)
    }

    #[tokio::test]
    async fn one_owner_at_a_time() -> Result<()> {
        let (leases, clock) = leases();
        let a = DaemonLease::new(leases.clone(), "reaper", "a", Duration::from_secs(60));
        let b = DaemonLease::new(leases, "reaper", "b", Duration::from_secs(60));

        assert!(a.acquire().await?.is_leader());
        assert_eq!(
            b.acquire().await?,
            LeadershipResult::NotLeader {
                current_leader: Some("a".into())
            }
        );

        clock.advance(Duration::from_secs(61));
        let LeadershipResult::Acquired { fencing_version, .. } = b.acquire().await? else {
            panic!("b should take over after expiry");
        };
        assert_eq!(fencing_version, 2);
        Ok(())
    }

    #[tokio::test]
    async fn release_hands_over_immediately() -> Result<()> {
        let (leases, _) = leases();
        let a = DaemonLease::new(leases.clone(), "reaper", "a", Duration::from_secs(60));
        let b = DaemonLease::new(leases, "reaper", "b", Duration::from_secs(60));

        a.acquire().await?;
        assert!(a.release().await?);
        assert!(!b.release().await?);
        assert!(b.acquire().await?.is_leader());
        Ok(())
    }
}
