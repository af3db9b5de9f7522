//! Publisher assignment resolver.
//!
//! Picks the least-recently-published eligible profile on a channel and leases
//! its assignment lock. There is no ordering lock shared between resolvers:
//! two workers may read the same candidate, and the per-profile CAS decides
//! which of them gets it. The loser restarts its scan from the first page,
//! since the index it read may be stale in more than one place.

use std::sync::Arc;
use std::time::Duration;

use postflow_core::{AcquireOutcome, Clock, LeaseEntry, LeaseManager};

use crate::error::{Error, Result};
use crate::ledger::DistributionChannel;
use crate::metrics::PipelineMetrics;
use crate::publisher::{AccountPublisher, LockKind, ProfileQuery, PublisherStore};

/// A leased publisher profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherLease {
    /// Profile as read when it was selected.
    pub publisher: AccountPublisher,
    /// The granted assignment lock.
    pub lease: LeaseEntry,
    /// Lock domain key of the assignment lock.
    pub lock_key: String,
}

/// Result of an assignment attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOutcome {
    /// A profile was leased.
    Assigned(PublisherLease),
    /// No eligible, unlocked profile matches the criteria.
    Unassignable,
}

impl AssignOutcome {
    /// Returns the lease, if assigned.
    #[must_use]
    pub const fn lease(&self) -> Option<&PublisherLease> {
        match self {
            Self::Assigned(lease) => Some(lease),
            Self::Unassignable => None,
        }
    }
}

/// Selects and leases publisher profiles.
#[derive(Clone)]
pub struct PublisherResolver {
    publishers: Arc<dyn PublisherStore>,
    locks: LeaseManager,
    clock: Arc<dyn Clock>,
    page_size: usize,
    max_race_retries: u32,
    metrics: PipelineMetrics,
}

impl std::fmt::Debug for PublisherResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherResolver")
            .field("page_size", &self.page_size)
            .field("max_race_retries", &self.max_race_retries)
            .finish_non_exhaustive()
    }
}

impl PublisherResolver {
    /// Creates a resolver.
    ///
    /// `locks` must lease records in the same store that `publishers` reads,
    /// so a granted lock is visible to the next scan's eligibility filter.
    #[must_use]
    pub fn new(
        publishers: Arc<dyn PublisherStore>,
        locks: LeaseManager,
        clock: Arc<dyn Clock>,
        page_size: usize,
        max_race_retries: u32,
    ) -> Self {
        Self {
            publishers,
            locks,
            clock,
            page_size: page_size.max(1),
            max_race_retries,
            metrics: PipelineMetrics::new(),
        }
    }

    /// The lease manager guarding publisher locks.
    #[must_use]
    pub const fn locks(&self) -> &LeaseManager {
        &self.locks
    }

    /// Leases the assignment lock of the eligible profile with the oldest
    /// `last_publish_at_epoch_milli`.
    ///
    /// # Errors
    ///
    /// Propagates store failures. Returns [`Error::Contention`] if every scan
    /// within the retry budget lost its lock race.
    #[tracing::instrument(skip(self), fields(channel = %channel))]
    pub async fn assign(
        &self,
        process_id: &str,
        channel: DistributionChannel,
        language: &str,
        niche: &str,
        ttl: Duration,
    ) -> Result<AssignOutcome> {
        let query = ProfileQuery {
            channel,
            language: language.to_string(),
            niche: niche.to_string(),
        };

        for attempt in 0..=self.max_race_retries {
            match self.scan_and_acquire(&query, process_id, ttl).await? {
                ScanResult::Leased(lease) => {
                    self.metrics.record_assignment(channel.as_str(), "assigned");
                    tracing::info!(
                        publisher = %lease.publisher.key(),
                        version = lease.lease.version,
                        "publisher assigned"
                    );
                    return Ok(AssignOutcome::Assigned(lease));
                }
                ScanResult::Exhausted => {
                    self.metrics.record_assignment(channel.as_str(), "unassignable");
                    tracing::info!("no eligible publisher profile");
                    return Ok(AssignOutcome::Unassignable);
                }
                ScanResult::LostRace => {
                    tracing::debug!(attempt, "lost publisher lock race; rescanning");
                }
            }
        }

        self.metrics.record_assignment(channel.as_str(), "contention");
        Err(Error::Contention {
            resource: format!("publisher assignment on {channel}"),
            attempts: self.max_race_retries.saturating_add(1),
        })
    }

    async fn scan_and_acquire(
        &self,
        query: &ProfileQuery,
        process_id: &str,
        ttl: Duration,
    ) -> Result<ScanResult> {
        let now = self.clock.now_millis();
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .publishers
                .query_eligible(query, now, cursor.as_deref(), self.page_size)
                .await?;

            if let Some(candidate) = page.items.into_iter().next() {
                let lock_key = candidate.lock_key(LockKind::Assignment).to_string();
                let outcome = self.locks.try_acquire(&lock_key, process_id, ttl).await?;
                return Ok(match outcome {
                    AcquireOutcome::Granted(lease) => {
                        self.metrics.record_lease_acquisition("assignment", "granted");
                        ScanResult::Leased(PublisherLease {
                            publisher: candidate,
                            lease,
                            lock_key,
                        })
                    }
                    AcquireOutcome::Held { .. } => {
                        self.metrics.record_lease_acquisition("assignment", "held");
                        ScanResult::LostRace
                    }
                    AcquireOutcome::Conflict => {
                        self.metrics.record_lease_acquisition("assignment", "conflict");
                        ScanResult::LostRace
                    }
                });
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(ScanResult::Exhausted),
            }
        }
    }
}

enum ScanResult {
    Leased(PublisherLease),
    LostRace,
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use postflow_core::ManualClock;

    use crate::publisher::{LockField, MemoryPublisherStore, PublisherKey, SubscriptionStatus};

    const TTL: Duration = Duration::from_secs(60);

    fn profile(id: &str, last_publish: i64) -> AccountPublisher {
        AccountPublisher {
            account_id: "acct".into(),
            publisher_profile_id: id.into(),
            channel: DistributionChannel::Tiktok,
            last_publish_at_epoch_milli: last_publish,
            subscription_status: SubscriptionStatus::Active,
            language: "en".into(),
            niche: "tech".into(),
            is_stale_profile: false,
            assignment_lock: LockField::default(),
            publish_lock: LockField::default(),
        }
    }

    fn resolver(profiles: Vec<AccountPublisher>, page_size: usize) -> (PublisherResolver, Arc<MemoryPublisherStore>) {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = Arc::new(MemoryPublisherStore::with_profiles(profiles));
        let locks = LeaseManager::new(store.clone(), clock.clone());
        (PublisherResolver::new(store.clone(), locks, clock, page_size, 3), store)
    }

    #[tokio::test]
    async fn picks_oldest_published_profile() -> Result<()> {
        let (resolver, _) = resolver(vec![profile("b", 500), profile("a", 100), profile("c", 900)], 10);

        let outcome = resolver
            .assign("p1", DistributionChannel::Tiktok, "en", "tech", TTL)
            .await?;
        let lease = outcome.lease().expect("assigned");
        assert_eq!(lease.publisher.publisher_profile_id, "a");
        assert_eq!(lease.lease.version, 1);
        Ok(())
    }

    #[tokio::test]
    async fn successive_assignments_rotate_through_profiles() -> Result<()> {
        let (resolver, _) = resolver(vec![profile("a", 100), profile("b", 200)], 1);

        let first = resolver.assign("p1", DistributionChannel::Tiktok, "en", "tech", TTL).await?;
        let second = resolver.assign("p2", DistributionChannel::Tiktok, "en", "tech", TTL).await?;
        let third = resolver.assign("p3", DistributionChannel::Tiktok, "en", "tech", TTL).await?;

        assert_eq!(first.lease().expect("first").publisher.publisher_profile_id, "a");
        assert_eq!(second.lease().expect("second").publisher.publisher_profile_id, "b");
        assert_eq!(third, AssignOutcome::Unassignable);
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_criteria_are_unassignable() -> Result<()> {
        let (resolver, _) = resolver(vec![profile("a", 100)], 10);

        let outcome = resolver
            .assign("p1", DistributionChannel::Tiktok, "de", "tech", TTL)
            .await?;
        assert_eq!(outcome, AssignOutcome::Unassignable);

        let outcome = resolver
            .assign("p1", DistributionChannel::Youtube, "en", "tech", TTL)
            .await?;
        assert_eq!(outcome, AssignOutcome::Unassignable);
        Ok(())
    }

    #[tokio::test]
    async fn granted_lock_is_written_to_profile() -> Result<()> {
        let (resolver, store) = resolver(vec![profile("a", 100)], 10);
        resolver.assign("p1", DistributionChannel::Tiktok, "en", "tech", TTL).await?;

        let stored = store.get(&PublisherKey::new("acct", "a")).await?.expect("profile");
        assert_eq!(stored.assignment_lock.process_id.as_deref(), Some("p1"));
        assert_eq!(stored.assignment_lock.expires_at_epoch_milli, 70_000);
        assert_eq!(stored.publish_lock, LockField::default());
        Ok(())
    }
}
