//! Publisher profiles and the fairness-ordered index over them.
//!
//! Each [`AccountPublisher`] carries two independent lock fields, one guarding
//! assignment and one guarding the act of publishing. The fields are exposed to
//! the [`LeaseManager`](postflow_core::LeaseManager) as versioned records under
//! [`PublisherLockKey`]s, so per-profile locks use the same CAS discipline as
//! every other lease.

pub mod memory;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use postflow_core::{LeaseRecord, Page};
use serde::{Deserialize, Serialize};

pub use memory::MemoryPublisherStore;

use crate::error::Result;
use crate::ledger::DistributionChannel;

/// Subscription state of a publisher account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    /// Paid up.
    Active,
    /// Lapsed; never assigned.
    Expired,
}

/// A lease embedded in a publisher profile.
///
/// `version` is zero until the first acquisition and increases on every write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockField {
    /// Holder, `None` when free.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    /// Lease deadline in epoch milliseconds.
    #[serde(default)]
    pub expires_at_epoch_milli: i64,
    /// When the holder acquired the lease.
    #[serde(default)]
    pub acquired_at_epoch_milli: i64,
    /// Write counter.
    #[serde(default)]
    pub version: u64,
}

impl LockField {
    /// Returns true if nobody holds a live lease at `now` (expired counts as free).
    #[must_use]
    pub fn is_free_at(&self, now_millis: i64) -> bool {
        self.to_record().is_free_at(now_millis)
    }

    /// Returns the lease view of this field.
    #[must_use]
    pub fn to_record(&self) -> LeaseRecord {
        LeaseRecord {
            process_id: self.process_id.clone(),
            expiry_time_epoch_milli: self.expires_at_epoch_milli,
            acquired_at_epoch_milli: self.acquired_at_epoch_milli,
        }
    }

    /// Builds a field from a lease record written at `version`.
    #[must_use]
    pub fn from_record(record: LeaseRecord, version: u64) -> Self {
        Self {
            process_id: record.process_id,
            expires_at_epoch_milli: record.expiry_time_epoch_milli,
            acquired_at_epoch_milli: record.acquired_at_epoch_milli,
            version,
        }
    }
}

/// Identity of a publisher profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublisherKey {
    /// Account id.
    pub account_id: String,
    /// Profile id within the account.
    pub publisher_profile_id: String,
}

impl PublisherKey {
    /// Creates a key.
    #[must_use]
    pub fn new(account_id: impl Into<String>, publisher_profile_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            publisher_profile_id: publisher_profile_id.into(),
        }
    }
}

impl fmt::Display for PublisherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account_id, self.publisher_profile_id)
    }
}

/// A publisher profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountPublisher {
    /// Account id.
    pub account_id: String,
    /// Profile id within the account.
    pub publisher_profile_id: String,
    /// Channel this profile publishes to.
    pub channel: DistributionChannel,
    /// Fairness cursor: last successful publish in epoch milliseconds.
    #[serde(default)]
    pub last_publish_at_epoch_milli: i64,
    /// Subscription state.
    pub subscription_status: SubscriptionStatus,
    /// Content language.
    pub language: String,
    /// Content niche.
    pub niche: String,
    /// Profile flagged as no longer usable.
    #[serde(default)]
    pub is_stale_profile: bool,
    /// Lease guarding assignment.
    #[serde(default)]
    pub assignment_lock: LockField,
    /// Lease guarding publishing.
    #[serde(default)]
    pub publish_lock: LockField,
}

impl AccountPublisher {
    /// Identity of this profile.
    #[must_use]
    pub fn key(&self) -> PublisherKey {
        PublisherKey::new(&self.account_id, &self.publisher_profile_id)
    }

    /// Lock key for one of this profile's locks.
    #[must_use]
    pub fn lock_key(&self, kind: LockKind) -> PublisherLockKey {
        PublisherLockKey {
            publisher: self.key(),
            kind,
        }
    }

    /// The lock field of the given kind.
    #[must_use]
    pub const fn lock(&self, kind: LockKind) -> &LockField {
        match kind {
            LockKind::Assignment => &self.assignment_lock,
            LockKind::Publish => &self.publish_lock,
        }
    }

    /// Mutable access to the lock field of the given kind.
    pub const fn lock_mut(&mut self, kind: LockKind) -> &mut LockField {
        match kind {
            LockKind::Assignment => &mut self.assignment_lock,
            LockKind::Publish => &mut self.publish_lock,
        }
    }
}

/// Which lock of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    /// Held from assignment until publish completes or the assignment expires.
    Assignment,
    /// Held while the channel driver runs.
    Publish,
}

impl LockKind {
    /// Returns the lowercase identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Assignment => "assignment",
            Self::Publish => "publish",
        }
    }
}

/// Lock domain key `publisher/{account}/{profile}/{kind}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublisherLockKey {
    /// Profile owning the lock.
    pub publisher: PublisherKey,
    /// Which lock.
    pub kind: LockKind,
}

const LOCK_KEY_PREFIX: &str = "publisher";

impl fmt::Display for PublisherLockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{LOCK_KEY_PREFIX}/{}/{}/{}",
            self.publisher.account_id,
            self.publisher.publisher_profile_id,
            self.kind.as_str()
        )
    }
}

impl FromStr for PublisherLockKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let [LOCK_KEY_PREFIX, account, profile, kind] = parts.as_slice() else {
            return Err(format!("not a publisher lock key: '{s}'"));
        };
        let kind = match *kind {
            "assignment" => LockKind::Assignment,
            "publish" => LockKind::Publish,
            other => return Err(format!("unknown lock kind '{other}'")),
        };
        Ok(Self {
            publisher: PublisherKey::new(*account, *profile),
            kind,
        })
    }
}

/// Eligibility filter for assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileQuery {
    /// Target channel.
    pub channel: DistributionChannel,
    /// Required language.
    pub language: String,
    /// Required niche.
    pub niche: String,
}

impl ProfileQuery {
    /// Returns true if `publisher` may be assigned at `now`: right channel,
    /// active subscription, matching language and niche, not stale, and an
    /// assignment lock that is empty or expired.
    #[must_use]
    pub fn matches(&self, publisher: &AccountPublisher, now_millis: i64) -> bool {
        publisher.channel == self.channel
            && publisher.subscription_status == SubscriptionStatus::Active
            && publisher.language == self.language
            && publisher.niche == self.niche
            && !publisher.is_stale_profile
            && publisher.assignment_lock.is_free_at(now_millis)
    }
}

/// Storage for publisher profiles.
#[async_trait]
pub trait PublisherStore: Send + Sync {
    /// Range query over the channel's profiles ordered by
    /// `last_publish_at_epoch_milli` ascending, filtered by `query` at `now`.
    ///
    /// At most `limit` index entries are scanned per call; a page may hold
    /// fewer matches while `next_cursor` is still set.
    async fn query_eligible(
        &self,
        query: &ProfileQuery,
        now_millis: i64,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<AccountPublisher>>;

    /// Loads one profile.
    async fn get(&self, key: &PublisherKey) -> Result<Option<AccountPublisher>>;

    /// Inserts or replaces a profile, keeping its existing lock fields.
    async fn upsert(&self, publisher: AccountPublisher) -> Result<()>;

    /// Advances the fairness cursor after a successful publish.
    async fn record_publish(&self, key: &PublisherKey, published_at: i64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_round_trips() {
        let key = PublisherLockKey {
            publisher: PublisherKey::new("acct-1", "prof-9"),
            kind: LockKind::Publish,
        };
        assert_eq!(key.to_string(), "publisher/acct-1/prof-9/publish");
        assert_eq!(key.to_string().parse::<PublisherLockKey>(), Ok(key));
        assert!("daemon/reaper".parse::<PublisherLockKey>().is_err());
        assert!("publisher/a/b/other".parse::<PublisherLockKey>().is_err());
    }

    #[test]
    fn expired_lock_field_is_free() {
        let field = LockField {
            process_id: Some("p1".into()),
            expires_at_epoch_milli: 50,
            acquired_at_epoch_milli: 0,
            version: 3,
        };
        assert!(!field.is_free_at(50));
        assert!(field.is_free_at(51));
        assert!(LockField::default().is_free_at(0));
    }
}
