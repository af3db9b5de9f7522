//! In-memory publisher store.
//!
//! Besides [`PublisherStore`], this store implements
//! [`VersionedRecordStore<LeaseRecord>`] over the profiles' lock fields, so a
//! [`LeaseManager`](postflow_core::LeaseManager) can lease publisher locks
//! directly. A lock field at version 0 reads as an absent record.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use postflow_core::{CasOutcome, LeaseRecord, Page, Versioned, VersionedRecordStore};

use super::{AccountPublisher, LockField, ProfileQuery, PublisherKey, PublisherLockKey, PublisherStore};
use crate::error::{Error, Result};

/// In-memory [`PublisherStore`].
#[derive(Debug, Default)]
pub struct MemoryPublisherStore {
    profiles: RwLock<BTreeMap<PublisherKey, AccountPublisher>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("publisher store lock poisoned")
}

fn core_poison_err<T>(_: PoisonError<T>) -> postflow_core::Error {
    postflow_core::Error::storage("publisher store lock poisoned")
}

// Index position: (last_publish_at, account, profile).
fn index_cursor(publisher: &AccountPublisher) -> String {
    format!(
        "{}|{}|{}",
        publisher.last_publish_at_epoch_milli, publisher.account_id, publisher.publisher_profile_id
    )
}

fn parse_cursor(cursor: &str) -> Result<(i64, String, String)> {
    let mut parts = cursor.splitn(3, '|');
    let (Some(ts), Some(account), Some(profile)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Core(postflow_core::Error::InvalidInput(format!(
            "invalid publisher cursor '{cursor}'"
        ))));
    };
    let ts = ts.parse::<i64>().map_err(|_| {
        Error::Core(postflow_core::Error::InvalidInput(format!(
            "invalid publisher cursor '{cursor}'"
        )))
    })?;
    Ok((ts, account.to_string(), profile.to_string()))
}

impl MemoryPublisherStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `profiles`.
    #[must_use]
    pub fn with_profiles(profiles: impl IntoIterator<Item = AccountPublisher>) -> Self {
        Self {
            profiles: RwLock::new(profiles.into_iter().map(|p| (p.key(), p)).collect()),
        }
    }
}

#[async_trait]
impl PublisherStore for MemoryPublisherStore {
    async fn query_eligible(
        &self,
        query: &ProfileQuery,
        now_millis: i64,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<AccountPublisher>> {
        let after = cursor.map(parse_cursor).transpose()?;
        let profiles = self.profiles.read().map_err(poison_err)?;

        let mut index: Vec<&AccountPublisher> = profiles
            .values()
            .filter(|p| p.channel == query.channel)
            .collect();
        index.sort_by(|a, b| {
            (a.last_publish_at_epoch_milli, &a.account_id, &a.publisher_profile_id).cmp(&(
                b.last_publish_at_epoch_milli,
                &b.account_id,
                &b.publisher_profile_id,
            ))
        });

        let scanned: Vec<&AccountPublisher> = index
            .into_iter()
            .filter(|p| match &after {
                None => true,
                Some((ts, account, profile)) => {
                    (p.last_publish_at_epoch_milli, &p.account_id, &p.publisher_profile_id)
                        > (*ts, account, profile)
                }
            })
            .take(limit.max(1) + 1)
            .collect();

        let has_more = scanned.len() > limit.max(1);
        let window = &scanned[..scanned.len().min(limit.max(1))];
        let next_cursor = if has_more {
            window.last().map(|p| index_cursor(p))
        } else {
            None
        };
        let items = window
            .iter()
            .filter(|p| query.matches(p, now_millis))
            .map(|p| (*p).clone())
            .collect();

        Ok(Page { items, next_cursor })
    }

    async fn get(&self, key: &PublisherKey) -> Result<Option<AccountPublisher>> {
        let profiles = self.profiles.read().map_err(poison_err)?;
        Ok(profiles.get(key).cloned())
    }

    async fn upsert(&self, mut publisher: AccountPublisher) -> Result<()> {
        let mut profiles = self.profiles.write().map_err(poison_err)?;
        if let Some(existing) = profiles.get(&publisher.key()) {
            publisher.assignment_lock = existing.assignment_lock.clone();
            publisher.publish_lock = existing.publish_lock.clone();
        }
        profiles.insert(publisher.key(), publisher);
        Ok(())
    }

    async fn record_publish(&self, key: &PublisherKey, published_at: i64) -> Result<()> {
        let mut profiles = self.profiles.write().map_err(poison_err)?;
        let profile = profiles
            .get_mut(key)
            .ok_or_else(|| Error::Core(postflow_core::Error::resource_not_found("publisher", key)))?;
        profile.last_publish_at_epoch_milli = profile.last_publish_at_epoch_milli.max(published_at);
        Ok(())
    }
}

#[async_trait]
impl VersionedRecordStore<LeaseRecord> for MemoryPublisherStore {
    async fn load(&self, key: &str) -> postflow_core::Result<Option<Versioned<LeaseRecord>>> {
        let lock_key: PublisherLockKey = key.parse().map_err(postflow_core::Error::InvalidInput)?;
        let profiles = self.profiles.read().map_err(core_poison_err)?;

        Ok(profiles.get(&lock_key.publisher).and_then(|profile| {
            let field = profile.lock(lock_key.kind);
            (field.version > 0).then(|| Versioned {
                version: field.version,
                value: field.to_record(),
            })
        }))
    }

    async fn try_compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: LeaseRecord,
    ) -> postflow_core::Result<CasOutcome> {
        let lock_key: PublisherLockKey = key.parse().map_err(postflow_core::Error::InvalidInput)?;
        let mut profiles = self.profiles.write().map_err(core_poison_err)?;
        let profile = profiles
            .get_mut(&lock_key.publisher)
            .ok_or_else(|| postflow_core::Error::resource_not_found("publisher", &lock_key.publisher))?;

        let field = profile.lock_mut(lock_key.kind);
        let current_version = (field.version > 0).then_some(field.version);
        if current_version != expected_version {
            return Ok(CasOutcome::Conflict { current_version });
        }

        let version = field.version + 1;
        *field = LockField::from_record(value, version);
        Ok(CasOutcome::Applied { version })
    }
}
