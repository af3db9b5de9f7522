//! Versioned records with compare-and-swap writes.
//!
//! [`VersionedRecordStore`] is the only write primitive the coordination layer
//! relies on. A backing store needs nothing more than a conditional single-row
//! update: DynamoDB `ConditionExpression`, a Postgres `UPDATE ... WHERE version = $n`,
//! or an object store generation match.
//!
//! ## Version Semantics
//!
//! - A record that does not exist is written with `expected_version = None`
//! - Every accepted write sets the version to `expected + 1` (first write: `1`)
//! - A write whose expected version no longer matches is rejected with
//!   [`CasOutcome::Conflict`], never applied partially

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::{Error, Result};

/// A record together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    /// Version observed at read time.
    pub version: u64,
    /// The record value.
    pub value: T,
}

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write was applied at the returned version.
    Applied {
        /// The version now stored.
        version: u64,
    },
    /// The stored version did not match the expected version.
    Conflict {
        /// The version currently stored, `None` if the record is absent.
        current_version: Option<u64>,
    },
}

impl CasOutcome {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Storage for records guarded by optimistic concurrency.
#[async_trait]
pub trait VersionedRecordStore<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Loads a record and the version it is stored at.
    ///
    /// Returns `None` if no record exists under `key`.
    async fn load(&self, key: &str) -> Result<Option<Versioned<T>>>;

    /// Writes `value` only if the stored version equals `expected_version`.
    ///
    /// `expected_version = None` means the record must not exist yet.
    async fn try_compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: T,
    ) -> Result<CasOutcome>;
}

/// In-memory versioned store for tests and single-process deployments.
#[derive(Debug)]
pub struct MemoryVersionedStore<T> {
    records: RwLock<HashMap<String, Versioned<T>>>,
}

impl<T> Default for MemoryVersionedStore<T> {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

fn poison_err<G>(_: PoisonError<G>) -> Error {
    Error::storage("versioned store lock poisoned")
}

impl<T> MemoryVersionedStore<T> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.records.read().map_err(poison_err)?.len())
    }

    /// Returns true if no records are stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl<T> VersionedRecordStore<T> for MemoryVersionedStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn load(&self, key: &str) -> Result<Option<Versioned<T>>> {
        let records = self.records.read().map_err(poison_err)?;
        Ok(records.get(key).cloned())
    }

    async fn try_compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: T,
    ) -> Result<CasOutcome> {
        let mut records = self.records.write().map_err(poison_err)?;
        let current_version = records.get(key).map(|r| r.version);

        if current_version != expected_version {
            return Ok(CasOutcome::Conflict { current_version });
        }

        let version = expected_version.map_or(1, |v| v + 1);
        records.insert(key.to_string(), Versioned { version, value });
        drop(records);

        Ok(CasOutcome::Applied { version })
    }
}
