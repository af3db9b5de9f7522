//! In-memory ledger store for tests and local mode.
//!
//! Mutations run under a single write lock, so each one is atomic with respect
//! to the version check. When a [`ChangeFeed`] is attached, every create and
//! every applied mutation emits one change notification after the lock is
//! released, mirroring a table change stream.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{CreateOutcome, LedgerItem, LedgerMutation, LedgerStore, MutationOutcome};
use crate::error::{Error, Result};
use crate::stream::{ChangeFeed, ChangeKind};

#[derive(Debug, Default)]
struct LedgerState {
    items: HashMap<String, LedgerItem>,
    by_content_hash: HashMap<String, String>,
}

/// In-memory [`LedgerStore`].
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: RwLock<LedgerState>,
    feed: Option<ChangeFeed>,
}

impl std::fmt::Debug for MemoryLedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLedgerStore")
            .field("emits_changes", &self.feed.is_some())
            .finish_non_exhaustive()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("ledger lock poisoned")
}

impl MemoryLedgerStore {
    /// Creates a store that emits no change notifications.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that emits a notification per accepted write.
    #[must_use]
    pub fn with_change_feed(feed: ChangeFeed) -> Self {
        Self {
            state: RwLock::default(),
            feed: Some(feed),
        }
    }

    /// Returns the number of stored items.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poison_err)?.items.len())
    }

    /// Returns true if no items are stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    async fn emit(&self, ledger_id: &str, kind: ChangeKind) -> Result<()> {
        if let Some(feed) = &self.feed {
            feed.emit(ledger_id, kind).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get(&self, ledger_id: &str) -> Result<Option<LedgerItem>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.items.get(ledger_id).cloned())
    }

    async fn create(&self, item: LedgerItem) -> Result<CreateOutcome> {
        let ledger_id = item.ledger_id.clone();
        {
            let mut state = self.state.write().map_err(poison_err)?;
            if state.items.contains_key(&ledger_id) {
                return Ok(CreateOutcome::DuplicateId);
            }
            if let Some(existing) = state.by_content_hash.get(&item.content_hash) {
                return Ok(CreateOutcome::DuplicateContent {
                    existing_ledger_id: existing.clone(),
                });
            }
            state
                .by_content_hash
                .insert(item.content_hash.clone(), ledger_id.clone());
            state.items.insert(ledger_id.clone(), item);
        }

        self.emit(&ledger_id, ChangeKind::Created).await?;
        Ok(CreateOutcome::Created)
    }

    async fn find_by_content_hash(&self, content_hash: &str) -> Result<Option<String>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.by_content_hash.get(content_hash).cloned())
    }

    async fn apply(&self, ledger_id: &str, mutation: LedgerMutation) -> Result<MutationOutcome> {
        let outcome = {
            let mut state = self.state.write().map_err(poison_err)?;
            let item = state
                .items
                .get_mut(ledger_id)
                .ok_or_else(|| Error::LedgerNotFound {
                    ledger_id: ledger_id.to_string(),
                })?;
            item.apply(mutation)
        };

        if outcome.is_applied() {
            self.emit(ledger_id, ChangeKind::Updated).await?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{EventPayload, IngestSource};

    fn item(id: &str, hash: &str) -> LedgerItem {
        LedgerItem::new(
            id,
            IngestSource::Webhook,
            EventPayload {
                language: "en".into(),
                niche: "tech".into(),
                content: "c".into(),
            },
            serde_json::Value::Null,
            hash,
            0,
        )
    }

    #[tokio::test]
    async fn create_detects_duplicates() -> Result<()> {
        let store = MemoryLedgerStore::new();
        assert_eq!(store.create(item("a", "h1")).await?, CreateOutcome::Created);
        assert_eq!(store.create(item("a", "h2")).await?, CreateOutcome::DuplicateId);
        assert_eq!(
            store.create(item("b", "h1")).await?,
            CreateOutcome::DuplicateContent {
                existing_ledger_id: "a".into()
            }
        );
        assert_eq!(store.find_by_content_hash("h1").await?.as_deref(), Some("a"));
        assert_eq!(store.len()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn apply_to_missing_item_is_not_found() {
        let store = MemoryLedgerStore::new();
        let err = store
            .apply("missing", LedgerMutation::Finish { finished_at: 0 })
            .await
            .expect_err("missing item");
        assert!(matches!(err, Error::LedgerNotFound { .. }));
    }
}
