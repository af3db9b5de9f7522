//! In-memory heartbeat store.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use postflow_core::{Clock, Page};

use super::{HeartbeatEntry, HeartbeatStore};
use crate::error::{Error, Result};

/// In-memory [`HeartbeatStore`]; expired entries are invisible to reads.
pub struct MemoryHeartbeatStore {
    clock: Arc<dyn Clock>,
    entries: RwLock<BTreeMap<(i64, String), HeartbeatEntry>>,
}

impl std::fmt::Debug for MemoryHeartbeatStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHeartbeatStore").finish_non_exhaustive()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("heartbeat store lock poisoned")
}

impl MemoryHeartbeatStore {
    /// Creates an empty store whose expiry follows `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Every live entry, for inspection.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn live_entries(&self) -> Result<Vec<HeartbeatEntry>> {
        let now = self.clock.now_millis();
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries
            .values()
            .filter(|e| e.expires_at >= now)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl HeartbeatStore for MemoryHeartbeatStore {
    async fn put(&self, entry: HeartbeatEntry) -> Result<()> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        entries.insert((entry.bucket, entry.ledger_id.clone()), entry);
        Ok(())
    }

    async fn list_bucket(
        &self,
        bucket: i64,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<HeartbeatEntry>> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.write().map_err(poison_err)?;
        entries.retain(|_, e| e.expires_at >= now);

        let start = match cursor {
            Some(after) => Bound::Excluded((bucket, after.to_string())),
            None => Bound::Included((bucket, String::new())),
        };
        let mut page: Vec<HeartbeatEntry> = entries
            .range((start, Bound::Unbounded))
            .take_while(|((b, _), _)| *b == bucket)
            .take(limit.max(1) + 1)
            .map(|(_, e)| e.clone())
            .collect();

        let next_cursor = if page.len() > limit.max(1) {
            page.truncate(limit.max(1));
            page.last().map(|e| e.ledger_id.clone())
        } else {
            None
        };
        Ok(Page {
            items: page,
            next_cursor,
        })
    }

    async fn delete(&self, bucket: i64, ledger_id: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        entries.remove(&(bucket, ledger_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use postflow_core::ManualClock;

    fn entry(bucket: i64, id: &str, expires_at: i64) -> HeartbeatEntry {
        HeartbeatEntry {
            bucket,
            ledger_id: id.into(),
            progress_counter: 0,
            stalled_cycles: 0,
            expires_at,
        }
    }

    #[tokio::test]
    async fn lists_one_bucket_in_pages() -> Result<()> {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryHeartbeatStore::new(clock);
        for id in ["a", "b", "c"] {
            store.put(entry(300, id, 10_000)).await?;
        }
        store.put(entry(600, "d", 10_000)).await?;

        let first = store.list_bucket(300, None, 2).await?;
        assert_eq!(first.items.len(), 2);
        let second = store
            .list_bucket(300, first.next_cursor.as_deref(), 2)
            .await?;
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].ledger_id, "c");
        assert!(second.next_cursor.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn expired_entries_disappear() -> Result<()> {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryHeartbeatStore::new(clock.clone());
        store.put(entry(300, "a", 1_000)).await?;

        clock.advance(Duration::from_secs(2));
        assert!(store.list_bucket(300, None, 10).await?.items.is_empty());
        assert!(store.live_entries()?.is_empty());
        Ok(())
    }
}
