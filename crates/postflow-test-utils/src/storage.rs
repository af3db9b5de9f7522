//! Failure-injecting store wrappers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use postflow_pipeline::error::{Error, Result};
use postflow_pipeline::ledger::{
    CreateOutcome, LedgerItem, LedgerMutation, LedgerStore, MutationOutcome,
};

/// Which ledger mutations a [`FailingLedgerStore`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerFault {
    /// Appending a publish event.
    AppendPublishEvent,
    /// Replacing a publish event.
    ReplacePublishEvent,
    /// Every mutation.
    AnyMutation,
}

impl LedgerFault {
    fn matches(self, mutation: &LedgerMutation) -> bool {
        match self {
            Self::AppendPublishEvent => matches!(mutation, LedgerMutation::AppendPublishEvent { .. }),
            Self::ReplacePublishEvent => {
                matches!(mutation, LedgerMutation::ReplacePublishEvent { .. })
            }
            Self::AnyMutation => true,
        }
    }
}

/// Ledger store that fails selected mutations with a storage error.
///
/// Reads and creates always pass through.
pub struct FailingLedgerStore {
    inner: Arc<dyn LedgerStore>,
    fault: LedgerFault,
    armed: AtomicBool,
    injected: AtomicUsize,
}

impl FailingLedgerStore {
    /// Wraps `inner`, failing mutations matching `fault` while armed.
    pub fn new(inner: Arc<dyn LedgerStore>, fault: LedgerFault) -> Self {
        Self {
            inner,
            fault,
            armed: AtomicBool::new(true),
            injected: AtomicUsize::new(0),
        }
    }

    /// Turns injection on or off.
    pub fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::SeqCst);
    }

    /// Number of failures injected so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerStore for FailingLedgerStore {
    async fn get(&self, ledger_id: &str) -> Result<Option<LedgerItem>> {
        self.inner.get(ledger_id).await
    }

    async fn create(&self, item: LedgerItem) -> Result<CreateOutcome> {
        self.inner.create(item).await
    }

    async fn find_by_content_hash(&self, content_hash: &str) -> Result<Option<String>> {
        self.inner.find_by_content_hash(content_hash).await
    }

    async fn apply(&self, ledger_id: &str, mutation: LedgerMutation) -> Result<MutationOutcome> {
        if self.armed.load(Ordering::SeqCst) && self.fault.matches(&mutation) {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(Error::storage(format!(
                "injected ledger failure for {ledger_id}"
            )));
        }
        self.inner.apply(ledger_id, mutation).await
    }
}
