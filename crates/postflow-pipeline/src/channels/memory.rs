//! Scriptable in-memory channel driver.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use ulid::Ulid;

use super::{ChannelDriver, PublishReceipt, PublishRequest, PublishedPost};
use crate::error::{Error, Result};
use crate::ledger::DistributionChannel;

/// In-memory [`ChannelDriver`].
///
/// By default uploads are accepted and confirmed on the first poll.
#[derive(Debug)]
pub struct InMemoryChannelDriver {
    channel: DistributionChannel,
    confirm_after: u32,
    never_confirm: AtomicBool,
    fail_publish: AtomicBool,
    confirm_polls: AtomicU32,
    published: Mutex<Vec<PublishRequest>>,
}

impl InMemoryChannelDriver {
    /// Creates a driver that confirms immediately.
    #[must_use]
    pub fn new(channel: DistributionChannel) -> Self {
        Self {
            channel,
            confirm_after: 0,
            never_confirm: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            confirm_polls: AtomicU32::new(0),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Confirms only after `polls` unsuccessful confirmation polls.
    #[must_use]
    pub fn confirm_after(mut self, polls: u32) -> Self {
        self.confirm_after = polls;
        self
    }

    /// Makes every upload fail.
    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Makes confirmation never arrive.
    pub fn never_confirm(&self, never: bool) {
        self.never_confirm.store(never, Ordering::SeqCst);
    }

    /// Uploads accepted so far.
    #[must_use]
    pub fn published(&self) -> Vec<PublishRequest> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChannelDriver for InMemoryChannelDriver {
    fn channel(&self) -> DistributionChannel {
        self.channel
    }

    async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::collaborator("channel driver", format!("{} rejected upload", self.channel)));
        }
        self.published
            .lock()
            .map_err(|_| Error::collaborator("channel driver", "state lock poisoned"))?
            .push(request);
        Ok(PublishReceipt {
            channel: self.channel,
            receipt_id: Ulid::new().to_string(),
        })
    }

    async fn confirm(&self, receipt: &PublishReceipt) -> Result<Option<PublishedPost>> {
        if self.never_confirm.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let polls = self.confirm_polls.fetch_add(1, Ordering::SeqCst);
        if polls < self.confirm_after {
            return Ok(None);
        }
        Ok(Some(PublishedPost {
            external_post_id: format!("{}-{}", self.channel, receipt.receipt_id),
            url: Some(format!("https://{}.example/{}", self.channel, receipt.receipt_id)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PublishRequest {
        PublishRequest {
            assignment_id: "A1".into(),
            ledger_id: "L1".into(),
            account_id: "acct".into(),
            publisher_profile_id: "prof".into(),
            title: "t".into(),
            body: "b".into(),
            content_lookup_key: "blob://render/x".into(),
        }
    }

    #[tokio::test]
    async fn confirms_after_configured_polls() -> Result<()> {
        let driver = InMemoryChannelDriver::new(DistributionChannel::Blog).confirm_after(2);
        let receipt = driver.publish(request()).await?;

        assert!(driver.confirm(&receipt).await?.is_none());
        assert!(driver.confirm(&receipt).await?.is_none());
        assert!(driver.confirm(&receipt).await?.is_some());
        assert_eq!(driver.published().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failing_upload_is_a_retryable_collaborator_error() {
        let driver = InMemoryChannelDriver::new(DistributionChannel::Youtube);
        driver.fail_publish(true);
        let err = driver.publish(request()).await.expect_err("upload fails");
        assert!(err.is_retryable());
        assert!(driver.published().is_empty());
    }
}
