//! Channel drivers.
//!
//! Each [`DistributionChannel`] has at most one [`ChannelDriver`] in the
//! [`ChannelRegistry`]. Lookup is by enum, never by free-form name; a channel
//! without a driver is a configuration problem the publish stage reports by
//! expiring the assignment.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::InMemoryChannelDriver;

use crate::error::Result;
use crate::ledger::DistributionChannel;

/// Everything a driver needs to upload one post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Assignment being published.
    pub assignment_id: String,
    /// Owning ledger item.
    pub ledger_id: String,
    /// Publisher account.
    pub account_id: String,
    /// Publisher profile within the account.
    pub publisher_profile_id: String,
    /// Post title.
    pub title: String,
    /// Post body or caption.
    pub body: String,
    /// Blob reference of the final render.
    pub content_lookup_key: String,
}

/// Acknowledgement of an accepted upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Channel that accepted the upload.
    pub channel: DistributionChannel,
    /// Driver-specific handle for confirmation polling.
    pub receipt_id: String,
}

/// A post visible on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPost {
    /// Channel-assigned post id.
    pub external_post_id: String,
    /// Public URL, if the channel reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Uploads posts to one channel.
#[async_trait]
pub trait ChannelDriver: Send + Sync {
    /// The channel this driver serves.
    fn channel(&self) -> DistributionChannel;

    /// Starts an upload. Blocks for the duration of the channel call.
    async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt>;

    /// Returns the post once the channel confirms it.
    async fn confirm(&self, receipt: &PublishReceipt) -> Result<Option<PublishedPost>>;
}

/// Drivers keyed by channel.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    drivers: HashMap<DistributionChannel, Arc<dyn ChannelDriver>>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ChannelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a driver under its own channel, replacing any previous one.
    pub fn register(&mut self, driver: Arc<dyn ChannelDriver>) {
        self.drivers.insert(driver.channel(), driver);
    }

    /// Builder form of [`Self::register`].
    #[must_use]
    pub fn with(mut self, driver: Arc<dyn ChannelDriver>) -> Self {
        self.register(driver);
        self
    }

    /// The driver for `channel`.
    #[must_use]
    pub fn get(&self, channel: DistributionChannel) -> Option<&Arc<dyn ChannelDriver>> {
        self.drivers.get(&channel)
    }
}
