//! Change notifications and the queue that carries them.
//!
//! Every accepted ledger write produces one [`ChangeNotification`]. The
//! notification only identifies the item; handlers always re-fetch current
//! state from the ledger, so a stale or reordered message can never cause a
//! stage to act on an outdated snapshot.
//!
//! ## Wire Format
//!
//! Messages travel inside a topic-style envelope whose `Message` field holds
//! the JSON-encoded notification:
//!
//! ```json
//! {
//!   "Type": "Notification",
//!   "MessageId": "01HZX...",
//!   "Topic": "ledger-changes",
//!   "Timestamp": "2026-03-01T12:00:00Z",
//!   "Message": "{\"ledger_id\":\"01HZW...\",\"kind\":\"updated\",\"emitted_at\":\"...\"}"
//! }
//! ```

pub mod consumer;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postflow_core::Clock;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub use consumer::{BatchReport, ChangeStreamConsumer};
pub use memory::InMemoryChangeQueue;

use crate::error::{Error, Result};

const ENVELOPE_TYPE: &str = "Notification";

/// What caused a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// The item was created.
    Created,
    /// A mutation was applied.
    Updated,
    /// The reaper re-armed a live item.
    Heartbeat,
}

/// Trigger carrying the identity of a mutated ledger item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// The mutated item.
    pub ledger_id: String,
    /// Cause of the notification.
    pub kind: ChangeKind,
    /// Emission time.
    pub emitted_at: DateTime<Utc>,
}

impl ChangeNotification {
    /// Creates a notification stamped at `now_millis`.
    #[must_use]
    pub fn new(ledger_id: impl Into<String>, kind: ChangeKind, now_millis: i64) -> Self {
        Self {
            ledger_id: ledger_id.into(),
            kind,
            emitted_at: DateTime::from_timestamp_millis(now_millis).unwrap_or_default(),
        }
    }
}

/// Outer transport envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NotificationEnvelope {
    /// Envelope type, always `Notification`.
    #[serde(rename = "Type")]
    pub kind: String,
    /// Unique message id.
    pub message_id: String,
    /// Source topic.
    pub topic: String,
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// JSON-encoded [`ChangeNotification`].
    pub message: String,
}

impl NotificationEnvelope {
    /// Wraps a notification for `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the notification cannot be serialized.
    pub fn wrap(notification: &ChangeNotification, topic: &str) -> Result<Self> {
        Ok(Self {
            kind: ENVELOPE_TYPE.to_string(),
            message_id: Ulid::new().to_string(),
            topic: topic.to_string(),
            timestamp: notification.emitted_at,
            message: serde_json::to_string(notification)?,
        })
    }

    /// Serializes the envelope as a queue message body.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_body(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a queue message body into the inner notification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedRecord`] if either layer does not parse or the
    /// notification carries no ledger id.
    pub fn parse_body(body: &str) -> Result<ChangeNotification> {
        let envelope: Self = serde_json::from_str(body)
            .map_err(|e| Error::malformed(format!("change envelope: {e}")))?;
        if envelope.kind != ENVELOPE_TYPE {
            return Err(Error::malformed(format!(
                "unexpected envelope type '{}'",
                envelope.kind
            )));
        }
        let notification: ChangeNotification = serde_json::from_str(&envelope.message)
            .map_err(|e| Error::malformed(format!("change notification: {e}")))?;
        if notification.ledger_id.is_empty() {
            return Err(Error::malformed("change notification without ledger_id"));
        }
        Ok(notification)
    }
}

/// A message received from the change queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Stable message id.
    pub message_id: String,
    /// Handle for acknowledging this delivery.
    pub receipt_handle: String,
    /// Raw body.
    pub body: String,
    /// Deliveries so far, including this one.
    pub receive_count: u32,
}

/// At-least-once queue with visibility timeouts.
///
/// A received message is hidden from other receivers for the visibility
/// timeout and reappears unless it is acknowledged first.
#[async_trait]
pub trait ChangeQueue: Send + Sync {
    /// Enqueues a message body, returning its id.
    async fn send(&self, body: String) -> Result<String>;

    /// Receives up to `max_messages` visible messages.
    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>>;

    /// Removes the message delivered under `receipt_handle`.
    ///
    /// A stale handle (the message was redelivered since) is ignored.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Messages waiting or in flight.
    async fn depth(&self) -> Result<u64>;
}

/// Processes one change notification.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    /// Handles a notification; an error leaves the message for redelivery.
    async fn handle(&self, notification: &ChangeNotification) -> Result<()>;
}

/// Publishes change notifications onto a queue.
#[derive(Clone)]
pub struct ChangeFeed {
    queue: Arc<dyn ChangeQueue>,
    topic: String,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl ChangeFeed {
    /// Creates a feed publishing to `queue` under `topic`.
    #[must_use]
    pub fn new(queue: Arc<dyn ChangeQueue>, topic: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            queue,
            topic: topic.into(),
            clock,
        }
    }

    /// Emits a notification for `ledger_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue rejects the message.
    pub async fn emit(&self, ledger_id: &str, kind: ChangeKind) -> Result<String> {
        let notification = ChangeNotification::new(ledger_id, kind, self.clock.now_millis());
        let body = NotificationEnvelope::wrap(&notification, &self.topic)?.to_body()?;
        let message_id = self.queue.send(body).await?;
        tracing::trace!(ledger_id, ?kind, message_id, "change emitted");
        Ok(message_id)
    }

    /// The underlying queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<dyn ChangeQueue> {
        &self.queue
    }
}
