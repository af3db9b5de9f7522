//! In-memory change queue with visibility timeouts.
//!
//! ## Limitations
//!
//! - **Single-process only**: messages are not shared across processes
//! - **No ordering guarantee**: receivers get visible messages in send order,
//!   but redelivered messages rejoin wherever their visibility lapses

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use postflow_core::Clock;
use postflow_core::clock::duration_millis;
use ulid::Ulid;

use super::{ChangeQueue, QueueMessage};
use crate::error::{Error, Result};

#[derive(Debug)]
struct StoredMessage {
    message_id: String,
    body: String,
    visible_at: i64,
    receipt_handle: Option<String>,
    receive_count: u32,
}

/// In-memory [`ChangeQueue`].
pub struct InMemoryChangeQueue {
    clock: Arc<dyn Clock>,
    messages: Mutex<Vec<StoredMessage>>,
}

impl std::fmt::Debug for InMemoryChangeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryChangeQueue").finish_non_exhaustive()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Queue {
        message: "queue lock poisoned".into(),
    }
}

impl InMemoryChangeQueue {
    /// Creates an empty queue whose visibility timeouts follow `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            messages: Mutex::new(Vec::new()),
        }
    }

    /// Messages receivable right now.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn visible_len(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let messages = self.messages.lock().map_err(poison_err)?;
        Ok(messages.iter().filter(|m| m.visible_at <= now).count())
    }

    /// Bodies of every stored message, visible or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn bodies(&self) -> Result<Vec<String>> {
        let messages = self.messages.lock().map_err(poison_err)?;
        Ok(messages.iter().map(|m| m.body.clone()).collect())
    }
}

#[async_trait]
impl ChangeQueue for InMemoryChangeQueue {
    async fn send(&self, body: String) -> Result<String> {
        let message_id = Ulid::new().to_string();
        let mut messages = self.messages.lock().map_err(poison_err)?;
        messages.push(StoredMessage {
            message_id: message_id.clone(),
            body,
            visible_at: i64::MIN,
            receipt_handle: None,
            receive_count: 0,
        });
        Ok(message_id)
    }

    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>> {
        let now = self.clock.now_millis();
        let hidden_until = now.saturating_add(duration_millis(visibility_timeout));
        let mut messages = self.messages.lock().map_err(poison_err)?;

        let received = messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .take(max_messages)
            .map(|m| {
                let receipt = Ulid::new().to_string();
                m.visible_at = hidden_until;
                m.receipt_handle = Some(receipt.clone());
                m.receive_count += 1;
                QueueMessage {
                    message_id: m.message_id.clone(),
                    receipt_handle: receipt,
                    body: m.body.clone(),
                    receive_count: m.receive_count,
                }
            })
            .collect();
        Ok(received)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let mut messages = self.messages.lock().map_err(poison_err)?;
        let before = messages.len();
        messages.retain(|m| m.receipt_handle.as_deref() != Some(receipt_handle));
        if messages.len() == before {
            tracing::debug!(receipt_handle, "ack ignored: stale receipt handle");
        }
        Ok(())
    }

    async fn depth(&self) -> Result<u64> {
        let messages = self.messages.lock().map_err(poison_err)?;
        Ok(messages.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postflow_core::ManualClock;

    fn queue() -> (InMemoryChangeQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (InMemoryChangeQueue::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn received_messages_are_hidden_until_timeout() -> Result<()> {
        let (queue, clock) = queue();
        queue.send("a".into()).await?;

        let first = queue.receive(10, Duration::from_secs(30)).await?;
        assert_eq!(first.len(), 1);
        assert!(queue.receive(10, Duration::from_secs(30)).await?.is_empty());

        clock.advance(Duration::from_secs(31));
        let again = queue.receive(10, Duration::from_secs(30)).await?;
        assert_eq!(again[0].receive_count, 2);
        assert_eq!(again[0].message_id, first[0].message_id);
        Ok(())
    }

    #[tokio::test]
    async fn stale_receipt_does_not_remove_redelivered_message() -> Result<()> {
        let (queue, clock) = queue();
        queue.send("a".into()).await?;
        let first = queue.receive(1, Duration::from_secs(1)).await?;
        clock.advance(Duration::from_secs(2));
        let second = queue.receive(1, Duration::from_secs(1)).await?;

        queue.ack(&first[0].receipt_handle).await?;
        assert_eq!(queue.depth().await?, 1);

        queue.ack(&second[0].receipt_handle).await?;
        assert_eq!(queue.depth().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn receive_respects_batch_size() -> Result<()> {
        let (queue, _) = queue();
        for i in 0..5 {
            queue.send(format!("m{i}")).await?;
        }
        assert_eq!(queue.receive(3, Duration::from_secs(5)).await?.len(), 3);
        assert_eq!(queue.visible_len()?, 2);
        Ok(())
    }
}
