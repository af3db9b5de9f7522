//! At-least-once change-stream pump.
//!
//! ```text
//! ChangeQueue ──receive──► poller ──mpsc(1)──► processor ──► JoinSet (≤ N tasks)
//!                                                              │
//!                                        ack on success ◄──────┘
//!                                        leave on failure (redelivered after
//!                                        the visibility timeout)
//! ```
//!
//! Each batch is processed behind a join barrier: the processor does not take
//! the next batch until every message in the current one has been acked or
//! has failed. Retryable failures are left for redelivery; terminal failures
//! and malformed messages are logged and acked, since redelivery would only
//! reproduce them.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use postflow_core::observability::pipeline_span;

use super::{ChangeHandler, ChangeQueue, NotificationEnvelope, QueueMessage};
use crate::config::ConsumerConfig;
use crate::error::Result;
use crate::metrics::PipelineMetrics;

/// Tally of one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Messages in the batch.
    pub received: usize,
    /// Handled and acknowledged.
    pub acked: usize,
    /// Left for redelivery.
    pub failed: usize,
    /// Acknowledged without successful handling (malformed or terminal).
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    Acked,
    Failed,
    Dropped,
}

/// Pulls change notifications and hands them to a [`ChangeHandler`].
#[derive(Clone)]
pub struct ChangeStreamConsumer {
    queue: Arc<dyn ChangeQueue>,
    handler: Arc<dyn ChangeHandler>,
    config: ConsumerConfig,
    metrics: PipelineMetrics,
}

impl std::fmt::Debug for ChangeStreamConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStreamConsumer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChangeStreamConsumer {
    /// Creates a consumer.
    #[must_use]
    pub fn new(
        queue: Arc<dyn ChangeQueue>,
        handler: Arc<dyn ChangeHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Receives one batch and processes it to completion.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue cannot be read.
    #[tracing::instrument(skip(self))]
    pub async fn poll_once(&self) -> Result<BatchReport> {
        let batch = self
            .queue
            .receive(
                self.config.max_messages_per_poll,
                self.config.visibility_timeout(),
            )
            .await?;
        Ok(self.process_batch(batch).await)
    }

    /// Processes a batch with at most `max_concurrent_consumers` in flight.
    pub async fn process_batch(&self, batch: Vec<QueueMessage>) -> BatchReport {
        let mut report = BatchReport {
            received: batch.len(),
            ..BatchReport::default()
        };
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_consumers.max(1)));
        let mut tasks = JoinSet::new();

        for message in batch {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                report.failed += 1;
                continue;
            };
            let queue = self.queue.clone();
            let handler = self.handler.clone();
            tasks.spawn(async move {
                let _permit = permit;
                process_message(queue.as_ref(), handler.as_ref(), &message).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|join_err| {
                tracing::error!(error = %join_err, "message task panicked");
                MessageOutcome::Failed
            });
            match outcome {
                MessageOutcome::Acked => report.acked += 1,
                MessageOutcome::Failed => report.failed += 1,
                MessageOutcome::Dropped => report.dropped += 1,
            }
            self.metrics.record_message(match outcome {
                MessageOutcome::Acked => "acked",
                MessageOutcome::Failed => "failed",
                MessageOutcome::Dropped => "dropped",
            });
        }

        report
    }

    /// Runs the poller and processor until `cancel` fires.
    ///
    /// The batch in progress at cancellation is finished before returning.
    ///
    /// # Errors
    ///
    /// Currently infallible; queue errors are logged and retried next period.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Vec<QueueMessage>>(1);

        let poller = async move {
            while !cancel.is_cancelled() {
                match self
                    .queue
                    .receive(
                        self.config.max_messages_per_poll,
                        self.config.visibility_timeout(),
                    )
                    .await
                {
                    Ok(batch) if batch.is_empty() => {}
                    Ok(batch) => {
                        let full = batch.len() >= self.config.max_messages_per_poll;
                        if tx.send(batch).await.is_err() {
                            break;
                        }
                        if full {
                            continue;
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "change queue receive failed"),
                }

                if let Ok(depth) = self.queue.depth().await {
                    self.metrics.set_queue_depth(&self.config.topic, depth);
                }

                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.poll_period()) => {}
                }
            }
            tracing::info!("change stream poller stopped");
        };

        let processor = async {
            while let Some(batch) = rx.recv().await {
                let report = self.process_batch(batch).await;
                tracing::debug!(?report, "batch processed");
            }
        };

        tokio::join!(poller, processor);
        Ok(())
    }
}

async fn process_message(
    queue: &dyn ChangeQueue,
    handler: &dyn ChangeHandler,
    message: &QueueMessage,
) -> MessageOutcome {
    let notification = match NotificationEnvelope::parse_body(&message.body) {
        Ok(notification) => notification,
        Err(err) => {
            tracing::error!(
                message_id = %message.message_id,
                error = %err,
                "dropping malformed change message"
            );
            return ack(queue, message, MessageOutcome::Dropped).await;
        }
    };

    let span = pipeline_span("consume", &notification.ledger_id);
    match handler.handle(&notification).instrument(span).await {
        Ok(()) => ack(queue, message, MessageOutcome::Acked).await,
        Err(err) if err.is_retryable() => {
            tracing::warn!(
                ledger_id = %notification.ledger_id,
                receive_count = message.receive_count,
                error = %err,
                "change handling failed; leaving message for redelivery"
            );
            MessageOutcome::Failed
        }
        Err(err) => {
            tracing::error!(
                ledger_id = %notification.ledger_id,
                error = %err,
                "change handling failed permanently; dropping message"
            );
            ack(queue, message, MessageOutcome::Dropped).await
        }
    }
}

async fn ack(
    queue: &dyn ChangeQueue,
    message: &QueueMessage,
    outcome: MessageOutcome,
) -> MessageOutcome {
    match queue.ack(&message.receipt_handle).await {
        Ok(()) => outcome,
        Err(err) => {
            tracing::warn!(message_id = %message.message_id, error = %err, "ack failed");
            MessageOutcome::Failed
        }
    }
}
