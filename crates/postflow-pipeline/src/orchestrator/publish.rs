//! Publish stage: upload rendered content and record the channel's answer.
//!
//! The publish lock serializes uploads per profile. Before uploading, the
//! assignment lock grant recorded in the publish event must still be current;
//! a profile whose grant moved on is never published to under a stale
//! assignment. Assignments of one item target different channels and are
//! published concurrently.

use postflow_core::{AcquireOutcome, PollOutcome, poll_until};
use tokio::task::JoinSet;
use tracing::Instrument;

use super::{AdvanceReport, Orchestrator, assignment_lock_key, join_waits, lock_key, publisher_key};
use crate::channels::{PublishRequest, PublishedPost};
use crate::error::{Error, Result};
use crate::ledger::{LedgerMutation, MediaEvent, MutationOutcome, PublishEvent, PublishStatus};
use crate::publisher::LockKind;

/// How a publish attempt ended.
enum Attempt {
    Published(PublishedPost),
    Failed(String),
}

impl Orchestrator {
    /// Publishes every assignment whose render is complete.
    pub(super) async fn publish_stage(
        &self,
        ledger_id: &str,
        report: &mut AdvanceReport,
    ) -> Result<()> {
        let item = self.load(ledger_id).await?;
        let now = self.clock.now_millis();
        let ready: Vec<(PublishEvent, MediaEvent, MediaEvent)> = item
            .publish_events
            .iter()
            .filter(|p| p.status == PublishStatus::Assigned && p.is_live_at(now))
            .filter_map(|p| {
                let render = item.render_for(&p.assignment_id).filter(|r| r.is_complete())?;
                let root = item.media_event(&p.root_media_event_id)?;
                Some((p.clone(), render.clone(), root.clone()))
            })
            .collect();

        let mut waits = JoinSet::new();
        for (event, render, root) in ready {
            let this = self.clone();
            let ledger_id = ledger_id.to_string();
            waits.spawn(
                async move {
                    let mut partial = AdvanceReport::default();
                    this.publish_one(&ledger_id, &event, &render, &root, &mut partial)
                        .await?;
                    Ok::<_, Error>(partial)
                }
                .instrument(tracing::Span::current()),
            );
        }
        join_waits(waits, report).await
    }

    async fn publish_one(
        &self,
        ledger_id: &str,
        event: &PublishEvent,
        render: &MediaEvent,
        root: &MediaEvent,
        report: &mut AdvanceReport,
    ) -> Result<()> {
        let publish_key = lock_key(event, LockKind::Publish);
        let grant = self
            .locks
            .try_acquire(&publish_key, &self.process_id, self.lock_config.publish_ttl())
            .await?;
        let AcquireOutcome::Granted(publish_lease) = grant else {
            tracing::debug!(lock_key = %publish_key, "publish lock busy; skipping");
            self.metrics.record_lease_acquisition("publish", "held");
            return Ok(());
        };
        self.metrics.record_lease_acquisition("publish", "granted");

        let result = self
            .publish_locked(ledger_id, event, render, root, report)
            .await;

        if let Err(err) = self
            .locks
            .release_at(&publish_key, &self.process_id, publish_lease.version)
            .await
        {
            tracing::warn!(lock_key = %publish_key, error = %err, "publish lock release failed");
        }
        result
    }

    async fn publish_locked(
        &self,
        ledger_id: &str,
        event: &PublishEvent,
        render: &MediaEvent,
        root: &MediaEvent,
        report: &mut AdvanceReport,
    ) -> Result<()> {
        let assignment_key = assignment_lock_key(event);
        if !self
            .locks
            .is_held_by(&assignment_key, &event.process_id, event.assignment_lock_version)
            .await?
        {
            self.expire_assignment(ledger_id, event, "assignment lock no longer held", report)
                .await?;
            return Ok(());
        }

        let now = self.clock.now_millis();
        let outcome = self
            .mutate(ledger_id, "publish_events", |item| {
                item.publish_event(&event.assignment_id)
                    .filter(|current| current.status == PublishStatus::Assigned)
                    .map(|current| LedgerMutation::ReplacePublishEvent {
                        expected_version: item.publish_version,
                        event: current.with_status(PublishStatus::Publishing, now),
                    })
            })
            .await?;
        if !matches!(outcome, Some(MutationOutcome::Applied { .. })) {
            tracing::debug!(assignment_id = %event.assignment_id, "assignment moved on; not publishing");
            return Ok(());
        }
        let publishing = event.with_status(PublishStatus::Publishing, now);

        match self.upload(ledger_id, &publishing, render, root).await {
            Attempt::Published(post) => {
                let result = self.complete(ledger_id, &publishing, &post, report).await;
                self.release_assignment_lock(&publishing).await;
                result
            }
            Attempt::Failed(reason) => {
                tracing::warn!(assignment_id = %event.assignment_id, %reason, "publish failed");
                self.metrics.record_publish(event.channel.as_str(), "failed");
                self.expire_assignment(ledger_id, &publishing, &reason, report)
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Uploads through the channel driver and waits for confirmation.
    async fn upload(
        &self,
        ledger_id: &str,
        event: &PublishEvent,
        render: &MediaEvent,
        root: &MediaEvent,
    ) -> Attempt {
        let Some(driver) = self.channels.get(event.channel) else {
            return Attempt::Failed(format!("no driver for channel {}", event.channel));
        };
        let Some(content_lookup_key) = render.content_lookup_key() else {
            return Attempt::Failed("render has no content".into());
        };
        let (title, body) = root
            .script_output()
            .map(|s| (s.title.clone(), s.body.clone()))
            .unwrap_or_default();

        let request = PublishRequest {
            assignment_id: event.assignment_id.clone(),
            ledger_id: ledger_id.to_string(),
            account_id: event.account_id.clone(),
            publisher_profile_id: event.publisher_profile_id.clone(),
            title,
            body,
            content_lookup_key: content_lookup_key.to_string(),
        };

        let receipt = match driver.publish(request).await {
            Ok(receipt) => receipt,
            Err(err) => return Attempt::Failed(format!("upload failed: {err}")),
        };

        let policy = self.stages.publish_confirm_poll();
        match poll_until(&policy, || driver.confirm(&receipt)).await {
            PollOutcome::Ready(post) => Attempt::Published(post),
            PollOutcome::TimedOut { attempts } => {
                Attempt::Failed(format!("no confirmation after {attempts} polls"))
            }
            PollOutcome::Failed(err) => Attempt::Failed(format!("confirmation failed: {err}")),
        }
    }

    async fn complete(
        &self,
        ledger_id: &str,
        event: &PublishEvent,
        post: &PublishedPost,
        report: &mut AdvanceReport,
    ) -> Result<()> {
        let now = self.clock.now_millis();
        let outcome = self
            .mutate(ledger_id, "publish_events", |item| {
                item.publish_event(&event.assignment_id)
                    .filter(|current| current.status == PublishStatus::Publishing)
                    .map(|current| {
                        let mut done = current.with_status(PublishStatus::Complete, now);
                        done.external_post_id = Some(post.external_post_id.clone());
                        LedgerMutation::ReplacePublishEvent {
                            expected_version: item.publish_version,
                            event: done,
                        }
                    })
            })
            .await?;

        if matches!(outcome, Some(MutationOutcome::Applied { .. })) {
            tracing::info!(
                assignment_id = %event.assignment_id,
                channel = %event.channel,
                external_post_id = %post.external_post_id,
                "content published"
            );
            report.published += 1;
            self.metrics.record_publish(event.channel.as_str(), "complete");
            self.publishers
                .record_publish(&publisher_key(event), now)
                .await?;
        }
        Ok(())
    }
}
