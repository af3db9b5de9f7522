//! Assignment stage: bind each fully enriched root to one publisher profile
//! per required channel.
//!
//! The profile's assignment lock is taken before the publish event is written.
//! If the write fails, is rejected, or the re-read does not show both the event
//! and the lock grant, the lock is released again by version.

use ulid::Ulid;

use super::{AdvanceReport, Orchestrator};
use crate::error::Result;
use crate::ledger::{
    DistributionChannel, LedgerItem, LedgerMutation, MediaEvent, MutationOutcome, PublishEvent,
    PublishStatus,
};
use crate::resolver::{AssignOutcome, PublisherLease};

/// Where a `(root, channel)` pair stands.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    /// A publish event completed.
    Published,
    /// A live assignment is in flight.
    InFlight,
    /// An assignment outlived its lease and must be expired first.
    Lapsed(PublishEvent),
    /// Every allowed attempt expired.
    Exhausted,
    /// Ready for a new assignment.
    Open,
}

impl Orchestrator {
    /// Expires lapsed assignments, then assigns every open pair.
    pub(super) async fn assignment_stage(
        &self,
        ledger_id: &str,
        report: &mut AdvanceReport,
    ) -> Result<()> {
        let item = self.load(ledger_id).await?;
        let now = self.clock.now_millis();

        let mut open = Vec::new();
        for root in item.roots().filter(|r| item.is_fully_enriched(r)) {
            for &channel in root.format.channels() {
                match self.slot(&item, root, channel, now) {
                    Slot::Lapsed(event) => {
                        self.expire_assignment(ledger_id, &event, "assignment lease lapsed", report)
                            .await?;
                    }
                    Slot::Open => open.push((root.clone(), channel)),
                    Slot::Published | Slot::InFlight | Slot::Exhausted => {}
                }
            }
        }

        // Pairs freed by an expiry above are picked up on the next trigger,
        // which the expiry write itself emits.
        for (root, channel) in open {
            self.assign_pair(ledger_id, &root, channel, report).await?;
        }
        Ok(())
    }

    fn slot(
        &self,
        item: &LedgerItem,
        root: &MediaEvent,
        channel: DistributionChannel,
        now: i64,
    ) -> Slot {
        let mut expired = 0;
        for event in item.publish_events_for(&root.event_id, channel) {
            match event.status {
                PublishStatus::Complete => return Slot::Published,
                PublishStatus::Expired => expired += 1,
                PublishStatus::Assigned | PublishStatus::Publishing => {
                    return if event.is_live_at(now) {
                        Slot::InFlight
                    } else {
                        Slot::Lapsed(event.clone())
                    };
                }
            }
        }
        if expired >= self.stages.max_assignment_attempts {
            Slot::Exhausted
        } else {
            Slot::Open
        }
    }

    async fn assign_pair(
        &self,
        ledger_id: &str,
        root: &MediaEvent,
        channel: DistributionChannel,
        report: &mut AdvanceReport,
    ) -> Result<()> {
        let outcome = self
            .resolver
            .assign(
                &self.process_id,
                channel,
                &root.language,
                &root.niche,
                self.lock_config.assignment_ttl(),
            )
            .await?;
        let AssignOutcome::Assigned(lease) = outcome else {
            tracing::info!(root = %root.event_id, %channel, "no eligible publisher; will retry");
            report.unassignable.push((root.event_id.clone(), channel));
            return Ok(());
        };

        let event = PublishEvent {
            assignment_id: Ulid::new().to_string(),
            root_media_event_id: root.event_id.clone(),
            channel,
            account_id: lease.publisher.account_id.clone(),
            publisher_profile_id: lease.publisher.publisher_profile_id.clone(),
            status: PublishStatus::Assigned,
            expires_at_ttl: lease.lease.expiry_time_epoch_milli,
            process_id: self.process_id.clone(),
            assignment_lock_version: lease.lease.version,
            external_post_id: None,
            failure_reason: None,
            updated_at: self.clock.now_millis(),
        };

        match self.record_assignment(ledger_id, &event, &lease, report).await {
            Ok(true) => {
                tracing::info!(
                    assignment_id = %event.assignment_id,
                    %channel,
                    publisher = %lease.publisher.key(),
                    "publish event assigned"
                );
                report.assigned.push(event.assignment_id);
                Ok(())
            }
            Ok(false) => {
                self.release_assignment_lock(&event).await;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    assignment_id = %event.assignment_id,
                    error = %err,
                    "assignment write failed; releasing publisher lock"
                );
                self.release_assignment_lock(&event).await;
                Err(err)
            }
        }
    }

    /// Writes the publish event and verifies both halves of the assignment.
    ///
    /// Returns `false` if the assignment did not take; the caller releases the
    /// lock.
    async fn record_assignment(
        &self,
        ledger_id: &str,
        event: &PublishEvent,
        lease: &PublisherLease,
        report: &mut AdvanceReport,
    ) -> Result<bool> {
        let outcome = self
            .mutate(ledger_id, "publish_events", |item| {
                Some(LedgerMutation::AppendPublishEvent {
                    expected_version: item.publish_version,
                    event: event.clone(),
                })
            })
            .await?;
        if let Some(MutationOutcome::Rejected(reason)) = outcome {
            tracing::info!(%reason, "publish event rejected");
            return Ok(false);
        }

        let item = self.load(ledger_id).await?;
        let written = item
            .publish_event(&event.assignment_id)
            .is_some_and(|p| p.status == PublishStatus::Assigned);
        let held = self
            .locks
            .is_held_by(&lease.lock_key, &self.process_id, lease.lease.version)
            .await?;

        match (written, held) {
            (true, true) => Ok(true),
            (true, false) => {
                tracing::warn!(
                    assignment_id = %event.assignment_id,
                    "publisher lock lost before assignment was verified"
                );
                self.expire_assignment(ledger_id, event, "publisher lock lost", report)
                    .await?;
                Ok(false)
            }
            (false, _) => Ok(false),
        }
    }
}
