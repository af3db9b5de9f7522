//! Completion stage: finish the item once every required channel is settled.

use super::{AdvanceReport, Orchestrator};
use crate::error::Result;
use crate::ledger::{DistributionChannel, LedgerItem, LedgerMutation, MediaEvent, PublishStatus};

impl Orchestrator {
    /// Marks the item `FINISHED` when every template root exists and each of
    /// its channels either published or used up its assignment attempts.
    pub(super) async fn completion_stage(
        &self,
        ledger_id: &str,
        report: &mut AdvanceReport,
    ) -> Result<()> {
        let item = self.load(ledger_id).await?;
        let now = self.clock.now_millis();
        let settled = !self.templates.is_empty()
            && self.templates.iter().all(|template| {
                item.media_event(&template.root_for(&item, now).event_id)
                    .is_some_and(|root| {
                        root.format
                            .channels()
                            .iter()
                            .all(|&channel| self.is_settled(&item, root, channel))
                    })
            });
        if !settled {
            return Ok(());
        }

        let outcome = self
            .mutate(ledger_id, "status", |item| {
                (!item.is_finished()).then_some(LedgerMutation::Finish { finished_at: now })
            })
            .await?;
        if outcome.is_some_and(|o| o.is_applied()) {
            tracing::info!("ledger item finished");
            report.finished = true;
        }
        Ok(())
    }

    fn is_settled(&self, item: &LedgerItem, root: &MediaEvent, channel: DistributionChannel) -> bool {
        let mut expired = 0;
        for event in item.publish_events_for(&root.event_id, channel) {
            match event.status {
                PublishStatus::Complete => return true,
                PublishStatus::Expired => expired += 1,
                PublishStatus::Assigned | PublishStatus::Publishing => return false,
            }
        }
        expired >= self.stages.max_assignment_attempts
    }
}
