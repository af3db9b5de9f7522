//! Enrichment stage: harvest generation output and expand roots into their
//! children.

use super::{AdvanceReport, Orchestrator};
use crate::error::Result;
use crate::ledger::{LedgerMutation, MediaEvent, MutationOutcome, expected_children};

impl Orchestrator {
    /// Runs harvest and expansion until neither makes progress.
    ///
    /// Children never have children of their own, so this settles within a
    /// few rounds.
    pub(super) async fn enrichment_stage(
        &self,
        ledger_id: &str,
        report: &mut AdvanceReport,
    ) -> Result<()> {
        loop {
            let harvested = self.harvest_outputs(ledger_id, report).await?;
            let expanded = self.expand_children(ledger_id, report).await?;
            if harvested == 0 && expanded == 0 {
                return Ok(());
            }
        }
    }

    /// Records output for dispatched events the generator has finished.
    ///
    /// Render nodes are left to the render stage.
    async fn harvest_outputs(&self, ledger_id: &str, report: &mut AdvanceReport) -> Result<usize> {
        let item = self.load(ledger_id).await?;
        let waiting: Vec<&MediaEvent> = item
            .media_events
            .iter()
            .filter(|e| !e.is_final_render && !e.is_complete() && item.is_dispatched(&e.event_id))
            .collect();

        let mut recorded = 0;
        for event in waiting {
            let Some(output) = self.generator.poll(&event.event_id).await? else {
                continue;
            };
            if self
                .record_media_output(ledger_id, &event.event_id, output)
                .await?
            {
                recorded += 1;
            }
        }
        report.outputs_recorded += recorded;
        Ok(recorded)
    }

    /// Appends the children every scripted root expects and dispatches them.
    async fn expand_children(&self, ledger_id: &str, report: &mut AdvanceReport) -> Result<usize> {
        let now = self.clock.now_millis();
        let mut appended = 0;
        let outcome = self
            .mutate(ledger_id, "media_events", |item| {
                let missing: Vec<MediaEvent> = item
                    .roots()
                    .filter_map(|root| root.script_output().map(|s| expected_children(root, s, now)))
                    .flatten()
                    .filter(|child| !item.has_media_event(&child.event_id))
                    .collect();
                appended = missing.len();
                (!missing.is_empty()).then(|| LedgerMutation::AppendMediaEvents {
                    expected_version: item.media_version,
                    events: missing,
                })
            })
            .await?;

        let appended = match outcome {
            Some(MutationOutcome::Applied { .. }) => {
                tracing::info!(children = appended, "child media events appended");
                report.media_appended += appended;
                appended
            }
            _ => 0,
        };

        self.dispatch_pending(ledger_id, report).await?;
        Ok(appended)
    }
}
