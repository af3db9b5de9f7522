//! Render stage: one final render node per live assignment.
//!
//! Renders are awaited concurrently, so the stage is bounded by a single
//! render wait however many assignments the item has.

use postflow_core::{PollOutcome, poll_until};
use tokio::task::JoinSet;
use tracing::Instrument;

use super::{AdvanceReport, Orchestrator, join_waits};
use crate::error::{Error, Result};
use crate::ledger::{LedgerMutation, MediaEvent, MutationOutcome, PublishEvent, PublishStatus};

impl Orchestrator {
    /// Spawns render nodes for live assignments, then waits on the ones not
    /// yet rendered.
    pub(super) async fn render_stage(
        &self,
        ledger_id: &str,
        report: &mut AdvanceReport,
    ) -> Result<()> {
        let now = self.clock.now_millis();
        let mut appended = 0;
        let outcome = self
            .mutate(ledger_id, "media_events", |item| {
                let missing: Vec<MediaEvent> = item
                    .publish_events
                    .iter()
                    .filter(|p| p.status == PublishStatus::Assigned && p.is_live_at(now))
                    .filter(|p| item.render_for(&p.assignment_id).is_none())
                    .filter_map(|p| {
                        let root = item.media_event(&p.root_media_event_id)?;
                        let inputs = item
                            .children_of(&root.event_id)
                            .iter()
                            .filter_map(|c| c.content_lookup_key().map(str::to_string))
                            .collect();
                        Some(root.render(&p.assignment_id, inputs, now))
                    })
                    .collect();
                appended = missing.len();
                (!missing.is_empty()).then(|| LedgerMutation::AppendMediaEvents {
                    expected_version: item.media_version,
                    events: missing,
                })
            })
            .await?;
        if let Some(MutationOutcome::Applied { .. }) = outcome {
            tracing::info!(renders = appended, "render nodes appended");
            report.media_appended += appended;
        }
        self.dispatch_pending(ledger_id, report).await?;

        let item = self.load(ledger_id).await?;
        let waiting: Vec<(PublishEvent, String)> = item
            .publish_events
            .iter()
            .filter(|p| p.status == PublishStatus::Assigned && p.is_live_at(now))
            .filter_map(|p| {
                let render = item.render_for(&p.assignment_id)?;
                (!render.is_complete()).then(|| (p.clone(), render.event_id.clone()))
            })
            .collect();

        let mut waits = JoinSet::new();
        for (event, render_id) in waiting {
            let this = self.clone();
            let ledger_id = ledger_id.to_string();
            waits.spawn(
                async move {
                    let mut partial = AdvanceReport::default();
                    this.await_render(&ledger_id, &event, &render_id, &mut partial)
                        .await?;
                    Ok::<_, Error>(partial)
                }
                .instrument(tracing::Span::current()),
            );
        }
        join_waits(waits, report).await
    }

    /// Polls the generator for one render within the render wait.
    ///
    /// A render that misses the wait expires its assignment so the pair can be
    /// reassigned.
    async fn await_render(
        &self,
        ledger_id: &str,
        event: &PublishEvent,
        render_id: &str,
        report: &mut AdvanceReport,
    ) -> Result<()> {
        let policy = self.stages.render_poll();
        match poll_until(&policy, || self.generator.poll(render_id)).await {
            PollOutcome::Ready(output) => {
                if self.record_media_output(ledger_id, render_id, output).await? {
                    report.outputs_recorded += 1;
                }
                Ok(())
            }
            PollOutcome::TimedOut { attempts } => {
                tracing::warn!(
                    assignment_id = %event.assignment_id,
                    render_id,
                    attempts,
                    "render did not complete in time"
                );
                self.expire_assignment(ledger_id, event, "render timed out", report)
                    .await?;
                Ok(())
            }
            PollOutcome::Failed(err) => Err(err),
        }
    }
}
