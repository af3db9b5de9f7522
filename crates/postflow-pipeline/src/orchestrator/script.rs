//! Script stage: one root script event per prompt template.

use super::{AdvanceReport, Orchestrator};
use crate::error::Result;
use crate::ledger::{LedgerMutation, MediaEvent, MutationOutcome};

impl Orchestrator {
    /// Appends the roots missing for the configured templates and dispatches
    /// every root without a generation request.
    pub(super) async fn script_stage(
        &self,
        ledger_id: &str,
        report: &mut AdvanceReport,
    ) -> Result<()> {
        let now = self.clock.now_millis();
        let templates = &self.templates;

        let mut appended = 0;
        let outcome = self
            .mutate(ledger_id, "media_events", |item| {
                let missing: Vec<MediaEvent> = templates
                    .iter()
                    .map(|t| t.root_for(item, now))
                    .filter(|root| !item.has_media_event(&root.event_id))
                    .collect();
                appended = missing.len();
                (!missing.is_empty()).then(|| LedgerMutation::AppendMediaEvents {
                    expected_version: item.media_version,
                    events: missing,
                })
            })
            .await?;

        if let Some(MutationOutcome::Applied { .. }) = outcome {
            tracing::info!(roots = appended, "root script events appended");
            report.media_appended += appended;
        }

        self.dispatch_pending(ledger_id, report).await
    }
}
