//! Workflow orchestrator.
//!
//! Advances one ledger item through its stages:
//!
//! ```text
//! NEW → script → enrichment → assignment → render → publish → completion → FINISHED
//! ```
//!
//! Every stage re-derives what is already done from the ledger and only
//! writes what is missing, so a stage may run any number of times on the same
//! item. All writes go through [`Orchestrator::mutate`], which retries version
//! conflicts against a fresh read up to the CAS retry budget.
//!
//! ## Cross-entity consistency
//!
//! A publisher lock and the publish event recording it live in different
//! rows. The orchestrator takes the lock first, writes the event, re-reads to
//! verify, and releases the lock again if any of that fails. A release always
//! names the lock version recorded at grant time, so it can never clear a
//! later grant to the same worker.

mod assignment;
mod completion;
mod enrichment;
mod publish;
mod render;
mod script;

use std::sync::Arc;

use async_trait::async_trait;
use postflow_core::{Clock, LeaseManager};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::Instrument;

use postflow_core::observability::pipeline_span;

use crate::channels::ChannelRegistry;
use crate::config::{LockConfig, StageConfig};
use crate::error::{Error, Result};
use crate::generator::{GenerationRequest, MediaGenerator};
use crate::ledger::{
    DistributionChannel, LedgerItem, LedgerMutation, LedgerStore, MediaOutput, MutationOutcome,
    PublishEvent, ScriptEvent,
};
use crate::metrics::{PipelineMetrics, time_stage};
use crate::publisher::{LockKind, PublisherKey, PublisherLockKey, PublisherStore};
use crate::resolver::PublisherResolver;
use crate::stream::{ChangeHandler, ChangeNotification};
use crate::templates::PromptTemplate;

/// Collaborators and settings an [`Orchestrator`] is built from.
#[derive(Clone)]
pub struct OrchestratorDeps {
    /// Ledger storage.
    pub ledger: Arc<dyn LedgerStore>,
    /// Publisher profile storage.
    pub publishers: Arc<dyn PublisherStore>,
    /// Resolver over the same profiles; its lease manager guards both
    /// publisher locks.
    pub resolver: PublisherResolver,
    /// Media generation service.
    pub generator: Arc<dyn MediaGenerator>,
    /// Channel drivers.
    pub channels: ChannelRegistry,
    /// Prompt templates, one root per template.
    pub templates: Vec<PromptTemplate>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Stage settings.
    pub stages: StageConfig,
    /// Publisher lock TTLs.
    pub locks: LockConfig,
    /// Identity of this worker in lock records.
    pub process_id: String,
}

/// What one call to [`Orchestrator::advance`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdvanceReport {
    /// The item advanced.
    pub ledger_id: String,
    /// The item was already `FINISHED`; nothing ran.
    pub skipped_finished: bool,
    /// Media events appended (roots, children and renders).
    pub media_appended: usize,
    /// Generation requests dispatched.
    pub dispatched: usize,
    /// Media outputs recorded.
    pub outputs_recorded: usize,
    /// Assignment ids created.
    pub assigned: Vec<String>,
    /// `(root media event, channel)` pairs with no eligible publisher.
    pub unassignable: Vec<(String, DistributionChannel)>,
    /// Publish events moved to `EXPIRED`.
    pub expired: usize,
    /// Publish events moved to `COMPLETE`.
    pub published: usize,
    /// The item reached `FINISHED` during this call.
    pub finished: bool,
}

impl AdvanceReport {
    fn absorb(&mut self, other: Self) {
        self.media_appended += other.media_appended;
        self.dispatched += other.dispatched;
        self.outputs_recorded += other.outputs_recorded;
        self.assigned.extend(other.assigned);
        self.unassignable.extend(other.unassignable);
        self.expired += other.expired;
        self.published += other.published;
        self.finished |= other.finished;
    }
}

/// Advances ledger items through the pipeline stages.
#[derive(Clone)]
pub struct Orchestrator {
    ledger: Arc<dyn LedgerStore>,
    publishers: Arc<dyn PublisherStore>,
    resolver: PublisherResolver,
    locks: LeaseManager,
    generator: Arc<dyn MediaGenerator>,
    channels: ChannelRegistry,
    templates: Arc<[PromptTemplate]>,
    clock: Arc<dyn Clock>,
    stages: StageConfig,
    lock_config: LockConfig,
    process_id: String,
    metrics: PipelineMetrics,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("process_id", &self.process_id)
            .field("templates", &self.templates.len())
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self {
            locks: deps.resolver.locks().clone(),
            ledger: deps.ledger,
            publishers: deps.publishers,
            resolver: deps.resolver,
            generator: deps.generator,
            channels: deps.channels,
            templates: deps.templates.into(),
            clock: deps.clock,
            stages: deps.stages,
            lock_config: deps.locks,
            process_id: deps.process_id,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Identity of this worker in lock records.
    #[must_use]
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Runs every stage once, in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LedgerNotFound`] for an unknown item. Store and
    /// collaborator failures abort the remaining stages; everything written so
    /// far stays written and the next trigger resumes from there.
    #[tracing::instrument(skip(self), fields(process_id = %self.process_id))]
    pub async fn advance(&self, ledger_id: &str) -> Result<AdvanceReport> {
        let mut report = AdvanceReport {
            ledger_id: ledger_id.to_string(),
            ..AdvanceReport::default()
        };

        if self.load(ledger_id).await?.is_finished() {
            tracing::debug!("ledger item already finished");
            report.skipped_finished = true;
            return Ok(report);
        }

        {
            let _timer = time_stage("script");
            self.script_stage(ledger_id, &mut report)
                .instrument(pipeline_span("script", ledger_id))
                .await?;
        }
        {
            let _timer = time_stage("enrichment");
            self.enrichment_stage(ledger_id, &mut report)
                .instrument(pipeline_span("enrichment", ledger_id))
                .await?;
        }
        {
            let _timer = time_stage("assignment");
            self.assignment_stage(ledger_id, &mut report)
                .instrument(pipeline_span("assignment", ledger_id))
                .await?;
        }
        {
            let _timer = time_stage("render");
            self.render_stage(ledger_id, &mut report)
                .instrument(pipeline_span("render", ledger_id))
                .await?;
        }
        {
            let _timer = time_stage("publish");
            self.publish_stage(ledger_id, &mut report)
                .instrument(pipeline_span("publish", ledger_id))
                .await?;
        }
        {
            let _timer = time_stage("completion");
            self.completion_stage(ledger_id, &mut report)
                .instrument(pipeline_span("completion", ledger_id))
                .await?;
        }

        tracing::debug!(?report, "ledger item advanced");
        Ok(report)
    }

    /// Records output reported by the generation service.
    ///
    /// Returns `true` if this call wrote the output; a repeated report is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LedgerNotFound`] for an unknown item and
    /// [`Error::MalformedRecord`] for an unknown media event.
    pub async fn record_media_output(
        &self,
        ledger_id: &str,
        event_id: &str,
        output: MediaOutput,
    ) -> Result<bool> {
        let outcome = self
            .mutate(ledger_id, "media_events", |item| {
                item.media_event(event_id)
                    .filter(|event| !event.is_complete())
                    .map(|_| LedgerMutation::RecordMediaOutput {
                        expected_version: item.media_version,
                        event_id: event_id.to_string(),
                        output: output.clone(),
                    })
            })
            .await?;

        match outcome {
            Some(MutationOutcome::Applied { .. }) => Ok(true),
            Some(MutationOutcome::Rejected(reason)) => {
                tracing::warn!(event_id, %reason, "media output rejected");
                Ok(false)
            }
            None => {
                let item = self.load(ledger_id).await?;
                if item.has_media_event(event_id) {
                    Ok(false)
                } else {
                    Err(Error::malformed(format!(
                        "output for unknown media event {event_id}"
                    )))
                }
            }
            Some(MutationOutcome::Unchanged | MutationOutcome::VersionConflict { .. }) => {
                Ok(false)
            }
        }
    }

    async fn load(&self, ledger_id: &str) -> Result<LedgerItem> {
        self.ledger
            .get(ledger_id)
            .await?
            .ok_or_else(|| Error::LedgerNotFound {
                ledger_id: ledger_id.to_string(),
            })
    }

    /// Applies the mutation `build` derives from a fresh read, retrying version
    /// conflicts.
    ///
    /// `build` returning `None` means nothing is left to write. The returned
    /// outcome is never [`MutationOutcome::VersionConflict`].
    async fn mutate<F>(
        &self,
        ledger_id: &str,
        resource: &str,
        mut build: F,
    ) -> Result<Option<MutationOutcome>>
    where
        F: FnMut(&LedgerItem) -> Option<LedgerMutation> + Send,
    {
        let budget = self.stages.cas_retry_budget.max(1);
        for attempt in 1..=budget {
            let item = self.load(ledger_id).await?;
            let Some(mutation) = build(&item) else {
                return Ok(None);
            };
            match self.ledger.apply(ledger_id, mutation).await? {
                MutationOutcome::VersionConflict { actual } => {
                    tracing::debug!(resource, attempt, actual, "ledger version conflict; retrying");
                }
                outcome => return Ok(Some(outcome)),
            }
        }
        Err(Error::Contention {
            resource: format!("{ledger_id}/{resource}"),
            attempts: budget,
        })
    }

    /// Submits every media event that has neither output nor a dispatch
    /// record, then records the dispatches.
    async fn dispatch_pending(&self, ledger_id: &str, report: &mut AdvanceReport) -> Result<()> {
        let item = self.load(ledger_id).await?;
        let pending: Vec<_> = item
            .media_events
            .iter()
            .filter(|e| !e.is_complete() && !item.is_dispatched(&e.event_id))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let now = self.clock.now_millis();
        let mut dispatched = Vec::with_capacity(pending.len());
        for event in pending {
            self.generator
                .submit(GenerationRequest::for_event(event))
                .await?;
            dispatched.push(ScriptEvent {
                media_event_id: event.event_id.clone(),
                media_type: event.media_type,
                process_id: self.process_id.clone(),
                dispatched_at: now,
            });
        }

        let outcome = self
            .mutate(ledger_id, "script_events", |item| {
                let events: Vec<_> = dispatched
                    .iter()
                    .filter(|s| !item.is_dispatched(&s.media_event_id))
                    .cloned()
                    .collect();
                (!events.is_empty()).then(|| LedgerMutation::AppendScriptEvents {
                    expected_version: item.script_version,
                    events,
                })
            })
            .await?;
        if matches!(outcome, Some(MutationOutcome::Applied { .. })) {
            report.dispatched += dispatched.len();
        }
        Ok(())
    }

    /// Moves an open publish event to `EXPIRED` and releases its assignment
    /// lock grant.
    ///
    /// Returns `true` if this call expired the event.
    async fn expire_assignment(
        &self,
        ledger_id: &str,
        event: &PublishEvent,
        reason: &str,
        report: &mut AdvanceReport,
    ) -> Result<bool> {
        let now = self.clock.now_millis();
        let outcome = self
            .mutate(ledger_id, "publish_events", |item| {
                item.publish_event(&event.assignment_id)
                    .filter(|current| !current.is_terminal())
                    .map(|current| LedgerMutation::ReplacePublishEvent {
                        expected_version: item.publish_version,
                        event: current.expired(reason, now),
                    })
            })
            .await?;

        let expired = matches!(outcome, Some(MutationOutcome::Applied { .. }));
        if expired {
            tracing::info!(
                assignment_id = %event.assignment_id,
                channel = %event.channel,
                reason,
                "publish event expired"
            );
            report.expired += 1;
            self.metrics.record_publish(event.channel.as_str(), "expired");
        }
        self.release_assignment_lock(event).await;
        Ok(expired)
    }

    /// Releases the assignment lock grant recorded in `event`.
    ///
    /// Failures are logged; the lock then lapses at its TTL.
    async fn release_assignment_lock(&self, event: &PublishEvent) {
        let key = assignment_lock_key(event);
        if let Err(err) = self
            .locks
            .release_at(&key, &event.process_id, event.assignment_lock_version)
            .await
        {
            tracing::warn!(lock_key = %key, error = %err, "assignment lock release failed");
        }
    }
}

/// Joins every per-assignment wait of a stage and folds the partial reports
/// into `report`.
///
/// All tasks are joined even after a failure; the first error is returned.
async fn join_waits(
    mut waits: JoinSet<Result<AdvanceReport>>,
    report: &mut AdvanceReport,
) -> Result<()> {
    let mut first_err = None;
    while let Some(joined) = waits.join_next().await {
        let partial = joined
            .map_err(|err| {
                Error::from(postflow_core::Error::internal(format!("stage task failed: {err}")))
            })
            .and_then(std::convert::identity);
        match partial {
            Ok(partial) => report.absorb(partial),
            Err(err) => {
                tracing::warn!(error = %err, "assignment wait failed");
                first_err.get_or_insert(err);
            }
        }
    }
    first_err.map_or(Ok(()), Err)
}

fn publisher_key(event: &PublishEvent) -> PublisherKey {
    PublisherKey::new(&event.account_id, &event.publisher_profile_id)
}

fn lock_key(event: &PublishEvent, kind: LockKind) -> String {
    PublisherLockKey {
        publisher: publisher_key(event),
        kind,
    }
    .to_string()
}

fn assignment_lock_key(event: &PublishEvent) -> String {
    lock_key(event, LockKind::Assignment)
}

#[async_trait]
impl ChangeHandler for Orchestrator {
    async fn handle(&self, notification: &ChangeNotification) -> Result<()> {
        match self.advance(&notification.ledger_id).await {
            Ok(_) => Ok(()),
            Err(Error::LedgerNotFound { ledger_id }) => {
                tracing::warn!(%ledger_id, "notification for unknown ledger item; dropping");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use postflow_core::ManualClock;

    use crate::generator::{InMemoryMediaGenerator, ScriptShape};
    use crate::ingest::{EventPayload, IngestSource};
    use crate::ledger::{MediaFormat, MemoryLedgerStore};
    use crate::publisher::MemoryPublisherStore;
    use crate::stream::ChangeKind;

    struct Fixture {
        orchestrator: Orchestrator,
        ledger: Arc<MemoryLedgerStore>,
        generator: Arc<InMemoryMediaGenerator>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let ledger = Arc::new(MemoryLedgerStore::new());
        let publishers = Arc::new(MemoryPublisherStore::new());
        let locks = LeaseManager::new(publishers.clone(), clock.clone());
        let generator = Arc::new(InMemoryMediaGenerator::manual(clock.clone()));
        let orchestrator = Orchestrator::new(OrchestratorDeps {
            ledger: ledger.clone(),
            publishers: publishers.clone(),
            resolver: PublisherResolver::new(publishers, locks, clock.clone(), 10, 3),
            generator: generator.clone(),
            channels: ChannelRegistry::new(),
            templates: vec![
                PromptTemplate::new("a", MediaFormat::Article, "explain {content}"),
                PromptTemplate::new("b", MediaFormat::ShortVideo, "hook for {content}"),
            ],
            clock,
            stages: StageConfig::default(),
            locks: LockConfig::default(),
            process_id: "worker-1".into(),
        });
        Fixture {
            orchestrator,
            ledger,
            generator,
        }
    }

    async fn seed(ledger: &MemoryLedgerStore) -> Result<()> {
        ledger
            .create(LedgerItem::new(
                "L1",
                IngestSource::Webhook,
                EventPayload {
                    language: "en".into(),
                    niche: "tech".into(),
                    content: "async rust".into(),
                },
                serde_json::Value::Null,
                "hash-1",
                0,
            ))
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn unknown_item_is_not_found() {
        let fx = fixture();
        let err = fx.orchestrator.advance("missing").await.expect_err("no item");
        assert!(matches!(err, Error::LedgerNotFound { .. }));
    }

    #[tokio::test]
    async fn handler_drops_notifications_for_unknown_items() -> Result<()> {
        let fx = fixture();
        fx.orchestrator
            .handle(&ChangeNotification::new("missing", ChangeKind::Updated, 0))
            .await
    }

    #[tokio::test]
    async fn script_stage_dispatches_each_root_once() -> Result<()> {
        let fx = fixture();
        seed(&fx.ledger).await?;

        let first = fx.orchestrator.advance("L1").await?;
        assert_eq!(first.media_appended, 2);
        assert_eq!(first.dispatched, 2);

        let second = fx.orchestrator.advance("L1").await?;
        assert_eq!(second.media_appended, 0);
        assert_eq!(second.dispatched, 0);
        assert_eq!(fx.generator.submissions()?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn callback_output_is_recorded_once() -> Result<()> {
        let fx = fixture();
        seed(&fx.ledger).await?;
        fx.orchestrator.advance("L1").await?;

        let item = fx.ledger.get("L1").await?.expect("item");
        let root = item.roots().next().expect("root").clone();
        let generator = InMemoryMediaGenerator::auto_complete(
            Arc::new(ManualClock::new(0)),
            ScriptShape::default(),
        );
        let output = generator.synthesize(&GenerationRequest::for_event(&root));

        assert!(fx.orchestrator.record_media_output("L1", &root.event_id, output.clone()).await?);
        assert!(!fx.orchestrator.record_media_output("L1", &root.event_id, output.clone()).await?);
        assert!(fx.orchestrator.record_media_output("L1", "nope", output).await.is_err());
        Ok(())
    }
}
