//! All-in-memory pipeline harness.
//!
//! Wraps [`LocalBackends`] with a [`ManualClock`] so tests control lease and
//! heartbeat expiry, plus helpers for ingesting and driving items.

use std::sync::Arc;
use std::time::Duration;

use postflow_core::ManualClock;
use postflow_pipeline::generator::InMemoryMediaGenerator;
use postflow_pipeline::ingest::{IngestOutcome, IngestSource};
use postflow_pipeline::ledger::{LedgerItem, LedgerStore};
use postflow_pipeline::orchestrator::{AdvanceReport, Orchestrator};
use postflow_pipeline::publisher::AccountPublisher;
use postflow_pipeline::templates::PromptTemplate;
use postflow_pipeline::worker::LocalBackends;

use crate::fixtures::{LANGUAGE, NICHE, templates, test_config};

/// Epoch milliseconds the harness clock starts at.
pub const START_MILLIS: i64 = 1_700_000_000_000;

/// Pipeline over in-memory backends with a manual clock.
pub struct Harness {
    /// Controlled time.
    pub clock: Arc<ManualClock>,
    /// Every wired component.
    pub backends: LocalBackends,
}

impl Harness {
    /// A harness with the default templates and an auto-completing generator.
    pub fn new(profiles: Vec<AccountPublisher>) -> Self {
        Self::with_templates(templates(), profiles)
    }

    /// A harness with custom templates and an auto-completing generator.
    pub fn with_templates(templates: Vec<PromptTemplate>, profiles: Vec<AccountPublisher>) -> Self {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let backends = LocalBackends::new(clock.clone(), test_config(), templates, profiles)
            .expect("valid harness configuration");
        Self { clock, backends }
    }

    /// A harness whose generator only completes what the test completes.
    pub fn with_manual_generator(
        templates: Vec<PromptTemplate>,
        profiles: Vec<AccountPublisher>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let generator = Arc::new(InMemoryMediaGenerator::manual(clock.clone()));
        let backends = LocalBackends::with_generator(
            clock.clone(),
            test_config(),
            templates,
            profiles,
            generator,
        )
        .expect("valid harness configuration");
        Self { clock, backends }
    }

    /// Orchestrator acting as `process_id`.
    pub fn orchestrator(&self, process_id: &str) -> Orchestrator {
        self.backends.orchestrator(process_id)
    }

    /// Ingests manual content and returns the new ledger id.
    pub async fn ingest(&self, content: &str) -> String {
        let outcome = self
            .backends
            .ingestor()
            .ingest(
                IngestSource::Manual,
                serde_json::json!({ "language": LANGUAGE, "niche": NICHE, "text": content }),
            )
            .await
            .expect("ingest");
        match outcome {
            IngestOutcome::Accepted { ledger_id } => ledger_id,
            other => panic!("expected a new ledger item, got {other:?}"),
        }
    }

    /// Loads a ledger item that must exist.
    pub async fn item(&self, ledger_id: &str) -> LedgerItem {
        self.backends
            .ledger
            .get(ledger_id)
            .await
            .expect("ledger read")
            .expect("ledger item exists")
    }

    /// Advances time.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Calls [`Orchestrator::advance`] until the item finishes or `max_rounds`
    /// calls have been made. Returns every report.
    pub async fn drive(
        &self,
        orchestrator: &Orchestrator,
        ledger_id: &str,
        max_rounds: usize,
    ) -> Vec<AdvanceReport> {
        let mut reports = Vec::new();
        for _ in 0..max_rounds {
            let report = orchestrator.advance(ledger_id).await.expect("advance");
            let done = report.finished || report.skipped_finished;
            reports.push(report);
            if done {
                break;
            }
        }
        reports
    }
}
