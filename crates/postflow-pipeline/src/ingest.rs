//! Ingestion: turning raw triggers into ledger items.
//!
//! Sources form a closed set. Each [`IngestSource`] has one [`SourceDriver`]
//! in the [`SourceRegistry`] that normalizes its raw JSON into an
//! [`EventPayload`]. The [`Ingestor`] then sheds load, drops duplicates by
//! content hash, creates the item and schedules its first heartbeat.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use postflow_core::keys::content_hash;
use postflow_core::{BackpressureDecision, BacklogState, Clock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::config::{IngestConfig, ReaperConfig};
use crate::error::{Error, Result};
use crate::heartbeat::{HeartbeatEntry, HeartbeatStore};
use crate::ledger::{CreateOutcome, LedgerItem, LedgerStore};
use crate::metrics::PipelineMetrics;
use crate::stream::ChangeQueue;

/// Where a trigger came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestSource {
    /// RSS feed item.
    Rss,
    /// Generic webhook call.
    Webhook,
    /// Operator-entered content.
    Manual,
}

impl IngestSource {
    /// Every source.
    pub const ALL: [Self; 3] = [Self::Rss, Self::Webhook, Self::Manual];

    /// Returns the lowercase identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rss => "rss",
            Self::Webhook => "webhook",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for IngestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized trigger content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Content language.
    pub language: String,
    /// Content niche.
    pub niche: String,
    /// Text the prompts are built from.
    pub content: String,
}

/// Normalizes raw triggers of one source.
pub trait SourceDriver: Send + Sync {
    /// The source this driver handles.
    fn source(&self) -> IngestSource;

    /// Builds the payload from a raw trigger.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedRecord`] if required fields are missing.
    fn build_event_payload(&self, raw: &Value) -> Result<EventPayload>;
}

fn string_field<'a>(raw: &'a Value, field: &str) -> Option<&'a str> {
    raw.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn required<'a>(raw: &'a Value, source: IngestSource, field: &str) -> Result<&'a str> {
    string_field(raw, field)
        .ok_or_else(|| Error::malformed(format!("{source} trigger without '{field}'")))
}

/// RSS items: `title` plus optional `description`, niche from `category`.
#[derive(Debug, Clone)]
pub struct RssDriver {
    default_language: String,
}

impl RssDriver {
    /// Creates a driver that assumes `default_language` when the feed omits one.
    #[must_use]
    pub fn new(default_language: impl Into<String>) -> Self {
        Self {
            default_language: default_language.into(),
        }
    }
}

impl SourceDriver for RssDriver {
    fn source(&self) -> IngestSource {
        IngestSource::Rss
    }

    fn build_event_payload(&self, raw: &Value) -> Result<EventPayload> {
        let title = required(raw, IngestSource::Rss, "title")?;
        let content = match string_field(raw, "description") {
            Some(description) => format!("{title}\n\n{description}"),
            None => title.to_string(),
        };
        Ok(EventPayload {
            language: string_field(raw, "language")
                .unwrap_or(&self.default_language)
                .to_lowercase(),
            niche: required(raw, IngestSource::Rss, "category")?.to_lowercase(),
            content,
        })
    }
}

/// Webhook calls carrying `language`, `niche` and `content` directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebhookDriver;

impl SourceDriver for WebhookDriver {
    fn source(&self) -> IngestSource {
        IngestSource::Webhook
    }

    fn build_event_payload(&self, raw: &Value) -> Result<EventPayload> {
        Ok(EventPayload {
            language: required(raw, IngestSource::Webhook, "language")?.to_lowercase(),
            niche: required(raw, IngestSource::Webhook, "niche")?.to_lowercase(),
            content: required(raw, IngestSource::Webhook, "content")?.to_string(),
        })
    }
}

/// Operator submissions: `text` with `language` and `niche`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualDriver;

impl SourceDriver for ManualDriver {
    fn source(&self) -> IngestSource {
        IngestSource::Manual
    }

    fn build_event_payload(&self, raw: &Value) -> Result<EventPayload> {
        Ok(EventPayload {
            language: required(raw, IngestSource::Manual, "language")?.to_lowercase(),
            niche: required(raw, IngestSource::Manual, "niche")?.to_lowercase(),
            content: required(raw, IngestSource::Manual, "text")?.to_string(),
        })
    }
}

/// Drivers keyed by source.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    drivers: HashMap<IngestSource, Arc<dyn SourceDriver>>,
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SourceRegistry {
    /// A registry with the built-in driver for every source.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(RssDriver::new("en")));
        registry.register(Arc::new(WebhookDriver));
        registry.register(Arc::new(ManualDriver));
        registry
    }

    /// Registers a driver under its own source.
    pub fn register(&mut self, driver: Arc<dyn SourceDriver>) {
        self.drivers.insert(driver.source(), driver);
    }

    /// The driver for `source`.
    #[must_use]
    pub fn get(&self, source: IngestSource) -> Option<&Arc<dyn SourceDriver>> {
        self.drivers.get(&source)
    }
}

/// Result of ingesting one trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new ledger item was created.
    Accepted {
        /// The new item.
        ledger_id: String,
    },
    /// The content was already ingested; nothing was written.
    Duplicate {
        /// The item holding this content.
        existing_ledger_id: String,
    },
    /// The backlog is over the hard threshold; the trigger was not queued.
    Rejected {
        /// Suggested client backoff.
        retry_after: std::time::Duration,
    },
}

/// Creates ledger items from raw triggers.
#[derive(Clone)]
pub struct Ingestor {
    ledger: Arc<dyn LedgerStore>,
    queue: Arc<dyn ChangeQueue>,
    heartbeats: Arc<dyn HeartbeatStore>,
    sources: SourceRegistry,
    clock: Arc<dyn Clock>,
    queue_name: String,
    thresholds: IngestConfig,
    heartbeat: ReaperConfig,
    metrics: PipelineMetrics,
}

impl fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ingestor")
            .field("sources", &self.sources)
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl Ingestor {
    /// Creates an ingestor.
    ///
    /// `queue` is the change queue whose depth drives load shedding.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        queue: Arc<dyn ChangeQueue>,
        heartbeats: Arc<dyn HeartbeatStore>,
        sources: SourceRegistry,
        clock: Arc<dyn Clock>,
        queue_name: impl Into<String>,
        thresholds: IngestConfig,
        heartbeat: ReaperConfig,
    ) -> Self {
        Self {
            ledger,
            queue,
            heartbeats,
            sources,
            clock,
            queue_name: queue_name.into(),
            thresholds,
            heartbeat,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Ingests one raw trigger.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedRecord`] for an unusable trigger or an
    /// unregistered source, and propagates store failures.
    #[tracing::instrument(skip(self, raw), fields(source = %source))]
    pub async fn ingest(&self, source: IngestSource, raw: Value) -> Result<IngestOutcome> {
        let backlog = BacklogState::new(&self.queue_name)
            .with_depth(self.queue.depth().await?)
            .with_thresholds(self.thresholds.soft_backlog, self.thresholds.hard_backlog);
        match backlog.evaluate() {
            BackpressureDecision::Reject { retry_after } => {
                tracing::warn!(depth = backlog.backlog_depth, "shedding ingestion load");
                self.metrics.record_ingest(source.as_str(), "rejected");
                return Ok(IngestOutcome::Rejected { retry_after });
            }
            BackpressureDecision::AcceptWithWarning { backlog } => {
                tracing::warn!(backlog, "change backlog above soft threshold");
            }
            BackpressureDecision::Accept => {}
        }

        let driver = self
            .sources
            .get(source)
            .ok_or_else(|| Error::malformed(format!("no driver for source {source}")))?;
        let payload = driver.build_event_payload(&raw)?;
        let hash = content_hash(&format!(
            "{}|{}|{}",
            payload.language, payload.niche, payload.content
        ));

        if let Some(existing_ledger_id) = self.ledger.find_by_content_hash(&hash).await? {
            return Ok(self.duplicate(source, existing_ledger_id));
        }

        let now = self.clock.now_millis();
        let ledger_id = Ulid::new().to_string();
        let item = LedgerItem::new(&ledger_id, source, payload, raw, hash, now);
        match self.ledger.create(item).await? {
            CreateOutcome::Created => {}
            CreateOutcome::DuplicateContent { existing_ledger_id } => {
                return Ok(self.duplicate(source, existing_ledger_id));
            }
            CreateOutcome::DuplicateId => {
                return Err(Error::storage(format!("ledger id collision on {ledger_id}")));
            }
        }

        self.heartbeats
            .put(HeartbeatEntry::next(
                ledger_id.clone(),
                0,
                0,
                now,
                self.heartbeat.bucket_width(),
                self.heartbeat.entry_ttl(),
            ))
            .await?;

        self.metrics.record_ingest(source.as_str(), "accepted");
        tracing::info!(ledger_id = %ledger_id, "ledger item created");
        Ok(IngestOutcome::Accepted { ledger_id })
    }

    fn duplicate(&self, source: IngestSource, existing_ledger_id: String) -> IngestOutcome {
        tracing::debug!(existing_ledger_id = %existing_ledger_id, "duplicate trigger dropped");
        self.metrics.record_ingest(source.as_str(), "duplicate");
        IngestOutcome::Duplicate { existing_ledger_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rss_items_fold_title_and_description() -> Result<()> {
        let payload = RssDriver::new("en").build_event_payload(&json!({
            "title": "Rust 2026",
            "description": "What changed",
            "category": "Tech",
        }))?;
        assert_eq!(payload.content, "Rust 2026\n\nWhat changed");
        assert_eq!(payload.niche, "tech");
        assert_eq!(payload.language, "en");
        Ok(())
    }

    #[test]
    fn missing_fields_are_malformed() {
        let err = WebhookDriver
            .build_event_payload(&json!({"language": "en", "niche": "tech"}))
            .expect_err("content missing");
        assert!(matches!(err, Error::MalformedRecord { .. }));

        assert!(ManualDriver
            .build_event_payload(&json!({"language": "en", "niche": " ", "text": "x"}))
            .is_err());
    }

    #[test]
    fn default_registry_covers_every_source() {
        let registry = SourceRegistry::with_defaults();
        for source in IngestSource::ALL {
            assert_eq!(registry.get(source).map(|d| d.source()), Some(source));
        }
    }
}
