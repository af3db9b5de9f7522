//! The ledger: one durable record per content item.
//!
//! A [`LedgerItem`] is the single source of truth for an item's pipeline state.
//! Its three sub-collections ([`MediaEvent`]s, [`ScriptEvent`]s and
//! [`PublishEvent`]s) are versioned independently; every append or update names
//! the version it was computed against and is rejected with
//! [`MutationOutcome::VersionConflict`] if another writer got there first.
//!
//! ## Invariants
//!
//! - Once `status = FINISHED` no mutation is accepted
//! - Media and script events are keyed idempotently; re-appending is a no-op
//! - At most one non-terminal publish event exists per `(root, channel)` pair,
//!   and none is added once the pair has a `COMPLETE` one
//! - Publish events only move along the status machine in [`publish`]

pub mod media;
pub mod memory;
pub mod publish;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use media::{
    MediaEvent, MediaFormat, MediaOutput, MediaType, ScriptEvent, ScriptOutput, expected_children,
};
pub use memory::MemoryLedgerStore;
pub use publish::{DistributionChannel, PublishEvent, PublishStatus};

use crate::error::Result;
use crate::ingest::{EventPayload, IngestSource};

/// Lifecycle status of a ledger item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerStatus {
    /// In progress.
    New,
    /// Every required channel reached a terminal publish state.
    Finished,
}

/// Per-content-item progress record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerItem {
    /// Identity and cross-system correlation id.
    pub ledger_id: String,
    /// Lifecycle status.
    pub status: LedgerStatus,
    /// Creation time in epoch milliseconds.
    pub created_at: i64,
    /// When the item finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    /// Ingestion source.
    pub source: IngestSource,
    /// Content language.
    pub language: String,
    /// Content niche.
    pub niche: String,
    /// Normalized trigger content.
    pub content: String,
    /// Raw trigger payload as received.
    pub payload: serde_json::Value,
    /// SHA-256 of the content, used for duplicate detection.
    pub content_hash: String,
    /// Media DAG.
    #[serde(default)]
    pub media_events: Vec<MediaEvent>,
    /// Version of `media_events`.
    #[serde(default)]
    pub media_version: u64,
    /// Generation dispatch log.
    #[serde(default)]
    pub script_events: Vec<ScriptEvent>,
    /// Version of `script_events`.
    #[serde(default)]
    pub script_version: u64,
    /// Publish attempts.
    #[serde(default)]
    pub publish_events: Vec<PublishEvent>,
    /// Version of `publish_events`.
    #[serde(default)]
    pub publish_version: u64,
}

impl LedgerItem {
    /// Creates a new item in `NEW` status.
    #[must_use]
    pub fn new(
        ledger_id: impl Into<String>,
        source: IngestSource,
        payload: EventPayload,
        raw: serde_json::Value,
        content_hash: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            ledger_id: ledger_id.into(),
            status: LedgerStatus::New,
            created_at: now,
            finished_at: None,
            source,
            language: payload.language,
            niche: payload.niche,
            content: payload.content,
            payload: raw,
            content_hash: content_hash.into(),
            media_events: Vec::new(),
            media_version: 0,
            script_events: Vec::new(),
            script_version: 0,
            publish_events: Vec::new(),
            publish_version: 0,
        }
    }

    /// Returns true once the item is `FINISHED`.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status == LedgerStatus::Finished
    }

    /// Sum of the sub-collection versions; advances on every accepted mutation.
    #[must_use]
    pub const fn progress_counter(&self) -> u64 {
        self.media_version + self.script_version + self.publish_version
    }

    /// Looks up a media event by id.
    #[must_use]
    pub fn media_event(&self, event_id: &str) -> Option<&MediaEvent> {
        self.media_events.iter().find(|e| e.event_id == event_id)
    }

    /// Returns true if a media event with this id exists.
    #[must_use]
    pub fn has_media_event(&self, event_id: &str) -> bool {
        self.media_event(event_id).is_some()
    }

    /// Root script events.
    pub fn roots(&self) -> impl Iterator<Item = &MediaEvent> {
        self.media_events.iter().filter(|e| e.is_root())
    }

    /// Non-render children of `parent_id`, in presentation order.
    #[must_use]
    pub fn children_of(&self, parent_id: &str) -> Vec<&MediaEvent> {
        let mut children: Vec<_> = self
            .media_events
            .iter()
            .filter(|e| !e.is_final_render && e.parent_event_id.as_deref() == Some(parent_id))
            .collect();
        children.sort_by_key(|e| (e.position_layer, e.render_sequence));
        children
    }

    /// Returns true if the root's script output arrived and every expected
    /// child exists with output.
    #[must_use]
    pub fn is_fully_enriched(&self, root: &MediaEvent) -> bool {
        let Some(script) = root.script_output() else {
            return false;
        };
        expected_children(root, script, 0)
            .iter()
            .all(|child| self.media_event(&child.event_id).is_some_and(MediaEvent::is_complete))
    }

    /// The render node spawned for an assignment.
    #[must_use]
    pub fn render_for(&self, assignment_id: &str) -> Option<&MediaEvent> {
        self.media_events
            .iter()
            .find(|e| e.is_final_render && e.assignment_id.as_deref() == Some(assignment_id))
    }

    /// Returns true if a generation request was recorded for the media event.
    #[must_use]
    pub fn is_dispatched(&self, media_event_id: &str) -> bool {
        self.script_events
            .iter()
            .any(|s| s.media_event_id == media_event_id)
    }

    /// Looks up a publish event by assignment id.
    #[must_use]
    pub fn publish_event(&self, assignment_id: &str) -> Option<&PublishEvent> {
        self.publish_events
            .iter()
            .find(|p| p.assignment_id == assignment_id)
    }

    /// Publish events for a `(root, channel)` pair, oldest first.
    pub fn publish_events_for<'a>(
        &'a self,
        root_media_event_id: &'a str,
        channel: DistributionChannel,
    ) -> impl Iterator<Item = &'a PublishEvent> + 'a {
        self.publish_events
            .iter()
            .filter(move |p| p.targets(root_media_event_id, channel))
    }

    /// The non-terminal publish event for a pair, live or lapsed.
    #[must_use]
    pub fn open_publish_event<'a>(
        &'a self,
        root_media_event_id: &'a str,
        channel: DistributionChannel,
    ) -> Option<&'a PublishEvent> {
        self.publish_events_for(root_media_event_id, channel)
            .find(|p| !p.is_terminal())
    }

    /// Applies a mutation to this item in place.
    ///
    /// Returns the outcome; the item is only modified for
    /// [`MutationOutcome::Applied`].
    pub fn apply(&mut self, mutation: LedgerMutation) -> MutationOutcome {
        if self.is_finished() {
            return match mutation {
                LedgerMutation::Finish { .. } => MutationOutcome::Unchanged,
                _ => MutationOutcome::Rejected("ledger item is finished".into()),
            };
        }

        match mutation {
            LedgerMutation::AppendMediaEvents {
                expected_version,
                events,
            } => {
                if let Some(conflict) = check_version(self.media_version, expected_version) {
                    return conflict;
                }
                let mut appended = false;
                for event in events {
                    if !self.has_media_event(&event.event_id) {
                        self.media_events.push(event);
                        appended = true;
                    }
                }
                bump_if(appended, &mut self.media_version)
            }

            LedgerMutation::RecordMediaOutput {
                expected_version,
                event_id,
                output,
            } => {
                if let Some(conflict) = check_version(self.media_version, expected_version) {
                    return conflict;
                }
                let Some(event) = self.media_events.iter_mut().find(|e| e.event_id == event_id)
                else {
                    return MutationOutcome::Rejected(format!("unknown media event {event_id}"));
                };
                if event.output.is_some() {
                    return MutationOutcome::Unchanged;
                }
                event.output = Some(output);
                bump_if(true, &mut self.media_version)
            }

            LedgerMutation::AppendScriptEvents {
                expected_version,
                events,
            } => {
                if let Some(conflict) = check_version(self.script_version, expected_version) {
                    return conflict;
                }
                let mut appended = false;
                for event in events {
                    if !self.is_dispatched(&event.media_event_id) {
                        self.script_events.push(event);
                        appended = true;
                    }
                }
                bump_if(appended, &mut self.script_version)
            }

            LedgerMutation::AppendPublishEvent {
                expected_version,
                event,
            } => {
                if let Some(conflict) = check_version(self.publish_version, expected_version) {
                    return conflict;
                }
                if self.publish_event(&event.assignment_id).is_some() {
                    return MutationOutcome::Unchanged;
                }
                if event.is_terminal() {
                    return MutationOutcome::Rejected("new publish event must be open".into());
                }
                if self
                    .publish_events_for(&event.root_media_event_id, event.channel)
                    .any(|p| p.status == PublishStatus::Complete)
                {
                    return MutationOutcome::Rejected(format!(
                        "{} already published on {}",
                        event.root_media_event_id, event.channel
                    ));
                }
                if let Some(open) = self.open_publish_event(&event.root_media_event_id, event.channel)
                {
                    return MutationOutcome::Rejected(format!(
                        "open assignment {} exists for {} on {}",
                        open.assignment_id, event.root_media_event_id, event.channel
                    ));
                }
                self.publish_events.push(event);
                bump_if(true, &mut self.publish_version)
            }

            LedgerMutation::ReplacePublishEvent {
                expected_version,
                event,
            } => {
                if let Some(conflict) = check_version(self.publish_version, expected_version) {
                    return conflict;
                }
                let Some(current) = self
                    .publish_events
                    .iter_mut()
                    .find(|p| p.assignment_id == event.assignment_id)
                else {
                    return MutationOutcome::Rejected(format!(
                        "unknown assignment {}",
                        event.assignment_id
                    ));
                };
                if *current == event {
                    return MutationOutcome::Unchanged;
                }
                if !current.status.can_transition_to(event.status) {
                    return MutationOutcome::Rejected(format!(
                        "invalid transition {} -> {}",
                        current.status, event.status
                    ));
                }
                *current = event;
                bump_if(true, &mut self.publish_version)
            }

            LedgerMutation::Finish { finished_at } => {
                self.status = LedgerStatus::Finished;
                self.finished_at = Some(finished_at);
                MutationOutcome::Applied {
                    version: self.progress_counter(),
                }
            }
        }
    }
}

fn check_version(actual: u64, expected: u64) -> Option<MutationOutcome> {
    (actual != expected).then_some(MutationOutcome::VersionConflict { actual })
}

fn bump_if(changed: bool, version: &mut u64) -> MutationOutcome {
    if changed {
        *version += 1;
        MutationOutcome::Applied { version: *version }
    } else {
        MutationOutcome::Unchanged
    }
}

/// A conditional change to one sub-collection of a ledger item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerMutation {
    /// Append media events not already present.
    AppendMediaEvents {
        /// Media version the events were derived from.
        expected_version: u64,
        /// Events to append.
        events: Vec<MediaEvent>,
    },
    /// Record the output of a media event, once.
    RecordMediaOutput {
        /// Media version observed.
        expected_version: u64,
        /// Target media event.
        event_id: String,
        /// Output to record.
        output: MediaOutput,
    },
    /// Append generation dispatch records.
    AppendScriptEvents {
        /// Script version observed.
        expected_version: u64,
        /// Dispatch records.
        events: Vec<ScriptEvent>,
    },
    /// Append a new open publish event.
    AppendPublishEvent {
        /// Publish version observed.
        expected_version: u64,
        /// The new event.
        event: PublishEvent,
    },
    /// Move an existing publish event along the status machine.
    ReplacePublishEvent {
        /// Publish version observed.
        expected_version: u64,
        /// The updated event, matched by assignment id.
        event: PublishEvent,
    },
    /// Mark the item `FINISHED`.
    Finish {
        /// Completion time in epoch milliseconds.
        finished_at: i64,
    },
}

/// Result of applying a [`LedgerMutation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The mutation was applied; `version` is the new sub-collection version.
    Applied {
        /// Version after the write.
        version: u64,
    },
    /// Everything the mutation would add is already present.
    Unchanged,
    /// The expected version is stale.
    VersionConflict {
        /// The version currently stored.
        actual: u64,
    },
    /// The mutation violates an invariant.
    Rejected(String),
}

impl MutationOutcome {
    /// Returns true if the mutation was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Result of creating a ledger item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The item was created.
    Created,
    /// An item with the same id exists.
    DuplicateId,
    /// An item with the same content hash exists.
    DuplicateContent {
        /// The existing item.
        existing_ledger_id: String,
    },
}

/// Durable storage for ledger items.
///
/// Implementations apply mutations as single-row conditional updates and emit
/// one change notification per accepted write.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Loads an item.
    async fn get(&self, ledger_id: &str) -> Result<Option<LedgerItem>>;

    /// Creates an item unless its id or content hash already exists.
    async fn create(&self, item: LedgerItem) -> Result<CreateOutcome>;

    /// Finds the item holding a content hash.
    async fn find_by_content_hash(&self, content_hash: &str) -> Result<Option<String>>;

    /// Applies a conditional mutation.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LedgerNotFound`] if the item does not exist.
    async fn apply(&self, ledger_id: &str, mutation: LedgerMutation) -> Result<MutationOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> LedgerItem {
        LedgerItem::new(
            "L1",
            IngestSource::Manual,
            EventPayload {
                language: "en".into(),
                niche: "tech".into(),
                content: "rust 2024".into(),
            },
            serde_json::json!({}),
            "hash",
            0,
        )
    }

    fn root(prompt: &str) -> MediaEvent {
        MediaEvent::root("L1", "t", MediaFormat::Article, "en", "tech", prompt.into(), 0)
    }

    fn publish(assignment_id: &str, status: PublishStatus) -> PublishEvent {
        PublishEvent {
            assignment_id: assignment_id.into(),
            root_media_event_id: root("a").event_id,
            channel: DistributionChannel::Blog,
            account_id: "acct".into(),
            publisher_profile_id: "prof".into(),
            status,
            expires_at_ttl: 100,
            process_id: "p1".into(),
            assignment_lock_version: 1,
            external_post_id: None,
            failure_reason: None,
            updated_at: 0,
        }
    }

    #[test]
    fn media_append_is_idempotent() {
        let mut item = item();
        let events = vec![root("a"), root("b")];

        let first = item.apply(LedgerMutation::AppendMediaEvents {
            expected_version: 0,
            events: events.clone(),
        });
        assert_eq!(first, MutationOutcome::Applied { version: 1 });

        let again = item.apply(LedgerMutation::AppendMediaEvents {
            expected_version: 1,
            events,
        });
        assert_eq!(again, MutationOutcome::Unchanged);
        assert_eq!(item.media_events.len(), 2);
    }

    #[test]
    fn stale_version_conflicts() {
        let mut item = item();
        item.apply(LedgerMutation::AppendMediaEvents {
            expected_version: 0,
            events: vec![root("a")],
        });
        let stale = item.apply(LedgerMutation::AppendMediaEvents {
            expected_version: 0,
            events: vec![root("b")],
        });
        assert_eq!(stale, MutationOutcome::VersionConflict { actual: 1 });
        assert_eq!(item.media_events.len(), 1);
    }

    #[test]
    fn second_open_assignment_is_rejected() {
        let mut item = item();
        let first = item.apply(LedgerMutation::AppendPublishEvent {
            expected_version: 0,
            event: publish("a1", PublishStatus::Assigned),
        });
        assert!(first.is_applied());

        let second = item.apply(LedgerMutation::AppendPublishEvent {
            expected_version: 1,
            event: publish("a2", PublishStatus::Assigned),
        });
        assert!(matches!(second, MutationOutcome::Rejected(_)));

        item.apply(LedgerMutation::ReplacePublishEvent {
            expected_version: 1,
            event: publish("a1", PublishStatus::Expired),
        });
        let retry = item.apply(LedgerMutation::AppendPublishEvent {
            expected_version: 2,
            event: publish("a2", PublishStatus::Assigned),
        });
        assert!(retry.is_applied());
    }

    #[test]
    fn terminal_publish_events_cannot_reopen() {
        let mut item = item();
        item.apply(LedgerMutation::AppendPublishEvent {
            expected_version: 0,
            event: publish("a1", PublishStatus::Assigned),
        });
        item.apply(LedgerMutation::ReplacePublishEvent {
            expected_version: 1,
            event: publish("a1", PublishStatus::Expired),
        });
        let reopen = item.apply(LedgerMutation::ReplacePublishEvent {
            expected_version: 2,
            event: publish("a1", PublishStatus::Publishing),
        });
        assert!(matches!(reopen, MutationOutcome::Rejected(_)));
    }

    #[test]
    fn open_event_lookup_skips_terminal_attempts() {
        let mut item = item();
        item.apply(LedgerMutation::AppendPublishEvent {
            expected_version: 0,
            event: publish("a1", PublishStatus::Assigned),
        });
        item.apply(LedgerMutation::ReplacePublishEvent {
            expected_version: 1,
            event: publish("a1", PublishStatus::Expired),
        });
        item.apply(LedgerMutation::AppendPublishEvent {
            expected_version: 2,
            event: publish("a2", PublishStatus::Assigned),
        });

        let open = {
            let root_id = root("a").event_id;
            item.open_publish_event(&root_id, DistributionChannel::Blog)
                .map(|p| p.assignment_id.clone())
        };
        assert_eq!(open.as_deref(), Some("a2"));
        assert!(item
            .open_publish_event(&root("b").event_id, DistributionChannel::Blog)
            .is_none());
    }

    #[test]
    fn published_pairs_take_no_new_assignment() {
        let mut item = item();
        item.apply(LedgerMutation::AppendPublishEvent {
            expected_version: 0,
            event: publish("a1", PublishStatus::Assigned),
        });
        item.apply(LedgerMutation::ReplacePublishEvent {
            expected_version: 1,
            event: publish("a1", PublishStatus::Publishing),
        });
        item.apply(LedgerMutation::ReplacePublishEvent {
            expected_version: 2,
            event: publish("a1", PublishStatus::Complete),
        });
        let late = item.apply(LedgerMutation::AppendPublishEvent {
            expected_version: 3,
            event: publish("a2", PublishStatus::Assigned),
        });
        assert!(matches!(late, MutationOutcome::Rejected(_)));
    }

    #[test]
    fn finished_items_are_frozen() {
        let mut item = item();
        assert!(item.apply(LedgerMutation::Finish { finished_at: 9 }).is_applied());
        assert_eq!(
            item.apply(LedgerMutation::Finish { finished_at: 10 }),
            MutationOutcome::Unchanged
        );
        let late = item.apply(LedgerMutation::AppendMediaEvents {
            expected_version: 0,
            events: vec![root("a")],
        });
        assert!(matches!(late, MutationOutcome::Rejected(_)));
        assert_eq!(item.finished_at, Some(9));
    }

    #[test]
    fn output_is_recorded_once() {
        let mut item = item();
        let event = root("a");
        let id = event.event_id.clone();
        item.apply(LedgerMutation::AppendMediaEvents {
            expected_version: 0,
            events: vec![event],
        });
        let output = MediaOutput {
            content_lookup_key: "blob/1".into(),
            script: None,
            completed_at: 1,
        };
        let first = item.apply(LedgerMutation::RecordMediaOutput {
            expected_version: 1,
            event_id: id.clone(),
            output: output.clone(),
        });
        assert_eq!(first, MutationOutcome::Applied { version: 2 });
        let second = item.apply(LedgerMutation::RecordMediaOutput {
            expected_version: 2,
            event_id: id,
            output,
        });
        assert_eq!(second, MutationOutcome::Unchanged);
        assert_eq!(item.progress_counter(), 2);
    }
}
