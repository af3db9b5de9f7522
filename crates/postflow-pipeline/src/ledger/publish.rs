//! Publish events and their status machine.
//!
//! ```text
//! ASSIGNED ──► PUBLISHING ──► COMPLETE
//!    │              │
//!    └──────────────┴───────► EXPIRED
//! ```
//!
//! `COMPLETE` and `EXPIRED` are terminal. A `(root, channel)` pair has at most
//! one non-terminal event at any time.

use std::fmt;
use std::str::FromStr;

use postflow_core::keys::publish_event_key;
use serde::{Deserialize, Serialize};

/// A distribution channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionChannel {
    /// `YouTube` Shorts.
    Youtube,
    /// `TikTok`.
    Tiktok,
    /// Instagram Reels.
    Instagram,
    /// Blog post.
    Blog,
}

impl DistributionChannel {
    /// All channels.
    pub const ALL: [Self; 4] = [Self::Youtube, Self::Tiktok, Self::Instagram, Self::Blog];

    /// Returns the lowercase identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Youtube => "youtube",
            Self::Tiktok => "tiktok",
            Self::Instagram => "instagram",
            Self::Blog => "blog",
        }
    }
}

impl fmt::Display for DistributionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistributionChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown distribution channel '{s}'"))
    }
}

/// Status of one publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishStatus {
    /// A publisher profile is leased for this root and channel.
    Assigned,
    /// The channel driver has been invoked.
    Publishing,
    /// Published and confirmed.
    Complete,
    /// Abandoned: deadline passed, render or upload failed.
    Expired,
}

impl PublishStatus {
    /// Returns true for `COMPLETE` and `EXPIRED`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Expired)
    }

    /// Returns true if `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Assigned, Self::Publishing | Self::Expired)
                | (Self::Publishing, Self::Complete | Self::Expired)
        )
    }

    /// Returns the uppercase identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Assigned => "ASSIGNED",
            Self::Publishing => "PUBLISHING",
            Self::Complete => "COMPLETE",
            Self::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One assignment of a root media event to a publisher profile on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishEvent {
    /// Unique id of this assignment attempt.
    pub assignment_id: String,
    /// Root media event being published.
    pub root_media_event_id: String,
    /// Target channel.
    pub channel: DistributionChannel,
    /// Publisher account.
    pub account_id: String,
    /// Publisher profile within the account.
    pub publisher_profile_id: String,
    /// Current status.
    pub status: PublishStatus,
    /// Assignment deadline in epoch milliseconds.
    pub expires_at_ttl: i64,
    /// Worker holding the assignment lock.
    pub process_id: String,
    /// Version of the assignment lock grant.
    pub assignment_lock_version: u64,
    /// Post id returned by the channel once published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_post_id: Option<String>,
    /// Why the event expired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Last status change in epoch milliseconds.
    pub updated_at: i64,
}

impl PublishEvent {
    /// Display key `{root}.{profile}.{status}`.
    #[must_use]
    pub fn event_key(&self) -> String {
        publish_event_key(
            &self.root_media_event_id,
            &self.publisher_profile_id,
            self.status,
        )
    }

    /// Returns true for `COMPLETE` and `EXPIRED`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if the event is non-terminal and its deadline has not passed.
    #[must_use]
    pub const fn is_live_at(&self, now_millis: i64) -> bool {
        !self.is_terminal() && now_millis <= self.expires_at_ttl
    }

    /// Returns a copy moved to `status`.
    #[must_use]
    pub fn with_status(&self, status: PublishStatus, now_millis: i64) -> Self {
        Self {
            status,
            updated_at: now_millis,
            ..self.clone()
        }
    }

    /// Returns a copy moved to `EXPIRED` with a reason.
    #[must_use]
    pub fn expired(&self, reason: impl Into<String>, now_millis: i64) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..self.with_status(PublishStatus::Expired, now_millis)
        }
    }

    /// Returns true if this event belongs to the `(root, channel)` pair.
    #[must_use]
    pub fn targets(&self, root_media_event_id: &str, channel: DistributionChannel) -> bool {
        self.root_media_event_id == root_media_event_id && self.channel == channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(status: PublishStatus) -> PublishEvent {
        PublishEvent {
            assignment_id: "01J".into(),
            root_media_event_id: "en.script.tech.abc".into(),
            channel: DistributionChannel::Youtube,
            account_id: "acct".into(),
            publisher_profile_id: "prof".into(),
            status,
            expires_at_ttl: 1_000,
            process_id: "p1".into(),
            assignment_lock_version: 1,
            external_post_id: None,
            failure_reason: None,
            updated_at: 0,
        }
    }

    #[test]
    fn transitions_follow_state_machine() {
        use PublishStatus::{Assigned, Complete, Expired, Publishing};
        assert!(Assigned.can_transition_to(Publishing));
        assert!(Assigned.can_transition_to(Expired));
        assert!(Publishing.can_transition_to(Complete));
        assert!(!Assigned.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(Expired));
        assert!(!Expired.can_transition_to(Assigned));
    }

    #[test]
    fn liveness_respects_deadline_and_status() {
        assert!(event(PublishStatus::Assigned).is_live_at(1_000));
        assert!(!event(PublishStatus::Assigned).is_live_at(1_001));
        assert!(!event(PublishStatus::Complete).is_live_at(0));
    }

    #[test]
    fn display_key_tracks_status() {
        let assigned = event(PublishStatus::Assigned);
        assert_eq!(assigned.event_key(), "en.script.tech.abc.prof.ASSIGNED");
        let expired = assigned.expired("render timed out", 5);
        assert_eq!(expired.event_key(), "en.script.tech.abc.prof.EXPIRED");
        assert_eq!(expired.failure_reason.as_deref(), Some("render timed out"));
    }

    #[test]
    fn channel_parses_case_insensitively() {
        assert_eq!(
            "TikTok".parse::<DistributionChannel>(),
            Ok(DistributionChannel::Tiktok)
        );
        assert!("myspace".parse::<DistributionChannel>().is_err());
    }
}
