//! Deterministic identifiers.
//!
//! Every derived record in the pipeline is keyed by a value computed from its
//! inputs, so re-running a stage collapses onto the records already written.
//!
//! | Key | Format |
//! |-----|--------|
//! | Media event | `{language}.{media_type}.{niche}.{hash}` |
//! | Publish event | `{root_media_event_id}.{publisher_profile_id}.{status}` |
//! | Daemon lock | `daemon/{name}` |
//! | Heartbeat bucket | epoch millis floored to the bucket width |

use std::fmt::Display;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::clock::duration_millis;

/// Default heartbeat bucket width.
pub const DEFAULT_BUCKET_WIDTH: Duration = Duration::from_secs(5 * 60);

/// Hex characters of the content hash kept in media event keys.
pub const KEY_HASH_LEN: usize = 16;

/// Computes the SHA-256 hex digest of `content`.
#[must_use]
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derives the idempotent key of a media event.
///
/// ```rust
/// use postflow_core::keys::media_event_key;
///
/// let a = media_event_key("en", "script", "finance", "Explain index funds");
/// let b = media_event_key("en", "script", "finance", "Explain index funds");
/// assert_eq!(a, b);
/// assert!(a.starts_with("en.script.finance."));
/// ```
#[must_use]
pub fn media_event_key(
    language: &str,
    media_type: impl Display,
    niche: &str,
    prompt_or_content: &str,
) -> String {
    let hash = content_hash(prompt_or_content);
    format!(
        "{language}.{media_type}.{niche}.{}",
        &hash[..KEY_HASH_LEN]
    )
}

/// Builds the display key of a publish event in its current status.
#[must_use]
pub fn publish_event_key(
    root_media_event_id: &str,
    publisher_profile_id: &str,
    status: impl Display,
) -> String {
    format!("{root_media_event_id}.{publisher_profile_id}.{status}")
}

/// Lock domain key for a singleton daemon.
#[must_use]
pub fn daemon_lock_key(name: &str) -> String {
    format!("daemon/{name}")
}

/// Floors `epoch_millis` to the start of its bucket.
#[must_use]
pub fn time_bucket(epoch_millis: i64, width: Duration) -> i64 {
    let width = duration_millis(width).max(1);
    epoch_millis.div_euclid(width) * width
}

/// Returns the bucket following the one containing `epoch_millis`.
#[must_use]
pub fn next_bucket(epoch_millis: i64, width: Duration) -> i64 {
    time_bucket(epoch_millis, width).saturating_add(duration_millis(width).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn media_key_changes_with_prompt() {
        let a = media_event_key("en", "script", "finance", "one");
        let b = media_event_key("en", "script", "finance", "two");
        assert_ne!(a, b);
        assert_eq!(a.rsplit('.').next().map(str::len), Some(KEY_HASH_LEN));
    }

    #[test]
    fn publish_key_format() {
        assert_eq!(
            publish_event_key("en.script.x.abc", "prof-1", "ASSIGNED"),
            "en.script.x.abc.prof-1.ASSIGNED"
        );
    }

    #[test]
    fn buckets_are_five_minutes() {
        let width = DEFAULT_BUCKET_WIDTH;
        assert_eq!(time_bucket(299_999, width), 0);
        assert_eq!(time_bucket(300_000, width), 300_000);
        assert_eq!(next_bucket(299_999, width), 300_000);
        assert_eq!(time_bucket(-1, width), -300_000);
    }
}
