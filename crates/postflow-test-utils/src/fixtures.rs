//! Pre-built test fixtures for common test scenarios.
//!
//! Provides factory functions to create test data with sensible defaults.

use postflow_pipeline::config::PipelineConfig;
use postflow_pipeline::ingest::{EventPayload, IngestSource};
use postflow_pipeline::ledger::{DistributionChannel, LedgerItem, MediaFormat};
use postflow_pipeline::publisher::{AccountPublisher, LockField, SubscriptionStatus};
use postflow_pipeline::templates::PromptTemplate;

/// Language of every fixture.
pub const LANGUAGE: &str = "en";

/// Niche of every fixture.
pub const NICHE: &str = "tech";

/// An active English tech profile on `channel`.
pub fn profile(
    account_id: &str,
    profile_id: &str,
    channel: DistributionChannel,
    last_publish_at: i64,
) -> AccountPublisher {
    AccountPublisher {
        account_id: account_id.to_string(),
        publisher_profile_id: profile_id.to_string(),
        channel,
        last_publish_at_epoch_milli: last_publish_at,
        subscription_status: SubscriptionStatus::Active,
        language: LANGUAGE.to_string(),
        niche: NICHE.to_string(),
        is_stale_profile: false,
        assignment_lock: LockField::default(),
        publish_lock: LockField::default(),
    }
}

/// One profile per channel, all under account `acct`.
pub fn profile_per_channel() -> Vec<AccountPublisher> {
    DistributionChannel::ALL
        .into_iter()
        .map(|channel| profile("acct", &format!("{channel}-1"), channel, 0))
        .collect()
}

/// Three templates: two articles and one short video.
pub fn templates() -> Vec<PromptTemplate> {
    vec![
        PromptTemplate::new("explainer", MediaFormat::Article, "Explain {content} for {niche} readers"),
        PromptTemplate::new("listicle", MediaFormat::Article, "Five facts about {content}"),
        PromptTemplate::new("hook", MediaFormat::ShortVideo, "A 30 second hook on {content} in {language}"),
    ]
}

/// A single article template.
pub fn article_template() -> Vec<PromptTemplate> {
    vec![PromptTemplate::new("explainer", MediaFormat::Article, "Explain {content}")]
}

/// A `NEW` ledger item with fixture language and niche.
pub fn ledger_item(ledger_id: &str, content: &str) -> LedgerItem {
    LedgerItem::new(
        ledger_id,
        IngestSource::Manual,
        EventPayload {
            language: LANGUAGE.to_string(),
            niche: NICHE.to_string(),
            content: content.to_string(),
        },
        serde_json::json!({ "text": content }),
        format!("hash-{ledger_id}"),
        0,
    )
}

/// Configuration with short waits and backoffs for tests.
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.consumer.poll_period_ms = 10;
    config.consumer.visibility_timeout_secs = 30;
    config.stages.render_wait_secs = 2;
    config.stages.publish_confirm_wait_secs = 2;
    config.stages.poll_initial_backoff_ms = 10;
    config.stages.poll_max_backoff_ms = 100;
    config
}
