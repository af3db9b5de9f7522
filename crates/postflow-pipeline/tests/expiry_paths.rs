//! Assignments that expire before publishing, and the retry that follows.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use postflow_core::LeaseManager;
use postflow_pipeline::Result;
use postflow_pipeline::ledger::{DistributionChannel, LedgerItem, MediaFormat, PublishStatus};
use postflow_pipeline::publisher::{AccountPublisher, LockKind, PublisherKey, PublisherStore};
use postflow_pipeline::templates::PromptTemplate;
use postflow_test_utils::{Harness, article_template, profile_per_channel};

async fn blog_profile(harness: &Harness) -> AccountPublisher {
    harness
        .backends
        .publishers
        .get(&PublisherKey::new("acct", "blog-1"))
        .await
        .expect("profile read")
        .expect("blog profile")
}

fn only_reason(item: &LedgerItem) -> String {
    let expired: Vec<_> = item
        .publish_events
        .iter()
        .filter(|e| e.status == PublishStatus::Expired)
        .collect();
    assert_eq!(expired.len(), 1, "expected one expired event");
    expired[0].failure_reason.clone().unwrap_or_default()
}

async fn assert_locks_free(harness: &Harness, kinds: &[LockKind]) -> Result<()> {
    let locks = LeaseManager::new(harness.backends.publishers.clone(), harness.clock.clone());
    let profile = blog_profile(harness).await;
    for kind in kinds {
        let key = profile.lock_key(*kind).to_string();
        assert!(locks.current(&key).await?.is_none(), "{key} still held");
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn lapsed_assignment_of_a_crashed_worker_is_expired() -> Result<()> {
    let harness = Harness::with_templates(article_template(), profile_per_channel());
    harness.backends.generator.hold_renders(true);
    let ledger_id = harness.ingest("crash mid render").await;

    // The first worker dies while waiting on its render.
    let crashed = tokio::spawn({
        let orchestrator = harness.orchestrator("w1");
        let ledger_id = ledger_id.clone();
        async move { orchestrator.advance(&ledger_id).await }
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    crashed.abort();
    assert!(crashed.await.is_err_and(|err| err.is_cancelled()));

    let item = harness.item(&ledger_id).await;
    assert_eq!(item.publish_events.len(), 1);
    assert_eq!(item.publish_events[0].status, PublishStatus::Assigned);
    assert_eq!(
        blog_profile(&harness).await.assignment_lock.process_id.as_deref(),
        Some("w1")
    );

    harness.advance(harness.backends.config.locks.assignment_ttl() + Duration::from_secs(1));
    harness.backends.generator.hold_renders(false);
    let orchestrator = harness.orchestrator("w2");

    let report = orchestrator.advance(&ledger_id).await?;
    assert_eq!(report.expired, 1);
    assert!(report.assigned.is_empty());
    assert_eq!(only_reason(&harness.item(&ledger_id).await), "assignment lease lapsed");
    assert!(blog_profile(&harness).await.assignment_lock.process_id.is_none());

    let report = orchestrator.advance(&ledger_id).await?;
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.published, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn render_timeout_expires_the_assignment() -> Result<()> {
    let harness = Harness::with_templates(article_template(), profile_per_channel());
    harness.backends.generator.hold_renders(true);
    let orchestrator = harness.orchestrator("w1");
    let ledger_id = harness.ingest("slow render").await;

    let report = orchestrator.advance(&ledger_id).await?;
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.expired, 1);
    assert_eq!(report.published, 0);
    assert_eq!(only_reason(&harness.item(&ledger_id).await), "render timed out");
    assert_locks_free(&harness, &[LockKind::Assignment]).await?;

    harness.backends.generator.hold_renders(false);
    let report = orchestrator.advance(&ledger_id).await?;
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.published, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn missing_confirmation_expires_the_assignment() -> Result<()> {
    let harness = Harness::with_templates(article_template(), profile_per_channel());
    let blog = harness
        .backends
        .driver(DistributionChannel::Blog)
        .expect("blog driver");
    blog.never_confirm(true);
    let orchestrator = harness.orchestrator("w1");
    let ledger_id = harness.ingest("silent channel").await;

    let report = orchestrator.advance(&ledger_id).await?;
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.expired, 1);
    let reason = only_reason(&harness.item(&ledger_id).await);
    assert!(reason.starts_with("no confirmation after"), "unexpected reason {reason}");
    assert_locks_free(&harness, &[LockKind::Assignment, LockKind::Publish]).await?;

    blog.never_confirm(false);
    let report = orchestrator.advance(&ledger_id).await?;
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.published, 1);
    assert_eq!(blog.published().len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn render_waits_of_one_item_overlap() -> Result<()> {
    let hook = PromptTemplate::new("hook", MediaFormat::ShortVideo, "A hook on {content}");
    let harness = Harness::with_templates(vec![hook], profile_per_channel());
    harness.backends.generator.hold_renders(true);
    let orchestrator = harness.orchestrator("w1");
    let ledger_id = harness.ingest("three channels").await;
    let render_wait = Duration::from_secs(harness.backends.config.stages.render_wait_secs);

    let started = tokio::time::Instant::now();
    let report = orchestrator.advance(&ledger_id).await?;
    let elapsed = started.elapsed();

    assert_eq!(report.assigned.len(), 3);
    assert_eq!(report.expired, 3);
    assert!(elapsed < render_wait * 2, "render waits ran one after another: {elapsed:?}");
    Ok(())
}
