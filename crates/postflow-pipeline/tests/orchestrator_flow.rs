//! End-to-end orchestration over in-memory backends.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use postflow_core::LeaseManager;
use postflow_pipeline::Result;
use postflow_pipeline::channels::ChannelRegistry;
use postflow_pipeline::ledger::{DistributionChannel, LedgerStatus, PublishStatus};
use postflow_pipeline::orchestrator::{Orchestrator, OrchestratorDeps};
use postflow_pipeline::publisher::{LockKind, PublisherKey, PublisherStore};
use postflow_pipeline::resolver::PublisherResolver;
use postflow_test_utils::{
    FailingLedgerStore, Harness, LedgerFault, START_MILLIS, article_template, init_test_logging,
    profile_per_channel, templates,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

fn publisher(channel: DistributionChannel) -> PublisherKey {
    PublisherKey::new("acct", format!("{channel}-1"))
}

async fn assignment_lock_key(harness: &Harness, channel: DistributionChannel) -> String {
    harness
        .backends
        .publishers
        .get(&publisher(channel))
        .await
        .expect("profile read")
        .expect("profile exists")
        .lock_key(LockKind::Assignment)
        .to_string()
}

#[tokio::test]
async fn item_is_published_once_per_root_and_channel() -> Result<()> {
    init_test_logging();
    let harness = Harness::new(profile_per_channel());
    let orchestrator = harness.orchestrator("w1");
    let ledger_id = harness.ingest("async rust in production").await;

    let reports = harness.drive(&orchestrator, &ledger_id, 6).await;
    assert!(reports.last().is_some_and(|r| r.finished));

    let item = harness.item(&ledger_id).await;
    assert_eq!(item.status, LedgerStatus::Finished);
    assert_eq!(item.roots().count(), 3);

    // Two article roots on the blog, one short video on three channels.
    let complete: Vec<_> = item
        .publish_events
        .iter()
        .filter(|e| e.status == PublishStatus::Complete)
        .collect();
    assert_eq!(complete.len(), 5);
    for event in &complete {
        assert!(event.external_post_id.is_some());
        let same_pair = complete
            .iter()
            .filter(|o| o.root_media_event_id == event.root_media_event_id && o.channel == event.channel)
            .count();
        assert_eq!(same_pair, 1);
    }

    let uploads = |channel| harness.backends.driver(channel).expect("driver").published().len();
    assert_eq!(uploads(DistributionChannel::Blog), 2);
    assert_eq!(uploads(DistributionChannel::Youtube), 1);
    assert_eq!(uploads(DistributionChannel::Tiktok), 1);
    assert_eq!(uploads(DistributionChannel::Instagram), 1);

    let blog = harness
        .backends
        .publishers
        .get(&publisher(DistributionChannel::Blog))
        .await?
        .expect("blog profile");
    assert_eq!(blog.last_publish_at_epoch_milli, START_MILLIS);
    assert!(blog.assignment_lock.is_free_at(START_MILLIS));
    Ok(())
}

#[tokio::test]
async fn finished_items_are_skipped_on_redelivery() -> Result<()> {
    let harness = Harness::with_templates(article_template(), profile_per_channel());
    let orchestrator = harness.orchestrator("w1");
    let ledger_id = harness.ingest("finished content").await;
    harness.drive(&orchestrator, &ledger_id, 4).await;

    let before = harness.item(&ledger_id).await;
    let report = orchestrator.advance(&ledger_id).await?;
    assert!(report.skipped_finished);
    assert_eq!(harness.item(&ledger_id).await, before);
    Ok(())
}

#[tokio::test]
async fn each_template_yields_one_root_across_reruns() -> Result<()> {
    let harness = Harness::with_manual_generator(templates(), profile_per_channel());
    let orchestrator = harness.orchestrator("w1");
    let ledger_id = harness.ingest("idempotent scripting").await;

    let first = orchestrator.advance(&ledger_id).await?;
    assert_eq!(first.media_appended, 3);
    assert_eq!(first.dispatched, 3);

    let second = orchestrator.advance(&ledger_id).await?;
    assert_eq!(second.media_appended, 0);
    assert_eq!(second.dispatched, 0);
    assert!(second.assigned.is_empty());

    let item = harness.item(&ledger_id).await;
    assert_eq!(item.roots().count(), 3);
    assert_eq!(item.script_events.len(), 3);
    assert_eq!(harness.backends.generator.submissions()?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn failed_uploads_exhaust_the_attempt_budget() -> Result<()> {
    let harness = Harness::with_templates(article_template(), profile_per_channel());
    harness
        .backends
        .driver(DistributionChannel::Blog)
        .expect("blog driver")
        .fail_publish(true);
    let orchestrator = harness.orchestrator("w1");
    let ledger_id = harness.ingest("doomed upload").await;

    let reports = harness.drive(&orchestrator, &ledger_id, 8).await;
    assert!(reports.last().is_some_and(|r| r.finished));

    let item = harness.item(&ledger_id).await;
    assert_eq!(item.publish_events.len(), 3);
    for event in &item.publish_events {
        assert_eq!(event.status, PublishStatus::Expired);
        let reason = event.failure_reason.as_deref().unwrap_or_default();
        assert!(reason.starts_with("upload failed"), "unexpected reason {reason}");
    }

    let key = assignment_lock_key(&harness, DistributionChannel::Blog).await;
    let locks = LeaseManager::new(harness.backends.publishers.clone(), harness.clock.clone());
    assert!(locks.current(&key).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn channels_without_a_driver_expire_their_assignments() -> Result<()> {
    let harness = Harness::with_templates(article_template(), profile_per_channel());
    let orchestrator = harness
        .backends
        .orchestrator_with_channels("w1", ChannelRegistry::new());
    let ledger_id = harness.ingest("nowhere to go").await;

    let report = orchestrator.advance(&ledger_id).await?;
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.expired, 1);

    let item = harness.item(&ledger_id).await;
    let reason = item.publish_events[0].failure_reason.as_deref().unwrap_or_default();
    assert!(reason.contains("no driver"), "unexpected reason {reason}");
    Ok(())
}

#[tokio::test]
async fn failed_assignment_write_releases_the_publisher_lock() -> Result<()> {
    let harness = Harness::with_templates(article_template(), profile_per_channel());
    let backends = &harness.backends;
    let failing = Arc::new(FailingLedgerStore::new(
        backends.ledger.clone(),
        LedgerFault::AppendPublishEvent,
    ));
    let locks = LeaseManager::new(backends.publishers.clone(), backends.clock.clone());
    let orchestrator = Orchestrator::new(OrchestratorDeps {
        ledger: failing.clone(),
        publishers: backends.publishers.clone(),
        resolver: PublisherResolver::new(
            backends.publishers.clone(),
            locks.clone(),
            backends.clock.clone(),
            backends.config.stages.resolver_page_size,
            backends.config.stages.resolver_race_retries,
        ),
        generator: backends.generator.clone(),
        channels: backends.channel_registry(),
        templates: backends.templates.clone(),
        clock: backends.clock.clone(),
        stages: backends.config.stages.clone(),
        locks: backends.config.locks.clone(),
        process_id: "w1".to_string(),
    });
    let ledger_id = harness.ingest("half-written assignment").await;

    assert!(orchestrator.advance(&ledger_id).await.is_err());
    assert_eq!(failing.injected(), 1);
    assert!(harness.item(&ledger_id).await.publish_events.is_empty());

    let key = assignment_lock_key(&harness, DistributionChannel::Blog).await;
    assert!(locks.current(&key).await?.is_none());

    failing.set_armed(false);
    let report = orchestrator.advance(&ledger_id).await?;
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.published, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_publish_a_pair_once() -> Result<()> {
    let harness = Harness::with_templates(article_template(), profile_per_channel());
    let ledger_id = harness.ingest("contended content").await;

    let mut workers = JoinSet::new();
    for n in 0..8 {
        let orchestrator = harness.orchestrator(&format!("w{n}"));
        let ledger_id = ledger_id.clone();
        workers.spawn(async move {
            for _ in 0..4 {
                // Losing a race surfaces as an error; the notification would be redelivered.
                let _ = orchestrator.advance(&ledger_id).await;
            }
        });
    }
    while let Some(joined) = workers.join_next().await {
        joined.expect("worker task");
    }
    harness.drive(&harness.orchestrator("settle"), &ledger_id, 4).await;

    let item = harness.item(&ledger_id).await;
    assert_eq!(item.status, LedgerStatus::Finished);
    let complete = item
        .publish_events
        .iter()
        .filter(|e| e.status == PublishStatus::Complete)
        .count();
    assert_eq!(complete, 1);
    assert_eq!(
        harness
            .backends
            .driver(DistributionChannel::Blog)
            .expect("blog driver")
            .published()
            .len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn worker_drives_items_from_change_notifications() -> Result<()> {
    let harness = Harness::with_templates(article_template(), profile_per_channel());
    let ledger_id = harness.ingest("event driven").await;

    let cancel = CancellationToken::new();
    let worker = harness.backends.worker("w1");
    let running = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if harness.item(&ledger_id).await.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    cancel.cancel();
    running.await.expect("worker task")?;

    assert!(finished.is_ok(), "item did not finish");
    assert_eq!(
        harness
            .backends
            .driver(DistributionChannel::Blog)
            .expect("blog driver")
            .published()
            .len(),
        1
    );
    Ok(())
}
