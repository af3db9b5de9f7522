//! Ingestion and the heartbeat reaper over a shared harness.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use postflow_pipeline::heartbeat::{HeartbeatReaper, SweepOutcome, SweepReport};
use postflow_pipeline::ingest::{IngestOutcome, IngestSource};
use postflow_pipeline::{Error, Result};
use postflow_test_utils::{Harness, article_template, profile_per_channel, templates};
use serde_json::json;

async fn sweep(reaper: &HeartbeatReaper) -> SweepReport {
    match reaper.sweep_once().await.expect("sweep") {
        SweepOutcome::Swept(report) => report,
        SweepOutcome::NotLeader { current_leader } => {
            panic!("expected to own the reaper, owned by {current_leader:?}")
        }
    }
}

fn next_bucket(harness: &Harness) {
    harness.advance(harness.backends.config.reaper.bucket_width());
}

#[tokio::test]
async fn items_without_progress_are_reported_after_the_threshold() -> Result<()> {
    let harness = Harness::with_manual_generator(templates(), profile_per_channel());
    let reaper = harness.backends.reaper("r1");
    let ledger_id = harness.ingest("stuck content").await;
    let threshold = harness.backends.config.reaper.stall_threshold;

    for cycle in 1..=threshold {
        next_bucket(&harness);
        let report = sweep(&reaper).await;
        assert_eq!(report.scanned, 1);
        assert_eq!(report.rearmed, 1);
        assert_eq!(report.nudged, 1);
        if cycle < threshold {
            assert!(report.stalled.is_empty(), "stalled early at cycle {cycle}");
        } else {
            assert_eq!(report.stalled, vec![ledger_id.clone()]);
        }
    }
    Ok(())
}

#[tokio::test]
async fn progress_resets_the_stall_count() -> Result<()> {
    let harness = Harness::with_manual_generator(templates(), profile_per_channel());
    let reaper = harness.backends.reaper("r1");
    let orchestrator = harness.orchestrator("w1");
    let ledger_id = harness.ingest("slow content").await;
    let threshold = harness.backends.config.reaper.stall_threshold;

    for _ in 1..threshold {
        next_bucket(&harness);
        assert!(sweep(&reaper).await.stalled.is_empty());
    }

    orchestrator.advance(&ledger_id).await?;
    next_bucket(&harness);
    assert!(sweep(&reaper).await.stalled.is_empty());
    next_bucket(&harness);
    assert!(sweep(&reaper).await.stalled.is_empty());
    Ok(())
}

#[tokio::test]
async fn finished_items_leave_the_heartbeat_schedule() -> Result<()> {
    let harness = Harness::with_templates(article_template(), profile_per_channel());
    let reaper = harness.backends.reaper("r1");
    let ledger_id = harness.ingest("done soon").await;
    harness.drive(&harness.orchestrator("w1"), &ledger_id, 4).await;
    assert!(harness.item(&ledger_id).await.is_finished());

    next_bucket(&harness);
    let report = sweep(&reaper).await;
    assert_eq!(report.finished, 1);
    assert_eq!(report.rearmed, 0);

    next_bucket(&harness);
    assert_eq!(sweep(&reaper).await.scanned, 0);
    Ok(())
}

#[tokio::test]
async fn only_one_process_sweeps_at_a_time() -> Result<()> {
    let harness = Harness::new(profile_per_channel());
    let first = harness.backends.reaper("r1");
    let second = harness.backends.reaper("r2");

    assert!(matches!(first.sweep_once().await?, SweepOutcome::Swept(_)));
    assert_eq!(
        second.sweep_once().await?,
        SweepOutcome::NotLeader {
            current_leader: Some("r1".to_string())
        }
    );

    harness.advance(harness.backends.config.reaper.lease_ttl() + Duration::from_secs(1));
    assert!(matches!(second.sweep_once().await?, SweepOutcome::Swept(_)));
    assert!(matches!(first.sweep_once().await?, SweepOutcome::NotLeader { .. }));
    Ok(())
}

#[tokio::test]
async fn repeated_content_is_a_duplicate() -> Result<()> {
    let harness = Harness::new(profile_per_channel());
    let ledger_id = harness.ingest("same story").await;

    let again = harness
        .backends
        .ingestor()
        .ingest(
            IngestSource::Manual,
            json!({ "language": "EN", "niche": "Tech", "text": "same story" }),
        )
        .await?;
    assert_eq!(
        again,
        IngestOutcome::Duplicate {
            existing_ledger_id: ledger_id
        }
    );
    Ok(())
}

#[tokio::test]
async fn ingestion_is_shed_above_the_hard_backlog() -> Result<()> {
    let mut harness = Harness::new(profile_per_channel());
    harness.backends.config.ingest.soft_backlog = 1;
    harness.backends.config.ingest.hard_backlog = 2;

    // Each accepted item queues one change notification.
    harness.ingest("first").await;
    harness.ingest("second").await;

    let shed = harness
        .backends
        .ingestor()
        .ingest(
            IngestSource::Manual,
            json!({ "language": "en", "niche": "tech", "text": "third" }),
        )
        .await?;
    assert!(matches!(shed, IngestOutcome::Rejected { .. }));
    Ok(())
}

#[tokio::test]
async fn unusable_triggers_are_malformed() {
    let harness = Harness::new(profile_per_channel());
    let err = harness
        .backends
        .ingestor()
        .ingest(IngestSource::Webhook, json!({ "language": "en", "niche": "tech" }))
        .await
        .expect_err("content is required");
    assert!(matches!(err, Error::MalformedRecord { .. }));
}
