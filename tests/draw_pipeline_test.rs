//! End-to-end properties of the draw pipeline, driven without the HTTP layer

use drawguard::{
    analytics::SNAPSHOT_KEY,
    config::DrawGuardConfig,
    errors::{AuthorizationError, DrawGuardError},
    security::CallerContext,
    services::ServiceContainer,
    tamper::TamperCheck,
    types::{DrawColor, SequenceStatus, RECENT_SPINS_LIMIT},
    AnalyticsSnapshot,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn container() -> (Arc<ServiceContainer>, TempDir) {
    let temp = TempDir::new().unwrap();
    let config = DrawGuardConfig::for_testing(temp.path().to_string_lossy());
    (Arc::new(ServiceContainer::new(config).unwrap()), temp)
}

#[tokio::test]
async fn test_every_pocket_ingests_with_expected_color() {
    let (services, _temp) = container();

    for n in 0..=36u8 {
        let draw = n as u64 + 1;
        let receipt = services
            .gateway()
            .ingest(&json!({"winning_number": n, "draw_number": draw}))
            .await
            .unwrap();

        let expected = match n {
            0 => DrawColor::Green,
            1 | 3 | 5 | 7 | 9 | 12 | 14 | 16 | 18 | 19 | 21 | 23 | 25 | 27 | 30 | 32 | 34 | 36 => DrawColor::Red,
            _ => DrawColor::Black,
        };
        assert_eq!(receipt.color, expected, "pocket {n}");
        assert_eq!(services.draws().latest_ingested().unwrap().unwrap().draw_number, draw);
    }
}

#[tokio::test]
async fn test_gap_between_six_and_eight() {
    let (services, _temp) = container();
    let guard = services.guard();
    let ctx = guard.internal_context("test", "seq".to_string()).unwrap();

    for (draw, number) in [(5u64, 11u8), (6, 12), (8, 13)] {
        services
            .gateway()
            .ingest(&json!({"winning_number": number, "draw_number": draw}))
            .await
            .unwrap();
        services.aggregator().update(number, draw, &ctx).await.unwrap();
    }

    let latest = services.monitor().latest_draws().unwrap();
    let statuses: Vec<(u64, SequenceStatus)> = latest.iter().map(|d| (d.draw_number, d.sequence_status)).collect();
    assert_eq!(
        statuses,
        vec![
            (8, SequenceStatus::Gap { size: 1 }),
            (6, SequenceStatus::Sequential),
            (5, SequenceStatus::First),
        ]
    );

    let report = services.monitor().check().unwrap();
    assert_eq!(report.alert_level, "warning");
    assert_eq!(report.gap_attempts[0].attempted_draw_number, 8);
    assert_eq!(report.gap_attempts[0].expected_draw_number, 7);
    assert_eq!(report.sequence_health[0].missing_draws, vec![7]);
}

#[tokio::test]
async fn test_window_stays_bounded_through_queue() {
    let (services, _temp) = container();

    for draw in 1..=(RECENT_SPINS_LIMIT as u64 * 2 + 7) {
        services
            .gateway()
            .ingest(&json!({"winning_number": draw % 37, "draw_number": draw}))
            .await
            .unwrap();
    }
    let summary = services.queue_processor().drain_once().await;
    assert_eq!(summary.processed, RECENT_SPINS_LIMIT as u64 * 2 + 7);

    let snapshot = services.aggregator().current_snapshot().unwrap().unwrap();
    assert_eq!(snapshot.recent_spins.len(), RECENT_SPINS_LIMIT);
    assert_eq!(snapshot.high_water_draw, RECENT_SPINS_LIMIT as u64 * 2 + 7);
}

#[tokio::test]
async fn test_histogram_counts_authorized_updates_only() {
    let (services, _temp) = container();

    // Raw ingests never touch the snapshot on their own
    for draw in 1..=5u64 {
        services
            .gateway()
            .ingest(&json!({"winning_number": 7, "draw_number": draw}))
            .await
            .unwrap();
    }
    assert!(services.aggregator().current_snapshot().unwrap().is_none());

    let guard = services.guard();
    let authorized = guard.internal_context("test", "auth".to_string()).unwrap();
    let anonymous = CallerContext::anonymous("someone", "anon");
    for draw in 1..=3u64 {
        services.aggregator().update(7, draw, &authorized).await.unwrap();
        assert!(services.aggregator().update(7, draw + 10, &anonymous).await.is_err());
    }

    let snapshot = services.aggregator().current_snapshot().unwrap().unwrap();
    assert_eq!(snapshot.total_spins(), 3);
    assert_eq!(snapshot.frequency[7], 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_both_land() {
    let (services, _temp) = container();
    let guard = services.guard();

    for _ in 0..10 {
        let handles: Vec<_> = [(100u64, 3u8), (101, 26)]
            .into_iter()
            .map(|(draw, number)| {
                let aggregator = services.aggregator();
                let ctx = guard.internal_context("worker", format!("w-{draw}")).unwrap();
                tokio::spawn(async move { aggregator.update(number, draw, &ctx).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    let snapshot = services.aggregator().current_snapshot().unwrap().unwrap();
    assert_eq!(snapshot.frequency[3], 1);
    assert_eq!(snapshot.frequency[26], 1);
    assert_eq!(snapshot.high_water_draw, 101);
    assert_eq!(snapshot.total_spins(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_updates_lose_nothing() {
    let (services, _temp) = container();
    let guard = services.guard();

    let handles: Vec<_> = (1..=40u64)
        .map(|draw| {
            let aggregator = services.aggregator();
            let ctx = guard.internal_context("worker", format!("w-{draw}")).unwrap();
            tokio::spawn(async move { aggregator.update((draw % 37) as u8, draw, &ctx).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let snapshot = services.aggregator().current_snapshot().unwrap().unwrap();
    assert_eq!(snapshot.total_spins(), 40);
    assert_eq!(snapshot.high_water_draw, 40);
}

#[tokio::test]
async fn test_unauthorized_update_leaves_snapshot_unchanged() {
    let (services, _temp) = container();
    let guard = services.guard();
    let ctx = guard.internal_context("test", "setup".to_string()).unwrap();
    services.aggregator().update(9, 1, &ctx).await.unwrap();
    let before = services.aggregator().current_snapshot().unwrap().unwrap();

    let intruder = CallerContext::anonymous("198.51.100.4", "intrusion");
    let result = services.aggregator().update(30, 2, &intruder).await;

    assert!(matches!(
        result,
        Err(DrawGuardError::Authorization(AuthorizationError::Unauthorized { .. }))
    ));
    assert_eq!(services.aggregator().current_snapshot().unwrap().unwrap(), before);

    let records = guard.forensic().recent();
    let entry = records.last().unwrap();
    assert_eq!(entry.caller, "198.51.100.4");
    assert_eq!(entry.payload["winning_number"], 30);
    assert_eq!(entry.request_id, "intrusion");
}

#[tokio::test]
async fn test_out_of_band_write_reverted() {
    let (services, _temp) = container();

    let mut forged = AnalyticsSnapshot::baseline();
    for draw in 1..=5u64 {
        forged.record_spin(0, draw);
    }
    services
        .storage()
        .put(SNAPSHOT_KEY, &serde_json::to_vec(&forged).unwrap())
        .unwrap();

    let ctx = CallerContext::anonymous("tamper-detector", "scheduled");
    match services.tamper().check(&ctx).await.unwrap() {
        TamperCheck::Reverted(event) => assert_eq!(event.detected_state["high_water_draw"], 5),
        other => panic!("Expected revert, got {other:?}"),
    }
    assert!(services.aggregator().current_snapshot().unwrap().unwrap().is_baseline());
    assert_eq!(services.metrics().tamper_events.get(), 1);

    // Legitimate updates after the revert are sealed and survive the next check
    let guard = services.guard();
    let authorized = guard.internal_context("test", "after".to_string()).unwrap();
    services.aggregator().update(19, 6, &authorized).await.unwrap();
    assert_eq!(services.tamper().check(&ctx).await.unwrap(), TamperCheck::Clean);
}
