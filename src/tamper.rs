//! Tamper detector
//!
//! A snapshot that differs from baseline must carry a valid seal, which only
//! the aggregator's authorized transaction writes. Anything else was written
//! around the aggregator and is reverted to baseline.
//!
//! The check locks the snapshot row, so it serializes with in-flight
//! authorized updates instead of racing them. Applied markers survive a
//! revert: draws counted before the revert are not counted again.

use crate::{
    analytics::{SnapshotSealer, SEAL_KEY, SNAPSHOT_KEY},
    errors::{DrawGuardResult, StorageError},
    metrics::DrawGuardMetrics,
    security::{CallerContext, ForensicLog, ForensicRecord},
    storage::DrawStorage,
    types::AnalyticsSnapshot,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Outcome of one tamper check
#[derive(Debug, Clone, PartialEq)]
pub enum TamperCheck {
    /// Snapshot missing, at baseline, or sealed
    Clean,
    /// The checking context holds an authorization token
    Skipped,
    Reverted(TamperEvent),
}

/// What the detector found before reverting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TamperEvent {
    pub detected_state: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

pub struct TamperDetector {
    storage: DrawStorage,
    sealer: SnapshotSealer,
    forensic: Arc<ForensicLog>,
    metrics: DrawGuardMetrics,
    timeout: Duration,
}

impl TamperDetector {
    pub fn new(
        storage: DrawStorage,
        sealer: SnapshotSealer,
        forensic: Arc<ForensicLog>,
        metrics: DrawGuardMetrics,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            sealer,
            forensic,
            metrics,
            timeout,
        }
    }

    pub async fn check(&self, ctx: &CallerContext) -> DrawGuardResult<TamperCheck> {
        if ctx.is_authorized() {
            debug!(request_id = %ctx.request_id, "Tamper check skipped for authorized context");
            return Ok(TamperCheck::Skipped);
        }

        let sealer = self.sealer.clone();
        let detected = self
            .storage
            .run_blocking(self.timeout, move |storage| revert_if_unsealed(storage, &sealer))
            .await?;

        let Some(detected_state) = detected else {
            return Ok(TamperCheck::Clean);
        };

        let event = TamperEvent {
            detected_state,
            timestamp: Utc::now(),
        };
        self.metrics.tamper_events.inc();
        warn!(
            target: "drawguard::forensic",
            detected_state = %event.detected_state,
            timestamp = %event.timestamp,
            "⚠️  Analytics tamper detected, snapshot reverted to baseline"
        );
        self.forensic.record(ForensicRecord {
            caller: ctx.caller.clone(),
            method: "DIRECT".to_string(),
            path: String::from_utf8_lossy(SNAPSHOT_KEY).into_owned(),
            payload: event.detected_state.clone(),
            reason: "tamper_reverted".to_string(),
            request_id: ctx.request_id.clone(),
            timestamp: event.timestamp,
        });

        Ok(TamperCheck::Reverted(event))
    }
}

/// Returns the offending state when a revert was written
fn revert_if_unsealed(
    storage: &DrawStorage,
    sealer: &SnapshotSealer,
) -> Result<Option<serde_json::Value>, StorageError> {
    let baseline = serde_json::to_vec(&AnalyticsSnapshot::baseline())?;

    storage.transaction(|txn| {
        let Some(bytes) = txn.get_for_update(SNAPSHOT_KEY, true)? else {
            return Ok(None);
        };

        let detected_state = match serde_json::from_slice::<AnalyticsSnapshot>(&bytes) {
            Ok(snapshot) if snapshot.is_baseline() => return Ok(None),
            Ok(snapshot) => {
                let sealed = txn
                    .get_for_update(SEAL_KEY, true)?
                    .is_some_and(|seal| sealer.verify(&bytes, &seal));
                if sealed {
                    return Ok(None);
                }
                serde_json::to_value(&snapshot).unwrap_or(serde_json::Value::Null)
            }
            Err(_) => serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        };

        txn.put(SNAPSHOT_KEY, &baseline)?;
        txn.delete(SEAL_KEY)?;
        Ok(Some(detected_state))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analytics::AnalyticsAggregator,
        config::SecurityConfig,
        security::AccessGuard,
    };
    use tempfile::TempDir;

    struct Fixture {
        detector: TamperDetector,
        aggregator: AnalyticsAggregator,
        guard: AccessGuard,
        storage: DrawStorage,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let storage = DrawStorage::open_path(temp.path()).unwrap();
        let forensic = Arc::new(ForensicLog::new(None));
        let metrics = DrawGuardMetrics::new().unwrap();
        let sealer = SnapshotSealer::new("seal");
        let timeout = Duration::from_secs(5);
        Fixture {
            detector: TamperDetector::new(storage.clone(), sealer.clone(), forensic.clone(), metrics.clone(), timeout),
            aggregator: AnalyticsAggregator::new(storage.clone(), sealer, forensic.clone(), metrics.clone(), timeout),
            guard: AccessGuard::new(&SecurityConfig::default(), forensic, metrics),
            storage,
            _temp: temp,
        }
    }

    fn detector_ctx() -> CallerContext {
        CallerContext::anonymous("tamper-detector", "check")
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_clean() {
        let f = fixture();
        assert_eq!(f.detector.check(&detector_ctx()).await.unwrap(), TamperCheck::Clean);
    }

    #[tokio::test]
    async fn test_sealed_snapshot_is_clean() {
        let f = fixture();
        let ctx = f.guard.internal_context("test", "u1".to_string()).unwrap();
        f.aggregator.update(22, 1, &ctx).await.unwrap();

        assert_eq!(f.detector.check(&detector_ctx()).await.unwrap(), TamperCheck::Clean);
        assert_eq!(f.aggregator.current_snapshot().unwrap().unwrap().frequency[22], 1);
    }

    #[tokio::test]
    async fn test_direct_write_reverted() {
        let f = fixture();
        let mut forged = AnalyticsSnapshot::baseline();
        forged.record_spin(13, 999);
        f.storage.put(SNAPSHOT_KEY, &serde_json::to_vec(&forged).unwrap()).unwrap();

        match f.detector.check(&detector_ctx()).await.unwrap() {
            TamperCheck::Reverted(event) => assert_eq!(event.detected_state["high_water_draw"], 999),
            other => panic!("Expected revert, got {other:?}"),
        }
        assert!(f.aggregator.current_snapshot().unwrap().unwrap().is_baseline());
        assert_eq!(f.guard.forensic().recent()[0].reason, "tamper_reverted");
    }

    #[tokio::test]
    async fn test_forged_histogram_with_empty_window_reverted() {
        let f = fixture();
        let mut forged = AnalyticsSnapshot::baseline();
        forged.frequency[17] = 9999;
        f.storage.put(SNAPSHOT_KEY, &serde_json::to_vec(&forged).unwrap()).unwrap();

        match f.detector.check(&detector_ctx()).await.unwrap() {
            TamperCheck::Reverted(event) => assert_eq!(event.detected_state["frequency"][17], 9999),
            other => panic!("Expected revert, got {other:?}"),
        }
        let restored = f.aggregator.current_snapshot().unwrap().unwrap();
        assert_eq!(restored.total_spins(), 0);
        assert!(restored.is_baseline());
    }

    #[tokio::test]
    async fn test_stored_baseline_is_clean() {
        let f = fixture();
        let baseline = AnalyticsSnapshot::baseline();
        f.storage.put(SNAPSHOT_KEY, &serde_json::to_vec(&baseline).unwrap()).unwrap();

        assert_eq!(f.detector.check(&detector_ctx()).await.unwrap(), TamperCheck::Clean);
    }

    #[tokio::test]
    async fn test_edit_of_sealed_snapshot_reverted() {
        let f = fixture();
        let ctx = f.guard.internal_context("test", "u2".to_string()).unwrap();
        f.aggregator.update(4, 1, &ctx).await.unwrap();

        let mut edited = f.aggregator.current_snapshot().unwrap().unwrap();
        edited.frequency[4] = 500;
        f.storage.put(SNAPSHOT_KEY, &serde_json::to_vec(&edited).unwrap()).unwrap();

        assert!(matches!(f.detector.check(&detector_ctx()).await.unwrap(), TamperCheck::Reverted(_)));
        assert_eq!(f.storage.get(SEAL_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_authorized_context_skips() {
        let f = fixture();
        f.storage.put(SNAPSHOT_KEY, b"garbage").unwrap();
        let ctx = f.guard.internal_context("test", "u3".to_string()).unwrap();

        assert_eq!(f.detector.check(&ctx).await.unwrap(), TamperCheck::Skipped);
        assert!(matches!(f.detector.check(&detector_ctx()).await.unwrap(), TamperCheck::Reverted(_)));
    }
}
