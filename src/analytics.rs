//! Analytics aggregator
//!
//! Owns the single rolling [`AnalyticsSnapshot`]. Each update is one
//! pessimistic transaction over the snapshot row that:
//!
//! 1. locks and reads the snapshot (baseline if absent)
//! 2. skips the draw if its applied marker already exists
//! 3. applies the spin, then writes the snapshot, its seal and the marker
//!
//! Concurrent updates queue on the row lock instead of overwriting each other.
//! The seal lets the tamper detector tell committed state from direct writes.

use crate::{
    errors::{AuthorizationError, DrawGuardResult, StorageError, ValidationError},
    metrics::DrawGuardMetrics,
    security::{AccessAttempt, CallerContext, ForensicLog, ForensicRecord},
    storage::{numbered_key, DrawStorage},
    types::{AnalyticsSnapshot, MAX_WINNING_NUMBER},
};
use sha2::{Digest, Sha256};
use std::{sync::Arc, time::Duration};
use tracing::debug;

pub const SNAPSHOT_KEY: &[u8] = b"analytics:snapshot";
pub const SEAL_KEY: &[u8] = b"analytics:seal";
const APPLIED_PREFIX: &[u8] = b"analytics:applied:";

/// Result of an authorized update
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied(AnalyticsSnapshot),
    /// Draw was counted before; snapshot unchanged
    AlreadyApplied(AnalyticsSnapshot),
}

impl UpdateOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied(_))
    }

    pub fn snapshot(&self) -> &AnalyticsSnapshot {
        match self {
            UpdateOutcome::Applied(s) | UpdateOutcome::AlreadyApplied(s) => s,
        }
    }
}

/// Keyed SHA-256 over the stored snapshot bytes
#[derive(Clone)]
pub struct SnapshotSealer {
    key: Arc<Vec<u8>>,
}

impl SnapshotSealer {
    pub fn new(key: &str) -> Self {
        Self {
            key: Arc::new(key.as_bytes().to_vec()),
        }
    }

    pub fn seal(&self, snapshot_bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_slice());
        hasher.update(snapshot_bytes);
        hex::encode(hasher.finalize())
    }

    pub fn verify(&self, snapshot_bytes: &[u8], seal: &[u8]) -> bool {
        self.seal(snapshot_bytes).as_bytes() == seal
    }
}

enum TxnStep {
    Applied(AnalyticsSnapshot),
    Duplicate(AnalyticsSnapshot),
    Corrupted(String),
}

pub struct AnalyticsAggregator {
    storage: DrawStorage,
    sealer: SnapshotSealer,
    forensic: Arc<ForensicLog>,
    metrics: DrawGuardMetrics,
    timeout: Duration,
}

impl AnalyticsAggregator {
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

    /// Apply one spin to the snapshot on behalf of `ctx`
    pub async fn update(
        &self,
        winning_number: u8,
        draw_number: u64,
        ctx: &CallerContext,
    ) -> DrawGuardResult<UpdateOutcome> {
        if !ctx.is_authorized() {
            self.metrics.auth_rejections.inc();
            self.forensic.record(ForensicRecord::from_attempt(
                &AccessAttempt {
                    caller: ctx.caller.clone(),
                    method: "CALL".to_string(),
                    path: "analytics:update".to_string(),
                    payload: serde_json::json!({
                        "winning_number": winning_number,
                        "draw_number": draw_number,
                    }),
                    request_id: ctx.request_id.clone(),
                },
                "update without authorization token",
            ));
            return Err(AuthorizationError::Unauthorized {
                caller: ctx.caller.clone(),
            }
            .into());
        }
        if winning_number > MAX_WINNING_NUMBER {
            return Err(ValidationError::WinningNumberOutOfRange(winning_number as i64).into());
        }
        if draw_number < 1 {
            return Err(ValidationError::DrawNumberOutOfRange(0).into());
        }

        let sealer = self.sealer.clone();
        let step = self
            .storage
            .run_blocking(self.timeout, move |storage| {
                apply_in_transaction(storage, &sealer, winning_number, draw_number)
            })
            .await?;

        match step {
            TxnStep::Applied(snapshot) => {
                self.metrics.analytics_applied.inc();
                debug!(
                    draw_number,
                    winning_number,
                    version = snapshot.version,
                    request_id = %ctx.request_id,
                    "Analytics snapshot updated"
                );
                Ok(UpdateOutcome::Applied(snapshot))
            }
            TxnStep::Duplicate(snapshot) => {
                self.metrics.analytics_duplicates.inc();
                debug!(draw_number, "Draw already counted in analytics");
                Ok(UpdateOutcome::AlreadyApplied(snapshot))
            }
            TxnStep::Corrupted(reason) => Err(StorageError::CorruptedData(reason).into()),
        }
    }

    /// Latest persisted snapshot, read straight from the store
    pub fn current_snapshot(&self) -> Result<Option<AnalyticsSnapshot>, StorageError> {
        self.storage
            .get(SNAPSHOT_KEY)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(StorageError::from))
            .transpose()
    }

    pub fn is_applied(&self, draw_number: u64) -> Result<bool, StorageError> {
        Ok(self.storage.get(&numbered_key(APPLIED_PREFIX, draw_number))?.is_some())
    }
}

fn apply_in_transaction(
    storage: &DrawStorage,
    sealer: &SnapshotSealer,
    winning_number: u8,
    draw_number: u64,
) -> Result<TxnStep, StorageError> {
    let marker_key = numbered_key(APPLIED_PREFIX, draw_number);

    storage.transaction(|txn| {
        let mut snapshot = match txn.get_for_update(SNAPSHOT_KEY, true)? {
            Some(bytes) => match serde_json::from_slice::<AnalyticsSnapshot>(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => return Ok(TxnStep::Corrupted(format!("analytics snapshot: {}", e))),
            },
            None => AnalyticsSnapshot::baseline(),
        };

        if txn.get_for_update(&marker_key, true)?.is_some() {
            return Ok(TxnStep::Duplicate(snapshot));
        }

        snapshot.record_spin(winning_number, draw_number);
        let encoded = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => return Ok(TxnStep::Corrupted(e.to_string())),
        };

        txn.put(SNAPSHOT_KEY, &encoded)?;
        txn.put(SEAL_KEY, sealer.seal(&encoded))?;
        txn.put(&marker_key, [winning_number])?;
        Ok(TxnStep::Applied(snapshot))
    })
}
