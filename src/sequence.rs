//! Sequence integrity monitor
//!
//! Classifies consecutive draws by draw number (never arrival order) and
//! records each non-sequential transition once as a [`GapRecord`]. Gap
//! records are keyed by detection time so the trailing-window query is a
//! single forward scan.

use crate::{
    draw_store::DrawStore,
    errors::StorageError,
    metrics::DrawGuardMetrics,
    storage::DrawStorage,
    types::{DrawEvent, GapRecord, SequenceHealth, SequenceStatus},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

const GAP_RECORD_PREFIX: &[u8] = b"gap:record:";
const GAP_SEEN_PREFIX: &[u8] = b"gap:seen:";

/// Source tag on gap records and health rows for the canonical store
pub const CANONICAL_SOURCE: &str = "canonical_draws";

pub const GAP_ATTEMPTS_LIMIT: usize = 10;
pub const LATEST_DRAWS_LIMIT: usize = 10;
/// Missing draw numbers listed per health row unless configured otherwise
pub const DEFAULT_MISSING_LIMIT: usize = 100;

/// One draw annotated with its transition from the previous draw number
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedDraw {
    pub draw_number: u64,
    pub winning_number: u8,
    pub color: crate::types::DrawColor,
    pub timestamp: DateTime<Utc>,
    pub sequence_status: SequenceStatus,
}

/// Alert surface answer
#[derive(Debug, Clone, Serialize)]
pub struct GapCheckReport {
    pub gap_attempts: Vec<GapRecord>,
    pub sequence_health: Vec<SequenceHealth>,
    pub alert_level: &'static str,
}

/// Summary of one scan pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSummary {
    pub inspected: usize,
    pub gaps_seen: usize,
    pub gaps_recorded: usize,
}

pub struct SequenceIntegrityMonitor {
    draws: DrawStore,
    storage: DrawStorage,
    metrics: DrawGuardMetrics,
    scan_depth: usize,
    window: Duration,
    missing_limit: usize,
}

impl SequenceIntegrityMonitor {
    pub fn new(
        draws: DrawStore,
        storage: DrawStorage,
        metrics: DrawGuardMetrics,
        scan_depth: usize,
        window: Duration,
    ) -> Self {
        Self {
            draws,
            storage,
            metrics,
            scan_depth,
            window,
            missing_limit: DEFAULT_MISSING_LIMIT,
        }
    }

    pub fn with_missing_limit(mut self, limit: usize) -> Self {
        self.missing_limit = limit;
        self
    }

    /// Classify the most recent `scan_depth` draws and record new gaps
    pub fn scan(&self) -> Result<ScanSummary, StorageError> {
        let classified = self.classify_latest(self.scan_depth)?;
        let mut summary = ScanSummary {
            inspected: classified.len(),
            ..Default::default()
        };

        for (previous, draw) in &classified {
            if let (Some(previous), SequenceStatus::Gap { size }) = (previous, draw.sequence_status) {
                summary.gaps_seen += 1;
                if self.record_gap(*previous, draw.draw_number, size)? {
                    summary.gaps_recorded += 1;
                }
            }
        }

        if summary.gaps_recorded > 0 {
            warn!(
                gaps = summary.gaps_recorded,
                inspected = summary.inspected,
                "⚠️  Draw sequence gaps detected"
            );
        } else {
            debug!(inspected = summary.inspected, "Sequence scan clean");
        }
        Ok(summary)
    }

    /// Rescan, then report gaps inside the trailing window plus current health
    pub fn check(&self) -> Result<GapCheckReport, StorageError> {
        self.scan()?;

        let recent = self.gaps_in_window()?;
        let health = self.health(recent.len())?;
        let alert_level = if recent.is_empty() { "normal" } else { "warning" };

        Ok(GapCheckReport {
            gap_attempts: recent.into_iter().take(GAP_ATTEMPTS_LIMIT).collect(),
            sequence_health: vec![health],
            alert_level,
        })
    }

    /// Last draws by draw number, newest first, each with its sequence status
    pub fn latest_draws(&self) -> Result<Vec<ClassifiedDraw>, StorageError> {
        let mut classified: Vec<ClassifiedDraw> = self
            .classify_latest(LATEST_DRAWS_LIMIT)?
            .into_iter()
            .map(|(_, draw)| draw)
            .collect();
        classified.reverse();
        Ok(classified)
    }

    /// Gap records detected within the trailing window, newest first
    pub fn gaps_in_window(&self) -> Result<Vec<GapRecord>, StorageError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::hours(1));
        let mut start = GAP_RECORD_PREFIX.to_vec();
        start.extend_from_slice(&(cutoff.timestamp_millis().max(0) as u64).to_be_bytes());

        let mut records = self
            .storage
            .scan_prefix(GAP_RECORD_PREFIX, Some(&start), usize::MAX)?
            .into_iter()
            .map(|(_, value)| serde_json::from_slice::<GapRecord>(&value).map_err(StorageError::from))
            .collect::<Result<Vec<_>, _>>()?;
        records.retain(|record| record.timestamp >= cutoff);
        records.reverse();
        Ok(records)
    }

    /// Full-range view over the canonical store.
    ///
    /// `missing_count` covers the whole range; `missing_draws` lists at most
    /// `missing_limit` of them, lowest first.
    pub fn health(&self, recent_gap_count: usize) -> Result<SequenceHealth, StorageError> {
        let mut total_draws = 0u64;
        let mut min_draw = None;
        let mut previous: Option<u64> = None;
        let mut missing_draws = Vec::new();

        self.draws.for_each_draw_number(|number| {
            total_draws += 1;
            if min_draw.is_none() {
                min_draw = Some(number);
            }
            if let Some(previous) = previous {
                collect_missing(previous, number, self.missing_limit, &mut missing_draws);
            }
            previous = Some(number);
        })?;

        let max_draw = previous;
        let expected_draws = match (min_draw, max_draw) {
            (Some(min), Some(max)) => max - min + 1,
            _ => 0,
        };
        let missing_count = expected_draws.saturating_sub(total_draws);

        let status = if missing_count > 0 {
            "GAPS_DETECTED"
        } else if recent_gap_count > 0 {
            "RECENT_GAPS"
        } else {
            "HEALTHY"
        };

        Ok(SequenceHealth {
            source_identifier: CANONICAL_SOURCE.to_string(),
            total_draws,
            min_draw,
            max_draw,
            expected_draws,
            missing_count,
            missing_draws,
            recent_gap_count,
            status: status.to_string(),
        })
    }

    /// Newest `limit` draws in ascending order, classified against the draw
    /// just below the window when one exists
    fn classify_latest(&self, limit: usize) -> Result<Vec<(Option<u64>, ClassifiedDraw)>, StorageError> {
        let mut draws: Vec<DrawEvent> = self.draws.latest_by_number(limit + 1)?;
        draws.reverse();

        let mut previous = if draws.len() > limit {
            Some(draws.remove(0).draw_number)
        } else {
            None
        };

        Ok(draws
            .into_iter()
            .map(|draw| {
                let status = SequenceStatus::classify(previous, draw.draw_number);
                let entry = (
                    previous,
                    ClassifiedDraw {
                        draw_number: draw.draw_number,
                        winning_number: draw.winning_number,
                        color: draw.color,
                        timestamp: draw.timestamp,
                        sequence_status: status,
                    },
                );
                previous = Some(draw.draw_number);
                entry
            })
            .collect())
    }

    /// Store a gap record unless this transition was recorded before
    fn record_gap(&self, previous: u64, current: u64, gap_size: u64) -> Result<bool, StorageError> {
        let mut seen_key = GAP_SEEN_PREFIX.to_vec();
        seen_key.extend_from_slice(&previous.to_be_bytes());
        seen_key.extend_from_slice(&current.to_be_bytes());

        let record = GapRecord {
            attempted_draw_number: current,
            expected_draw_number: previous + 1,
            gap_size,
            timestamp: Utc::now(),
            source_identifier: CANONICAL_SOURCE.to_string(),
        };
        let mut record_key = GAP_RECORD_PREFIX.to_vec();
        record_key.extend_from_slice(&(record.timestamp.timestamp_millis().max(0) as u64).to_be_bytes());
        record_key.extend_from_slice(&previous.to_be_bytes());
        record_key.extend_from_slice(&current.to_be_bytes());
        let encoded = serde_json::to_vec(&record)?;

        let recorded = self.storage.transaction(|txn| {
            if txn.get_for_update(&seen_key, true)?.is_some() {
                return Ok(false);
            }
            txn.put(&seen_key, &record_key)?;
            txn.put(&record_key, &encoded)?;
            Ok(true)
        })?;

        if recorded {
            self.metrics.gaps_recorded.inc();
            warn!(
                attempted_draw_number = current,
                expected_draw_number = previous + 1,
                gap_size,
                source = CANONICAL_SOURCE,
                "Draw sequence gap recorded"
            );
        }
        Ok(recorded)
    }
}

/// Append the numbers strictly between `previous` and `current` until `out` holds `limit`
fn collect_missing(previous: u64, current: u64, limit: usize, out: &mut Vec<u64>) {
    let room = limit.saturating_sub(out.len()) as u64;
    let end = current.min(previous.saturating_add(1).saturating_add(room));
    out.extend((previous + 1)..end);
}
