//! Domain types shared by the ingestion, analytics and monitoring paths

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest pocket on a single-zero wheel
pub const MAX_WINNING_NUMBER: u8 = 36;

/// Number of frequency buckets (0..=36)
pub const POCKET_COUNT: usize = MAX_WINNING_NUMBER as usize + 1;

/// Upper bound on the rolling window of recent spins
pub const RECENT_SPINS_LIMIT: usize = 50;

const RED_POCKETS: [u8; 18] = [1, 3, 5, 7, 9, 12, 14, 16, 18, 19, 21, 23, 25, 27, 30, 32, 34, 36];

/// Pocket color
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DrawColor {
    Red,
    Black,
    Green,
}

impl DrawColor {
    /// Color of a pocket; callers validate the range first
    pub fn for_number(winning_number: u8) -> Self {
        if winning_number == 0 {
            DrawColor::Green
        } else if RED_POCKETS.contains(&winning_number) {
            DrawColor::Red
        } else {
            DrawColor::Black
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DrawColor::Red => "red",
            DrawColor::Black => "black",
            DrawColor::Green => "green",
        }
    }
}

impl fmt::Display for DrawColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored draw. Immutable once written to the canonical store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DrawEvent {
    /// Store-assigned insert id (arrival order)
    pub id: u64,
    pub draw_number: u64,
    pub winning_number: u8,
    pub color: DrawColor,
    pub timestamp: DateTime<Utc>,
}

/// Side-effect job created by the ingestion gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub winning_number: u8,
    pub draw_number: u64,
    pub color: DrawColor,
    pub timestamp: DateTime<Utc>,
    /// Unix seconds with sub-second precision
    pub queued_at: f64,
    #[serde(default)]
    pub attempts: u32,
}

/// The single rolling analytics aggregate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalyticsSnapshot {
    /// Most recent first, at most [`RECENT_SPINS_LIMIT`] entries
    pub recent_spins: Vec<u8>,
    /// Index is the pocket number
    pub frequency: Vec<u64>,
    pub high_water_draw: u64,
    pub last_updated: DateTime<Utc>,
    /// Bumped on every committed update
    #[serde(default)]
    pub version: u64,
}

impl AnalyticsSnapshot {
    /// Empty window, zeroed histogram, no draws seen
    pub fn baseline() -> Self {
        Self {
            recent_spins: Vec::new(),
            frequency: vec![0; POCKET_COUNT],
            high_water_draw: 0,
            last_updated: Utc::now(),
            version: 0,
        }
    }

    /// True only for the untouched aggregate: no window, no counts, never committed
    pub fn is_baseline(&self) -> bool {
        self.version == 0
            && self.high_water_draw == 0
            && self.recent_spins.is_empty()
            && self.frequency.iter().all(|&count| count == 0)
    }

    pub fn total_spins(&self) -> u64 {
        self.frequency.iter().sum()
    }

    /// Apply one spin in place
    pub fn record_spin(&mut self, winning_number: u8, draw_number: u64) {
        if self.frequency.len() < POCKET_COUNT {
            self.frequency.resize(POCKET_COUNT, 0);
        }
        self.recent_spins.insert(0, winning_number);
        self.recent_spins.truncate(RECENT_SPINS_LIMIT);
        self.frequency[winning_number as usize] += 1;
        self.high_water_draw = self.high_water_draw.max(draw_number);
        self.last_updated = Utc::now();
        self.version += 1;
    }
}

/// Classification of one draw relative to its predecessor by draw number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    First,
    Sequential,
    Gap { size: u64 },
}

impl SequenceStatus {
    /// Classify `current` given the previous draw number, if any
    pub fn classify(previous: Option<u64>, current: u64) -> Self {
        match previous {
            None => SequenceStatus::First,
            Some(prev) if current == prev + 1 => SequenceStatus::Sequential,
            Some(prev) => SequenceStatus::Gap {
                size: current.saturating_sub(prev).saturating_sub(1),
            },
        }
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, SequenceStatus::Gap { .. })
    }
}

impl fmt::Display for SequenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceStatus::First => f.write_str("FIRST"),
            SequenceStatus::Sequential => f.write_str("SEQUENTIAL"),
            SequenceStatus::Gap { size } => write!(f, "GAP: {} missing", size),
        }
    }
}

impl Serialize for SequenceStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A recorded non-sequential transition. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GapRecord {
    pub attempted_draw_number: u64,
    pub expected_draw_number: u64,
    pub gap_size: u64,
    pub timestamp: DateTime<Utc>,
    pub source_identifier: String,
}

/// Derived health view over one draw source, recomputed on read
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequenceHealth {
    pub source_identifier: String,
    pub total_draws: u64,
    pub min_draw: Option<u64>,
    pub max_draw: Option<u64>,
    pub expected_draws: u64,
    pub missing_count: u64,
    pub missing_draws: Vec<u64>,
    pub recent_gap_count: usize,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_for_every_pocket() {
        let mut red = 0;
        let mut black = 0;
        for n in 0..=MAX_WINNING_NUMBER {
            match DrawColor::for_number(n) {
                DrawColor::Green => assert_eq!(n, 0),
                DrawColor::Red => {
                    assert!(RED_POCKETS.contains(&n));
                    red += 1;
                }
                DrawColor::Black => {
                    assert!(!RED_POCKETS.contains(&n));
                    black += 1;
                }
            }
            // Pure function: same answer twice
            assert_eq!(DrawColor::for_number(n), DrawColor::for_number(n));
        }
        assert_eq!(red, 18);
        assert_eq!(black, 18);
    }

    #[test]
    fn test_color_spot_checks() {
        assert_eq!(DrawColor::for_number(0), DrawColor::Green);
        assert_eq!(DrawColor::for_number(1), DrawColor::Red);
        assert_eq!(DrawColor::for_number(2), DrawColor::Black);
        assert_eq!(DrawColor::for_number(10), DrawColor::Black);
        assert_eq!(DrawColor::for_number(11), DrawColor::Black);
        assert_eq!(DrawColor::for_number(12), DrawColor::Red);
        assert_eq!(DrawColor::for_number(28), DrawColor::Black);
        assert_eq!(DrawColor::for_number(36), DrawColor::Red);
        assert_eq!(serde_json::to_string(&DrawColor::Green).unwrap(), "\"green\"");
    }

    #[test]
    fn test_sequence_classification() {
        assert_eq!(SequenceStatus::classify(None, 5), SequenceStatus::First);
        assert_eq!(SequenceStatus::classify(Some(5), 6), SequenceStatus::Sequential);
        assert_eq!(SequenceStatus::classify(Some(6), 8), SequenceStatus::Gap { size: 1 });
        assert_eq!(SequenceStatus::classify(Some(10), 20).to_string(), "GAP: 9 missing");
        assert_eq!(SequenceStatus::Sequential.to_string(), "SEQUENTIAL");
    }

    #[test]
    fn test_baseline_requires_zeroed_histogram() {
        let mut snapshot = AnalyticsSnapshot::baseline();
        snapshot.frequency[17] = 1;
        assert!(!snapshot.is_baseline());

        let mut snapshot = AnalyticsSnapshot::baseline();
        snapshot.version = 3;
        assert!(!snapshot.is_baseline());
    }

    #[test]
    fn test_snapshot_window_is_bounded() {
        let mut snapshot = AnalyticsSnapshot::baseline();
        assert!(snapshot.is_baseline());

        for draw in 1..=120u64 {
            snapshot.record_spin((draw % 37) as u8, draw);
            assert!(snapshot.recent_spins.len() <= RECENT_SPINS_LIMIT);
        }

        assert_eq!(snapshot.recent_spins.len(), RECENT_SPINS_LIMIT);
        assert_eq!(snapshot.recent_spins[0], (120 % 37) as u8);
        assert_eq!(snapshot.total_spins(), 120);
        assert_eq!(snapshot.high_water_draw, 120);
        assert_eq!(snapshot.version, 120);
    }

    #[test]
    fn test_high_water_never_decreases() {
        let mut snapshot = AnalyticsSnapshot::baseline();
        snapshot.record_spin(7, 40);
        snapshot.record_spin(8, 12);
        assert_eq!(snapshot.high_water_draw, 40);
        assert_eq!(snapshot.recent_spins, vec![8, 7]);
    }
}
