//! API Data Models
//!
//! Request and response shapes. Field names are part of the wire contract.

use crate::{
    sequence::{ClassifiedDraw, GapCheckReport},
    types::{AnalyticsSnapshot, GapRecord, SequenceHealth},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub queue_depth: i64,
}

/// Gap alert query parameters
#[derive(Debug, Deserialize)]
pub struct GapAlertQuery {
    #[serde(default = "default_action")]
    pub action: String,
}

fn default_action() -> String {
    "check".to_string()
}

/// `?action=check`
#[derive(Debug, Clone, Serialize)]
pub struct GapCheckResponse {
    pub status: &'static str,
    pub gap_attempts: Vec<GapRecord>,
    pub sequence_health: Vec<SequenceHealth>,
    pub alert_level: &'static str,
    pub timestamp: String,
}

impl GapCheckResponse {
    pub fn from_report(report: GapCheckReport) -> Self {
        Self {
            status: "success",
            gap_attempts: report.gap_attempts,
            sequence_health: report.sequence_health,
            alert_level: report.alert_level,
            timestamp: display_timestamp(Utc::now()),
        }
    }
}

/// `?action=latest_draws`
#[derive(Debug, Clone, Serialize)]
pub struct LatestDrawsResponse {
    pub status: &'static str,
    pub latest_draws: Vec<ClassifiedDraw>,
    pub timestamp: String,
}

/// Current and next draw for display clients
#[derive(Debug, Clone, Serialize)]
pub struct DrawSyncResponse {
    pub success: bool,
    #[serde(rename = "currentDraw")]
    pub current_draw: u64,
    #[serde(rename = "nextDraw")]
    pub next_draw: u64,
    /// Snapshot, or `{}` when none exists yet
    pub analytics: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsResponse {
    pub status: &'static str,
    pub analytics: Option<AnalyticsSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsUpdateResponse {
    pub status: &'static str,
    /// False when the draw had already been counted
    pub applied: bool,
    pub snapshot: AnalyticsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct TamperCheckResponse {
    pub status: &'static str,
    /// clean, skipped or reverted
    pub result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_state: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// `YYYY-MM-DD HH:MM:SS` in UTC
pub fn display_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}
