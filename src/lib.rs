//! DrawGuard - roulette draw ingestion and analytics core
//!
//! Ingests draws on a low-latency path, keeps the draw sequence auditable for
//! gaps, and maintains one rolling analytics snapshot that only authorized
//! callers can change.

pub mod analytics;
pub mod api;
pub mod config;
pub mod draw_store;
pub mod errors;
pub mod ingestion;
pub mod metrics;
pub mod queue;
pub mod security;
pub mod sequence;
pub mod services;
pub mod storage;
pub mod tamper;
pub mod types;

pub use analytics::{AnalyticsAggregator, UpdateOutcome};
pub use config::{ConfigLoader, DrawGuardConfig};
pub use errors::{DrawGuardError, DrawGuardResult};
pub use security::{AccessGuard, AuthorizationToken, CallerContext};
pub use services::ServiceContainer;
pub use types::{AnalyticsSnapshot, DrawColor, DrawEvent, GapRecord, SequenceHealth, SequenceStatus};
