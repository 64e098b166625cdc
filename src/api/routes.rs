//! Route Definitions
//!
//! The ingest, health and metrics routes stay outside the access guard.
//! Everything else passes through it.

use super::{handlers::*, middleware::access_guard_middleware};
use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Build the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    let open = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        // Ingestion favors latency; authorization happens at the aggregator
        .route("/draws", post(ingest_handler));

    let guarded = Router::new()
        .route("/gap-alert", get(gap_alert_handler))
        .route("/draw-sync", get(draw_sync_handler))
        .route("/analytics", get(analytics_read_handler).post(analytics_update_handler))
        .route("/analytics/tamper-check", post(tamper_check_handler))
        .route_layer(from_fn_with_state(state.clone(), access_guard_middleware));

    open.merge(guarded).with_state(state)
}
