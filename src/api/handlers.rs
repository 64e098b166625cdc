//! Request Handlers
//!
//! Thin adapters between HTTP and the draw pipeline. Storage-bound work runs
//! on the blocking pool.

use super::{
    errors::ApiError,
    middleware::{caller_identity, RequestId},
    models::*,
};
use crate::{
    errors::{DrawGuardError, StorageError},
    ingestion::{self, IngestReceipt},
    security::{AuthorizationToken, CallerContext},
    services::ServiceContainer,
    tamper::TamperCheck,
};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Shared application state
pub struct AppState {
    pub services: Arc<ServiceContainer>,
    pub version: String,
}

impl AppState {
    pub fn new(services: Arc<ServiceContainer>) -> Self {
        Self {
            services,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Run a storage-bound closure off the async workers, bounded by the read timeout
async fn blocking<T, F>(state: &AppState, request_id: &str, op: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    let services = &state.services;
    services
        .storage()
        .run_blocking(services.config().read_timeout(), move |_| op())
        .await
        .map_err(|e| ApiError::from_domain(request_id.to_string(), e.into()))
}

fn parse_json(request_id: &str, body: &Bytes) -> Result<serde_json::Value, ApiError> {
    serde_json::from_slice(body).map_err(|_| ApiError::bad_request(request_id.to_string(), "Invalid JSON body"))
}

/// Health check handler
/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Running".to_string(),
        version: state.version.clone(),
        queue_depth: state.services.metrics().queue_depth.get(),
    })
}

/// Prometheus exposition
/// GET /metrics
pub async fn metrics_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let text = state
        .services
        .metrics()
        .gather()
        .map_err(|e| ApiError::from_domain(request_id.0, e))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response())
}

/// Ingest one draw
/// POST /draws
pub async fn ingest_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<IngestReceipt>, ApiError> {
    let payload = parse_json(&request_id.0, &body)?;
    state
        .services
        .gateway()
        .ingest(&payload)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_domain(request_id.0, e))
}

/// Gap alert surface
/// GET /gap-alert?action=check|latest_draws
pub async fn gap_alert_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Query(params): Query<GapAlertQuery>,
) -> Result<Response, ApiError> {
    let monitor = state.services.monitor();

    match params.action.as_str() {
        "check" => {
            let report = blocking(&state, &request_id.0, move || monitor.check()).await?;
            Ok(Json(GapCheckResponse::from_report(report)).into_response())
        }
        "latest_draws" => {
            let latest_draws = blocking(&state, &request_id.0, move || monitor.latest_draws()).await?;
            Ok(Json(LatestDrawsResponse {
                status: "success",
                latest_draws,
                timestamp: display_timestamp(Utc::now()),
            })
            .into_response())
        }
        _ => Err(ApiError::bad_request(request_id.0, "Invalid action")),
    }
}

/// Current and next draw numbers plus analytics
/// GET /draw-sync
pub async fn draw_sync_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<DrawSyncResponse>, ApiError> {
    let draws = state.services.draws().clone();
    let aggregator = state.services.aggregator();

    let (current, snapshot) = blocking(&state, &request_id.0, move || {
        Ok((draws.max_draw_number()?.unwrap_or(0), aggregator.current_snapshot()?))
    })
    .await?;

    let analytics = match snapshot {
        Some(snapshot) => serde_json::to_value(snapshot)
            .map_err(|e| ApiError::from_domain(request_id.0.clone(), StorageError::from(e).into()))?,
        None => serde_json::json!({}),
    };

    Ok(Json(DrawSyncResponse {
        success: true,
        current_draw: current,
        next_draw: current + 1,
        analytics,
    }))
}

/// Fresh read of the analytics snapshot
/// GET /analytics
pub async fn analytics_read_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<AnalyticsResponse>, ApiError> {
    let aggregator = state.services.aggregator();
    let analytics = blocking(&state, &request_id.0, move || aggregator.current_snapshot()).await?;
    Ok(Json(AnalyticsResponse {
        status: "success",
        analytics,
    }))
}

/// Privileged analytics update
/// POST /analytics
pub async fn analytics_update_handler(
    Extension(request_id): Extension<RequestId>,
    token: Option<Extension<AuthorizationToken>>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AnalyticsUpdateResponse>, ApiError> {
    let payload = parse_json(&request_id.0, &body)?;
    let draw = ingestion::validate(&payload).map_err(|e| ApiError::from_domain(request_id.0.clone(), e.into()))?;
    let source = payload.get("source").and_then(|s| s.as_str()).unwrap_or("api");

    let mut ctx = CallerContext::anonymous(caller_identity(&headers), request_id.0.clone());
    if let Some(Extension(token)) = token {
        ctx = ctx.with_token(token);
    }

    let outcome = state
        .services
        .aggregator()
        .update(draw.winning_number, draw.draw_number, &ctx)
        .await
        .map_err(|e: DrawGuardError| ApiError::from_domain(request_id.0.clone(), e))?;

    info!(
        request_id = %request_id.0,
        draw_number = draw.draw_number,
        applied = outcome.applied(),
        source,
        "Analytics update via API"
    );

    Ok(Json(AnalyticsUpdateResponse {
        status: "success",
        applied: outcome.applied(),
        snapshot: outcome.snapshot().clone(),
    }))
}

/// Run the tamper detector now
/// POST /analytics/tamper-check
pub async fn tamper_check_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<TamperCheckResponse>, ApiError> {
    // The caller's token authorizes the trigger, not the snapshot state
    let ctx = CallerContext::anonymous("tamper-detector", request_id.0.clone());
    let check = state
        .services
        .tamper()
        .check(&ctx)
        .await
        .map_err(|e| ApiError::from_domain(request_id.0.clone(), e))?;

    let (result, detected_state) = match check {
        TamperCheck::Clean => ("clean", None),
        TamperCheck::Skipped => ("skipped", None),
        TamperCheck::Reverted(event) => ("reverted", Some(event.detected_state)),
    };

    Ok(Json(TamperCheckResponse {
        status: "success",
        result,
        detected_state,
        timestamp: Utc::now(),
    }))
}
