//! Middleware Components
//!
//! CORS, request tracking and the analytics access guard.

use super::{errors::ApiError, handlers::AppState};
use crate::security::AccessAttempt;
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer, ExposeHeaders};
use uuid::Uuid;

/// Request ID header key
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Header carrying the analytics update key
pub const ANALYTICS_KEY_HEADER: &str = "x-analytics-key";

/// Largest body the guard will buffer for inspection
const MAX_GUARDED_BODY_BYTES: usize = 64 * 1024;

/// Create CORS middleware with configurable origins
pub fn create_cors_layer(allowed_origins: Vec<String>) -> CorsLayer {
    let expose = ExposeHeaders::list([HeaderName::from_static(REQUEST_ID_HEADER)]);

    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(expose)
    } else {
        CorsLayer::new()
            .allow_origin(
                allowed_origins
                    .into_iter()
                    .filter_map(|o| o.parse().ok())
                    .collect::<Vec<HeaderValue>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers(Any)
            .expose_headers(expose)
    }
}

/// Middleware to add request ID to all requests
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

/// Request ID wrapper for extracting in handlers
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Best-effort caller identity from proxy headers
pub fn caller_identity(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Intercept analytics mutations.
///
/// Matching requests must carry today's key in `x-analytics-key`. Accepted
/// requests get an `AuthorizationToken` extension; rejected ones get a 403
/// and a forensic entry.
pub async fn access_guard_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_GUARDED_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return ApiError::bad_request(request_id, "Request body too large").into_response(),
    };
    let payload: Option<serde_json::Value> = serde_json::from_slice(&bytes).ok();

    let guard = state.services.guard();
    if !guard.is_guarded_request(&parts.method, parts.uri.path(), payload.as_ref()) {
        return next.run(Request::from_parts(parts, Body::from(bytes))).await;
    }

    let attempt = AccessAttempt {
        caller: caller_identity(&parts.headers),
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        payload: payload.unwrap_or(serde_json::Value::Null),
        request_id: request_id.clone(),
    };
    let key = parts
        .headers
        .get(ANALYTICS_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match guard.issue_token(key, &attempt) {
        Ok(token) => {
            let mut request = Request::from_parts(parts, Body::from(bytes));
            request.extensions_mut().insert(token);
            next.run(request).await
        }
        Err(e) => ApiError::forbidden(request_id, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_identity() {
        let mut headers = HeaderMap::new();
        assert_eq!(caller_identity(&headers), "unknown");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        assert_eq!(caller_identity(&headers), "203.0.113.7");
    }
}
