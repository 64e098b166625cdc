//! API Error Handling
//!
//! Structured error responses with HTTP status codes and request tracking.
//! Storage failures are reported generically; details stay in the logs.

use crate::errors::DrawGuardError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;

/// Error body returned by every failing endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    /// BAD_REQUEST, FORBIDDEN, INTERNAL_ERROR, ...
    pub code: String,
    pub message: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

/// API error with request tracking
#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request_id: String,
}

#[derive(Debug)]
pub enum ApiErrorKind {
    BadRequest(String),
    Forbidden(String),
    InternalError(String),
}

impl ApiError {
    pub fn bad_request(request_id: String, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::BadRequest(message.into()),
            request_id,
        }
    }

    pub fn forbidden(request_id: String, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Forbidden(message.into()),
            request_id,
        }
    }

    pub fn internal_error(request_id: String, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::InternalError(message.into()),
            request_id,
        }
    }

    /// Map a domain error onto its HTTP shape
    pub fn from_domain(request_id: String, err: DrawGuardError) -> Self {
        match err {
            DrawGuardError::Validation(e) => Self::bad_request(request_id, e.to_string()),
            DrawGuardError::Authorization(e) => Self::forbidden(request_id, e.to_string()),
            DrawGuardError::Storage(e) => {
                error!(request_id = %request_id, error = %e, "Storage failure");
                Self::internal_error(request_id, "Storage unavailable")
            }
            other => {
                error!(request_id = %request_id, error = %other, "Internal failure");
                Self::internal_error(request_id, "Internal error")
            }
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ApiErrorKind::BadRequest(msg) => write!(f, "[{}] Bad Request: {}", self.request_id, msg),
            ApiErrorKind::Forbidden(msg) => write!(f, "[{}] Forbidden: {}", self.request_id, msg),
            ApiErrorKind::InternalError(msg) => write!(f, "[{}] Internal Error: {}", self.request_id, msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self.kind {
            ApiErrorKind::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiErrorKind::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg),
            ApiErrorKind::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        };

        let body = Json(ErrorResponse {
            status: "error".to_string(),
            code: code.to_string(),
            message,
            request_id: self.request_id,
            timestamp: Utc::now(),
        });

        (status, body).into_response()
    }
}
