//! Error types for the draw ingestion and analytics core
//!
//! Validation and authorization failures are terminal for the request that
//! caused them. Storage failures propagate to the caller but never take the
//! process down. Consistency anomalies (gaps, tamper events) are not errors at
//! all: they are recorded and exposed through the alert surface.

use std::time::Duration;
use thiserror::Error;

/// Root error type for every fallible operation in the crate
#[derive(Debug, Error)]
pub enum DrawGuardError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Authorization error: {0}")]
    Authorization(#[from] AuthorizationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Malformed or out-of-range input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field {field} must be an integer")]
    NotNumeric { field: &'static str },

    #[error("Winning number {0} outside 0..=36")]
    WinningNumberOutOfRange(i64),

    #[error("Draw number {0} must be >= 1")]
    DrawNumberOutOfRange(i64),

    #[error("Draw {0} already recorded")]
    DuplicateDraw(u64),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Missing or incorrect privilege on an analytics mutation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    #[error("Analytics update key missing")]
    MissingKey,

    #[error("Analytics update key rejected")]
    InvalidKey,

    #[error("Caller {caller} holds no authorization token")]
    Unauthorized { caller: String },
}

/// Underlying store unavailable or write failed
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database open failed: {0}")]
    OpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    #[error("Transaction conflict persisted after {attempts} attempts")]
    Contention { attempts: u32 },

    #[error("Storage operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Storage task failed: {0}")]
    TaskFailed(String),
}

/// Configuration load and validation errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::WriteFailed(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::CorruptedData(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::TaskFailed(e.to_string())
    }
}

impl From<rocksdb::Error> for DrawGuardError {
    fn from(e: rocksdb::Error) -> Self {
        DrawGuardError::Storage(e.into())
    }
}

impl From<std::io::Error> for DrawGuardError {
    fn from(e: std::io::Error) -> Self {
        DrawGuardError::Storage(StorageError::WriteFailed(e.to_string()))
    }
}

// Convenience type alias for Results
pub type DrawGuardResult<T> = Result<T, DrawGuardError>;
