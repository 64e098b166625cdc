//! Access guard and forensic audit
//!
//! Analytics mutations need an [`AuthorizationToken`]. Only [`AccessGuard`]
//! can mint one, and only after checking the caller's key against the key
//! derived from today's UTC date. The token travels inside a
//! [`CallerContext`] owned by a single request or job, so one caller's
//! authorization never leaks into another's.

use crate::{config::SecurityConfig, errors::AuthorizationError, metrics::DrawGuardMetrics};
use axum::http::Method;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::VecDeque,
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread::JoinHandle,
};
use tokio::sync::mpsc;
use tracing::{error, warn};

/// In-memory forensic history kept for inspection
pub const FORENSIC_HISTORY_LIMIT: usize = 1000;

/// Proof that a specific request passed the access guard
#[derive(Debug, Clone)]
pub struct AuthorizationToken {
    request_id: String,
    issued_at: DateTime<Utc>,
}

impl AuthorizationToken {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

/// Who is calling, for which request, and with what privilege
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub caller: String,
    pub request_id: String,
    token: Option<AuthorizationToken>,
}

impl CallerContext {
    /// Context without any privilege
    pub fn anonymous(caller: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            request_id: request_id.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: AuthorizationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn token(&self) -> Option<&AuthorizationToken> {
        self.token.as_ref()
    }

    pub fn is_authorized(&self) -> bool {
        self.token.is_some()
    }
}

/// Request details captured when the guard sees a mutation attempt
#[derive(Debug, Clone)]
pub struct AccessAttempt {
    pub caller: String,
    pub method: String,
    pub path: String,
    pub payload: serde_json::Value,
    pub request_id: String,
}

/// One audit entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForensicRecord {
    pub caller: String,
    pub method: String,
    pub path: String,
    pub payload: serde_json::Value,
    pub reason: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

impl ForensicRecord {
    pub fn from_attempt(attempt: &AccessAttempt, reason: impl Into<String>) -> Self {
        Self {
            caller: attempt.caller.clone(),
            method: attempt.method.clone(),
            path: attempt.path.clone(),
            payload: attempt.payload.clone(),
            reason: reason.into(),
            request_id: attempt.request_id.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Audit sink: tracing, optional JSON-lines file, bounded in-memory history
pub struct ForensicLog {
    writer: Option<AuditWriter>,
    recent: Mutex<VecDeque<ForensicRecord>>,
}

impl ForensicLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        let writer = path.and_then(|path| match AuditWriter::spawn(path.clone()) {
            Ok(writer) => Some(writer),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to start forensic writer");
                None
            }
        });

        Self {
            writer,
            recent: Mutex::new(VecDeque::with_capacity(64)),
        }
    }

    /// Never touches the filesystem on the calling thread
    pub fn record(&self, record: ForensicRecord) {
        warn!(
            target: "drawguard::forensic",
            caller = %record.caller,
            method = %record.method,
            path = %record.path,
            payload = %record.payload,
            reason = %record.reason,
            request_id = %record.request_id,
            "🚨 Forensic entry"
        );

        if let Some(writer) = &self.writer {
            writer.send(record.clone());
        }

        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        if recent.len() >= FORENSIC_HISTORY_LIMIT {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    /// Recorded entries, oldest first
    pub fn recent(&self) -> Vec<ForensicRecord> {
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.recent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dedicated thread appending records to the audit file.
///
/// Dropping the writer closes the channel and waits for queued lines.
struct AuditWriter {
    tx: Option<mpsc::UnboundedSender<ForensicRecord>>,
    worker: Option<JoinHandle<()>>,
}

impl AuditWriter {
    fn spawn(path: PathBuf) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ForensicRecord>();
        let worker = std::thread::Builder::new()
            .name("forensic-writer".to_string())
            .spawn(move || {
                while let Some(record) = rx.blocking_recv() {
                    if let Err(e) = append_line(&path, &record) {
                        error!(path = %path.display(), error = %e, "Failed to write forensic log");
                    }
                }
            })?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    fn send(&self, record: ForensicRecord) {
        let delivered = self.tx.as_ref().is_some_and(|tx| tx.send(record).is_ok());
        if !delivered {
            error!("Forensic writer stopped; entry kept in memory only");
        }
    }
}

impl Drop for AuditWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Forensic writer panicked");
            }
        }
    }
}

fn append_line(path: &Path, record: &ForensicRecord) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    OpenOptions::new().create(true).append(true).open(path)?.write_all(&line)
}

/// Date-keyed gate on analytics mutations
pub struct AccessGuard {
    key_prefix: String,
    guarded_tokens: Vec<String>,
    forensic: Arc<ForensicLog>,
    metrics: DrawGuardMetrics,
}

impl AccessGuard {
    pub fn new(config: &SecurityConfig, forensic: Arc<ForensicLog>, metrics: DrawGuardMetrics) -> Self {
        Self {
            key_prefix: config.analytics_key_prefix.clone(),
            guarded_tokens: config.guarded_path_tokens.clone(),
            forensic,
            metrics,
        }
    }

    /// Key accepted on `date`
    pub fn expected_key_for(&self, date: NaiveDate) -> String {
        format!("{}{}", self.key_prefix, date.format("%Y-%m-%d"))
    }

    pub fn current_key(&self) -> String {
        self.expected_key_for(Utc::now().date_naive())
    }

    /// Exact match against today's key. Stateless per call.
    pub fn authorize(&self, key: &str) -> bool {
        constant_time_eq(key.as_bytes(), self.current_key().as_bytes())
    }

    /// Check `key` and mint a token for this attempt, or audit the rejection
    pub fn issue_token(
        &self,
        key: Option<&str>,
        attempt: &AccessAttempt,
    ) -> Result<AuthorizationToken, AuthorizationError> {
        let result = match key {
            None => Err(AuthorizationError::MissingKey),
            Some(key) if self.authorize(key) => Ok(AuthorizationToken {
                request_id: attempt.request_id.clone(),
                issued_at: Utc::now(),
            }),
            Some(_) => Err(AuthorizationError::InvalidKey),
        };

        if let Err(ref e) = result {
            self.reject(attempt, &e.to_string());
        }
        result
    }

    /// Context for in-process jobs that hold the configured key material
    pub fn internal_context(&self, caller: &str, request_id: String) -> Result<CallerContext, AuthorizationError> {
        let attempt = AccessAttempt {
            caller: caller.to_string(),
            method: "INTERNAL".to_string(),
            path: "analytics:update".to_string(),
            payload: serde_json::Value::Null,
            request_id: request_id.clone(),
        };
        let token = self.issue_token(Some(&self.current_key()), &attempt)?;
        Ok(CallerContext::anonymous(caller, request_id).with_token(token))
    }

    /// Audit a rejected mutation attempt
    pub fn reject(&self, attempt: &AccessAttempt, reason: &str) {
        self.metrics.auth_rejections.inc();
        self.forensic.record(ForensicRecord::from_attempt(attempt, reason));
    }

    /// Whether a request looks like an analytics mutation.
    ///
    /// Writes are matched by path token or by a `winning_number` field in the
    /// body. Safe methods are never guarded.
    pub fn is_guarded_request(&self, method: &Method, path: &str, body: Option<&serde_json::Value>) -> bool {
        if matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) {
            return false;
        }

        let path_match = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .any(|segment| self.guarded_tokens.iter().any(|token| segment.eq_ignore_ascii_case(token)));

        let payload_match = body
            .and_then(|b| b.as_object())
            .is_some_and(|obj| obj.contains_key("winning_number"));

        path_match || payload_match
    }

    pub fn forensic(&self) -> &Arc<ForensicLog> {
        &self.forensic
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let left = Sha256::digest(a);
    let right = Sha256::digest(b);
    left.iter().zip(right.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
