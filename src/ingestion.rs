//! Ingestion gateway
//!
//! The low-latency write path: validate, derive the color, then insert the
//! draw and its queue item in one transaction under a bounded timeout. The
//! analytics update happens later, off the request path.

use crate::{
    draw_store::DrawStore,
    errors::{DrawGuardError, DrawGuardResult, StorageError, ValidationError},
    metrics::DrawGuardMetrics,
    queue::BackgroundQueue,
    types::{DrawColor, DrawEvent, QueueItem, MAX_WINNING_NUMBER},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::info;

/// Input after validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedDraw {
    pub winning_number: u8,
    pub draw_number: u64,
    pub timestamp: DateTime<Utc>,
}

/// Success body of the ingest endpoint
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub status: &'static str,
    pub id: u64,
    pub draw: u64,
    pub number: u8,
    pub color: DrawColor,
    pub time_ms: f64,
}

/// Validate a raw ingest payload.
///
/// Numbers may arrive as JSON integers or numeric strings.
pub fn validate(payload: &Value) -> Result<ValidatedDraw, ValidationError> {
    let winning_number = integer_field(payload, "winning_number")?;
    let draw_number = integer_field(payload, "draw_number")?;

    if !(0..=MAX_WINNING_NUMBER as i64).contains(&winning_number) {
        return Err(ValidationError::WinningNumberOutOfRange(winning_number));
    }
    if draw_number < 1 {
        return Err(ValidationError::DrawNumberOutOfRange(draw_number));
    }

    let timestamp = match payload.get("timestamp") {
        None | Some(Value::Null) => Utc::now(),
        Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
            .map_err(|_| ValidationError::InvalidTimestamp(raw.clone()))?
            .with_timezone(&Utc),
        Some(other) => return Err(ValidationError::InvalidTimestamp(other.to_string())),
    };

    Ok(ValidatedDraw {
        winning_number: winning_number as u8,
        draw_number: draw_number as u64,
        timestamp,
    })
}

fn integer_field(payload: &Value, field: &'static str) -> Result<i64, ValidationError> {
    match payload.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15).map(|f| f as i64))
            .ok_or(ValidationError::NotNumeric { field }),
        Some(Value::String(s)) => s.trim().parse::<i64>().map_err(|_| ValidationError::NotNumeric { field }),
        Some(_) => Err(ValidationError::NotNumeric { field }),
    }
}

#[derive(Clone)]
pub struct IngestionGateway {
    draws: DrawStore,
    queue: BackgroundQueue,
    metrics: DrawGuardMetrics,
    write_timeout: Duration,
}

impl IngestionGateway {
    pub fn new(draws: DrawStore, queue: BackgroundQueue, metrics: DrawGuardMetrics, write_timeout: Duration) -> Self {
        Self {
            draws,
            queue,
            metrics,
            write_timeout,
        }
    }

    pub async fn ingest(&self, payload: &Value) -> DrawGuardResult<IngestReceipt> {
        let started = Instant::now();

        let draw = validate(payload).inspect_err(|_| self.metrics.ingest_rejections.inc())?;

        let item = QueueItem {
            winning_number: draw.winning_number,
            draw_number: draw.draw_number,
            color: DrawColor::for_number(draw.winning_number),
            timestamp: draw.timestamp,
            queued_at: Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            attempts: 0,
        };
        let store = self.draws.clone();
        let queue = self.queue.clone();
        let insert = tokio::task::spawn_blocking(move || -> DrawGuardResult<(DrawEvent, u64)> {
            let encoded = serde_json::to_vec(&item).map_err(StorageError::from)?;
            let seq = queue.reserve();
            let event = store.insert_with(draw.draw_number, draw.winning_number, draw.timestamp, |txn| {
                queue.stage(txn, seq, &encoded)
            })?;
            queue.committed(seq);
            Ok((event, seq))
        });
        // On timeout the write may still land; draw and queue item commit together either way
        let (event, seq) = match tokio::time::timeout(self.write_timeout, insert).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(StorageError::from(join).into()),
            Err(_) => Err(StorageError::Timeout(self.write_timeout).into()),
        }
        .inspect_err(|e| {
            if matches!(e, DrawGuardError::Validation(_)) {
                self.metrics.ingest_rejections.inc();
            }
        })?;

        let elapsed = started.elapsed();
        self.metrics.draws_ingested.inc();
        self.metrics.ingest_latency_ms.observe(elapsed.as_secs_f64() * 1000.0);

        info!(
            id = event.id,
            seq,
            draw_number = event.draw_number,
            winning_number = event.winning_number,
            color = %event.color,
            "🎯 Draw ingested"
        );

        Ok(IngestReceipt {
            status: "success",
            id: event.id,
            draw: event.draw_number,
            number: event.winning_number,
            color: event.color,
            time_ms: (elapsed.as_secs_f64() * 100_000.0).round() / 100.0,
        })
    }
}
