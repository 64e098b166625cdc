//! Prometheus metrics for the ingestion and analytics paths

use crate::errors::DrawGuardResult;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};

/// Service metrics, each instance backed by its own registry
#[derive(Clone)]
pub struct DrawGuardMetrics {
    registry: Registry,

    // Ingestion
    pub draws_ingested: IntCounter,
    pub ingest_rejections: IntCounter,
    pub ingest_latency_ms: Histogram,

    // Queue
    pub queue_enqueued: IntCounter,
    pub queue_processed: IntCounter,
    pub queue_failed: IntCounter,
    pub queue_retried: IntCounter,
    pub queue_depth: IntGauge,

    // Analytics and integrity
    pub analytics_applied: IntCounter,
    pub analytics_duplicates: IntCounter,
    pub auth_rejections: IntCounter,
    pub gaps_recorded: IntCounter,
    pub tamper_events: IntCounter,
}

impl DrawGuardMetrics {
    pub fn new() -> DrawGuardResult<Self> {
        let registry = Registry::new_custom(Some("drawguard".to_string()), None)?;

        let ingest_latency_ms = Histogram::with_opts(
            HistogramOpts::new("ingest_latency_ms", "Synchronous ingest path latency in milliseconds")
                .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0]),
        )?;
        registry.register(Box::new(ingest_latency_ms.clone()))?;

        let queue_depth = IntGauge::new("queue_depth", "Queue items awaiting processing")?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            draws_ingested: counter(&registry, "draws_ingested_total", "Draws written to the canonical store")?,
            ingest_rejections: counter(&registry, "ingest_rejections_total", "Ingest requests rejected by validation")?,
            ingest_latency_ms,
            queue_enqueued: counter(&registry, "queue_enqueued_total", "Queue items appended")?,
            queue_processed: counter(&registry, "queue_processed_total", "Queue items acknowledged")?,
            queue_failed: counter(&registry, "queue_failed_total", "Queue item processing failures")?,
            queue_retried: counter(&registry, "queue_retried_total", "Queue items left for retry")?,
            queue_depth,
            analytics_applied: counter(&registry, "analytics_applied_total", "Snapshot updates committed")?,
            analytics_duplicates: counter(&registry, "analytics_duplicates_total", "Updates skipped as already applied")?,
            auth_rejections: counter(&registry, "auth_rejections_total", "Analytics mutations rejected by the access guard")?,
            gaps_recorded: counter(&registry, "gaps_recorded_total", "Sequence gaps recorded")?,
            tamper_events: counter(&registry, "tamper_events_total", "Snapshot reverts after out-of-band mutation")?,
            registry,
        })
    }

    /// Prometheus text exposition of every registered metric
    pub fn gather(&self) -> DrawGuardResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
