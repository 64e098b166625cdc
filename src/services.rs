//! Service container wiring every component onto one storage handle
//!
//! Components are built once, shared through `Arc`, and the background
//! loops (queue processor, gap scan, tamper check) are started separately so
//! tests can drive them by hand.

use crate::{
    analytics::{AnalyticsAggregator, SnapshotSealer},
    config::DrawGuardConfig,
    draw_store::DrawStore,
    errors::DrawGuardResult,
    ingestion::IngestionGateway,
    metrics::DrawGuardMetrics,
    queue::{BackgroundQueue, ProcessorStats, QueueProcessor},
    security::{AccessGuard, CallerContext, ForensicLog},
    sequence::SequenceIntegrityMonitor,
    storage::DrawStorage,
    tamper::{TamperCheck, TamperDetector},
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info};
use uuid::Uuid;

/// Service container for the draw pipeline
pub struct ServiceContainer {
    config: DrawGuardConfig,
    storage: DrawStorage,
    draws: DrawStore,
    queue: BackgroundQueue,
    gateway: IngestionGateway,
    aggregator: Arc<AnalyticsAggregator>,
    guard: Arc<AccessGuard>,
    monitor: Arc<SequenceIntegrityMonitor>,
    tamper: Arc<TamperDetector>,
    metrics: DrawGuardMetrics,
}

impl ServiceContainer {
    /// Open storage and build every component
    pub fn new(config: DrawGuardConfig) -> DrawGuardResult<Self> {
        let storage = DrawStorage::open(&config.storage)?;
        let metrics = DrawGuardMetrics::new()?;
        let forensic = Arc::new(ForensicLog::new(
            config.security.forensic_log_path.as_ref().map(PathBuf::from),
        ));
        let sealer = SnapshotSealer::new(&config.security.seal_key);

        let draws = DrawStore::new(storage.clone())?;
        let queue = BackgroundQueue::new(storage.clone(), metrics.clone())?;
        let gateway = IngestionGateway::new(draws.clone(), queue.clone(), metrics.clone(), config.write_timeout());
        let guard = Arc::new(AccessGuard::new(&config.security, forensic.clone(), metrics.clone()));
        let aggregator = Arc::new(AnalyticsAggregator::new(
            storage.clone(),
            sealer.clone(),
            forensic.clone(),
            metrics.clone(),
            config.write_timeout(),
        ));
        let monitor = Arc::new(SequenceIntegrityMonitor::new(
            draws.clone(),
            storage.clone(),
            metrics.clone(),
            config.monitor.gap_scan_depth,
            config.gap_window(),
        )
        .with_missing_limit(config.monitor.missing_draws_limit));
        let tamper = Arc::new(TamperDetector::new(
            storage.clone(),
            sealer,
            forensic,
            metrics.clone(),
            config.write_timeout(),
        ));

        info!(data_dir = %config.storage.data_directory, "🗄️  Draw pipeline initialized");

        Ok(Self {
            config,
            storage,
            draws,
            queue,
            gateway,
            aggregator,
            guard,
            monitor,
            tamper,
            metrics,
        })
    }

    pub fn config(&self) -> &DrawGuardConfig {
        &self.config
    }

    pub fn storage(&self) -> &DrawStorage {
        &self.storage
    }

    pub fn draws(&self) -> &DrawStore {
        &self.draws
    }

    pub fn queue(&self) -> &BackgroundQueue {
        &self.queue
    }

    pub fn gateway(&self) -> &IngestionGateway {
        &self.gateway
    }

    pub fn aggregator(&self) -> Arc<AnalyticsAggregator> {
        Arc::clone(&self.aggregator)
    }

    pub fn guard(&self) -> Arc<AccessGuard> {
        Arc::clone(&self.guard)
    }

    pub fn monitor(&self) -> Arc<SequenceIntegrityMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn tamper(&self) -> Arc<TamperDetector> {
        Arc::clone(&self.tamper)
    }

    pub fn metrics(&self) -> &DrawGuardMetrics {
        &self.metrics
    }

    /// Queue processor bound to this container's components
    pub fn queue_processor(&self) -> QueueProcessor {
        QueueProcessor::new(
            self.queue.clone(),
            self.aggregator(),
            self.guard(),
            self.metrics.clone(),
            &self.config,
        )
    }

    /// Start the queue processor and the scheduled integrity checks
    pub fn start_background(&self) -> BackgroundTasks {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let processor = self.queue_processor();
        let processor_stats = processor.stats();
        let mut handles = vec![processor.spawn(shutdown_rx.clone())];

        handles.push(spawn_gap_scanner(
            self.monitor(),
            self.config.gap_scan_interval(),
            shutdown_rx.clone(),
        ));
        handles.push(spawn_tamper_checker(
            self.tamper(),
            self.config.tamper_check_interval(),
            shutdown_rx,
        ));

        info!(
            gap_scan_secs = self.config.monitor.gap_scan_interval_secs,
            tamper_check_secs = self.config.monitor.tamper_check_interval_secs,
            "⏱️  Background tasks started"
        );

        BackgroundTasks {
            shutdown: shutdown_tx,
            handles,
            processor_stats,
        }
    }
}

/// Handles to the running background loops
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    processor_stats: Arc<ProcessorStats>,
}

impl BackgroundTasks {
    pub fn processor_stats(&self) -> Arc<ProcessorStats> {
        Arc::clone(&self.processor_stats)
    }

    /// Signal every loop and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Background task ended abnormally");
            }
        }
    }
}

fn spawn_gap_scanner(
    monitor: Arc<SequenceIntegrityMonitor>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            let monitor = monitor.clone();
            match tokio::task::spawn_blocking(move || monitor.scan()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "Gap scan failed"),
                Err(e) => error!(error = %e, "Gap scan task failed"),
            }
        }
    })
}

fn spawn_tamper_checker(
    tamper: Arc<TamperDetector>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            let ctx = CallerContext::anonymous("tamper-detector", Uuid::new_v4().to_string());
            match tamper.check(&ctx).await {
                Ok(TamperCheck::Reverted(_)) => info!("Snapshot restored to baseline"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Tamper check failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_background_pipeline() {
        let temp = TempDir::new().unwrap();
        let container = ServiceContainer::new(DrawGuardConfig::for_testing(temp.path().to_string_lossy())).unwrap();
        let tasks = container.start_background();

        container
            .gateway()
            .ingest(&json!({"winning_number": 14, "draw_number": 1}))
            .await
            .unwrap();

        let stats = tasks.processor_stats();
        for _ in 0..100 {
            if stats.processed() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(stats.processed(), 1);
        assert!(container.aggregator().is_applied(1).unwrap());
        assert!(container.queue().is_empty().unwrap());

        tasks.shutdown().await;
    }
}
