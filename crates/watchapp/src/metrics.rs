//! Minimal observability (§4.17, ambient): monotonic counters for the
//! quantities spec.md never asks to export anywhere, plus a slow periodic
//! `tracing::info!` report. No exporter is wired up — counters exist so an
//! operator tailing logs can see the system is alive and roughly what it's
//! doing, not to feed a metrics backend the corpus shows no pattern for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{DomainEvent, EventKind};
use eventbus::{Bus, Handler, HandlerError, Subscription};
use tracing::info;

#[derive(Default)]
pub struct Metrics {
    pub blocks_processed: AtomicU64,
    pub activities_emitted: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub rate_cache_hits: AtomicU64,
    pub rate_cache_misses: AtomicU64,
    pub circuit_breaker_trips: AtomicU64,
}

impl Metrics {
    pub fn record(&self, kind: EventKind) {
        match kind {
            EventKind::BlockParsed => self.blocks_processed.fetch_add(1, Ordering::Relaxed),
            EventKind::AddressActivityFound => self.activities_emitted.fetch_add(1, Ordering::Relaxed),
            EventKind::NotificationEmitted => self.notifications_sent.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    pub fn record_rate_cache_hit(&self) {
        self.rate_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_cache_miss(&self) {
        self.rate_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_breaker_trip(&self) {
        self.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot_and_log(&self) {
        info!(
            target: "watchapp",
            blocks_processed = self.blocks_processed.load(Ordering::Relaxed),
            activities_emitted = self.activities_emitted.load(Ordering::Relaxed),
            notifications_sent = self.notifications_sent.load(Ordering::Relaxed),
            rate_cache_hits = self.rate_cache_hits.load(Ordering::Relaxed),
            rate_cache_misses = self.rate_cache_misses.load(Ordering::Relaxed),
            circuit_breaker_trips = self.circuit_breaker_trips.load(Ordering::Relaxed),
            "watchapp.metrics"
        );
    }
}

struct MetricsHandler(Arc<Metrics>);

#[async_trait]
impl Handler for MetricsHandler {
    async fn handle(&self, event: DomainEvent) -> Result<(), HandlerError> {
        self.0.record(event.kind());
        Ok(())
    }
}

/// Subscribe a best-effort counter handler for each kind that feeds the
/// counters above, and spawn the slow periodic reporter.
pub async fn install(bus: &Bus, metrics: Arc<Metrics>, report_interval: Duration) {
    for kind in [
        EventKind::BlockParsed,
        EventKind::AddressActivityFound,
        EventKind::NotificationEmitted,
    ] {
        bus.subscribe(Subscription::new(
            kind,
            "metrics",
            1,
            0,
            |_attempt| Duration::from_millis(0),
            Arc::new(MetricsHandler(metrics.clone())),
        ))
        .await;
    }

    let metrics = metrics.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(report_interval);
        loop {
            interval.tick().await;
            metrics.snapshot_and_log();
        }
    });
}
