// Performance metrics module
//
// Lightweight counters for the import/export engine

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Engine metrics
///
/// Uses atomic operations for thread-safe tracking without locks. The worker
/// and the orchestrator share one instance; call [`log_summary`](Self::log_summary)
/// on shutdown.
#[derive(Debug)]
pub struct Metrics {
    pub imports_committed: AtomicU64,

    pub imports_rolled_back: AtomicU64,

    /// Imports refused because another one was in flight
    pub imports_rejected_in_flight: AtomicU64,

    pub validations: AtomicU64,

    pub previews: AtomicU64,

    pub exports: AtomicU64,

    /// Files or contents rejected by the sandbox, including rate limiting
    pub security_rejections: AtomicU64,

    /// Operations refused by the memory governor
    pub memory_refusals: AtomicU64,

    /// Requests rejected because the worker mailbox was full
    pub backpressure_rejections: AtomicU64,

    pub cancellations: AtomicU64,

    /// Total time spent in committed imports, in milliseconds
    pub total_import_time_ms: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            imports_committed: AtomicU64::new(0),
            imports_rolled_back: AtomicU64::new(0),
            imports_rejected_in_flight: AtomicU64::new(0),
            validations: AtomicU64::new(0),
            previews: AtomicU64::new(0),
            exports: AtomicU64::new(0),
            security_rejections: AtomicU64::new(0),
            memory_refusals: AtomicU64::new(0),
            backpressure_rejections: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            total_import_time_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_import_committed(&self, duration: Duration) {
        self.imports_committed.fetch_add(1, Ordering::Relaxed);
        self.total_import_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_import_rolled_back(&self) {
        self.imports_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_import_in_flight(&self) {
        self.imports_rejected_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation(&self) {
        self.validations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preview(&self) {
        self.previews.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_export(&self) {
        self.exports.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_security_rejection(&self) {
        self.security_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_refusal(&self) {
        self.memory_refusals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure(&self) {
        self.backpressure_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average duration of a committed import in milliseconds
    pub fn avg_import_time_ms(&self) -> f64 {
        let total = self.total_import_time_ms.load(Ordering::Relaxed);
        let count = self.imports_committed.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    pub fn log_summary(&self) {
        tracing::info!("=== Import/Export Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Imports: {} committed, {} rolled back, {} rejected while busy (avg: {:.2}ms)",
            self.imports_committed.load(Ordering::Relaxed),
            self.imports_rolled_back.load(Ordering::Relaxed),
            self.imports_rejected_in_flight.load(Ordering::Relaxed),
            self.avg_import_time_ms()
        );
        tracing::info!(
            "Validations: {}, previews: {}, exports: {}",
            self.validations.load(Ordering::Relaxed),
            self.previews.load(Ordering::Relaxed),
            self.exports.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Rejections: {} security, {} memory, {} backpressure, {} cancelled",
            self.security_rejections.load(Ordering::Relaxed),
            self.memory_refusals.load(Ordering::Relaxed),
            self.backpressure_rejections.load(Ordering::Relaxed),
            self.cancellations.load(Ordering::Relaxed)
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.imports_committed.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.security_rejections.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_import_outcomes() {
        let metrics = Metrics::new();

        metrics.record_import_committed(Duration::from_millis(100));
        metrics.record_import_committed(Duration::from_millis(200));
        metrics.record_import_rolled_back();
        metrics.record_import_in_flight();

        assert_eq!(metrics.imports_committed.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.imports_rolled_back.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.imports_rejected_in_flight.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.avg_import_time_ms(), 150.0);
    }

    #[test]
    fn test_avg_import_time_without_imports() {
        let metrics = Metrics::new();
        assert_eq!(metrics.avg_import_time_ms(), 0.0);
    }

    #[test]
    fn test_uptime() {
        let metrics = Metrics::new();
        thread::sleep(Duration::from_millis(10));
        assert!(metrics.uptime().as_millis() >= 10);
    }

    #[test]
    fn test_rejection_counters() {
        let metrics = Metrics::new();

        metrics.record_security_rejection();
        metrics.record_memory_refusal();
        metrics.record_backpressure();
        metrics.record_cancellation();
        metrics.record_validation();
        metrics.record_preview();
        metrics.record_export();

        assert_eq!(metrics.security_rejections.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.memory_refusals.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.backpressure_rejections.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.cancellations.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.validations.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.previews.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.exports.load(Ordering::Relaxed), 1);
    }
}
