//! Prometheus metrics for the batch pipeline.
//!
//! - **Gauges**: dispatch queue depth
//! - **Counters**: uploads by admission outcome, batches by outcome, files by outcome
//! - **Histograms**: batch processing duration

#[cfg(feature = "metrics")]
use prometheus::{CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};
#[cfg(feature = "metrics")]
use std::time::Duration;

#[cfg(feature = "metrics")]
use crate::error::Result;

/// Prometheus metrics registry for the coordinator and worker.
#[cfg(feature = "metrics")]
#[derive(Clone)]
pub struct VolleyMetrics {
    registry: Registry,

    dispatch_queue_depth: Gauge,

    uploads_total: CounterVec,
    batches_total: CounterVec,
    files_total: CounterVec,

    batch_duration_seconds: Histogram,
}

#[cfg(feature = "metrics")]
impl VolleyMetrics {
    /// Create the metrics and register them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if metrics fail to register (e.g., duplicate registration).
    pub fn new(registry: Registry) -> Result<Self> {
        let dispatch_queue_depth = Gauge::with_opts(Opts::new(
            "volley_dispatch_queue_depth",
            "Number of dispatched batches waiting for the worker",
        ))
        .map_err(|e| anyhow::anyhow!("Failed to create dispatch_queue_depth gauge: {}", e))?;

        let uploads_total = CounterVec::new(
            Opts::new(
                "volley_uploads_total",
                "Total number of uploads by admission outcome",
            ),
            &["outcome"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create uploads_total counter: {}", e))?;

        let batches_total = CounterVec::new(
            Opts::new("volley_batches_total", "Total number of batches processed by outcome"),
            &["outcome"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create batches_total counter: {}", e))?;

        let files_total = CounterVec::new(
            Opts::new("volley_files_total", "Total number of files processed by outcome"),
            &["outcome"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create files_total counter: {}", e))?;

        // Pacing alone puts a full batch of 15 at 7 seconds
        let batch_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "volley_batch_duration_seconds",
                "Batch processing duration in seconds",
            )
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )
        .map_err(|e| anyhow::anyhow!("Failed to create batch_duration_seconds histogram: {}", e))?;

        registry
            .register(Box::new(dispatch_queue_depth.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register dispatch_queue_depth: {}", e))?;
        registry
            .register(Box::new(uploads_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register uploads_total: {}", e))?;
        registry
            .register(Box::new(batches_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register batches_total: {}", e))?;
        registry
            .register(Box::new(files_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register files_total: {}", e))?;
        registry
            .register(Box::new(batch_duration_seconds.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register batch_duration_seconds: {}", e))?;

        Ok(Self {
            registry,
            dispatch_queue_depth,
            uploads_total,
            batches_total,
            files_total,
            batch_duration_seconds,
        })
    }

    /// Get the underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.dispatch_queue_depth.set(depth as f64);
    }

    /// Count one upload. `outcome` is a low-cardinality value such as "accepted",
    /// "rejected" or "sealed".
    pub fn record_upload(&self, outcome: &str) {
        self.uploads_total.with_label_values(&[outcome]).inc();
    }

    /// Record a finished batch and how long it took.
    pub fn record_batch(&self, outcome: &str, duration: Duration) {
        self.batches_total.with_label_values(&[outcome]).inc();
        self.batch_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_files(&self, outcome: &str, count: usize) {
        if count > 0 {
            self.files_total
                .with_label_values(&[outcome])
                .inc_by(count as f64);
        }
    }
}
