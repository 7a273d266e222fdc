//! Single worker that drives dispatched batches one at a time.
//!
//! The worker consumes [`DispatchSignal`]s in FIFO order, claims the referenced batch
//! from the store and runs it through the typestate machine in [`types`]. The next
//! signal is not taken until the current batch is completed, so at most one batch is
//! being converted at any moment, across all submitters.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::conversion::{Converter, Validator};
use crate::domain::batch::Batch;
use crate::error::Result;
#[cfg(feature = "metrics")]
use crate::metrics::VolleyMetrics;
use crate::outcome::OutcomeStore;
use crate::queue::{DispatchReceiver, DispatchSignal};
use crate::store::BatchStore;
use crate::sweeper::RetentionSweeper;
use crate::transport::Transport;

pub mod transitions;
pub mod types;

pub use types::{
    Announcing, BatchRun, Completed, Converting, Finalizing, Queued, RunData, RunState, Tally,
};

/// Status text posted when the per-batch driver itself fails.
pub const BATCH_FAILED_TEXT: &str = "❌ Batch processing failed";

/// External collaborators used while processing a batch.
#[derive(Clone)]
pub struct Services {
    pub transport: Arc<dyn Transport>,
    pub validator: Arc<dyn Validator>,
    pub converter: Arc<dyn Converter>,
    pub outcomes: Arc<dyn OutcomeStore>,
}

/// Everything a batch run needs, shared by all runs.
pub struct RunContext {
    pub store: Arc<BatchStore>,
    pub services: Services,
    /// Pause between two files of the same batch
    pub inter_file_pacing: Duration,
    /// Post a progress update after every this many files (0 disables)
    pub progress_report_every: usize,
}

/// Snapshot of the worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub files_converted: u64,
    pub files_failed: u64,
    /// Signals whose batch was absent or not queued when they were consumed
    pub signals_dropped: u64,
    pub batches_in_flight: usize,
}

#[derive(Default)]
struct Counters {
    batches_processed: AtomicU64,
    batches_failed: AtomicU64,
    files_converted: AtomicU64,
    files_failed: AtomicU64,
    signals_dropped: AtomicU64,
    batches_in_flight: AtomicUsize,
}

/// Consumer of the dispatch queue.
pub struct BatchProcessor {
    ctx: Arc<RunContext>,
    sweeper: RetentionSweeper,
    retention_grace: Duration,
    status_log_interval: Option<Duration>,
    counters: Arc<Counters>,
    shutdown_token: CancellationToken,
    #[cfg(feature = "metrics")]
    metrics: Option<VolleyMetrics>,
}

impl BatchProcessor {
    pub fn new(
        ctx: RunContext,
        sweeper: RetentionSweeper,
        retention_grace: Duration,
        status_log_interval: Option<Duration>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            ctx: Arc::new(ctx),
            sweeper,
            retention_grace,
            status_log_interval,
            counters: Arc::new(Counters::default()),
            shutdown_token,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Attach Prometheus metrics.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: VolleyMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn stats(&self) -> ProcessorStats {
        let c = &self.counters;
        ProcessorStats {
            batches_processed: c.batches_processed.load(Ordering::Relaxed),
            batches_failed: c.batches_failed.load(Ordering::Relaxed),
            files_converted: c.files_converted.load(Ordering::Relaxed),
            files_failed: c.files_failed.load(Ordering::Relaxed),
            signals_dropped: c.signals_dropped.load(Ordering::Relaxed),
            batches_in_flight: c.batches_in_flight.load(Ordering::Relaxed),
        }
    }

    /// Consume signals until shutdown or until every producer is gone.
    ///
    /// A batch that is being processed when shutdown is requested runs to completion.
    #[tracing::instrument(skip(self, rx))]
    pub async fn run(self: Arc<Self>, mut rx: DispatchReceiver) -> Result<()> {
        tracing::info!("Batch processor starting");

        // Stops the status ticker on shutdown or whenever this loop returns
        let ticker_token = self.shutdown_token.child_token();
        let _stop_ticker = ticker_token.clone().drop_guard();

        if let Some(interval) = self.status_log_interval {
            let processor = self.clone();
            let depth = rx.depth_handle();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let stats = processor.stats();
                            tracing::debug!(
                                queue_depth = depth.get(),
                                batches_in_flight = stats.batches_in_flight,
                                batches_processed = stats.batches_processed,
                                batches_failed = stats.batches_failed,
                                files_converted = stats.files_converted,
                                files_failed = stats.files_failed,
                                "Batch processor status"
                            );
                        }
                        _ = ticker_token.cancelled() => break,
                    }
                }
            });
        }

        loop {
            let signal = tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Shutdown signal received, stopping batch processor");
                    break;
                }
                signal = rx.next() => signal,
            };

            let Some(signal) = signal else {
                tracing::info!("Dispatch queue closed, stopping batch processor");
                break;
            };

            #[cfg(feature = "metrics")]
            if let Some(metrics) = &self.metrics {
                metrics.set_queue_depth(rx.depth());
            }

            self.process_signal(signal).await;
        }

        rx.close();
        Ok(())
    }

    /// Claim and fully process one batch.
    pub async fn process_signal(&self, signal: DispatchSignal) {
        let DispatchSignal {
            submitter,
            batch_id,
        } = signal;

        let Some(batch) = self.ctx.store.claim(submitter, batch_id) else {
            self.counters.signals_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                submitter = %submitter,
                batch_id = %batch_id,
                "Dropping dispatch signal, batch is absent or not queued"
            );
            return;
        };

        let chat_id = batch.chat_id;
        let status_message = batch.status_message;
        let started = tokio::time::Instant::now();

        self.counters.batches_in_flight.fetch_add(1, Ordering::Relaxed);
        let counters = self.counters.clone();
        let _guard = scopeguard::guard((), move |_| {
            counters.batches_in_flight.fetch_sub(1, Ordering::Relaxed);
        });

        // Own task, so a panic outside the per-file loop only fails this batch
        let ctx = self.ctx.clone();
        let driver = tokio::spawn(async move { drive(ctx, batch).await });

        let failure = match driver.await {
            Ok(Ok(done)) => {
                let tally = done.state.tally;
                self.counters.batches_processed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .files_converted
                    .fetch_add(tally.converted as u64, Ordering::Relaxed);
                self.counters
                    .files_failed
                    .fetch_add(tally.failed as u64, Ordering::Relaxed);
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_files("converted", tally.converted);
                    metrics.record_files("failed", tally.failed);
                }
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(join_error) => Some(if join_error.is_panic() {
                "batch driver panicked".to_string()
            } else {
                join_error.to_string()
            }),
        };

        if let Some(reason) = &failure {
            self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                submitter = %submitter,
                batch_id = %batch_id,
                error = %reason,
                "Error processing batch"
            );
            if let Err(e) = self
                .ctx
                .services
                .transport
                .edit_message(chat_id, status_message, BATCH_FAILED_TEXT)
                .await
            {
                tracing::warn!(batch_id = %batch_id, error = %e, "Failed to post batch failure status");
            }
            self.ctx.store.mark_completed(submitter, batch_id);
        }

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            let outcome = if failure.is_some() { "failed" } else { "completed" };
            metrics.record_batch(outcome, started.elapsed());
        }

        tracing::debug!(
            submitter = %submitter,
            batch_id = %batch_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch slot released"
        );
        self.sweeper
            .schedule_eviction(submitter, batch_id, self.retention_grace);
    }
}

async fn drive(ctx: Arc<RunContext>, batch: Batch) -> Result<BatchRun<Completed>> {
    let run = BatchRun::new(batch);
    let run = run.announce(&ctx).await?;
    let run = run.start_conversion(&ctx)?;
    let run = run.convert_all(&ctx).await?;
    run.complete(&ctx).await
}
