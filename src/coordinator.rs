//! Entry point that wires admission, the batch store, timers, the dispatch queue and
//! the worker together.
//!
//! ```ignore
//! let coordinator = Arc::new(BatchCoordinator::new(BatchConfig::from_env()?, services, token)?);
//! let worker = coordinator.run()?;
//! coordinator.submit(upload).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::admission::FileAdmissionGate;
use crate::config::BatchConfig;
use crate::domain::batch::{BatchId, BatchStatus, SubmitterId};
use crate::domain::file::{ChatId, MessageId, PendingFile};
use crate::error::{Result, VolleyError};
#[cfg(feature = "metrics")]
use crate::metrics::VolleyMetrics;
use crate::queue::{DispatchQueue, DispatchReceiver, dispatch_queue};
use crate::scheduler::DebounceScheduler;
use crate::store::BatchStore;
use crate::sweeper::RetentionSweeper;
use crate::transport::Transport;
use crate::worker::{BatchProcessor, ProcessorStats, RunContext, Services};

/// One uploaded file as received from the chat.
#[derive(Debug, Clone)]
pub struct Upload {
    pub submitter: SubmitterId,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub filename: String,
    pub content: Bytes,
}

/// Where an accepted upload ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub batch_id: BatchId,
    /// Files in the batch after this upload
    pub file_count: usize,
    pub is_new_batch: bool,
    /// This call enqueued the batch (it filled up, or it filled up or timed out while
    /// the status message was being posted)
    pub dispatched: bool,
}

/// Batches uploads per submitter and feeds them to a single worker.
pub struct BatchCoordinator {
    config: BatchConfig,
    gate: FileAdmissionGate,
    store: Arc<BatchStore>,
    scheduler: DebounceScheduler,
    queue: DispatchQueue,
    processor: Arc<BatchProcessor>,
    transport: Arc<dyn Transport>,
    receiver: Mutex<Option<DispatchReceiver>>,
    tracker: TaskTracker,
    shutdown_token: CancellationToken,
    #[cfg(feature = "metrics")]
    metrics: Option<VolleyMetrics>,
}

impl BatchCoordinator {
    pub fn new(
        config: BatchConfig,
        services: Services,
        shutdown_token: CancellationToken,
    ) -> Result<Self> {
        Self::build(config, services, shutdown_token, |processor| processor)
    }

    /// Like [`BatchCoordinator::new`], recording Prometheus metrics.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(
        config: BatchConfig,
        services: Services,
        shutdown_token: CancellationToken,
        metrics: VolleyMetrics,
    ) -> Result<Self> {
        let worker_metrics = metrics.clone();
        let mut coordinator = Self::build(config, services, shutdown_token, move |processor| {
            processor.with_metrics(worker_metrics)
        })?;
        coordinator.metrics = Some(metrics);
        Ok(coordinator)
    }

    fn build(
        config: BatchConfig,
        services: Services,
        shutdown_token: CancellationToken,
        configure: impl FnOnce(BatchProcessor) -> BatchProcessor,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(BatchStore::new(config.max_batch_size));
        let (queue, receiver) = dispatch_queue(config.dispatch_queue_capacity);
        let tracker = TaskTracker::new();

        let scheduler = DebounceScheduler::new(
            store.clone(),
            queue.clone(),
            config.processing_delay(),
            tracker.clone(),
            shutdown_token.clone(),
        );
        let sweeper = RetentionSweeper::new(store.clone(), tracker.clone(), shutdown_token.clone());

        let transport = services.transport.clone();
        let ctx = RunContext {
            store: store.clone(),
            services,
            inter_file_pacing: config.inter_file_pacing(),
            progress_report_every: config.progress_report_every,
        };
        let processor = configure(BatchProcessor::new(
            ctx,
            sweeper,
            config.retention_grace(),
            config.status_log_interval_ms.map(Duration::from_millis),
            shutdown_token.clone(),
        ));

        Ok(Self {
            gate: FileAdmissionGate::from_config(&config),
            config,
            store,
            scheduler,
            queue,
            processor: Arc::new(processor),
            transport,
            receiver: Mutex::new(Some(receiver)),
            tracker,
            shutdown_token,
            #[cfg(feature = "metrics")]
            metrics: None,
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Start the worker. Can only be called once.
    pub fn run(&self) -> Result<JoinHandle<Result<()>>> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or(VolleyError::AlreadyRunning)?;
        let processor = self.processor.clone();
        Ok(tokio::spawn(processor.run(receiver)))
    }

    /// Admit an upload and add it to the submitter's batch.
    ///
    /// Rejected uploads and uploads arriving while the submitter's previous batch is
    /// still being processed are answered in the chat and returned as errors
    /// ([`VolleyError::AdmissionRejected`], [`VolleyError::BatchSealed`]).
    #[tracing::instrument(skip(self, upload), fields(submitter = %upload.submitter, filename = %upload.filename))]
    pub async fn submit(&self, upload: Upload) -> Result<SubmitOutcome> {
        if self.shutdown_token.is_cancelled() {
            return Err(VolleyError::Shutdown);
        }

        let Upload {
            submitter,
            chat_id,
            message_id,
            filename,
            content,
        } = upload;

        if let Err(rejection) = self.gate.admit(submitter, &content, &filename) {
            self.record_upload("rejected");
            self.reply(chat_id, &rejection.user_message()).await;
            return Err(VolleyError::AdmissionRejected(rejection));
        }

        let file = PendingFile::new(content, filename, message_id, chat_id);
        let appended = match self.store.append_awaiting_status(submitter, file) {
            Ok(appended) => appended,
            Err(e @ VolleyError::BatchSealed(..)) => {
                self.record_upload("sealed");
                let status = self
                    .store
                    .status(submitter)
                    .map(|s| s.describe(chrono::Utc::now()))
                    .unwrap_or_else(|| "Processing".to_string());
                let text = format!(
                    "🔄 I'm currently processing your files.\nStatus: {}\n\nPlease wait for the conversion to complete.",
                    status
                );
                self.reply(chat_id, &text).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.record_upload("accepted");

        let dispatched = if appended.is_new_batch {
            if !appended.sealed_by_full {
                self.scheduler.arm_on_create(submitter, appended.batch_id);
            }
            self.post_status_message(submitter, appended.batch_id, chat_id)
                .await
        } else {
            // A missing handle means the creator is still posting it and will show
            // the count itself
            if let Some(status_message) = appended.status_message {
                self.edit_file_count(appended.chat_id, status_message, appended.file_count)
                    .await;
            }
            appended.must_dispatch()
        };

        if dispatched {
            self.scheduler
                .dispatch_sealed(submitter, appended.batch_id)
                .await?;
        }

        Ok(SubmitOutcome {
            batch_id: appended.batch_id,
            file_count: appended.file_count,
            is_new_batch: appended.is_new_batch,
            dispatched,
        })
    }

    /// Current (or recently completed) batch of a submitter.
    pub fn batch_status(&self, submitter: SubmitterId) -> Option<BatchStatus> {
        self.store.status(submitter)
    }

    pub fn stats(&self) -> ProcessorStats {
        self.processor.stats()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Number of submitters with a batch that is not completed yet.
    pub fn active_batches(&self) -> usize {
        self.store.active_count()
    }

    /// Cancel pending timers and evictions and wait for them to wind down.
    ///
    /// The worker observes the same token; await the handle returned by
    /// [`BatchCoordinator::run`] to wait for it.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down batch coordinator");
        self.shutdown_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Post the status message of a new batch and settle it in the store.
    ///
    /// Returns true when the batch was sealed in the meantime and must be dispatched.
    async fn post_status_message(
        &self,
        submitter: SubmitterId,
        batch_id: BatchId,
        chat_id: ChatId,
    ) -> bool {
        let text = format!(
            "⏳ Please wait, processing for {} seconds...",
            format_seconds(self.config.processing_delay())
        );
        let handle = match self.transport.send_message(chat_id, &text).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(batch_id = %batch_id, error = %e, "Failed to send status message");
                None
            }
        };

        let Some(resolution) = self
            .store
            .resolve_status_message(submitter, batch_id, handle)
        else {
            tracing::debug!(batch_id = %batch_id, "Batch was gone before its status message was posted");
            return false;
        };

        // Files that joined while the post was in flight were not shown yet
        if handle.is_some() && resolution.file_count > 1 {
            self.edit_file_count(chat_id, resolution.status_message, resolution.file_count)
                .await;
        }
        resolution.dispatch
    }

    async fn edit_file_count(&self, chat_id: ChatId, status_message: MessageId, file_count: usize) {
        let text = format!(
            "⏳ Please wait, processing {} files for {} seconds...",
            file_count,
            format_seconds(self.config.processing_delay())
        );
        if let Err(e) = self
            .transport
            .edit_message(chat_id, status_message, &text)
            .await
        {
            tracing::warn!(chat_id = %chat_id, error = %e, "Failed to update status message");
        }
    }

    async fn reply(&self, chat_id: ChatId, text: &str) {
        if let Err(e) = self.transport.send_message(chat_id, text).await {
            tracing::warn!(chat_id = %chat_id, error = %e, "Failed to reply to upload");
        }
    }

    #[cfg(feature = "metrics")]
    fn record_upload(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_upload(outcome);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_upload(&self, _outcome: &str) {}
}

/// "3" for whole seconds, "1.5" otherwise.
fn format_seconds(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        duration.as_secs().to_string()
    } else {
        format!("{:.1}", duration.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::Rejection;
    use crate::conversion::{MockConverter, ScriptedValidator};
    use crate::domain::batch::RunPhase;
    use crate::outcome::InMemoryOutcomeStore;
    use crate::transport::{CallKind, MockTransport};

    fn coordinator(config: BatchConfig) -> (BatchCoordinator, MockTransport) {
        let transport = MockTransport::new();
        let services = Services {
            transport: Arc::new(transport.clone()),
            validator: Arc::new(ScriptedValidator::new()),
            converter: Arc::new(MockConverter::new()),
            outcomes: Arc::new(InMemoryOutcomeStore::new()),
        };
        let coordinator = BatchCoordinator::new(config, services, CancellationToken::new()).unwrap();
        (coordinator, transport)
    }

    fn upload(user: i64, name: &str, content: &'static [u8]) -> Upload {
        Upload {
            submitter: SubmitterId(user),
            chat_id: ChatId(user),
            message_id: MessageId(1),
            filename: name.to_string(),
            content: Bytes::from_static(content),
        }
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(Duration::from_secs(3)), "3");
        assert_eq!(format_seconds(Duration::from_millis(1500)), "1.5");
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let config = BatchConfig {
            max_batch_size: 0,
            ..Default::default()
        };
        let services = Services {
            transport: Arc::new(MockTransport::new()),
            validator: Arc::new(ScriptedValidator::new()),
            converter: Arc::new(MockConverter::new()),
            outcomes: Arc::new(InMemoryOutcomeStore::new()),
        };
        assert!(matches!(
            BatchCoordinator::new(config, services, CancellationToken::new()),
            Err(VolleyError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_upload_has_no_side_effects() {
        let (coordinator, transport) = coordinator(BatchConfig::default());
        let err = coordinator
            .submit(upload(1, "photo.png", b"png"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VolleyError::AdmissionRejected(Rejection::WrongExtension { .. })
        ));
        assert!(coordinator.batch_status(SubmitterId(1)).is_none());

        let replies = transport.calls_of(CallKind::Send);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].text.starts_with("❌ Only SVG files are accepted."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_message_created_then_edited() {
        let (coordinator, transport) = coordinator(BatchConfig::default());
        let first = coordinator.submit(upload(1, "a.svg", b"<svg/>")).await.unwrap();
        let second = coordinator.submit(upload(1, "b.svg", b"<svg/>")).await.unwrap();

        assert!(first.is_new_batch);
        assert!(!second.is_new_batch);
        assert_eq!(first.batch_id, second.batch_id);
        assert_eq!(second.file_count, 2);

        let sends = transport.calls_of(CallKind::Send);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].text, "⏳ Please wait, processing for 3 seconds...");
        let handle = sends[0].message.unwrap();
        assert_eq!(
            transport.edits_of(handle),
            vec!["⏳ Please wait, processing 2 files for 3 seconds..."]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_is_dispatched_and_refuses_more() {
        let config = BatchConfig {
            max_batch_size: 2,
            ..Default::default()
        };
        let (coordinator, transport) = coordinator(config);
        coordinator.submit(upload(1, "a.svg", b"<svg/>")).await.unwrap();
        let full = coordinator.submit(upload(1, "b.svg", b"<svg/>")).await.unwrap();
        assert!(full.dispatched);
        assert_eq!(coordinator.queue_depth(), 1);
        assert_eq!(
            coordinator.batch_status(SubmitterId(1)).unwrap().phase,
            RunPhase::Queued
        );

        let err = coordinator
            .submit(upload(1, "c.svg", b"<svg/>"))
            .await
            .unwrap_err();
        assert!(matches!(err, VolleyError::BatchSealed(..)));
        assert_eq!(coordinator.batch_status(SubmitterId(1)).unwrap().file_count, 2);
        let last = transport.calls_of(CallKind::Send).pop().unwrap();
        assert!(last.text.starts_with("🔄 I'm currently processing your files."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_filled_during_slow_status_post_waits_for_handle() {
        let config = BatchConfig {
            max_batch_size: 2,
            ..Default::default()
        };
        let (coordinator, transport) = coordinator(config);
        transport.set_send_latency(Duration::from_secs(1));
        let coordinator = Arc::new(coordinator);

        let creator = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.submit(upload(1, "a.svg", b"<svg/>")).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let filler = coordinator.submit(upload(1, "b.svg", b"<svg/>")).await.unwrap();
        assert_eq!(filler.file_count, 2);
        assert!(!filler.dispatched);
        assert_eq!(coordinator.queue_depth(), 0);
        assert!(transport.calls_of(CallKind::Edit).is_empty());

        let created = creator.await.unwrap().unwrap();
        assert!(created.dispatched);
        assert_eq!(coordinator.queue_depth(), 1);

        let handle = transport.calls_of(CallKind::Send)[0].message.unwrap();
        assert_eq!(coordinator.store.get(SubmitterId(1)).unwrap().status_message, handle);
        assert_eq!(
            transport.edits_of(handle),
            vec!["⏳ Please wait, processing 2 files for 3 seconds..."]
        );
        assert!(transport.edits_of(MessageId(1)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_during_slow_status_post_dispatches_once() {
        let (coordinator, transport) = coordinator(BatchConfig::default());
        transport.set_send_latency(Duration::from_secs(5));

        let created = coordinator.submit(upload(1, "a.svg", b"<svg/>")).await.unwrap();
        assert!(created.dispatched);
        assert_eq!(coordinator.queue_depth(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(coordinator.queue_depth(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_file_batches_dispatch_on_create() {
        let config = BatchConfig {
            max_batch_size: 1,
            ..Default::default()
        };
        let (coordinator, _transport) = coordinator(config);
        let outcome = coordinator.submit(upload(1, "a.svg", b"<svg/>")).await.unwrap();
        assert!(outcome.is_new_batch);
        assert!(outcome.dispatched);
        assert_eq!(coordinator.queue_depth(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_twice_fails() {
        let (coordinator, _transport) = coordinator(BatchConfig::default());
        let worker = coordinator.run().unwrap();
        assert!(matches!(coordinator.run(), Err(VolleyError::AlreadyRunning)));

        coordinator.shutdown().await;
        worker.await.unwrap().unwrap();
        assert!(matches!(
            coordinator.submit(upload(1, "a.svg", b"<svg/>")).await,
            Err(VolleyError::Shutdown)
        ));
    }
}
