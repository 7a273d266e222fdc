//! Debounce timers that turn an accumulating batch into a dispatch signal.
//!
//! A timer is armed once, when the batch is created, and fires `processing_delay`
//! later regardless of how many files arrive in between. That bounds how long the
//! first uploader waits. A burst that straddles the deadline is split across two
//! batches.
//!
//! Timers are never cancelled individually. When a batch is sealed early by its size
//! cap, the later fire finds it already sealed in the store and does nothing.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::domain::batch::{BatchId, SubmitterId};
use crate::error::Result;
use crate::queue::{DispatchQueue, DispatchSignal};
use crate::store::BatchStore;

pub struct DebounceScheduler {
    store: Arc<BatchStore>,
    queue: DispatchQueue,
    delay: Duration,
    tracker: TaskTracker,
    shutdown_token: CancellationToken,
}

impl DebounceScheduler {
    pub fn new(
        store: Arc<BatchStore>,
        queue: DispatchQueue,
        delay: Duration,
        tracker: TaskTracker,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            queue,
            delay,
            tracker,
            shutdown_token,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Start the one-shot timer for a freshly created batch.
    pub fn arm_on_create(&self, submitter: SubmitterId, batch_id: BatchId) {
        let store = self.store.clone();
        let queue = self.queue.clone();
        let delay = self.delay;
        let shutdown_token = self.shutdown_token.clone();

        tracing::debug!(
            submitter = %submitter,
            batch_id = %batch_id,
            delay_ms = delay.as_millis() as u64,
            "Armed debounce timer"
        );

        self.tracker.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_token.cancelled() => {
                    tracing::debug!(submitter = %submitter, batch_id = %batch_id, "Debounce timer cancelled by shutdown");
                    return;
                }
            }

            if !store.seal(submitter, batch_id) {
                tracing::debug!(
                    submitter = %submitter,
                    batch_id = %batch_id,
                    "Debounce timer fired for a batch that is already sealed or gone"
                );
                return;
            }

            tracing::info!(submitter = %submitter, batch_id = %batch_id, "Debounce window elapsed, dispatching batch");
            if let Err(e) = queue.enqueue(DispatchSignal { submitter, batch_id }).await {
                tracing::error!(
                    submitter = %submitter,
                    batch_id = %batch_id,
                    error = %e,
                    "Failed to enqueue batch after debounce"
                );
            }
        });
    }

    /// Dispatch a batch that the store already sealed because it reached its size cap.
    pub async fn dispatch_sealed(&self, submitter: SubmitterId, batch_id: BatchId) -> Result<()> {
        tracing::info!(submitter = %submitter, batch_id = %batch_id, "Dispatching full batch immediately");
        self.queue
            .enqueue(DispatchSignal {
                submitter,
                batch_id,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::batch::RunPhase;
    use crate::domain::file::{ChatId, MessageId, PendingFile};
    use crate::queue::dispatch_queue;

    const USER: SubmitterId = SubmitterId(5);

    fn file(n: i64) -> PendingFile {
        PendingFile::new(&b"<svg/>"[..], format!("{n}.svg"), MessageId(n), ChatId(1))
    }

    fn scheduler(store: Arc<BatchStore>) -> (DebounceScheduler, crate::queue::DispatchReceiver, CancellationToken) {
        let (queue, rx) = dispatch_queue(16);
        let token = CancellationToken::new();
        let scheduler = DebounceScheduler::new(
            store,
            queue,
            Duration::from_secs(3),
            TaskTracker::new(),
            token.clone(),
        );
        (scheduler, rx, token)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let store = Arc::new(BatchStore::new(15));
        let (scheduler, mut rx, _token) = scheduler(store.clone());

        let start = tokio::time::Instant::now();
        let outcome = store.append_or_create(USER, file(1)).unwrap();
        scheduler.arm_on_create(USER, outcome.batch_id);

        let signal = rx.next().await.unwrap();
        assert_eq!(signal.batch_id, outcome.batch_id);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(store.get(USER).unwrap().phase, RunPhase::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_is_noop_after_size_cap_seal() {
        let store = Arc::new(BatchStore::new(2));
        let (scheduler, mut rx, _token) = scheduler(store.clone());

        let first = store.append_or_create(USER, file(1)).unwrap();
        scheduler.arm_on_create(USER, first.batch_id);
        let full = store.append_or_create(USER, file(2)).unwrap();
        assert!(full.sealed_by_full);
        scheduler
            .dispatch_sealed(USER, full.batch_id)
            .await
            .unwrap();

        assert_eq!(rx.next().await.unwrap().batch_id, first.batch_id);

        // Let the timer fire; it must not produce a second signal
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rx.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_timers() {
        let store = Arc::new(BatchStore::new(15));
        let (scheduler, mut rx, token) = scheduler(store.clone());
        let outcome = store.append_or_create(USER, file(1)).unwrap();
        scheduler.arm_on_create(USER, outcome.batch_id);

        token.cancel();
        scheduler.tracker.close();
        scheduler.tracker.wait().await;

        rx.close();
        assert!(rx.next().await.is_none());
        assert_eq!(store.get(USER).unwrap().phase, RunPhase::Accumulating);
    }
}
