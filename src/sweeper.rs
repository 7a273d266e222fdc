//! Delayed eviction of completed batches.
//!
//! A finished batch stays in the store for a grace period so the submitter can still
//! ask about it, then the sweeper removes it. Eviction is keyed by batch instance: if
//! the submitter already started a new batch, the sweep for the old one finds a
//! different id at the key and leaves it alone.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::domain::batch::{BatchId, SubmitterId};
use crate::store::BatchStore;

#[derive(Clone)]
pub struct RetentionSweeper {
    store: Arc<BatchStore>,
    tracker: TaskTracker,
    shutdown_token: CancellationToken,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<BatchStore>,
        tracker: TaskTracker,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            tracker,
            shutdown_token,
        }
    }

    /// Evict `batch_id` after `delay`, provided it is still the submitter's batch and
    /// still completed.
    pub fn schedule_eviction(&self, submitter: SubmitterId, batch_id: BatchId, delay: Duration) {
        let store = self.store.clone();
        let shutdown_token = self.shutdown_token.clone();

        self.tracker.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_token.cancelled() => return,
            }

            if store.evict_instance(submitter, batch_id) {
                tracing::debug!(submitter = %submitter, batch_id = %batch_id, "Evicted completed batch");
            } else {
                tracing::debug!(
                    submitter = %submitter,
                    batch_id = %batch_id,
                    "Skipped eviction, batch already gone or superseded"
                );
            }
        });
    }
}
