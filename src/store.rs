//! In-memory store of every submitter's current batch.
//!
//! The store is the only owner of [`Batch`] values. The scheduler, queue and sweeper
//! refer to batches by `(SubmitterId, BatchId)` and go through the methods here for
//! every read and write.
//!
//! # Locking
//!
//! Batches live in a sharded [`DashMap`]. Every mutation for a submitter runs inside that
//! key's entry guard, so appends, seals, phase changes, completion and eviction for one
//! submitter are totally ordered while other submitters proceed on other shards. Guards
//! are only ever held for synchronous critical sections, never across an `.await`.

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::domain::batch::{Batch, BatchId, BatchStatus, RunPhase, SubmitterId};
use crate::domain::file::{ChatId, MessageId, PendingFile};
use crate::error::{Result, VolleyError};

/// What happened when a file was added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub batch_id: BatchId,
    /// Number of files in the batch after the append
    pub file_count: usize,
    /// The file started a new batch (first upload, or previous batch already completed)
    pub is_new_batch: bool,
    /// The file filled the batch and it has been sealed
    pub sealed_by_full: bool,
    /// The sealed batch waits for its status message; the creator dispatches it
    pub dispatch_held: bool,
    pub chat_id: ChatId,
    /// `None` while the creator is still posting the status message
    pub status_message: Option<MessageId>,
}

impl AppendOutcome {
    /// Whether the caller must enqueue the batch now.
    pub fn must_dispatch(&self) -> bool {
        self.sealed_by_full && !self.dispatch_held
    }
}

/// Result of resolving a batch's status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResolution {
    pub status_message: MessageId,
    pub file_count: usize,
    /// The batch was sealed while the status message was in flight and must be
    /// enqueued by the caller now
    pub dispatch: bool,
}

/// Per-submitter batch map.
pub struct BatchStore {
    batches: DashMap<SubmitterId, Batch>,
    max_batch_size: usize,
}

impl BatchStore {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            batches: DashMap::new(),
            max_batch_size: max_batch_size.max(1),
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Add a file to the submitter's batch, creating the batch if needed.
    ///
    /// A completed batch still waiting for eviction is replaced by a fresh one. A batch
    /// that is sealed but not yet completed refuses the file with
    /// [`VolleyError::BatchSealed`].
    pub fn append_or_create(
        &self,
        submitter: SubmitterId,
        file: PendingFile,
    ) -> Result<AppendOutcome> {
        self.append(submitter, file, false)
    }

    /// Like [`BatchStore::append_or_create`], but a batch created by this call waits for
    /// [`BatchStore::resolve_status_message`] before it can be dispatched.
    ///
    /// Until then a seal (size cap or debounce timer) freezes the batch without
    /// dispatching it, so the worker never reports to a handle that is about to change.
    pub fn append_awaiting_status(
        &self,
        submitter: SubmitterId,
        file: PendingFile,
    ) -> Result<AppendOutcome> {
        self.append(submitter, file, true)
    }

    fn append(
        &self,
        submitter: SubmitterId,
        file: PendingFile,
        awaiting_status: bool,
    ) -> Result<AppendOutcome> {
        let (outcome, replaced) = match self.batches.entry(submitter) {
            Entry::Vacant(entry) => {
                let batch = self.start_batch(submitter, file, awaiting_status);
                let outcome = outcome_of(&batch, true);
                entry.insert(batch);
                (outcome, None)
            }
            Entry::Occupied(mut entry) => {
                let batch = entry.get_mut();
                match batch.phase {
                    RunPhase::Completed => {
                        let previous = batch.id;
                        *batch = self.start_batch(submitter, file, awaiting_status);
                        (outcome_of(batch, true), Some(previous))
                    }
                    RunPhase::Accumulating if batch.files.len() < self.max_batch_size => {
                        batch.files.push(file);
                        if batch.files.len() >= self.max_batch_size {
                            batch.seal();
                        }
                        (outcome_of(batch, false), None)
                    }
                    _ => return Err(VolleyError::BatchSealed(submitter, batch.id)),
                }
            }
        };

        if let Some(previous) = replaced {
            tracing::debug!(
                submitter = %submitter,
                previous_batch_id = %previous,
                batch_id = %outcome.batch_id,
                "Replaced completed batch with a new one"
            );
        }
        if outcome.is_new_batch {
            tracing::info!(submitter = %submitter, batch_id = %outcome.batch_id, "Created batch");
        } else {
            tracing::debug!(
                submitter = %submitter,
                batch_id = %outcome.batch_id,
                file_count = outcome.file_count,
                "Appended file to batch"
            );
        }
        if outcome.sealed_by_full {
            tracing::info!(
                submitter = %submitter,
                batch_id = %outcome.batch_id,
                file_count = outcome.file_count,
                dispatch_held = outcome.dispatch_held,
                "Batch reached size cap and was sealed"
            );
        }

        Ok(outcome)
    }

    fn start_batch(&self, submitter: SubmitterId, file: PendingFile, awaiting_status: bool) -> Batch {
        let mut batch = Batch::new(submitter, file);
        batch.status_pending = awaiting_status;
        if batch.files.len() >= self.max_batch_size {
            batch.seal();
        }
        batch
    }

    /// Snapshot of the submitter's batch.
    pub fn get(&self, submitter: SubmitterId) -> Option<Batch> {
        self.batches.get(&submitter).map(|b| b.value().clone())
    }

    pub fn status(&self, submitter: SubmitterId) -> Option<BatchStatus> {
        self.batches.get(&submitter).map(|b| b.status())
    }

    /// Settle the status message of a batch created by
    /// [`BatchStore::append_awaiting_status`].
    ///
    /// `Some` replaces the handle chosen at creation; `None` keeps it (the post failed).
    /// Only the first resolution for a batch instance takes effect, and only while the
    /// batch has not been handed to the worker. Returns `None` when refused.
    pub fn resolve_status_message(
        &self,
        submitter: SubmitterId,
        batch_id: BatchId,
        message: Option<MessageId>,
    ) -> Option<StatusResolution> {
        let mut batch = self.batches.get_mut(&submitter)?;
        let undispatched = batch.phase == RunPhase::Accumulating
            || (batch.phase == RunPhase::Queued && batch.dispatch_held);
        if batch.id != batch_id || !batch.status_pending || !undispatched {
            return None;
        }

        if let Some(message) = message {
            batch.status_message = message;
        }
        batch.status_pending = false;
        let dispatch = std::mem::take(&mut batch.dispatch_held);
        if dispatch {
            tracing::debug!(
                submitter = %submitter,
                batch_id = %batch_id,
                "Status message resolved, releasing held batch"
            );
        }
        Some(StatusResolution {
            status_message: batch.status_message,
            file_count: batch.files.len(),
            dispatch,
        })
    }

    /// Seal a batch for dispatch (`Accumulating -> Queued`).
    ///
    /// Returns true only for the caller that performed the transition; a later timer
    /// fire, or a fire after a size-cap seal, gets false and must not enqueue. A batch
    /// still waiting for its status message is sealed but held, and also gets false.
    pub fn seal(&self, submitter: SubmitterId, batch_id: BatchId) -> bool {
        match self.batches.get_mut(&submitter) {
            Some(mut batch) if batch.id == batch_id && batch.phase == RunPhase::Accumulating => {
                batch.seal();
                if batch.dispatch_held {
                    tracing::debug!(
                        submitter = %submitter,
                        batch_id = %batch_id,
                        "Batch sealed before its status message was posted, holding dispatch"
                    );
                }
                !batch.dispatch_held
            }
            _ => false,
        }
    }

    /// Hand the worker a frozen copy of a queued batch.
    ///
    /// Returns `None` when the batch is absent, has been replaced, is not in `Queued`,
    /// or is held for its status message; the caller drops the signal.
    pub fn claim(&self, submitter: SubmitterId, batch_id: BatchId) -> Option<Batch> {
        self.batches
            .get(&submitter)
            .filter(|b| b.id == batch_id && b.phase == RunPhase::Queued && !b.dispatch_held)
            .map(|b| b.value().clone())
    }

    /// Record the worker's progress through a batch.
    pub fn set_phase(&self, submitter: SubmitterId, batch_id: BatchId, phase: RunPhase) -> Result<()> {
        let mut batch = self
            .batches
            .get_mut(&submitter)
            .ok_or(VolleyError::BatchNotFound(submitter))?;
        if batch.id != batch_id {
            return Err(VolleyError::StaleBatch(submitter, batch_id));
        }
        batch.phase = phase;
        Ok(())
    }

    /// Mark a batch completed. Logs and returns false if it is no longer held.
    pub fn mark_completed(&self, submitter: SubmitterId, batch_id: BatchId) -> bool {
        match self.batches.get_mut(&submitter) {
            Some(mut batch) if batch.id == batch_id => {
                if !batch.is_completed() {
                    batch.phase = RunPhase::Completed;
                    batch.completed_at = Some(Utc::now());
                }
                true
            }
            _ => {
                tracing::warn!(
                    submitter = %submitter,
                    batch_id = %batch_id,
                    "Cannot mark batch completed, it is no longer held"
                );
                false
            }
        }
    }

    /// Remove whatever batch the submitter has. No-op when there is none.
    pub fn evict(&self, submitter: SubmitterId) -> Option<Batch> {
        self.batches.remove(&submitter).map(|(_, batch)| batch)
    }

    /// Remove the given batch instance, only if it is still the submitter's batch and
    /// is completed.
    pub fn evict_instance(&self, submitter: SubmitterId, batch_id: BatchId) -> bool {
        self.batches
            .remove_if(&submitter, |_, batch| {
                batch.id == batch_id && batch.is_completed()
            })
            .is_some()
    }

    /// Number of batches held, including completed ones awaiting eviction.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Number of batches that are not completed.
    pub fn active_count(&self) -> usize {
        self.batches.iter().filter(|b| !b.is_completed()).count()
    }
}

fn outcome_of(batch: &Batch, is_new_batch: bool) -> AppendOutcome {
    AppendOutcome {
        batch_id: batch.id,
        file_count: batch.files.len(),
        is_new_batch,
        sealed_by_full: batch.phase == RunPhase::Queued,
        dispatch_held: batch.dispatch_held,
        chat_id: batch.chat_id,
        status_message: (!batch.status_pending).then_some(batch.status_message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const USER: SubmitterId = SubmitterId(42);

    fn file(n: i64) -> PendingFile {
        PendingFile::new(
            format!("<svg id=\"{n}\"/>").into_bytes(),
            format!("f{n}.svg"),
            MessageId(n),
            ChatId(7),
        )
    }

    #[test]
    fn test_first_file_creates_batch() {
        let store = BatchStore::new(15);
        let outcome = store.append_or_create(USER, file(1)).unwrap();
        assert!(outcome.is_new_batch);
        assert!(!outcome.sealed_by_full);
        assert_eq!(outcome.file_count, 1);
        assert_eq!(outcome.status_message, Some(MessageId(1)));

        let batch = store.get(USER).unwrap();
        assert_eq!(batch.id, outcome.batch_id);
        assert_eq!(batch.phase, RunPhase::Accumulating);
    }

    #[test]
    fn test_appends_keep_arrival_order() {
        let store = BatchStore::new(15);
        let first = store.append_or_create(USER, file(1)).unwrap();
        for n in 2..=4 {
            let outcome = store.append_or_create(USER, file(n)).unwrap();
            assert!(!outcome.is_new_batch);
            assert_eq!(outcome.batch_id, first.batch_id);
            assert_eq!(outcome.file_count, n as usize);
        }
        let names: Vec<_> = store
            .get(USER)
            .unwrap()
            .files
            .iter()
            .map(|f| f.filename.clone())
            .collect();
        assert_eq!(names, vec!["f1.svg", "f2.svg", "f3.svg", "f4.svg"]);
    }

    #[test]
    fn test_filling_append_seals_and_further_files_are_refused() {
        let store = BatchStore::new(3);
        store.append_or_create(USER, file(1)).unwrap();
        assert!(!store.append_or_create(USER, file(2)).unwrap().sealed_by_full);
        let full = store.append_or_create(USER, file(3)).unwrap();
        assert!(full.sealed_by_full);
        assert_eq!(store.get(USER).unwrap().phase, RunPhase::Queued);

        let err = store.append_or_create(USER, file(4)).unwrap_err();
        assert!(matches!(err, VolleyError::BatchSealed(s, id) if s == USER && id == full.batch_id));
        assert_eq!(store.get(USER).unwrap().len(), 3);
    }

    #[test]
    fn test_single_file_cap_seals_on_create() {
        let store = BatchStore::new(1);
        let outcome = store.append_or_create(USER, file(1)).unwrap();
        assert!(outcome.is_new_batch);
        assert!(outcome.sealed_by_full);
    }

    #[test]
    fn test_seal_succeeds_once() {
        let store = BatchStore::new(15);
        let outcome = store.append_or_create(USER, file(1)).unwrap();
        assert!(store.seal(USER, outcome.batch_id));
        assert!(!store.seal(USER, outcome.batch_id));
        assert!(!store.seal(USER, BatchId::new()));
        assert!(!store.seal(SubmitterId(9), outcome.batch_id));
    }

    #[test]
    fn test_claim_requires_queued_instance() {
        let store = BatchStore::new(15);
        let outcome = store.append_or_create(USER, file(1)).unwrap();
        assert!(store.claim(USER, outcome.batch_id).is_none());

        store.seal(USER, outcome.batch_id);
        assert!(store.claim(USER, BatchId::new()).is_none());
        let claimed = store.claim(USER, outcome.batch_id).unwrap();
        assert_eq!(claimed.len(), 1);

        store.mark_completed(USER, outcome.batch_id);
        assert!(store.claim(USER, outcome.batch_id).is_none());
    }

    #[test]
    fn test_status_message_resolved_once() {
        let store = BatchStore::new(15);
        let outcome = store.append_awaiting_status(USER, file(1)).unwrap();
        assert_eq!(outcome.status_message, None);

        let resolved = store
            .resolve_status_message(USER, outcome.batch_id, Some(MessageId(100)))
            .unwrap();
        assert_eq!(resolved.status_message, MessageId(100));
        assert!(!resolved.dispatch);
        assert!(store
            .resolve_status_message(USER, outcome.batch_id, Some(MessageId(200)))
            .is_none());
        assert_eq!(store.get(USER).unwrap().status_message, MessageId(100));

        let next = store.append_or_create(USER, file(2)).unwrap();
        assert_eq!(next.status_message, Some(MessageId(100)));
    }

    #[test]
    fn test_plain_batch_refuses_status_resolution() {
        let store = BatchStore::new(15);
        let outcome = store.append_or_create(USER, file(1)).unwrap();
        assert!(store
            .resolve_status_message(USER, outcome.batch_id, Some(MessageId(100)))
            .is_none());
        assert_eq!(store.get(USER).unwrap().status_message, MessageId(1));
    }

    #[test]
    fn test_fill_while_status_in_flight_holds_dispatch() {
        let store = BatchStore::new(2);
        let created = store.append_awaiting_status(USER, file(1)).unwrap();
        let full = store.append_or_create(USER, file(2)).unwrap();
        assert!(full.sealed_by_full);
        assert!(full.dispatch_held);
        assert!(!full.must_dispatch());
        assert_eq!(full.status_message, None);

        // Held batches are frozen but invisible to the worker
        assert!(store.claim(USER, created.batch_id).is_none());
        assert!(matches!(
            store.append_or_create(USER, file(3)),
            Err(VolleyError::BatchSealed(..))
        ));
        assert!(!store.seal(USER, created.batch_id));

        let resolved = store
            .resolve_status_message(USER, created.batch_id, Some(MessageId(500)))
            .unwrap();
        assert!(resolved.dispatch);
        assert_eq!(resolved.file_count, 2);
        let claimed = store.claim(USER, created.batch_id).unwrap();
        assert_eq!(claimed.status_message, MessageId(500));
    }

    #[test]
    fn test_timer_seal_while_status_in_flight_is_held() {
        let store = BatchStore::new(15);
        let created = store.append_awaiting_status(USER, file(1)).unwrap();
        assert!(!store.seal(USER, created.batch_id));
        assert_eq!(store.get(USER).unwrap().phase, RunPhase::Queued);
        assert!(store.claim(USER, created.batch_id).is_none());

        // Failed post keeps the original handle but still releases the batch
        let resolved = store
            .resolve_status_message(USER, created.batch_id, None)
            .unwrap();
        assert!(resolved.dispatch);
        assert_eq!(resolved.status_message, MessageId(1));
        assert!(store.claim(USER, created.batch_id).is_some());
    }

    #[test]
    fn test_late_status_message_cannot_touch_dispatched_batch() {
        let store = BatchStore::new(15);
        let created = store.append_awaiting_status(USER, file(1)).unwrap();
        store
            .set_phase(USER, created.batch_id, RunPhase::Converting)
            .unwrap();
        assert!(store
            .resolve_status_message(USER, created.batch_id, Some(MessageId(9)))
            .is_none());

        store.mark_completed(USER, created.batch_id);
        assert!(store
            .resolve_status_message(USER, created.batch_id, Some(MessageId(9)))
            .is_none());
        assert_eq!(store.get(USER).unwrap().status_message, MessageId(1));
    }

    #[test]
    fn test_single_file_cap_awaiting_status_is_held() {
        let store = BatchStore::new(1);
        let created = store.append_awaiting_status(USER, file(1)).unwrap();
        assert!(created.sealed_by_full);
        assert!(created.dispatch_held);
        let resolved = store
            .resolve_status_message(USER, created.batch_id, Some(MessageId(7)))
            .unwrap();
        assert!(resolved.dispatch);
    }

    #[test]
    fn test_completed_batch_is_replaced_by_new_arrival() {
        let store = BatchStore::new(15);
        let old = store.append_or_create(USER, file(1)).unwrap();
        store.seal(USER, old.batch_id);
        assert!(store.mark_completed(USER, old.batch_id));

        let fresh = store.append_or_create(USER, file(2)).unwrap();
        assert!(fresh.is_new_batch);
        assert_ne!(fresh.batch_id, old.batch_id);
        assert_eq!(fresh.status_message, Some(MessageId(2)));

        // The sweep scheduled for the old instance must leave the new one alone
        assert!(!store.evict_instance(USER, old.batch_id));
        assert_eq!(store.get(USER).unwrap().id, fresh.batch_id);
    }

    #[test]
    fn test_set_phase_detects_stale_and_missing() {
        let store = BatchStore::new(15);
        let outcome = store.append_or_create(USER, file(1)).unwrap();
        store
            .set_phase(USER, outcome.batch_id, RunPhase::Converting)
            .unwrap();
        assert!(matches!(
            store.set_phase(USER, BatchId::new(), RunPhase::Finalizing),
            Err(VolleyError::StaleBatch(..))
        ));
        assert!(matches!(
            store.set_phase(SubmitterId(1), outcome.batch_id, RunPhase::Finalizing),
            Err(VolleyError::BatchNotFound(_))
        ));
    }

    #[test]
    fn test_evict_is_idempotent() {
        let store = BatchStore::new(15);
        assert!(store.evict(USER).is_none());
        store.append_or_create(USER, file(1)).unwrap();
        assert!(store.evict(USER).is_some());
        assert!(store.evict(USER).is_none());
        assert!(!store.mark_completed(USER, BatchId::new()));
    }

    #[test]
    fn test_evict_instance_only_when_completed() {
        let store = BatchStore::new(15);
        let outcome = store.append_or_create(USER, file(1)).unwrap();
        assert!(!store.evict_instance(USER, outcome.batch_id));
        store.mark_completed(USER, outcome.batch_id);
        assert!(store.evict_instance(USER, outcome.batch_id));
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_never_exceed_cap() {
        let store = Arc::new(BatchStore::new(15));
        let mut handles = Vec::new();
        for n in 0..40 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.append_or_create(USER, file(n))
            }));
        }

        let mut accepted = 0;
        let mut created = 0;
        let mut sealed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(outcome) => {
                    accepted += 1;
                    created += outcome.is_new_batch as usize;
                    sealed += outcome.sealed_by_full as usize;
                }
                Err(VolleyError::BatchSealed(..)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(accepted, 15);
        assert_eq!(created, 1);
        assert_eq!(sealed, 1);
        assert_eq!(store.get(USER).unwrap().len(), 15);
    }
}
