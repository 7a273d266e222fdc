//! Batch run state types using the typestate pattern.
//!
//! A claimed batch moves through `Queued -> Announcing -> Converting -> Finalizing ->
//! Completed`. Each step consumes the previous state, so a run cannot skip a step or be
//! finalized twice.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::batch::{Batch, BatchId, SubmitterId};
use crate::domain::file::{ChatId, MessageId, PendingFile};

/// Marker trait for valid run states.
pub trait RunState: Send + Sync {}

/// One batch being driven by the worker.
#[derive(Debug, Clone)]
pub struct BatchRun<T: RunState> {
    pub state: T,
    pub data: RunData,
}

/// Everything the run needs from the claimed batch.
#[derive(Debug, Clone)]
pub struct RunData {
    pub batch_id: BatchId,
    pub submitter: SubmitterId,
    pub chat_id: ChatId,
    pub status_message: MessageId,
    pub files: Vec<PendingFile>,
}

impl From<Batch> for RunData {
    fn from(batch: Batch) -> Self {
        Self {
            batch_id: batch.id,
            submitter: batch.submitter,
            chat_id: batch.chat_id,
            status_message: batch.status_message,
            files: batch.files,
        }
    }
}

// ============================================================================
// Run States
// ============================================================================

/// Claimed from the store, nothing reported yet.
#[derive(Debug, Clone, Serialize)]
pub struct Queued {
    pub claimed_at: DateTime<Utc>,
}

impl RunState for Queued {}

/// The "converting" status has been posted.
#[derive(Debug, Clone, Serialize)]
pub struct Announcing {
    pub claimed_at: DateTime<Utc>,
}

impl RunState for Announcing {}

/// Files are being validated and converted.
#[derive(Debug, Clone, Serialize)]
pub struct Converting {
    pub claimed_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl RunState for Converting {}

/// Every file has been attempted.
#[derive(Debug, Clone, Serialize)]
pub struct Finalizing {
    pub claimed_at: DateTime<Utc>,
    pub tally: Tally,
}

impl RunState for Finalizing {}

/// Summary posted and batch marked completed (terminal state).
#[derive(Debug, Clone, Serialize)]
pub struct Completed {
    pub claimed_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub tally: Tally,
}

impl RunState for Completed {}

impl BatchRun<Queued> {
    pub fn new(batch: Batch) -> Self {
        Self {
            state: Queued {
                claimed_at: Utc::now(),
            },
            data: batch.into(),
        }
    }
}

/// Per-batch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub total: usize,
    pub processed: usize,
    pub converted: usize,
    pub failed: usize,
}

impl Tally {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn record_success(&mut self) {
        self.processed += 1;
        self.converted += 1;
    }

    pub fn record_failure(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }

    /// Share of files processed, rounded down.
    pub fn percent(&self) -> usize {
        if self.total == 0 {
            return 100;
        }
        self.processed * 100 / self.total
    }

    /// Whether a progress update is due after the latest file.
    pub fn progress_due(&self, every: usize) -> bool {
        every > 0 && self.processed > 0 && self.processed % every == 0
    }

    pub fn progress_text(&self) -> String {
        format!(
            "🔄 Progress: {}/{} ({}%)\n✅ {} converted | ❌ {} failed",
            self.processed,
            self.total,
            self.percent(),
            self.converted,
            self.failed
        )
    }

    /// Terminal status text.
    pub fn summary_text(&self) -> String {
        if self.converted == 0 {
            return "❌ No files could be converted".to_string();
        }
        let mut text = "Done ✅".to_string();
        if self.failed > 0 {
            text.push_str(&format!(
                "\n✅ {} converted | ❌ {} failed",
                self.converted, self.failed
            ));
        }
        text
    }
}
