//! Batch types for grouping a submitter's uploads.
//!
//! A batch is the unit of work for one submitter: every file they upload inside the
//! debounce window lands in the same batch, which is then converted end-to-end by the
//! worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::file::{ChatId, MessageId, PendingFile};

/// Stable key of the user whose uploads are grouped together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmitterId(pub i64);

impl std::fmt::Display for SubmitterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one batch instance.
///
/// A submitter can own several batches over time (one after another). Every deferred
/// action carries the instance id so it never touches a newer batch at the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        BatchId(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for BatchId {
    fn from(uuid: Uuid) -> Self {
        BatchId(uuid)
    }
}

impl std::ops::Deref for BatchId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Where a batch is in its lifecycle.
///
/// ```text
/// Accumulating ──seal──> Queued ──> Announcing ──> Converting ──> Finalizing ──> Completed
/// ```
///
/// Only `Accumulating` accepts new files. Sealing happens either when the debounce
/// timer fires or when the batch reaches its size cap, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Accumulating,
    Queued,
    Announcing,
    Converting,
    Finalizing,
    Completed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Accumulating => "accumulating",
            RunPhase::Queued => "queued",
            RunPhase::Announcing => "announcing",
            RunPhase::Converting => "converting",
            RunPhase::Finalizing => "finalizing",
            RunPhase::Completed => "completed",
        }
    }

    /// Whether the batch has been frozen against further appends.
    pub fn is_sealed(&self) -> bool {
        !matches!(self, RunPhase::Accumulating)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submitter's pending (or recently finished) batch.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub submitter: SubmitterId,
    /// Chat where the first file arrived; status updates are posted here
    pub chat_id: ChatId,
    /// Files in arrival order
    pub files: Vec<PendingFile>,
    /// Message used to report progress. Starts as the first upload's message and is
    /// replaced once, when the status message has been posted.
    pub status_message: MessageId,
    /// The creator is still posting the status message
    pub status_pending: bool,
    /// Sealed while `status_pending`; whoever resolves the status message dispatches it
    pub dispatch_held: bool,
    pub phase: RunPhase,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Start a batch from its first file.
    pub fn new(submitter: SubmitterId, first: PendingFile) -> Self {
        Self {
            id: BatchId::new(),
            submitter,
            chat_id: first.chat_id,
            status_message: first.message_id,
            status_pending: false,
            dispatch_held: false,
            files: vec![first],
            phase: RunPhase::Accumulating,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn is_completed(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Freeze against further appends. Dispatch is held while the status message is
    /// still being posted.
    pub(crate) fn seal(&mut self) {
        self.phase = RunPhase::Queued;
        self.dispatch_held = self.status_pending;
    }

    pub fn total_bytes(&self) -> usize {
        self.files.iter().map(PendingFile::size).sum()
    }

    pub fn status(&self) -> BatchStatus {
        BatchStatus {
            batch_id: self.id,
            submitter: self.submitter,
            phase: self.phase,
            file_count: self.files.len(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Read-only view of a batch, used to answer "what is happening with my files".
#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub batch_id: BatchId,
    pub submitter: SubmitterId,
    pub phase: RunPhase,
    pub file_count: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchStatus {
    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn is_running(&self) -> bool {
        !self.is_finished()
    }

    /// Whole seconds since the batch was created.
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds().max(0)
    }

    /// Text shown to the user when they message the bot mid-batch.
    pub fn describe(&self, now: DateTime<Utc>) -> String {
        if self.is_finished() {
            return "Completed".to_string();
        }
        format!(
            "Processing {} files (elapsed: {}s)",
            self.file_count,
            self.elapsed_secs(now)
        )
    }
}
