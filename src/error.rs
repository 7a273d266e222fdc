//! Error types for the batching system.

use thiserror::Error;

use crate::admission::Rejection;
use crate::domain::batch::{BatchId, SubmitterId};

/// Result type alias using the volley error type.
pub type Result<T> = std::result::Result<T, VolleyError>;

/// Main error type for the batching system.
#[derive(Error, Debug)]
pub enum VolleyError {
    /// Upload refused by the admission gate (wrong extension, too large)
    #[error("Upload rejected: {0}")]
    AdmissionRejected(Rejection),

    /// The validation collaborator refused a file
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// The conversion collaborator could not produce an artifact
    #[error("Conversion failed: {0}")]
    ConversionFailed(String),

    /// A send/edit/deliver call on the messaging transport failed
    #[error("Transport failure: {0}")]
    Transport(String),

    /// No batch is held for this submitter
    #[error("No batch for submitter {0}")]
    BatchNotFound(SubmitterId),

    /// The submitter's batch has been dispatched and no longer accepts files
    #[error("Batch {1} for submitter {0} is sealed")]
    BatchSealed(SubmitterId, BatchId),

    /// A deferred action or signal referenced a batch instance that is no longer current
    #[error("Batch {1} for submitter {0} was replaced or evicted")]
    StaleBatch(SubmitterId, BatchId),

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// `run` was called twice on the same coordinator
    #[error("Batch processor is already running")]
    AlreadyRunning,

    /// Coordinator is shutting down
    #[error("Coordinator is shutting down")]
    Shutdown,

    /// Database error from the outcome store
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VolleyError {
    /// Whether this error is local to a single file (the batch carries on).
    pub fn is_per_file(&self) -> bool {
        matches!(
            self,
            VolleyError::ValidationFailed(_)
                | VolleyError::ConversionFailed(_)
                | VolleyError::Transport(_)
        )
    }

    /// Text recorded against a failed file in the outcome store.
    pub fn outcome_message(&self) -> String {
        match self {
            VolleyError::ValidationFailed(msg) | VolleyError::ConversionFailed(msg) => msg.clone(),
            other => format!("❌ Processing error: {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_file_errors() {
        assert!(VolleyError::ValidationFailed("bad root".into()).is_per_file());
        assert!(VolleyError::ConversionFailed("lottie".into()).is_per_file());
        assert!(VolleyError::Transport("429".into()).is_per_file());
        assert!(!VolleyError::Shutdown.is_per_file());
        assert!(!VolleyError::BatchNotFound(SubmitterId(7)).is_per_file());
    }

    #[test]
    fn test_outcome_message_keeps_collaborator_text() {
        let err = VolleyError::ValidationFailed("❌ SVG must be 512x512".into());
        assert_eq!(err.outcome_message(), "❌ SVG must be 512x512");

        let err = VolleyError::Other(anyhow::anyhow!("disk full"));
        assert_eq!(err.outcome_message(), "❌ Processing error: disk full");
    }
}
