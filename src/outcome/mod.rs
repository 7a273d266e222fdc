//! Persistence of per-file conversion outcomes.
//!
//! The worker records one [`ConversionOutcome`] per processed file. Recording is
//! best-effort from the worker's point of view: a failing store is logged and the batch
//! carries on.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::batch::SubmitterId;
use crate::error::{Result, VolleyError};

#[cfg(feature = "postgres")]
pub mod postgres;

/// One file's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionOutcome {
    pub submitter: SubmitterId,
    pub filename: String,
    pub size: usize,
    pub success: bool,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ConversionOutcome {
    pub fn succeeded(submitter: SubmitterId, filename: &str, size: usize) -> Self {
        Self {
            submitter,
            filename: filename.to_string(),
            size,
            success: true,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(
        submitter: SubmitterId,
        filename: &str,
        size: usize,
        error: impl Into<String>,
    ) -> Self {
        Self {
            submitter,
            filename: filename.to_string(),
            size,
            success: false,
            error: Some(error.into()),
            recorded_at: Utc::now(),
        }
    }
}

/// Storage for conversion outcomes and the submitter ban list.
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    /// Persist one file's outcome.
    async fn record_outcome(&self, outcome: &ConversionOutcome) -> Result<()>;

    /// Whether the submitter is banned from using the service.
    async fn is_banned(&self, submitter: SubmitterId) -> Result<bool>;
}

/// In-memory outcome store.
///
/// Useful for tests and for running without a database.
#[derive(Clone, Default)]
pub struct InMemoryOutcomeStore {
    outcomes: Arc<Mutex<Vec<ConversionOutcome>>>,
    banned: Arc<Mutex<HashSet<SubmitterId>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl InMemoryOutcomeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ban(&self, submitter: SubmitterId) {
        self.banned.lock().insert(submitter);
    }

    pub fn unban(&self, submitter: SubmitterId) {
        self.banned.lock().remove(&submitter);
    }

    /// Make every call fail, as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    pub fn outcomes(&self) -> Vec<ConversionOutcome> {
        self.outcomes.lock().clone()
    }

    pub fn outcomes_for(&self, submitter: SubmitterId) -> Vec<ConversionOutcome> {
        self.outcomes
            .lock()
            .iter()
            .filter(|o| o.submitter == submitter)
            .cloned()
            .collect()
    }

    fn check_available(&self) -> Result<()> {
        if *self.unavailable.lock() {
            return Err(VolleyError::Other(anyhow::anyhow!(
                "outcome store unavailable"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl OutcomeStore for InMemoryOutcomeStore {
    async fn record_outcome(&self, outcome: &ConversionOutcome) -> Result<()> {
        self.check_available()?;
        self.outcomes.lock().push(outcome.clone());
        Ok(())
    }

    async fn is_banned(&self, submitter: SubmitterId) -> Result<bool> {
        self.check_available()?;
        Ok(self.banned.lock().contains(&submitter))
    }
}
