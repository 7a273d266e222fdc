//! Debounced per-submitter batching of file uploads in front of a conversion pipeline.
//!
//! Uploads are checked by an admission gate and grouped per submitter. A batch is
//! dispatched once its debounce window (armed when the batch is created) elapses, or
//! immediately when it reaches its size cap. A single worker processes dispatched
//! batches one at a time, reporting progress back through a messaging transport, and
//! completed batches are evicted after a grace period.
//!
//! Collaborators (transport, validator, converter, outcome store) are traits; the crate
//! ships in-memory doubles for all of them and a PostgreSQL outcome store behind the
//! `postgres` feature.

pub mod admission;
pub mod config;
pub mod conversion;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod outcome;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod sweeper;
pub mod transport;
pub mod worker;

// Re-export commonly used types
pub use admission::{FileAdmissionGate, Rejection};
pub use config::BatchConfig;
pub use conversion::{
    Conversion, Converter, MockConverter, ScriptedValidator, Validator, Verdict,
};
pub use coordinator::{BatchCoordinator, SubmitOutcome, Upload};
pub use domain::batch::{Batch, BatchId, BatchStatus, RunPhase, SubmitterId};
pub use domain::file::{ChatId, MessageId, PendingFile};
pub use error::{Result, VolleyError};
#[cfg(feature = "metrics")]
pub use metrics::VolleyMetrics;
#[cfg(feature = "postgres")]
pub use outcome::postgres::PostgresOutcomeStore;
pub use outcome::{ConversionOutcome, InMemoryOutcomeStore, OutcomeStore};
pub use queue::{DispatchQueue, DispatchReceiver, DispatchSignal, dispatch_queue};
pub use scheduler::DebounceScheduler;
pub use store::{AppendOutcome, BatchStore, StatusResolution};
pub use sweeper::RetentionSweeper;
pub use transport::{CallKind, MockTransport, Transport, TransportCall};
pub use worker::{BatchProcessor, ProcessorStats, RunContext, Services};

/// Get the volley database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
