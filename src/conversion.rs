//! Validation and conversion collaborators.
//!
//! The worker calls a [`Validator`] on every file first and only hands accepted files to
//! the [`Converter`]. Both are external to this crate; the mocks below drive the tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Result, VolleyError};

/// Result of validating one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub accepted: bool,
    pub message: String,
}

impl Verdict {
    pub fn accept(message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            message: message.into(),
        }
    }

    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
        }
    }
}

/// Result of converting one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    pub success: bool,
    pub output: Option<Bytes>,
    pub message: String,
}

impl Conversion {
    pub fn succeeded(output: impl Into<Bytes>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            message: message.into(),
        }
    }

    /// The artifact, if the conversion actually produced one.
    pub fn artifact(&self) -> Option<&Bytes> {
        if self.success { self.output.as_ref() } else { None }
    }
}

/// Deep content validation, run by the worker before conversion.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Inspect a file. `Ok` with a rejecting verdict is a user-facing refusal; `Err` is
    /// an unexpected failure and is reported as a processing error.
    async fn validate(&self, content: &Bytes, filename: &str) -> Result<Verdict>;
}

/// The actual file-format conversion.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, content: &Bytes, filename: &str) -> Result<Conversion>;

    /// Name to give the converted artifact.
    fn output_filename(&self, input_filename: &str) -> String;
}

/// Swap the extension of `filename` for `extension` (given without the dot).
pub fn replace_extension(filename: &str, extension: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    format!("{}.{}", stem, extension)
}

// ============================================================================
// Test/Mock Implementations
// ============================================================================

/// Validator that accepts everything except the filenames it was told about.
#[derive(Clone, Default)]
pub struct ScriptedValidator {
    rejections: Arc<Mutex<HashMap<String, String>>>,
    errors: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject `filename` with `message`.
    pub fn reject(&self, filename: &str, message: &str) {
        self.rejections
            .lock()
            .insert(filename.to_string(), message.to_string());
    }

    /// Return an error (not a verdict) for `filename`.
    pub fn error_on(&self, filename: &str) {
        self.errors.lock().insert(filename.to_string());
    }

    /// Filenames validated so far, in call order.
    pub fn get_calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn validate(&self, _content: &Bytes, filename: &str) -> Result<Verdict> {
        self.calls.lock().push(filename.to_string());
        if self.errors.lock().contains(filename) {
            return Err(VolleyError::Other(anyhow::anyhow!(
                "validator crashed on {}",
                filename
            )));
        }
        match self.rejections.lock().get(filename) {
            Some(message) => Ok(Verdict::reject(message.clone())),
            None => Ok(Verdict::accept("✅ Valid SVG file")),
        }
    }
}

/// Mock converter for testing.
///
/// Produces `b"tgs:" + input` for every file unless told otherwise, and tracks how many
/// conversions run at the same time.
#[derive(Clone, Default)]
pub struct MockConverter {
    failures: Arc<Mutex<HashMap<String, String>>>,
    errors: Arc<Mutex<HashSet<String>>>,
    panics: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
    latency: Arc<Mutex<Duration>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a failed conversion for `filename`.
    pub fn fail_on(&self, filename: &str, message: &str) {
        self.failures
            .lock()
            .insert(filename.to_string(), message.to_string());
    }

    /// Return an error for `filename`.
    pub fn error_on(&self, filename: &str) {
        self.errors.lock().insert(filename.to_string());
    }

    /// Panic while converting `filename`.
    pub fn panic_on(&self, filename: &str) {
        self.panics.lock().insert(filename.to_string());
    }

    /// Make every conversion take this long.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn get_calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of conversions observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Converter for MockConverter {
    async fn convert(&self, content: &Bytes, filename: &str) -> Result<Conversion> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.calls.lock().push(filename.to_string());

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.panics.lock().contains(filename) {
            panic!("converter blew up on {}", filename);
        }
        if self.errors.lock().contains(filename) {
            return Err(VolleyError::Other(anyhow::anyhow!(
                "lottie_convert exited with status 1"
            )));
        }
        if let Some(message) = self.failures.lock().get(filename) {
            return Ok(Conversion::failed(message.clone()));
        }

        let mut output = b"tgs:".to_vec();
        output.extend_from_slice(content);
        Ok(Conversion::succeeded(output, "✅ Conversion successful"))
    }

    fn output_filename(&self, input_filename: &str) -> String {
        replace_extension(input_filename, "tgs")
    }
}
