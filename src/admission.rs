//! Cheap upload checks applied before a file may occupy a batch slot.
//!
//! Only the filename and byte length are inspected. Structural validation of the
//! content happens later, in the worker, through the [`Validator`](crate::conversion::Validator)
//! collaborator.

use std::fmt;

use crate::domain::batch::SubmitterId;

/// Why an upload was refused at the door.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Filename does not end with the required extension
    WrongExtension { expected: String },
    /// Content is larger than the configured maximum
    TooLarge { size: u64, max: u64 },
}

impl Rejection {
    /// Reply sent to the user for this rejection.
    pub fn user_message(&self) -> String {
        match self {
            Rejection::WrongExtension { expected } => {
                let kind = expected.trim_start_matches('.').to_uppercase();
                format!(
                    "❌ Only {kind} files are accepted.\nPlease send a valid {kind} file."
                )
            }
            Rejection::TooLarge { size, max } => format!(
                "❌ File too large ({:.1}MB).\nMaximum allowed: {:.1}MB",
                megabytes(*size),
                megabytes(*max)
            ),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::WrongExtension { expected } => {
                write!(f, "wrong extension (expected {})", expected)
            }
            Rejection::TooLarge { size, max } => {
                write!(f, "too large ({} bytes, max {})", size, max)
            }
        }
    }
}

fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Extension and size gate.
#[derive(Debug, Clone)]
pub struct FileAdmissionGate {
    extension: String,
    max_file_size: u64,
}

impl FileAdmissionGate {
    pub fn new(extension: impl Into<String>, max_file_size: u64) -> Self {
        Self {
            extension: extension.into().to_lowercase(),
            max_file_size,
        }
    }

    pub fn from_config(config: &crate::config::BatchConfig) -> Self {
        Self::new(config.required_extension.clone(), config.max_file_size)
    }

    /// Decide whether an upload may enter a batch.
    ///
    /// The extension is checked before the size so a wrong file type is reported as
    /// such even when it is also oversized.
    pub fn admit(
        &self,
        submitter: SubmitterId,
        content: &[u8],
        filename: &str,
    ) -> std::result::Result<(), Rejection> {
        if !filename.to_lowercase().ends_with(&self.extension) {
            tracing::warn!(
                submitter = %submitter,
                filename = %filename,
                "Rejected upload with wrong extension"
            );
            return Err(Rejection::WrongExtension {
                expected: self.extension.clone(),
            });
        }

        let size = content.len() as u64;
        if size > self.max_file_size {
            tracing::warn!(
                submitter = %submitter,
                filename = %filename,
                size,
                max = self.max_file_size,
                "Rejected oversized upload"
            );
            return Err(Rejection::TooLarge {
                size,
                max: self.max_file_size,
            });
        }

        Ok(())
    }
}
