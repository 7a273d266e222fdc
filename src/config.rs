//! Configuration for the batching core.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VolleyError};

/// Prefix of the environment variables read by [`BatchConfig::from_env`].
pub const ENV_PREFIX: &str = "VOLLEY_";

/// Configuration for admission, debouncing and the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum number of files in one batch; the file that reaches it dispatches the batch
    pub max_batch_size: usize,

    /// Largest accepted upload in bytes
    pub max_file_size: u64,

    /// Required filename extension, matched case-insensitively (e.g. ".svg")
    pub required_extension: String,

    /// Quiet period after a batch's first file before it is dispatched
    pub processing_delay_ms: u64,

    /// How long a completed batch stays queryable before eviction
    pub retention_grace_ms: u64,

    /// Pause between files of one batch, to stay under transport rate limits
    pub inter_file_pacing_ms: u64,

    /// Emit a progress update every this many files
    pub progress_report_every: usize,

    /// Capacity of the dispatch queue
    pub dispatch_queue_capacity: usize,

    /// Interval for logging worker status (queue depth, counters) in milliseconds.
    /// Set to None to disable periodic status logging
    pub status_log_interval_ms: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 15,
            max_file_size: 5 * 1024 * 1024,
            required_extension: ".svg".to_string(),
            processing_delay_ms: 3000,
            retention_grace_ms: 300_000, // 5 minutes
            inter_file_pacing_ms: 500,
            progress_report_every: 10,
            dispatch_queue_capacity: 1024,
            status_log_interval_ms: None,
        }
    }
}

impl BatchConfig {
    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.processing_delay_ms)
    }

    pub fn retention_grace(&self) -> Duration {
        Duration::from_millis(self.retention_grace_ms)
    }

    pub fn inter_file_pacing(&self) -> Duration {
        Duration::from_millis(self.inter_file_pacing_ms)
    }

    /// Load configuration from the process environment.
    ///
    /// A `.env` file in the working directory is loaded first if present. Every field
    /// can be overridden by an upper-cased `VOLLEY_` variable, e.g.
    /// `VOLLEY_MAX_BATCH_SIZE=20` or `VOLLEY_STATUS_LOG_INTERVAL_MS=5000`.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            tracing::warn!(error = %e, "Failed to load .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup, starting from defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = get("MAX_BATCH_SIZE") {
            config.max_batch_size = parse("MAX_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("MAX_FILE_SIZE") {
            config.max_file_size = parse("MAX_FILE_SIZE", &v)?;
        }
        if let Some(v) = get("REQUIRED_EXTENSION") {
            config.required_extension = v;
        }
        if let Some(v) = get("PROCESSING_DELAY_MS") {
            config.processing_delay_ms = parse("PROCESSING_DELAY_MS", &v)?;
        }
        if let Some(v) = get("RETENTION_GRACE_MS") {
            config.retention_grace_ms = parse("RETENTION_GRACE_MS", &v)?;
        }
        if let Some(v) = get("INTER_FILE_PACING_MS") {
            config.inter_file_pacing_ms = parse("INTER_FILE_PACING_MS", &v)?;
        }
        if let Some(v) = get("PROGRESS_REPORT_EVERY") {
            config.progress_report_every = parse("PROGRESS_REPORT_EVERY", &v)?;
        }
        if let Some(v) = get("DISPATCH_QUEUE_CAPACITY") {
            config.dispatch_queue_capacity = parse("DISPATCH_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = get("STATUS_LOG_INTERVAL_MS") {
            config.status_log_interval_ms = if v.is_empty() {
                None
            } else {
                Some(parse("STATUS_LOG_INTERVAL_MS", &v)?)
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can drive the scheduler.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(VolleyError::Config(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.progress_report_every == 0 {
            return Err(VolleyError::Config(
                "progress_report_every must be at least 1".to_string(),
            ));
        }
        if self.dispatch_queue_capacity == 0 {
            return Err(VolleyError::Config(
                "dispatch_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.required_extension.trim().is_empty() {
            return Err(VolleyError::Config(
                "required_extension must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        VolleyError::Config(format!("{}{}={:?}: {}", ENV_PREFIX, name, value, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_bot_settings() {
        let config = BatchConfig::default();
        assert_eq!(config.max_batch_size, 15);
        assert_eq!(config.processing_delay(), Duration::from_secs(3));
        assert_eq!(config.retention_grace(), Duration::from_secs(300));
        assert_eq!(config.inter_file_pacing(), Duration::from_millis(500));
        assert_eq!(config.progress_report_every, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = BatchConfig::from_lookup(lookup(&[
            ("VOLLEY_MAX_BATCH_SIZE", "20"),
            ("VOLLEY_PROCESSING_DELAY_MS", " 1500 "),
            ("VOLLEY_STATUS_LOG_INTERVAL_MS", "2000"),
            ("VOLLEY_REQUIRED_EXTENSION", ".SVG"),
        ]))
        .unwrap();

        assert_eq!(config.max_batch_size, 20);
        assert_eq!(config.processing_delay_ms, 1500);
        assert_eq!(config.status_log_interval_ms, Some(2000));
        assert_eq!(config.required_extension, ".SVG");
        assert_eq!(config.retention_grace_ms, 300_000);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = BatchConfig::from_lookup(lookup(&[("VOLLEY_MAX_BATCH_SIZE", "lots")]))
            .unwrap_err();
        assert!(matches!(err, VolleyError::Config(_)));
        assert!(err.to_string().contains("VOLLEY_MAX_BATCH_SIZE"));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = BatchConfig {
            max_batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BatchConfig {
            progress_report_every: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BatchConfig {
            required_extension: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_json_uses_defaults() {
        let config: BatchConfig =
            serde_json::from_str(r#"{"max_batch_size": 3, "inter_file_pacing_ms": 0}"#).unwrap();
        assert_eq!(config.max_batch_size, 3);
        assert_eq!(config.inter_file_pacing_ms, 0);
        assert_eq!(config.processing_delay_ms, 3000);
    }
}
