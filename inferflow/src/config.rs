//! Runtime configuration.
//!
//! Every field has a serde default so a partial JSON document (or none at
//! all) yields a usable configuration. `INFERFLOW_*` environment variables
//! override the loaded values.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::codec::DEFAULT_INLINE_LIMIT_BYTES;
use crate::core::CURRENT_SCHEMA_VERSION;
use crate::errors::{InferflowError, Result};
use crate::retry::RetryConfig;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = InferflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(InferflowError::Config(format!("unknown log format: {other}"))),
        }
    }
}

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

fn default_inline_limit_bytes() -> usize {
    DEFAULT_INLINE_LIMIT_BYTES
}

/// Codec settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Oldest schema version accepted.
    #[serde(default = "default_schema_version")]
    pub min_schema_version: u32,
    /// Newest schema version accepted.
    #[serde(default = "default_schema_version")]
    pub max_schema_version: u32,
    /// Inline payloads larger than this are moved to object storage.
    #[serde(default = "default_inline_limit_bytes")]
    pub inline_limit_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            min_schema_version: default_schema_version(),
            max_schema_version: default_schema_version(),
            inline_limit_bytes: default_inline_limit_bytes(),
        }
    }
}

fn default_consumer_name() -> String {
    "inferflow".to_string()
}

fn default_capacity() -> usize {
    8
}

fn default_workers() -> usize {
    2
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

/// Consumer loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Name used in logs.
    #[serde(default = "default_consumer_name")]
    pub name: String,
    /// Maximum in-flight handler invocations across all workers.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Competing consumer instances started by the engine.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How long shutdown waits for in-flight handlers.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: default_consumer_name(),
            capacity: default_capacity(),
            workers: default_workers(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InferflowConfig {
    /// Codec settings.
    #[serde(default)]
    pub codec: CodecConfig,
    /// Consumer settings.
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Retry settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl InferflowConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses configuration from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| InferflowError::Config(format!("invalid configuration: {e}")))
    }

    /// Reads configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            InferflowError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&contents)
    }

    /// Applies `INFERFLOW_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`.
    ///
    /// Recognized keys: `INFERFLOW_CAPACITY`, `INFERFLOW_WORKERS`,
    /// `INFERFLOW_MAX_ATTEMPTS`, `INFERFLOW_INLINE_LIMIT_BYTES`,
    /// `INFERFLOW_LOG_FORMAT`.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("INFERFLOW_CAPACITY") {
            self.consumer.capacity = parse_override("INFERFLOW_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("INFERFLOW_WORKERS") {
            self.consumer.workers = parse_override("INFERFLOW_WORKERS", &v)?;
        }
        if let Some(v) = lookup("INFERFLOW_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_override("INFERFLOW_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("INFERFLOW_INLINE_LIMIT_BYTES") {
            self.codec.inline_limit_bytes = parse_override("INFERFLOW_INLINE_LIMIT_BYTES", &v)?;
        }
        if let Some(v) = lookup("INFERFLOW_LOG_FORMAT") {
            self.log_format = v.parse()?;
        }
        Ok(self)
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.codec.min_schema_version > self.codec.max_schema_version {
            return Err(InferflowError::Config(format!(
                "min_schema_version {} is greater than max_schema_version {}",
                self.codec.min_schema_version, self.codec.max_schema_version
            )));
        }
        if !(self.codec.min_schema_version..=self.codec.max_schema_version)
            .contains(&CURRENT_SCHEMA_VERSION)
        {
            return Err(InferflowError::Config(format!(
                "schema range does not include the current version {CURRENT_SCHEMA_VERSION}"
            )));
        }
        if self.codec.inline_limit_bytes == 0 {
            return Err(InferflowError::Config("inline_limit_bytes must be positive".to_string()));
        }
        if self.consumer.capacity == 0 {
            return Err(InferflowError::Config("capacity must be positive".to_string()));
        }
        if self.consumer.workers == 0 {
            return Err(InferflowError::Config("workers must be positive".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(InferflowError::Config("max_attempts must be positive".to_string()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(InferflowError::Config(
                "base_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the consumer capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.consumer.capacity = capacity;
        self
    }

    /// Sets the number of competing consumers.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.consumer.workers = workers;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the inline payload limit.
    #[must_use]
    pub fn with_inline_limit_bytes(mut self, limit: usize) -> Self {
        self.codec.inline_limit_bytes = limit;
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub fn with_shutdown_grace_ms(mut self, grace_ms: u64) -> Self {
        self.consumer.shutdown_grace_ms = grace_ms;
        self
    }

    /// Sets the log format.
    #[must_use]
    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| InferflowError::Config(format!("{key} has invalid value '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = InferflowConfig::default();
        assert_eq!(config.codec.inline_limit_bytes, DEFAULT_INLINE_LIMIT_BYTES);
        assert_eq!(config.consumer.capacity, 8);
        assert_eq!(config.consumer.workers, 2);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = InferflowConfig::from_json_str(
            r#"{"consumer": {"capacity": 32}, "retry": {"max_attempts": 5}, "log_format": "json"}"#,
        )
        .unwrap();

        assert_eq!(config.consumer.capacity, 32);
        assert_eq!(config.consumer.workers, 2);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_json() {
        let err = InferflowConfig::from_json_str("{").unwrap_err();
        assert!(matches!(err, InferflowError::Config(_)));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inferflow.json");
        std::fs::write(&path, r#"{"codec": {"inline_limit_bytes": 1024}}"#).unwrap();

        let config = InferflowConfig::from_json_file(&path).unwrap();
        assert_eq!(config.codec.inline_limit_bytes, 1024);
    }

    #[test]
    fn test_missing_file() {
        let err = InferflowConfig::from_json_file("/nonexistent/inferflow.json").unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("INFERFLOW_CAPACITY", "16"),
            ("INFERFLOW_MAX_ATTEMPTS", "4"),
            ("INFERFLOW_LOG_FORMAT", "JSON"),
        ]
        .into_iter()
        .collect();

        let config = InferflowConfig::default()
            .apply_overrides(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.consumer.capacity, 16);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_bad_override() {
        let err = InferflowConfig::default()
            .apply_overrides(|k| (k == "INFERFLOW_CAPACITY").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("INFERFLOW_CAPACITY"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = InferflowConfig::default().with_capacity(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = InferflowConfig::default().with_retry(RetryConfig::new().with_max_attempts(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_versions() {
        let mut config = InferflowConfig::default();
        config.codec.min_schema_version = 3;
        config.codec.max_schema_version = 2;
        assert!(config.validate().is_err());
    }
}
