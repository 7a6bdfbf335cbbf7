//! Error types for the inferflow pipeline.
//!
//! Failures fall into three kinds that drive the retry policy:
//! schema mismatches (fatal, never retried), transient handler errors
//! (retried with backoff) and permanent handler errors (dead-lettered
//! immediately).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core::{EventType, JobId};

/// Convenience result alias used across the crate.
pub type Result<T, E = InferflowError> = std::result::Result<T, E>;

/// The main error type for inferflow operations.
#[derive(Debug, Error)]
pub enum InferflowError {
    /// The event carries a schema version this codec does not support.
    #[error("{0}")]
    SchemaMismatch(#[from] SchemaMismatchError),

    /// An inline payload exceeded the inline size threshold.
    #[error("Payload too large to inline: {size_bytes} bytes exceeds limit of {limit_bytes} bytes")]
    PayloadTooLarge {
        /// Serialized payload size.
        size_bytes: usize,
        /// Configured inline limit.
        limit_bytes: usize,
    },

    /// Malformed wire data or an unexpected event body.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Object storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A referenced object does not exist or its uri is not ours.
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Broker channel failure.
    #[error("Broker error: {0}")]
    Broker(String),

    /// The job is not known to the state store.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// A state transition was rejected.
    #[error("{0}")]
    InvalidTransition(#[from] InvalidTransitionError),

    /// A pipeline stage list was rejected.
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// Two handlers were registered for the same event type.
    #[error("Handler already registered for event type: {0}")]
    DuplicateHandler(EventType),

    /// A handler invocation failed.
    #[error("{0}")]
    Handler(#[from] HandlerError),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Waiting for a job or task took too long.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A background task failed unexpectedly.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for InferflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl InferflowError {
    /// Classifies the error for the retry policy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            Self::Storage(_)
            | Self::Broker(_)
            | Self::Io(_)
            | Self::Timeout(_)
            | Self::Internal(_) => {
                ErrorKind::Transient
            }
            Self::Handler(err) => err.kind(),
            Self::PayloadTooLarge { .. }
            | Self::Codec(_)
            | Self::ObjectNotFound(_)
            | Self::JobNotFound(_)
            | Self::InvalidTransition(_)
            | Self::InvalidPipeline(_)
            | Self::DuplicateHandler(_)
            | Self::Config(_) => ErrorKind::Permanent,
        }
    }
}

/// Error raised when an event's schema version is outside the supported range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Schema mismatch: version {found} is outside supported range {min_supported}..={max_supported}")]
pub struct SchemaMismatchError {
    /// The version found on the event.
    pub found: u32,
    /// Lowest supported version.
    pub min_supported: u32,
    /// Highest supported version.
    pub max_supported: u32,
}

/// Error raised when a job state transition is not allowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid transition '{transition}' for job {job_id} in state '{state}': {reason}")]
pub struct InvalidTransitionError {
    /// The job being transitioned.
    pub job_id: JobId,
    /// The job's state when the transition was attempted.
    pub state: String,
    /// The rejected transition.
    pub transition: String,
    /// Why it was rejected.
    pub reason: String,
}

impl InvalidTransitionError {
    /// Creates a new invalid transition error.
    #[must_use]
    pub fn new(
        job_id: JobId,
        state: impl Into<String>,
        transition: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            state: state.into(),
            transition: transition.into(),
            reason: reason.into(),
        }
    }
}

/// How a failure should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The event could not be understood. Fatal, never retried.
    SchemaMismatch,
    /// Retried with backoff up to the attempt limit.
    Transient,
    /// Routed directly to the dead-letter channel.
    Permanent,
}

impl ErrorKind {
    /// Returns true if failures of this kind may be retried.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SchemaMismatch => write!(f, "schema_mismatch"),
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Error returned by event handlers and stage executors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// A failure that may succeed on a later attempt (timeouts, busy GPU).
    #[error("Transient handler error: {0}")]
    Transient(String),

    /// A failure that will never succeed (bad input, missing job).
    #[error("Permanent handler error: {0}")]
    Permanent(String),
}

impl HandlerError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Returns the error kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Permanent(_) => ErrorKind::Permanent,
        }
    }

    /// Returns true if the failed invocation may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Returns the bare message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

impl From<InferflowError> for HandlerError {
    fn from(err: InferflowError) -> Self {
        match err {
            InferflowError::Handler(inner) => inner,
            other => match other.kind() {
                ErrorKind::Transient => Self::Transient(other.to_string()),
                ErrorKind::SchemaMismatch | ErrorKind::Permanent => {
                    Self::Permanent(other.to_string())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_mismatch_message() {
        let err = SchemaMismatchError {
            found: 7,
            min_supported: 1,
            max_supported: 2,
        };
        assert_eq!(
            err.to_string(),
            "Schema mismatch: version 7 is outside supported range 1..=2"
        );
        assert_eq!(InferflowError::from(err).kind(), ErrorKind::SchemaMismatch);
    }

    #[test]
    fn test_handler_error_kinds() {
        assert!(HandlerError::transient("gpu busy").is_retryable());
        assert!(!HandlerError::permanent("bad prompt").is_retryable());
        assert_eq!(HandlerError::permanent("x").message(), "x");
    }

    #[test]
    fn test_storage_errors_become_transient() {
        let err: HandlerError = InferflowError::Storage("bucket offline".to_string()).into();
        assert!(matches!(err, HandlerError::Transient(_)));
    }

    #[test]
    fn test_missing_object_is_permanent() {
        let err = InferflowError::ObjectNotFound("mem://objects/00".to_string());
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(matches!(HandlerError::from(err), HandlerError::Permanent(_)));
    }

    #[test]
    fn test_missing_job_becomes_permanent() {
        let err: HandlerError = InferflowError::JobNotFound(JobId::new()).into();
        assert!(matches!(err, HandlerError::Permanent(_)));
    }

    #[test]
    fn test_wrapped_handler_error_is_unwrapped() {
        let inner = HandlerError::transient("timeout");
        let err: HandlerError = InferflowError::Handler(inner.clone()).into();
        assert_eq!(err, inner);
    }

    #[test]
    fn test_error_kind_serialize() {
        let json = serde_json::to_string(&ErrorKind::SchemaMismatch).unwrap();
        assert_eq!(json, r#""schema_mismatch""#);
    }
}
