//! Dead-letter records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Event, EventType, JobId, Stage};
use crate::errors::ErrorKind;

/// An event that exhausted its attempts or could not be processed at all.
///
/// Published to the dead-letter channel; never silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Channel the delivery arrived on.
    pub event_type: EventType,
    /// The decoded event, when decoding succeeded.
    pub event: Option<Event>,
    /// Raw wire bytes, kept when the event could not be decoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<u8>>,
    /// Why the event was dead-lettered.
    pub reason: String,
    /// Classification of the final failure.
    pub error_kind: ErrorKind,
    /// Handler attempts made.
    pub attempts: u32,
    /// When the event was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Creates a dead letter for a decoded event.
    #[must_use]
    pub fn for_event(event: Event, reason: impl Into<String>, error_kind: ErrorKind, attempts: u32) -> Self {
        Self {
            event_type: event.event_type,
            event: Some(event),
            raw: None,
            reason: reason.into(),
            error_kind,
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }

    /// Creates a dead letter for bytes that could not be decoded.
    #[must_use]
    pub fn undecodable(event_type: EventType, raw: Vec<u8>, reason: impl Into<String>, error_kind: ErrorKind) -> Self {
        Self {
            event_type,
            event: None,
            raw: Some(raw),
            reason: reason.into(),
            error_kind,
            attempts: 0,
            dead_lettered_at: Utc::now(),
        }
    }

    /// The job, when the event was decoded.
    #[must_use]
    pub fn job_id(&self) -> Option<JobId> {
        self.event.as_ref().map(|e| e.job_id)
    }

    /// The stage, when the event was decoded and carried one.
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        self.event.as_ref().and_then(|e| e.stage)
    }
}
