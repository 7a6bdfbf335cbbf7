//! The event envelope published on broker channels.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{JobId, Stage};
use crate::errors::{InferflowError, Result};

/// Schema version stamped on newly produced events.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// The type of an event, used to route it to exactly one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new job entered the system.
    JobSubmitted,
    /// A non-inference stage has its input and can run.
    StageReady,
    /// The prompt is assembled and the inference stage can run.
    PromptReady,
    /// The inference stage produced its output.
    InferenceCompleted,
    /// A stage failed for good; completed stages must be compensated.
    JobFailed,
    /// The job was cancelled by a client.
    JobCancelled,
}

impl EventType {
    /// All event types.
    pub const ALL: [Self; 6] = [
        Self::JobSubmitted,
        Self::StageReady,
        Self::PromptReady,
        Self::InferenceCompleted,
        Self::JobFailed,
        Self::JobCancelled,
    ];

    /// Returns the wire name of the event type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JobSubmitted => "job_submitted",
            Self::StageReady => "stage_ready",
            Self::PromptReady => "prompt_ready",
            Self::InferenceCompleted => "inference_completed",
            Self::JobFailed => "job_failed",
            Self::JobCancelled => "job_cancelled",
        }
    }

    /// Returns true for events whose payload is stage data rather than a
    /// typed control body.
    #[must_use]
    pub fn carries_stage_data(self) -> bool {
        matches!(
            self,
            Self::StageReady | Self::PromptReady | Self::InferenceCompleted
        )
    }

    /// Returns true for events that move a job forward through its stages.
    /// A dead-lettered event of this kind fails the job.
    #[must_use]
    pub fn advances_job(self) -> bool {
        matches!(
            self,
            Self::JobSubmitted | Self::StageReady | Self::PromptReady | Self::InferenceCompleted
        )
    }

    /// Returns true for events whose successful handling leaves the job
    /// in a terminal state.
    #[must_use]
    pub fn closes_job(self) -> bool {
        matches!(
            self,
            Self::InferenceCompleted | Self::JobFailed | Self::JobCancelled
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payload, either carried inline or stored out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// JSON carried inside the envelope.
    Inline {
        /// The payload value.
        data: serde_json::Value,
    },
    /// Bytes stored in object storage.
    Reference {
        /// Object storage URI.
        uri: String,
        /// Size of the stored bytes.
        size_bytes: u64,
        /// Hex SHA-256 digest of the stored bytes.
        sha256: String,
    },
}

impl Payload {
    /// Creates an inline payload.
    #[must_use]
    pub fn inline(data: serde_json::Value) -> Self {
        Self::Inline { data }
    }

    /// Creates an empty inline payload.
    #[must_use]
    pub fn empty() -> Self {
        Self::inline(serde_json::Value::Null)
    }

    /// Returns true if the payload lives in object storage.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference { .. })
    }

    /// Returns the inline value, if any.
    #[must_use]
    pub fn as_inline(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Inline { data } => Some(data),
            Self::Reference { .. } => None,
        }
    }

    /// Serialized size of an inline payload in bytes.
    #[must_use]
    pub fn inline_size(&self) -> Option<usize> {
        self.as_inline()
            .and_then(|data| serde_json::to_vec(data).ok())
            .map(|bytes| bytes.len())
    }
}

/// Key of one retry state machine: a job's stage, or the event type for
/// events that are not tied to a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKey {
    /// A pipeline stage.
    Stage(Stage),
    /// A stage-less control event.
    Event(EventType),
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(stage) => write!(f, "stage:{stage}"),
            Self::Event(event_type) => write!(f, "event:{event_type}"),
        }
    }
}

/// An immutable record of a state change published to a broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique id of this event.
    pub event_id: Uuid,

    /// The event type.
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// The job this event belongs to.
    pub job_id: JobId,

    /// The stage this event drives, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,

    /// Envelope schema version.
    pub schema_version: u32,

    /// Inline data or an object storage reference.
    pub payload: Payload,

    /// When the event was produced.
    pub produced_at: DateTime<Utc>,
}

impl Event {
    /// Creates a new event at the current schema version.
    #[must_use]
    pub fn new(event_type: EventType, job_id: JobId, payload: Payload) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type,
            job_id,
            stage: None,
            schema_version: CURRENT_SCHEMA_VERSION,
            payload,
            produced_at: Utc::now(),
        }
    }

    /// Creates an event carrying stage data for `stage`.
    #[must_use]
    pub fn stage_data(event_type: EventType, job_id: JobId, stage: Stage, payload: Payload) -> Self {
        Self::new(event_type, job_id, payload).with_stage(stage)
    }

    /// Creates an event from a typed control body.
    pub fn from_body<B: EventBody>(job_id: JobId, body: &B) -> Result<Self> {
        let data = serde_json::to_value(body)?;
        Ok(Self::new(B::EVENT_TYPE, job_id, Payload::inline(data)))
    }

    /// Sets the stage.
    #[must_use]
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Overrides the schema version.
    #[must_use]
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Decodes the typed body of an event with an inline payload.
    pub fn body<B: EventBody>(&self) -> Result<B> {
        match &self.payload {
            Payload::Inline { data } => self.decode_body(data.clone()),
            Payload::Reference { uri, .. } => Err(InferflowError::Codec(format!(
                "payload of {} event is stored at {uri} and must be resolved first",
                self.event_type
            ))),
        }
    }

    /// Decodes a typed body from an already resolved payload value.
    pub fn decode_body<B: EventBody>(&self, data: serde_json::Value) -> Result<B> {
        if self.event_type != B::EVENT_TYPE {
            return Err(InferflowError::Codec(format!(
                "expected {} body, event is {}",
                B::EVENT_TYPE,
                self.event_type
            )));
        }
        Ok(serde_json::from_value(data)?)
    }

    /// Returns the retry state machine key for this event.
    ///
    /// Events that run a stage are keyed by the stage; all others by their
    /// type, so `InferenceCompleted` does not share `Generate`'s attempts.
    #[must_use]
    pub fn step_key(&self) -> StepKey {
        match (self.event_type, self.stage) {
            (EventType::StageReady | EventType::PromptReady, Some(stage)) => StepKey::Stage(stage),
            (event_type, _) => StepKey::Event(event_type),
        }
    }
}

/// A typed event body bound to one event type.
pub trait EventBody: Serialize + DeserializeOwned {
    /// The event type this body belongs to.
    const EVENT_TYPE: EventType;
}

/// Body of a `JobSubmitted` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSubmitted {
    /// The user prompt.
    pub prompt: String,
    /// Stages to run, in order.
    pub stages: Vec<Stage>,
}

impl EventBody for JobSubmitted {
    const EVENT_TYPE: EventType = EventType::JobSubmitted;
}

/// Body of a `JobFailed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailed {
    /// The stage that failed, if the failure was tied to one.
    #[serde(default)]
    pub stage: Option<Stage>,
    /// Why the job failed.
    pub reason: String,
}

impl EventBody for JobFailed {
    const EVENT_TYPE: EventType = EventType::JobFailed;
}

/// Body of a `JobCancelled` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCancelled {
    /// Why the job was cancelled.
    pub reason: String,
}

impl EventBody for JobCancelled {
    const EVENT_TYPE: EventType = EventType::JobCancelled;
}
