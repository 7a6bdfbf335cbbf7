//! # Inferflow
//!
//! An event-driven job pipeline for asynchronous LLM inference.
//!
//! Jobs move through retrieve, rerank and generate stages by way of events
//! on a message broker. Inferflow provides:
//!
//! - **Versioned event codec**: schema-checked envelopes with large payloads
//!   moved to object storage by reference
//! - **Job state store**: idempotent transitions guarded by per-job locks
//! - **Bounded consumers**: at-least-once dispatch with shared capacity
//! - **Retry and dead-lettering**: backoff with jitter, exactly one
//!   dead letter per failed step
//! - **Saga coordination**: reverse-order compensation of completed stages
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use inferflow::prelude::*;
//!
//! let engine = Engine::builder()
//!     .executor(Arc::new(MyRetriever))
//!     .executor(Arc::new(MyReranker))
//!     .executor(Arc::new(MyModel))
//!     .build()?;
//! let handle = engine.start();
//!
//! let jobs = engine.job_service();
//! let job_id = jobs.submit_default("What changed in the Q3 report?").await?;
//! let status = jobs.wait_for_terminal(job_id, Duration::from_secs(30)).await?;
//!
//! handle.shutdown().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod broker;
pub mod cancellation;
pub mod codec;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod lifecycle;
pub mod observability;
pub mod pipeline;
pub mod retry;
pub mod saga;
pub mod service;
pub mod storage;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::broker::{Broker, InMemoryBroker};
    pub use crate::cancellation::CancellationToken;
    pub use crate::codec::{EventCodec, PayloadOffloader};
    pub use crate::config::{InferflowConfig, LogFormat};
    pub use crate::core::{
        DeadLetter, Event, EventType, Job, JobId, JobStatus, JobStatusView, Payload, Stage,
    };
    pub use crate::engine::{Engine, EngineBuilder, EngineHandle};
    pub use crate::errors::{ErrorKind, HandlerError, InferflowError, Result};
    pub use crate::lifecycle::{EventSink, LoggingEventSink, Notification, NotificationKind};
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::StageExecutor;
    pub use crate::retry::{BackoffStrategy, JitterStrategy, RetryConfig};
    pub use crate::saga::Compensator;
    pub use crate::service::JobService;
    pub use crate::storage::{FileObjectStore, InMemoryObjectStore, ObjectStore};
    pub use crate::store::{InMemoryJobStore, JobStore};
}
