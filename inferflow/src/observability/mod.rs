//! Observability utilities.

mod tracing;

pub use tracing::{init_tracing, SpanTimer, DEFAULT_LOG_FILTER};
