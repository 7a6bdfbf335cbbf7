//! Tracing subscriber setup and timing helpers.

use std::time::Instant;
use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Installs the global tracing subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to `info`. Returns false
/// when a subscriber was already installed, so repeated calls are harmless.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match format {
        LogFormat::Json => builder
            .json()
            .with_current_span(true)
            .try_init()
            .is_ok(),
        LogFormat::Text => builder.try_init().is_ok(),
    }
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: &'static str,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Finishes the span and returns the duration.
    #[must_use]
    pub fn finish(self) -> f64 {
        self.elapsed_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("prompt_ready");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(timer.name(), "prompt_ready");
        assert!(timer.finish() >= 10.0);
    }

    #[test]
    fn test_init_tracing_is_repeatable() {
        // The first call may or may not win depending on test order.
        let _ = init_tracing(LogFormat::Text);
        assert!(!init_tracing(LogFormat::Json));
    }
}
