//! Pipeline stages.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{InferflowError, Result};

/// A stage of the inference pipeline.
///
/// Variants are declared in execution order; the derived `Ord` is the
/// pipeline order and stage progression is checked against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Fetch candidate context documents for the prompt.
    Retrieve,
    /// Score and trim the retrieved candidates.
    Rerank,
    /// Run the model on the assembled prompt.
    Generate,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Self; 3] = [Self::Retrieve, Self::Rerank, Self::Generate];

    /// Returns true for the stage that consumes inference capacity.
    #[must_use]
    pub fn is_inference(self) -> bool {
        matches!(self, Self::Generate)
    }

    /// Returns the wire name of the stage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retrieve => "retrieve",
            Self::Rerank => "rerank",
            Self::Generate => "generate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks that a stage list forms a runnable pipeline.
///
/// The list must be non-empty, strictly ordered (which also rules out
/// duplicates) and end with the inference stage.
pub fn validate_pipeline(stages: &[Stage]) -> Result<()> {
    let Some(last) = stages.last() else {
        return Err(InferflowError::InvalidPipeline(
            "pipeline has no stages".to_string(),
        ));
    };

    if let Some(pair) = stages.windows(2).find(|w| w[0] >= w[1]) {
        return Err(InferflowError::InvalidPipeline(format!(
            "stage '{}' cannot follow '{}'",
            pair[1], pair[0]
        )));
    }

    if !last.is_inference() {
        return Err(InferflowError::InvalidPipeline(format!(
            "pipeline must end with '{}', found '{}'",
            Stage::Generate,
            last
        )));
    }

    Ok(())
}
