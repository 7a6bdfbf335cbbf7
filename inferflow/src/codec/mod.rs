//! Event envelope codec.
//!
//! Events travel as JSON. Decoding reads the schema version before the
//! rest of the envelope so that events from an unsupported producer fail
//! with a schema mismatch instead of an opaque parse error.

mod payload;

pub use payload::PayloadOffloader;

use serde::Deserialize;

use crate::config::CodecConfig;
use crate::core::{Event, Payload, CURRENT_SCHEMA_VERSION};
use crate::errors::{InferflowError, Result, SchemaMismatchError};

/// Default inline payload threshold (64 KiB).
pub const DEFAULT_INLINE_LIMIT_BYTES: usize = 64 * 1024;

#[derive(Deserialize)]
struct VersionProbe {
    schema_version: u32,
}

/// Encodes and decodes events, validating schema version and payload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventCodec {
    min_version: u32,
    max_version: u32,
    inline_limit_bytes: usize,
}

impl Default for EventCodec {
    fn default() -> Self {
        Self {
            min_version: CURRENT_SCHEMA_VERSION,
            max_version: CURRENT_SCHEMA_VERSION,
            inline_limit_bytes: DEFAULT_INLINE_LIMIT_BYTES,
        }
    }
}

impl EventCodec {
    /// Creates a codec accepting versions `min_version..=max_version`.
    #[must_use]
    pub fn new(min_version: u32, max_version: u32, inline_limit_bytes: usize) -> Self {
        Self {
            min_version,
            max_version,
            inline_limit_bytes,
        }
    }

    /// Creates a codec from configuration.
    #[must_use]
    pub fn from_config(config: &CodecConfig) -> Self {
        Self::new(
            config.min_schema_version,
            config.max_schema_version,
            config.inline_limit_bytes,
        )
    }

    /// Returns the inline payload limit.
    #[must_use]
    pub fn inline_limit_bytes(&self) -> usize {
        self.inline_limit_bytes
    }

    /// Returns true if `version` can be encoded and decoded.
    #[must_use]
    pub fn supports(&self, version: u32) -> bool {
        (self.min_version..=self.max_version).contains(&version)
    }

    fn check_version(&self, version: u32) -> Result<(), SchemaMismatchError> {
        if self.supports(version) {
            Ok(())
        } else {
            Err(SchemaMismatchError {
                found: version,
                min_supported: self.min_version,
                max_supported: self.max_version,
            })
        }
    }

    fn check_payload(&self, payload: &Payload) -> Result<()> {
        match payload.inline_size() {
            Some(size_bytes) if size_bytes > self.inline_limit_bytes => {
                Err(InferflowError::PayloadTooLarge {
                    size_bytes,
                    limit_bytes: self.inline_limit_bytes,
                })
            }
            _ => Ok(()),
        }
    }

    /// Serializes an event to its wire representation.
    pub fn encode(&self, event: &Event) -> Result<Vec<u8>> {
        self.check_version(event.schema_version)?;
        self.check_payload(&event.payload)?;
        Ok(serde_json::to_vec(event)?)
    }

    /// Parses an event from its wire representation.
    pub fn decode(&self, bytes: &[u8]) -> Result<Event> {
        let probe: VersionProbe = serde_json::from_slice(bytes)?;
        self.check_version(probe.schema_version)?;

        let event: Event = serde_json::from_slice(bytes)?;
        self.check_payload(&event.payload)?;
        Ok(event)
    }
}
