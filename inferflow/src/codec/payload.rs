//! Moves oversize payloads into object storage and back.

use std::sync::Arc;

use crate::core::Payload;
use crate::errors::{InferflowError, Result};
use crate::storage::ObjectStore;
use crate::utils::sha256_hex;

/// Enforces the inline size threshold on outgoing payloads.
///
/// Payloads above the threshold are stored and replaced by a reference;
/// references are fetched and digest-checked on the way in.
pub struct PayloadOffloader {
    store: Arc<dyn ObjectStore>,
    threshold_bytes: usize,
}

impl PayloadOffloader {
    /// Creates an offloader storing payloads larger than `threshold_bytes`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, threshold_bytes: usize) -> Self {
        Self {
            store,
            threshold_bytes,
        }
    }

    /// Returns the inline threshold.
    #[must_use]
    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }

    /// Replaces an oversize inline payload with an object storage reference.
    pub async fn externalize(&self, payload: Payload) -> Result<Payload> {
        let bytes = match payload.as_inline() {
            Some(data) => serde_json::to_vec(data)?,
            None => return Ok(payload),
        };
        if bytes.len() <= self.threshold_bytes {
            return Ok(payload);
        }

        let size_bytes = bytes.len() as u64;
        let sha256 = sha256_hex(&bytes);
        let uri = self.store.put(bytes).await?;
        tracing::debug!(uri = %uri, size_bytes, "Payload moved to object storage");

        Ok(Payload::Reference {
            uri,
            size_bytes,
            sha256,
        })
    }

    /// Returns the payload value, fetching it from storage if needed.
    pub async fn resolve(&self, payload: &Payload) -> Result<serde_json::Value> {
        match payload {
            Payload::Inline { data } => Ok(data.clone()),
            Payload::Reference {
                uri,
                size_bytes,
                sha256,
            } => {
                let bytes = self.store.get(uri).await?;
                if bytes.len() as u64 != *size_bytes || sha256_hex(&bytes) != *sha256 {
                    return Err(InferflowError::Storage(format!(
                        "object at {uri} does not match its reference"
                    )));
                }
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }
}

impl std::fmt::Debug for PayloadOffloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadOffloader")
            .field("threshold_bytes", &self.threshold_bytes)
            .finish_non_exhaustive()
    }
}
