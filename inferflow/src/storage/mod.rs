//! Object storage for payloads too large to travel inline.
//!
//! Objects are content addressed: the key is the SHA-256 of the bytes, so
//! putting the same payload twice yields the same URI.

mod file;

pub use file::FileObjectStore;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::errors::{InferflowError, Result};
use crate::utils::sha256_hex;

/// URI scheme prefix of the in-memory store.
const MEM_PREFIX: &str = "mem://objects/";

/// Object storage contract used for large payload references.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` and returns the URI they can be fetched from.
    async fn put(&self, bytes: Vec<u8>) -> Result<String>;

    /// Fetches the bytes stored at `uri`.
    async fn get(&self, uri: &str) -> Result<Vec<u8>>;
}

/// Object store backed by a concurrent in-process map.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<String, Vec<u8>>,
}

impl InMemoryObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String> {
        let key = sha256_hex(&bytes);
        self.objects.entry(key.clone()).or_insert(bytes);
        Ok(format!("{MEM_PREFIX}{key}"))
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        let key = uri
            .strip_prefix(MEM_PREFIX)
            .ok_or_else(|| InferflowError::ObjectNotFound(format!("unsupported uri: {uri}")))?;

        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| InferflowError::ObjectNotFound(uri.to_string()))
    }
}
