//! Filesystem-backed object store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::ObjectStore;
use crate::errors::{InferflowError, Result};
use crate::utils::sha256_hex;

const FILE_PREFIX: &str = "file://";
const STAGING_SUFFIX: &str = ".partial";

/// Object store writing one file per object under a root directory.
#[derive(Debug, Clone)]
pub struct FileObjectStore {
    root: PathBuf,
}

impl FileObjectStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for_uri(&self, uri: &str) -> Result<PathBuf> {
        let path = uri
            .strip_prefix(FILE_PREFIX)
            .map(PathBuf::from)
            .ok_or_else(|| InferflowError::ObjectNotFound(format!("unsupported uri: {uri}")))?;

        // Only plain object names directly under the root are valid.
        let valid = path.parent() == Some(self.root.as_path())
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.chars().all(|c| c.is_ascii_hexdigit()));

        if valid {
            Ok(path)
        } else {
            Err(InferflowError::ObjectNotFound(format!(
                "uri outside store root: {uri}"
            )))
        }
    }
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String> {
        tokio::fs::create_dir_all(&self.root).await?;

        let name = sha256_hex(&bytes);
        let path = self.root.join(&name);
        if !tokio::fs::try_exists(&path).await? {
            // Readers only ever see complete objects: write aside, then rename.
            let staging = self
                .root
                .join(format!(".{name}.{}{STAGING_SUFFIX}", uuid::Uuid::new_v4().simple()));
            if let Err(err) = tokio::fs::write(&staging, &bytes).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(err.into());
            }
            if let Err(err) = tokio::fs::rename(&staging, &path).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(err.into());
            }
            tracing::debug!(path = %path.display(), size_bytes = bytes.len(), "Stored object");
        }

        Ok(format!("{FILE_PREFIX}{}", path.display()))
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        let path = self.path_for_uri(uri)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(InferflowError::ObjectNotFound(uri.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
