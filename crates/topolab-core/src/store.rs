//! On-disk persistence of environments.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<environment-id>/config        # serialized environment
//! <root>/<environment-id>/disk*.<fmt>   # disk files created at build time
//! ```

use crate::environment::{Environment, EnvironmentId};
use crate::error::{CoreError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Name of the serialized state file inside a work directory.
pub const CONFIG_FILE: &str = "config";

/// Reads and writes environment state below a root directory.
#[derive(Debug, Clone)]
pub struct EnvironmentStore {
    root: PathBuf,
}

impl EnvironmentStore {
    /// Create a store rooted at `root`. Nothing is touched on disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory holding all work directories.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Work directory for the environment with `id`.
    pub fn work_dir(&self, id: &EnvironmentId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Encode an environment. Driver handles are not included.
    pub fn serialize(env: &Environment) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(env)?)
    }

    /// Decode an environment. The result has no driver attached.
    pub fn deserialize(bytes: &[u8]) -> Result<Environment> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Write `env` to `<work_dir>/config`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PreconditionFailed`] without touching the
    /// filesystem if the environment has not been built.
    pub async fn save(&self, env: &Environment) -> Result<()> {
        if !env.built {
            return Err(CoreError::PreconditionFailed(format!(
                "environment {} has not been built yet",
                env.label()
            )));
        }
        let work_dir = env.work_dir.as_ref().ok_or_else(|| {
            CoreError::PreconditionFailed(format!(
                "environment {} has no work directory",
                env.label()
            ))
        })?;

        let data = Self::serialize(env)?;
        let path = work_dir.join(CONFIG_FILE);
        tokio::fs::write(&path, data).await?;
        tracing::debug!(env_id = %env.label(), path = %path.display(), "Environment saved");
        Ok(())
    }

    /// Read the environment saved under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if there is no config file for `id`.
    pub async fn load(&self, id: &str) -> Result<Environment> {
        if !is_plain_id(id) {
            return Err(CoreError::NotFound(id.to_string()));
        }
        let path = self.root.join(id).join(CONFIG_FILE);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CoreError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let env = Self::deserialize(&data)?;
        tracing::debug!(env_id = %id, "Environment loaded");
        Ok(env)
    }

    /// Ids of every directory under the root that holds a config file,
    /// sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if tokio::fs::try_exists(entry.path().join(CONFIG_FILE)).await? {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// An id must name a single directory entry below the root.
fn is_plain_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains('/') && !id.contains('\\')
}
