//! Snapshot persistence
//!
//! A [`PersistedState`] keeps one value in memory and mirrors it to a JSON file
//! wrapped in a version number and an md5 checksum. Writes go through a temp
//! file and a rename so a crash never leaves a half-written snapshot behind.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Persistence error types
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// State not initialized
    #[error("State not initialized")]
    NotInitialized,

    /// The snapshot on disk does not match its checksum
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Snapshot was written by a different schema version
    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected version
        expected: u32,
        /// Found version
        found: u32,
    },
}

impl PersistenceError {
    /// Whether the snapshot itself is unusable (as opposed to an IO failure)
    pub fn is_unreadable_snapshot(&self) -> bool {
        matches!(
            self,
            PersistenceError::Corruption(_)
                | PersistenceError::VersionMismatch { .. }
                | PersistenceError::Serialization(_)
        )
    }
}

/// Result type for persistence operations
pub type Result<T> = std::result::Result<T, PersistenceError>;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot<T> {
    version: u32,
    checksum: String,
    data: T,
}

fn checksum_of<T: Serialize>(data: &T) -> Result<String> {
    let json = serde_json::to_string(data)?;
    Ok(format!("{:x}", md5::compute(json)))
}

/// Persistence configuration
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Path to the snapshot file
    pub path: PathBuf,
    /// Current schema version
    pub version: u32,
    /// Write through a temp file and rename
    pub atomic_writes: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("session.json"),
            version: 1,
            atomic_writes: true,
        }
    }
}

impl PersistenceConfig {
    /// Create a new configuration
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Default::default() }
    }

    /// Set schema version
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Enable or disable atomic writes
    pub fn atomic_writes(mut self, enabled: bool) -> Self {
        self.atomic_writes = enabled;
        self
    }
}

/// A value mirrored to a checksummed snapshot file
///
/// Cloning is cheap and clones share the same in-memory value.
pub struct PersistedState<T> {
    config: Arc<PersistenceConfig>,
    state: Arc<RwLock<Option<T>>>,
}

impl<T> Clone for PersistedState<T> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> PersistedState<T>
where
    T: Serialize + DeserializeOwned + Clone + Default,
{
    /// Create a new persisted state manager
    pub fn new(config: PersistenceConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(RwLock::new(None)),
        }
    }

    /// Path of the backing snapshot
    pub fn path(&self) -> &PathBuf {
        &self.config.path
    }

    /// Load the snapshot from disk
    ///
    /// A missing file initializes the default value. A corrupt or
    /// version-mismatched snapshot is reported and leaves the state
    /// uninitialized so the caller can decide to [`clear`](Self::clear) it.
    pub async fn init(&self) -> Result<()> {
        let loaded = match self.read_snapshot().await {
            Ok(data) => data,
            Err(PersistenceError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                T::default()
            }
            Err(e) => return Err(e),
        };

        *self.state.write().await = Some(loaded);
        Ok(())
    }

    /// Get the current value
    pub async fn get(&self) -> Result<T> {
        self.state
            .read()
            .await
            .clone()
            .ok_or(PersistenceError::NotInitialized)
    }

    /// Replace the value and persist it
    pub async fn set(&self, value: T) -> Result<()> {
        let mut state = self.state.write().await;
        self.write_snapshot(&value).await?;
        *state = Some(value);
        Ok(())
    }

    /// Mutate the value in place and persist it
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut T),
    {
        let mut state = self.state.write().await;
        let current = state.as_mut().ok_or(PersistenceError::NotInitialized)?;
        f(current);
        self.write_snapshot(current).await
    }

    /// Reset to the default value and delete the snapshot file
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.write().await;
        *state = Some(T::default());

        match fs::remove_file(&self.config.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_snapshot(&self) -> Result<T> {
        let contents = fs::read_to_string(&self.config.path).await?;
        let snapshot: Snapshot<T> = serde_json::from_str(&contents)?;

        if snapshot.version != self.config.version {
            return Err(PersistenceError::VersionMismatch {
                expected: self.config.version,
                found: snapshot.version,
            });
        }

        let computed = checksum_of(&snapshot.data)?;
        if computed != snapshot.checksum {
            return Err(PersistenceError::Corruption(format!(
                "checksum mismatch: expected {}, got {}",
                snapshot.checksum, computed
            )));
        }

        Ok(snapshot.data)
    }

    async fn write_snapshot(&self, data: &T) -> Result<()> {
        let snapshot = Snapshot {
            version: self.config.version,
            checksum: checksum_of(data)?,
            data,
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        if self.config.atomic_writes {
            let temp_path = self.config.path.with_extension("tmp");
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.config.path).await?;
        } else {
            fs::write(&self.config.path, json).await?;
        }

        tracing::debug!(path = %self.config.path.display(), "snapshot written");
        Ok(())
    }
}
