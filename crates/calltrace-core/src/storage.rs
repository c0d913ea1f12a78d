//! Session-scoped key/value storage
//!
//! The identity store persists the session id through this trait. Storage
//! is optional: when no backend is configured, or a backend fails, ids are
//! kept in process memory only.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt storage file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for session storage backends
pub trait SessionStorage: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Write a value
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Remove a value (absent keys are not an error)
    fn remove(&self, key: &str) -> StorageResult<()>;
}

/// Process-local storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemoryStorage {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// File-backed storage
///
/// Keeps a small JSON object on disk. Writes go through a temp file and a
/// rename so a crash never leaves a half-written file behind.
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Default location under the user's config directory
    pub fn default_path() -> Option<PathBuf> {
        crate::config::ConfigLoader::config_dir().map(|d| d.join("calltrace").join("session.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> StorageResult<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let json = fs::read_to_string(&self.path)?;
        if json.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&json)?)
    }

    /// Current map for a read-modify-write; a corrupt file is replaced
    fn read_for_update(&self) -> StorageResult<BTreeMap<String, String>> {
        match self.read_all() {
            Err(StorageError::Corrupt(e)) => {
                warn!("Discarding corrupt session storage {:?}: {}", self.path, e);
                Ok(BTreeMap::new())
            }
            other => other,
        }
    }

    fn write_all(&self, values: &BTreeMap<String, String>) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(values)?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &self.path)?;

        debug!("Wrote session storage to {:?}", self.path);
        Ok(())
    }
}

impl SessionStorage for FileStorage {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let _guard = self.lock.lock();
        Ok(self.read_all()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let _guard = self.lock.lock();
        let mut values = self.read_for_update()?;
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values)
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let _guard = self.lock.lock();
        match self.read_all() {
            Ok(mut values) => {
                if values.remove(key).is_some() {
                    self.write_all(&values)?;
                }
                Ok(())
            }
            Err(StorageError::Corrupt(e)) => {
                warn!("Discarding corrupt session storage {:?}: {}", self.path, e);
                self.write_all(&BTreeMap::new())
            }
            Err(e) => Err(e),
        }
    }
}
