//! Last-known-good response snapshots.
//!
//! Provides the "cache" tier of a degradation chain:
//! - In-memory front layer (mini-moka) for repeat reads
//! - JSON documents on disk that survive restarts
//! - Atomic writes: temp file in the same directory, then rename
//!
//! The `data` field is whatever JSON the caller saved; the store does not
//! impose a schema on it.

use crate::config::ResilienceDefaults;
use crate::resilience::degradation::DataSource;
use crate::{BulwarkError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mini_moka::sync::Cache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Readable key characters kept in a snapshot file name, ahead of the hash.
const FILE_SLUG_LEN: usize = 48;

/// A stored document with its save time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot<T> {
    pub key: String,
    pub saved_at: DateTime<Utc>,
    pub data: T,
}

/// Disk-backed snapshot store with an in-memory front layer.
#[derive(Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    memory: Cache<String, Arc<Snapshot<serde_json::Value>>>,
}

impl SnapshotStore {
    /// Create a store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            memory: Cache::builder()
                .max_capacity(ResilienceDefaults::SNAPSHOT_MEMORY_CAPACITY)
                .build(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `data` under `key`, replacing any previous snapshot.
    pub fn save<T: Serialize>(&self, key: &str, data: &T) -> Result<()> {
        let snapshot = Snapshot {
            key: key.to_string(),
            saved_at: Utc::now(),
            data: serde_json::to_value(data)?,
        };

        std::fs::create_dir_all(&self.dir).map_err(|e| BulwarkError::io_with_path(e, &self.dir))?;
        let path = self.path_for(key);
        let contents = serde_json::to_vec_pretty(&snapshot)?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| BulwarkError::io_with_path(e, &self.dir))?;
        temp.write_all(&contents)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| BulwarkError::io_with_path(e, temp.path()))?;
        temp.persist(&path)
            .map_err(|e| BulwarkError::io_with_path(e.error, &path))?;

        debug!("Saved snapshot {} to {}", key, path.display());
        self.memory.insert(key.to_string(), Arc::new(snapshot));
        Ok(())
    }

    /// Load the snapshot for `key`, if one exists.
    ///
    /// A document whose `data` no longer matches `T` is an error, not a miss.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Snapshot<T>>> {
        let raw = match self.memory.get(&key.to_string()) {
            Some(snapshot) => snapshot,
            None => match self.read_disk(key)? {
                Some(snapshot) => {
                    let snapshot = Arc::new(snapshot);
                    self.memory.insert(key.to_string(), Arc::clone(&snapshot));
                    snapshot
                }
                None => return Ok(None),
            },
        };

        let data = T::deserialize(&raw.data).map_err(|e| BulwarkError::Json {
            message: format!("Snapshot {} does not match the requested type: {}", key, e),
            source: Some(Arc::new(e)),
        })?;

        Ok(Some(Snapshot {
            key: raw.key.clone(),
            saved_at: raw.saved_at,
            data,
        }))
    }

    /// Delete the snapshot for `key`. Returns whether a file was removed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        self.memory.invalidate(&key.to_string());
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BulwarkError::io_with_path(e, path)),
        }
    }

    fn read_disk(&self, key: &str) -> Result<Option<Snapshot<serde_json::Value>>> {
        let path = self.path_for(key);
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BulwarkError::io_with_path(e, path)),
        };

        match serde_json::from_slice::<Snapshot<serde_json::Value>>(&contents) {
            Ok(snapshot) if snapshot.key != key => {
                debug!(
                    "Snapshot {} holds key {}, not {}",
                    path.display(),
                    snapshot.key,
                    key
                );
                Ok(None)
            }
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!("Failed to parse snapshot {}: {}", path.display(), e);
                Err(e.into())
            }
        }
    }

    /// File for `key`: a short readable slug plus the SHA-256 of the full key.
    fn path_for(&self, key: &str) -> PathBuf {
        let slug: String = key
            .chars()
            .take(FILE_SLUG_LEN)
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!(
            "{}{}-{}.json",
            ResilienceDefaults::SNAPSHOT_FILE_PREFIX,
            slug,
            digest
        ))
    }
}

/// Degradation source that serves the stored snapshot for one key.
pub struct SnapshotSource<T> {
    name: String,
    store: SnapshotStore,
    key: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SnapshotSource<T> {
    pub fn new(name: impl Into<String>, store: SnapshotStore, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store,
            key: key.into(),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T> DataSource<T> for SnapshotSource<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<T> {
        match self.store.load::<T>(&self.key)? {
            Some(snapshot) => Ok(snapshot.data),
            None => Err(BulwarkError::Io {
                message: format!("No snapshot stored for {}", self.key),
                path: Some(self.store.path_for(&self.key)),
                source: None,
            }),
        }
    }
}
