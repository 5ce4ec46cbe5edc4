//! Durable key-value storage for client-side state.
//!
//! `KeyValueStore` is the raw string store (one JSON document on disk, or an
//! in-memory map for tests). `PersistentCell` layers a typed, JSON-encoded
//! value with a default on top of one key of a store.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Key holding the signed-in user record.
pub const USER_KEY: &str = "hipocampo_user";

/// Key holding the active agent session identifier.
pub const SESSION_KEY: &str = "hipocampo_session_id";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt store file {path}: {source}")]
    CorruptFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Corrupt value under key \"{key}\": {source}")]
    CorruptValue {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode value for key \"{key}\": {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Raw string storage keyed by caller-chosen names.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

// ============================================================================
// JsonFileStore
// ============================================================================

/// All keys live in a single JSON object on disk. Writes go to a sibling
/// temp file which is then renamed over the old one.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|source| StoreError::CorruptFile {
            path: self.path.clone(),
            source,
        })
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let body = serde_json::to_string_pretty(entries).map_err(|source| StoreError::Encode {
            key: "*".to_string(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        // A corrupt file is replaced rather than blocking every later write.
        let mut entries = match self.read_all() {
            Ok(entries) => entries,
            Err(StoreError::CorruptFile { .. }) => {
                tracing::warn!(path = %self.path.display(), "Replacing corrupt store file");
                BTreeMap::new()
            }
            Err(e) => return Err(e),
        };
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut entries = match self.read_all() {
            Ok(entries) => entries,
            Err(StoreError::CorruptFile { .. }) => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        if entries.remove(key).is_some() {
            return self.write_all(&entries);
        }
        Ok(())
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

// ============================================================================
// PersistentCell
// ============================================================================

/// A typed value mirrored into one key of a `KeyValueStore`.
///
/// Reads never fail: a missing or undecodable entry yields the default.
/// Writes always update the in-memory value, even when persisting fails.
pub struct PersistentCell<T> {
    store: Arc<dyn KeyValueStore>,
    key: String,
    default: T,
    value: T,
}

impl<T> PersistentCell<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Open the cell, falling back to `default` when the stored entry is
    /// missing or cannot be decoded.
    pub fn open(store: Arc<dyn KeyValueStore>, key: impl Into<String>, default: T) -> Self {
        let key = key.into();
        let value = match read_entry::<T>(store.as_ref(), &key) {
            Ok(Some(v)) => v,
            Ok(None) => default.clone(),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to read stored value, using default");
                default.clone()
            }
        };
        Self {
            store,
            key,
            default,
            value,
        }
    }

    /// Like `open`, but an undecodable entry is also removed from the store.
    pub fn open_or_reset(store: Arc<dyn KeyValueStore>, key: impl Into<String>, default: T) -> Self {
        let key = key.into();
        match read_entry::<T>(store.as_ref(), &key) {
            Ok(stored) => {
                let value = stored.unwrap_or_else(|| default.clone());
                Self {
                    store,
                    key,
                    default,
                    value,
                }
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding unreadable stored value");
                let mut cell = Self {
                    store,
                    key,
                    value: default.clone(),
                    default,
                };
                cell.clear();
                cell
            }
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn set(&mut self, value: T) {
        match serde_json::to_string(&value) {
            Ok(encoded) => {
                if let Err(e) = self.store.set(&self.key, &encoded) {
                    tracing::error!(key = %self.key, error = %e, "Failed to persist value");
                }
            }
            Err(source) => {
                let e = StoreError::Encode {
                    key: self.key.clone(),
                    source,
                };
                tracing::error!(key = %self.key, error = %e, "Failed to persist value");
            }
        }
        self.value = value;
    }

    /// Apply `f` to the current value and store the result.
    pub fn update(&mut self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.value);
        self.set(next);
    }

    pub fn clear(&mut self) {
        if let Err(e) = self.store.remove(&self.key) {
            tracing::error!(key = %self.key, error = %e, "Failed to remove stored value");
        }
        self.value = self.default.clone();
    }
}

fn read_entry<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| StoreError::CorruptValue {
            key: key.to_string(),
            source,
        })
}
