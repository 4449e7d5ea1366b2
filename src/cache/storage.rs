//! Key-value storage providers backing the persistent cache.
//!
//! Providers are synchronous string stores. The only failure the persistent
//! cache treats specially is [`StorageError::QuotaExceeded`].

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::storage";
const ENTRY_EXTENSION: &str = "entry";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage I/O failed: {0}")]
    Io(#[source] io::Error),
}

impl StorageError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded)
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => Self::QuotaExceeded,
            _ => Self::Io(err),
        }
    }
}

/// Synchronous string key-value store.
pub trait StorageProvider: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    /// Removing a missing key is not an error.
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

fn entry_size(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}

/// In-process storage with an optional byte quota over keys and values.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Bytes currently held, keys included.
    pub fn used_bytes(&self) -> u64 {
        mutex_lock(&self.items, SOURCE, "memory.used_bytes")
            .iter()
            .map(|(key, value)| entry_size(key, value))
            .sum()
    }
}

impl StorageProvider for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(mutex_lock(&self.items, SOURCE, "memory.get_item")
            .get(key)
            .cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = mutex_lock(&self.items, SOURCE, "memory.set_item");
        if let Some(quota) = self.quota_bytes {
            let used: u64 = items
                .iter()
                .filter(|(existing, _)| existing.as_str() != key)
                .map(|(k, v)| entry_size(k, v))
                .sum();
            if used + entry_size(key, value) > quota {
                return Err(StorageError::QuotaExceeded);
            }
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        mutex_lock(&self.items, SOURCE, "memory.remove_item").remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(mutex_lock(&self.items, SOURCE, "memory.keys")
            .keys()
            .cloned()
            .collect())
    }
}

/// On-disk framing: the original key travels with its value.
#[derive(Serialize, Deserialize)]
struct StoredItem<'a> {
    #[serde(borrow)]
    key: Cow<'a, str>,
    #[serde(borrow)]
    value: Cow<'a, str>,
}

/// One file per key under a directory.
///
/// File names are the SHA-256 of the key plus `.entry`, so keys of any
/// length or content are safe on disk. Each file holds the key next to its
/// value. Writes go through a temp file in the same directory and are
/// renamed into place. The quota counts bytes on disk.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    quota_bytes: Option<u64>,
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory.
    pub fn open(dir: impl Into<PathBuf>, quota_bytes: Option<u64>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "File storage opened");
        Ok(Self {
            dir,
            quota_bytes,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let digest = hex::encode(hasher.finalize().as_slice());
        self.dir.join(format!("{digest}.{ENTRY_EXTENSION}"))
    }

    fn entry_paths(&self) -> Result<Vec<(PathBuf, u64)>, StorageError> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION) {
                paths.push((path, entry.metadata()?.len()));
            }
        }
        Ok(paths)
    }

    fn read_item(path: &Path) -> Result<Option<(String, String)>, StorageError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let item: StoredItem<'_> = serde_json::from_str(&raw).map_err(io::Error::from)?;
        Ok(Some((item.key.into_owned(), item.value.into_owned())))
    }
}

impl StorageProvider for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(Self::read_item(&self.path_for(key))?
            .filter(|(stored_key, _)| stored_key == key)
            .map(|(_, value)| value))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = mutex_lock(&self.write_lock, SOURCE, "file.set_item");
        let body = serde_json::to_string(&StoredItem {
            key: Cow::Borrowed(key),
            value: Cow::Borrowed(value),
        })
        .map_err(io::Error::from)?;

        let path = self.path_for(key);
        if let Some(quota) = self.quota_bytes {
            let used: u64 = self
                .entry_paths()?
                .into_iter()
                .filter(|(existing, _)| *existing != path)
                .map(|(_, len)| len)
                .sum();
            if used + body.len() as u64 > quota {
                return Err(StorageError::QuotaExceeded);
            }
        }

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(body.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .map_err(|err| StorageError::from(err.error))?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let _guard = mutex_lock(&self.write_lock, SOURCE, "file.remove_item");
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for (path, _) in self.entry_paths()? {
            match Self::read_item(&path) {
                Ok(Some((key, _))) => keys.push(key),
                Ok(None) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "Unreadable storage entry skipped"),
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }
}

/// Storage that refuses every operation.
#[derive(Debug, Clone)]
pub struct UnavailableStorage {
    reason: String,
}

impl UnavailableStorage {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn err(&self) -> StorageError {
        StorageError::Unavailable(self.reason.clone())
    }
}

impl StorageProvider for UnavailableStorage {
    fn get_item(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(self.err())
    }

    fn set_item(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(self.err())
    }

    fn remove_item(&self, _key: &str) -> Result<(), StorageError> {
        Err(self.err())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Err(self.err())
    }
}

/// Build the provider described by `config`.
///
/// A storage directory that cannot be opened yields [`UnavailableStorage`],
/// which turns the persistent cache into a no-op.
pub fn from_config(config: &CacheConfig) -> Arc<dyn StorageProvider> {
    match &config.storage_dir {
        Some(dir) => match FileStorage::open(dir, config.storage_quota_bytes) {
            Ok(storage) => Arc::new(storage),
            Err(err) => {
                warn!(
                    dir = %dir.display(),
                    error = %err,
                    "Persistent storage directory unusable; persistent cache disabled"
                );
                Arc::new(UnavailableStorage::new(err.to_string()))
            }
        },
        None => match config.storage_quota_bytes {
            Some(quota) => Arc::new(MemoryStorage::with_quota(quota)),
            None => Arc::new(MemoryStorage::new()),
        },
    }
}
