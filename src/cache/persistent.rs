//! Persistent cache tier.
//!
//! Best-effort durable cache for values that should survive a restart.
//! Entries are stored as JSON `{data, timestamp, ttl}` under
//! `<namespace><key>`; a single expiry index record maps each key to its
//! absolute expiry so expired and soon-to-expire entries can be found
//! without scanning storage.
//!
//! Nothing here returns an error. Storage that fails the construction probe
//! turns every method into a no-op, and individual failures degrade to
//! misses or dropped writes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::clock::{Clock, duration_ms};
use super::config::CacheConfig;
use super::diagnostics::{DiagnosticKind, DiagnosticRecord, DiagnosticsSink, Severity, emit};
use super::lock::mutex_lock;
use super::storage::{StorageError, StorageProvider};

const SOURCE: &str = "cache::persistent";
const METRIC_RECLAIM_TOTAL: &str = "courier_cache_persist_reclaim_total";
const METRIC_WRITE_DROPPED_TOTAL: &str = "courier_cache_persist_write_dropped_total";

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry<T> {
    data: T,
    timestamp: u64,
    /// Milliseconds.
    ttl: u64,
}

type ExpiryIndex = BTreeMap<String, u64>;

struct PersistentInner {
    storage: Arc<dyn StorageProvider>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn DiagnosticsSink>,
    namespace: String,
    index_key: String,
    default_ttl: Duration,
    reclaim_batch: usize,
    available: bool,
    /// Serializes read-modify-write of the expiry index.
    index_lock: Mutex<()>,
}

/// Durable, quota-aware cache over a [`StorageProvider`].
#[derive(Clone)]
pub struct PersistentCache {
    inner: Arc<PersistentInner>,
}

impl PersistentCache {
    /// Probe `storage` and, if usable, drop entries that expired while the
    /// process was down.
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        config: &CacheConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        let probe_key = format!("{}.probe", config.expiry_index_key);
        let available = match probe(storage.as_ref(), &probe_key) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    error = %err,
                    "Persistent storage probe failed; persistent cache disabled"
                );
                false
            }
        };

        let inner = PersistentInner {
            storage,
            clock,
            sink,
            namespace: config.namespace.clone(),
            index_key: config.expiry_index_key.clone(),
            default_ttl: config.persistent_ttl(),
            reclaim_batch: config.reclaim_batch_non_zero().get(),
            available,
            index_lock: Mutex::new(()),
        };

        if available {
            let removed = inner.clear_expired();
            info!(
                namespace = %inner.namespace,
                expired_removed = removed,
                "Persistent cache ready"
            );
        }

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.available
    }

    /// Save with the configured default TTL.
    pub async fn save<T>(&self, key: &str, data: &T)
    where
        T: Serialize + ?Sized,
    {
        self.save_with_ttl(key, data, self.inner.default_ttl).await;
    }

    /// Save `data` under `key` for `ttl`.
    ///
    /// On a quota error the entries closest to expiry are reclaimed and the
    /// write is retried once; a second failure drops the write.
    pub async fn save_with_ttl<T>(&self, key: &str, data: &T, ttl: Duration)
    where
        T: Serialize + ?Sized,
    {
        if !self.inner.available {
            return;
        }

        let now = self.inner.clock.now_ms();
        let ttl_ms = duration_ms(ttl);
        let body = match serde_json::to_string(&PersistedEntry {
            data,
            timestamp: now,
            ttl: ttl_ms,
        }) {
            Ok(body) => body,
            Err(err) => {
                warn!(key, error = %err, "Persistent cache value not serializable; write dropped");
                return;
            }
        };

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        let expires_at = now.saturating_add(ttl_ms);
        run_blocking("save", move || inner.save_entry(&key, &body, expires_at)).await;
    }

    /// Load a live value; absent, malformed and expired entries read as `None`.
    pub async fn load<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        if !self.inner.available {
            return None;
        }

        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let raw = run_blocking("load", move || inner.load_raw(&owned_key))
            .await
            .flatten()?;

        match serde_json::from_str::<PersistedEntry<T>>(&raw) {
            Ok(entry) => Some(entry.data),
            Err(err) => {
                debug!(key, error = %err, "Persistent entry does not match requested type");
                None
            }
        }
    }

    pub async fn remove(&self, key: &str) {
        if !self.inner.available {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        run_blocking("remove", move || inner.remove_entry(&key)).await;
    }

    /// Remove every entry whose indexed expiry has passed.
    pub async fn clear_expired(&self) -> usize {
        if !self.inner.available {
            return 0;
        }
        let inner = Arc::clone(&self.inner);
        run_blocking("clear_expired", move || inner.clear_expired())
            .await
            .unwrap_or(0)
    }

    /// Remove every namespaced entry and the expiry index.
    pub async fn clear_all(&self) -> usize {
        if !self.inner.available {
            return 0;
        }
        let inner = Arc::clone(&self.inner);
        run_blocking("clear_all", move || inner.clear_all())
            .await
            .unwrap_or(0)
    }

    /// Number of namespaced entries in storage, expired or not.
    pub fn size(&self) -> usize {
        if !self.inner.available {
            return 0;
        }
        self.inner.namespaced_keys().len()
    }
}

fn probe(storage: &dyn StorageProvider, key: &str) -> Result<(), StorageError> {
    storage.set_item(key, "1")?;
    storage.remove_item(key)
}

async fn run_blocking<R, F>(op: &'static str, f: F) -> Option<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => Some(result),
        Err(err) => {
            warn!(op, error = %err, "Persistent cache task failed");
            None
        }
    }
}

impl PersistentInner {
    fn storage_key(&self, key: &str) -> String {
        format!("{}{key}", self.namespace)
    }

    fn read_index(&self) -> ExpiryIndex {
        match self.storage.get_item(&self.index_key) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(error = %err, "Expiry index malformed; starting from empty index");
                ExpiryIndex::new()
            }),
            Ok(None) => ExpiryIndex::new(),
            Err(err) => {
                warn!(error = %err, "Expiry index unreadable");
                ExpiryIndex::new()
            }
        }
    }

    fn store_index(&self, index: &ExpiryIndex) -> Result<(), StorageError> {
        let raw = serde_json::to_string(index)
            .map_err(|err| StorageError::Unavailable(format!("expiry index encoding: {err}")))?;
        self.storage.set_item(&self.index_key, &raw)
    }

    fn write_index(&self, index: &ExpiryIndex) {
        if let Err(err) = self.store_index(index) {
            warn!(error = %err, "Expiry index write failed");
        }
    }

    /// Run `write`; on a quota error reclaim entries other than `keep` and
    /// retry once.
    fn write_reclaiming<F>(
        &self,
        index: &mut ExpiryIndex,
        keep: &str,
        reclaimed: &mut usize,
        mut write: F,
    ) -> Result<(), StorageError>
    where
        F: FnMut(&ExpiryIndex) -> Result<(), StorageError>,
    {
        match write(index) {
            Err(err) if err.is_quota_exceeded() => {
                *reclaimed += self.reclaim(index, keep);
                write(index)
            }
            result => result,
        }
    }

    /// The entry and its index record land together or not at all.
    fn save_entry(&self, key: &str, body: &str, expires_at: u64) {
        let _guard = mutex_lock(&self.index_lock, SOURCE, "save");
        let storage_key = self.storage_key(key);
        let mut index = self.read_index();
        let mut reclaimed = 0;

        let written = self.write_reclaiming(&mut index, key, &mut reclaimed, |_| {
            self.storage.set_item(&storage_key, body)
        });
        if let Err(err) = written {
            self.report_dropped(key, &err, reclaimed);
            if reclaimed > 0 {
                self.write_index(&index);
            }
            return;
        }

        index.insert(key.to_string(), expires_at);
        let indexed =
            self.write_reclaiming(&mut index, key, &mut reclaimed, |index| self.store_index(index));
        match indexed {
            Ok(()) if reclaimed > 0 => {
                debug!(key, reclaimed, "Persistent write succeeded after reclaim");
            }
            Ok(()) => {}
            Err(err) => {
                // An unindexed entry could never be expired or reclaimed.
                if let Err(remove_err) = self.storage.remove_item(&storage_key) {
                    warn!(key, error = %remove_err, "Unindexed persistent entry could not be rolled back");
                }
                index.remove(key);
                if reclaimed > 0 {
                    self.write_index(&index);
                }
                self.report_dropped(key, &err, reclaimed);
            }
        }
    }

    /// Drop the entries closest to expiry; returns how many were removed.
    fn reclaim(&self, index: &mut ExpiryIndex, keep: &str) -> usize {
        let mut by_expiry: Vec<(u64, String)> = index
            .iter()
            .filter(|(key, _)| key.as_str() != keep)
            .map(|(key, expires_at)| (*expires_at, key.clone()))
            .collect();
        by_expiry.sort_unstable();

        let mut reclaimed = 0;
        for (_, key) in by_expiry.into_iter().take(self.reclaim_batch) {
            match self.storage.remove_item(&self.storage_key(&key)) {
                Ok(()) => {
                    index.remove(&key);
                    reclaimed += 1;
                }
                Err(err) => warn!(key = %key, error = %err, "Reclaim could not remove entry"),
            }
        }

        counter!(METRIC_RECLAIM_TOTAL).increment(reclaimed as u64);
        info!(reclaimed, "Persistent storage over quota; reclaimed entries nearest expiry");
        emit(
            self.sink.as_ref(),
            DiagnosticRecord::new(
                DiagnosticKind::Storage,
                format!("reclaimed {reclaimed} entries after quota error"),
                self.clock.now_ms(),
            )
            .with_severity(Severity::Warn)
            .with_data(json!({ "reclaimed": reclaimed })),
        );
        reclaimed
    }

    fn report_dropped(&self, key: &str, err: &StorageError, reclaimed: usize) {
        counter!(METRIC_WRITE_DROPPED_TOTAL).increment(1);
        warn!(key, error = %err, reclaimed, "Persistent cache write dropped");
        emit(
            self.sink.as_ref(),
            DiagnosticRecord::new(
                DiagnosticKind::Storage,
                format!("write dropped for {key}"),
                self.clock.now_ms(),
            )
            .with_severity(Severity::Error)
            .with_data(json!({ "key": key, "error": err.to_string() })),
        );
    }

    /// `Some(true)` when `raw` has outlived its own TTL; `None` if malformed.
    fn is_expired(&self, key: &str, raw: &str) -> Option<bool> {
        let header: PersistedEntry<IgnoredAny> = match serde_json::from_str(raw) {
            Ok(header) => header,
            Err(err) => {
                warn!(key, error = %err, "Persistent entry malformed");
                return None;
            }
        };
        let age = self.clock.now_ms().saturating_sub(header.timestamp);
        Some(age > header.ttl)
    }

    /// Raw JSON of a live entry. Expired entries are removed on sight.
    fn load_raw(&self, key: &str) -> Option<String> {
        let raw = match self.storage.get_item(&self.storage_key(key)) {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(key, error = %err, "Persistent cache read failed");
                return None;
            }
        };

        if self.is_expired(key, &raw)? {
            debug!(key, "Persistent entry expired");
            self.remove_if_expired(key);
            return None;
        }
        Some(raw)
    }

    /// Re-check under the index lock so a concurrent save of `key` survives.
    fn remove_if_expired(&self, key: &str) {
        let _guard = mutex_lock(&self.index_lock, SOURCE, "remove_expired");
        let still_expired = match self.storage.get_item(&self.storage_key(key)) {
            Ok(Some(raw)) => self.is_expired(key, &raw) == Some(true),
            Ok(None) => true,
            Err(err) => {
                warn!(key, error = %err, "Persistent cache read failed");
                false
            }
        };
        if still_expired {
            self.remove_locked(key);
        } else {
            debug!(key, "Persistent entry rewritten before expiry removal");
        }
    }

    fn remove_entry(&self, key: &str) {
        let _guard = mutex_lock(&self.index_lock, SOURCE, "remove");
        self.remove_locked(key);
    }

    /// Caller holds `index_lock`.
    fn remove_locked(&self, key: &str) {
        if let Err(err) = self.storage.remove_item(&self.storage_key(key)) {
            warn!(key, error = %err, "Persistent cache remove failed");
        }
        let mut index = self.read_index();
        if index.remove(key).is_some() {
            self.write_index(&index);
        }
    }

    fn clear_expired(&self) -> usize {
        let _guard = mutex_lock(&self.index_lock, SOURCE, "clear_expired");
        let now = self.clock.now_ms();
        let mut index = self.read_index();
        let expired: Vec<String> = index
            .iter()
            .filter(|(_, expires_at)| **expires_at < now)
            .map(|(key, _)| key.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let mut removed = 0;
        for key in expired {
            match self.storage.remove_item(&self.storage_key(&key)) {
                Ok(()) => {
                    index.remove(&key);
                    removed += 1;
                }
                Err(err) => warn!(key = %key, error = %err, "Expired entry could not be removed"),
            }
        }
        self.write_index(&index);
        debug!(removed, "Expired persistent entries removed");
        removed
    }

    fn clear_all(&self) -> usize {
        let _guard = mutex_lock(&self.index_lock, SOURCE, "clear_all");
        let mut removed = 0;
        for storage_key in self.namespaced_keys() {
            match self.storage.remove_item(&storage_key) {
                Ok(()) => removed += 1,
                Err(err) => warn!(key = %storage_key, error = %err, "Persistent entry could not be removed"),
            }
        }
        if let Err(err) = self.storage.remove_item(&self.index_key) {
            warn!(error = %err, "Expiry index could not be removed");
        }
        info!(removed, "Persistent cache cleared");
        removed
    }

    fn namespaced_keys(&self) -> Vec<String> {
        match self.storage.keys() {
            Ok(keys) => keys
                .into_iter()
                .filter(|key| key.starts_with(&self.namespace))
                .collect(),
            Err(err) => {
                warn!(error = %err, "Persistent storage keys unreadable");
                Vec::new()
            }
        }
    }
}
