//! Cache configuration.
//!
//! Controls the in-memory query cache, the persistent tier, and any hydration
//! rules layered on top of the built-in table via `courier-cache.toml`.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
pub(crate) const DEFAULT_MAX_ENTRIES: usize = 500;
pub(crate) const DEFAULT_TTL_MS: u64 = 5 * 60 * 1000;
pub(crate) const DEFAULT_EVICT_FRACTION: f64 = 0.2;
pub(crate) const DEFAULT_PERSISTENT_TTL_MS: u64 = 60_000;
pub(crate) const DEFAULT_RECLAIM_BATCH: usize = 10;
pub(crate) const DEFAULT_NAMESPACE: &str = "courier-cache:";
pub(crate) const DEFAULT_EXPIRY_INDEX_KEY: &str = "courier-cache-expiry";

/// Cache configuration from `courier-cache.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries held by the in-memory query cache.
    pub max_entries: usize,
    /// TTL applied when a caller stores an entry without one (ms).
    pub default_ttl_ms: u64,
    /// Share of entries dropped, oldest-written first, once `max_entries` is exceeded.
    pub evict_fraction: f64,
    /// Default TTL for persistent entries (ms).
    pub persistent_ttl_ms: u64,
    /// Entries reclaimed from the persistent tier before retrying a write that hit the quota.
    pub reclaim_batch: usize,
    /// Prefix applied to every persistent entry key.
    pub namespace: String,
    /// Storage key holding the persistent expiry index.
    pub expiry_index_key: String,
    /// Directory backing the persistent tier; in-process storage when unset.
    pub storage_dir: Option<PathBuf>,
    /// Byte quota for the persistent tier; unlimited when unset.
    pub storage_quota_bytes: Option<u64>,
    /// Extra hydration rules merged into the built-in table.
    pub rules: BTreeMap<String, Vec<String>>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            default_ttl_ms: DEFAULT_TTL_MS,
            evict_fraction: DEFAULT_EVICT_FRACTION,
            persistent_ttl_ms: DEFAULT_PERSISTENT_TTL_MS,
            reclaim_batch: DEFAULT_RECLAIM_BATCH,
            namespace: DEFAULT_NAMESPACE.to_string(),
            expiry_index_key: DEFAULT_EXPIRY_INDEX_KEY.to_string(),
            storage_dir: None,
            storage_quota_bytes: None,
            rules: BTreeMap::new(),
        }
    }
}

impl CacheConfig {
    /// Returns the entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the eviction fraction clamped to `(0, 1]`; non-finite or
    /// non-positive values fall back to the default.
    pub fn evict_fraction_clamped(&self) -> f64 {
        if self.evict_fraction.is_finite() && self.evict_fraction > 0.0 {
            self.evict_fraction.min(1.0)
        } else {
            DEFAULT_EVICT_FRACTION
        }
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn persistent_ttl(&self) -> Duration {
        Duration::from_millis(self.persistent_ttl_ms)
    }

    /// Returns the reclaim batch, clamping to 1 if zero.
    pub fn reclaim_batch_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.reclaim_batch).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.max_entries, 500);
        assert_eq!(config.default_ttl_ms, 300_000);
        assert_eq!(config.evict_fraction, 0.2);
        assert_eq!(config.persistent_ttl_ms, 60_000);
        assert_eq!(config.reclaim_batch, 10);
        assert_eq!(config.namespace, "courier-cache:");
        assert!(config.storage_dir.is_none());
        assert!(config.rules.is_empty());
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            max_entries: 0,
            reclaim_batch: 0,
            ..Default::default()
        };
        assert_eq!(config.max_entries_non_zero().get(), 1);
        assert_eq!(config.reclaim_batch_non_zero().get(), 1);
    }

    #[test]
    fn evict_fraction_is_clamped() {
        let over = CacheConfig {
            evict_fraction: 3.0,
            ..Default::default()
        };
        assert_eq!(over.evict_fraction_clamped(), 1.0);

        let negative = CacheConfig {
            evict_fraction: -0.5,
            ..Default::default()
        };
        assert_eq!(negative.evict_fraction_clamped(), DEFAULT_EVICT_FRACTION);

        let nan = CacheConfig {
            evict_fraction: f64::NAN,
            ..Default::default()
        };
        assert_eq!(nan.evict_fraction_clamped(), DEFAULT_EVICT_FRACTION);
    }

    #[test]
    fn layered_toml_fills_missing_fields_with_defaults() {
        let config: CacheConfig = ::config::Config::builder()
            .add_source(::config::File::from_str(
                "max_entries = 42\nstorage_quota_bytes = 4096\n",
                ::config::FileFormat::Toml,
            ))
            .build()
            .and_then(|built| built.try_deserialize())
            .expect("config should deserialize");

        assert_eq!(config.max_entries, 42);
        assert_eq!(config.storage_quota_bytes, Some(4096));
        assert_eq!(config.reclaim_batch, DEFAULT_RECLAIM_BATCH);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn deserializes_partial_json_with_defaults() {
        let config: CacheConfig = serde_json::from_value(serde_json::json!({
            "max_entries": 42,
            "rules": { "route.closed": ["routes:*"] }
        }))
        .expect("config should deserialize");

        assert_eq!(config.max_entries, 42);
        assert_eq!(config.reclaim_batch, DEFAULT_RECLAIM_BATCH);
        assert_eq!(config.rules["route.closed"], vec!["routes:*".to_string()]);
    }
}
