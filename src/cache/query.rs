//! In-memory query cache.
//!
//! Holds query results keyed by flat strings. Staleness is lazy: `get` hands
//! back whatever is present and callers decide via [`QueryCache::is_stale`]
//! whether to refetch. Invalidation is eager and driven by key patterns.
//!
//! Capacity is bounded by `max_entries`. Once a write pushes the map over
//! the limit the oldest-written share of entries is evicted; reads never
//! protect an entry.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::clock::{Clock, duration_ms};
use super::config::CacheConfig;
use super::diagnostics::{DiagnosticKind, DiagnosticRecord, DiagnosticsSink, Severity, emit};
use super::error::CacheError;
use super::lock::{panic_message, rw_read, rw_write};
use super::pattern::KeyPattern;

const SOURCE: &str = "cache::query";
const METRIC_HIT_TOTAL: &str = "courier_cache_hit_total";
const METRIC_MISS_TOTAL: &str = "courier_cache_miss_total";
const METRIC_EVICT_TOTAL: &str = "courier_cache_evict_total";

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    data: V,
    timestamp: u64,
    /// Zero defers to the TTL passed to `is_stale`.
    ttl: Duration,
    /// Write order, breaks timestamp ties when ranking for eviction.
    seq: u64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_keys: usize,
    pub memory_hits: u64,
    pub memory_misses: u64,
    /// Hits over lookups as a percentage, two decimals; 0 before any lookup.
    pub hit_rate: f64,
    pub persistent_keys: usize,
}

impl CacheStats {
    pub fn with_persistent_keys(mut self, persistent_keys: usize) -> Self {
        self.persistent_keys = persistent_keys;
        self
    }
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let lookups = hits + misses;
    if lookups == 0 {
        return 0.0;
    }
    let percent = hits as f64 / lookups as f64 * 100.0;
    (percent * 100.0).round() / 100.0
}

/// Something invalidation rules can clear.
pub trait InvalidationTarget: Send + Sync {
    /// Drop every entry; returns how many were removed.
    fn invalidate_all(&self) -> usize;

    /// Drop every entry whose key matches `pattern`; returns how many were removed.
    fn invalidate_matching(&self, pattern: &KeyPattern) -> usize;
}

/// String-keyed cache of cloneable query results.
pub struct QueryCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    write_seq: AtomicU64,
    max_entries: usize,
    evict_fraction: f64,
    default_ttl: Duration,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn DiagnosticsSink>,
}

impl<V> QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        config: &CacheConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            write_seq: AtomicU64::new(0),
            max_entries: config.max_entries_non_zero().get(),
            evict_fraction: config.evict_fraction_clamped(),
            default_ttl: config.default_ttl(),
            clock,
            sink,
        }
    }

    /// Return the cached value if present, stale or not.
    pub fn get(&self, key: &str) -> Option<V> {
        let data = rw_read(&self.entries, SOURCE, "get")
            .get(key)
            .map(|entry| entry.data.clone());

        let now = self.clock.now_ms();
        if data.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_HIT_TOTAL).increment(1);
            debug!(key, result = "hit", "Query cache lookup");
            emit(
                self.sink.as_ref(),
                DiagnosticRecord::new(DiagnosticKind::CacheHit, format!("hit {key}"), now)
                    .with_severity(Severity::Debug)
                    .with_data(json!({ "key": key })),
            );
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_MISS_TOTAL).increment(1);
            debug!(key, result = "miss", "Query cache lookup");
            emit(
                self.sink.as_ref(),
                DiagnosticRecord::new(DiagnosticKind::CacheMiss, format!("miss {key}"), now)
                    .with_severity(Severity::Debug)
                    .with_data(json!({ "key": key })),
            );
        }
        data
    }

    /// Store `data` with the configured default TTL.
    pub fn set(&self, key: impl Into<String>, data: V) {
        self.set_with_ttl(key, data, self.default_ttl);
    }

    /// Store `data` under `key`, replacing any previous entry.
    pub fn set_with_ttl(&self, key: impl Into<String>, data: V, ttl: Duration) {
        let entry = CacheEntry {
            data,
            timestamp: self.clock.now_ms(),
            ttl,
            seq: self.write_seq.fetch_add(1, Ordering::Relaxed),
        };

        let evicted = {
            let mut entries = rw_write(&self.entries, SOURCE, "set");
            entries.insert(key.into(), entry);
            self.evict_overflow(&mut entries)
        };

        if !evicted.is_empty() {
            self.report_eviction(&evicted);
        }
    }

    /// True when `key` is absent or older than its own TTL (or `ttl` when
    /// the entry has none).
    pub fn is_stale(&self, key: &str, ttl: Duration) -> bool {
        let entries = rw_read(&self.entries, SOURCE, "is_stale");
        let Some(entry) = entries.get(key) else {
            return true;
        };
        let effective = if entry.ttl.is_zero() { ttl } else { entry.ttl };
        let age = self.clock.now_ms().saturating_sub(entry.timestamp);
        age > duration_ms(effective)
    }

    /// Remove exactly one entry.
    pub fn clear(&self, key: &str) -> bool {
        let removed = rw_write(&self.entries, SOURCE, "clear")
            .remove(key)
            .is_some();
        if removed {
            debug!(key, "Query cache entry cleared");
        }
        removed
    }

    /// Remove every key matching the glob `pattern`.
    pub fn clear_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let pattern = KeyPattern::compile(pattern)?;
        Ok(self.clear_matching(&pattern))
    }

    /// Remove every key matching a precompiled pattern.
    pub fn clear_matching(&self, pattern: &KeyPattern) -> usize {
        if pattern.is_wildcard() {
            return self.clear_all();
        }

        let removed = {
            let mut entries = rw_write(&self.entries, SOURCE, "clear_matching");
            let before = entries.len();
            entries.retain(|key, _| !pattern.matches(key));
            before - entries.len()
        };

        debug!(pattern = %pattern, removed, "Query cache pattern cleared");
        removed
    }

    /// Empty the cache. Hit and miss counters are kept.
    pub fn clear_all(&self) -> usize {
        let removed = {
            let mut entries = rw_write(&self.entries, SOURCE, "clear_all");
            let removed = entries.len();
            entries.clear();
            removed
        };
        info!(removed, "Query cache cleared");
        removed
    }

    /// Rewrite every present entry matching `pattern` with `updater`.
    ///
    /// Updated entries get a fresh timestamp and keep their TTL. A panicking
    /// updater skips that key only. Returns the number of entries rewritten.
    pub fn update<F>(&self, pattern: &str, updater: F) -> Result<usize, CacheError>
    where
        F: Fn(&V) -> V,
    {
        let pattern = KeyPattern::compile(pattern)?;

        let snapshot: Vec<(String, V)> = rw_read(&self.entries, SOURCE, "update.snapshot")
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .map(|(key, entry)| (key.clone(), entry.data.clone()))
            .collect();

        let mut replacements = Vec::with_capacity(snapshot.len());
        for (key, data) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| updater(&data))) {
                Ok(next) => replacements.push((key, next)),
                Err(payload) => warn!(
                    key = %key,
                    panic = %panic_message(payload.as_ref()),
                    "Query cache updater panicked; entry left unchanged"
                ),
            }
        }

        let now = self.clock.now_ms();
        let mut updated = 0;
        {
            let mut entries = rw_write(&self.entries, SOURCE, "update.apply");
            for (key, data) in replacements {
                // Entry may have been cleared while the updater ran.
                if let Some(entry) = entries.get_mut(&key) {
                    entry.data = data;
                    entry.timestamp = now;
                    entry.seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
                    updated += 1;
                }
            }
        }

        if updated > 0 {
            emit(
                self.sink.as_ref(),
                DiagnosticRecord::new(
                    DiagnosticKind::Update,
                    format!("updated {updated} entries matching {pattern}"),
                    now,
                )
                .with_data(json!({ "pattern": pattern.as_str(), "updated": updated })),
            );
        }
        debug!(pattern = %pattern, updated, "Query cache entries updated");
        Ok(updated)
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            total_keys: self.len(),
            memory_hits: hits,
            memory_misses: misses,
            hit_rate: hit_rate(hits, misses),
            persistent_keys: 0,
        }
    }

    /// Zero the hit and miss counters.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Present keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = rw_read(&self.entries, SOURCE, "keys")
            .keys()
            .cloned()
            .collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_overflow(&self, entries: &mut HashMap<String, CacheEntry<V>>) -> Vec<String> {
        let len = entries.len();
        if len <= self.max_entries {
            return Vec::new();
        }

        let by_fraction = (len as f64 * self.evict_fraction).floor() as usize;
        // The entry just written always survives.
        let count = by_fraction.max(len - self.max_entries).min(len - 1);

        let mut ranked: Vec<(u64, u64, &String)> = entries
            .iter()
            .map(|(key, entry)| (entry.timestamp, entry.seq, key))
            .collect();
        ranked.sort_unstable();

        let victims: Vec<String> = ranked
            .into_iter()
            .take(count)
            .map(|(_, _, key)| key.clone())
            .collect();
        for key in &victims {
            entries.remove(key);
        }
        victims
    }

    fn report_eviction(&self, evicted: &[String]) {
        let count = evicted.len();
        counter!(METRIC_EVICT_TOTAL).increment(count as u64);
        info!(
            evicted = count,
            max_entries = self.max_entries,
            "Query cache over capacity; evicted oldest entries"
        );
        emit(
            self.sink.as_ref(),
            DiagnosticRecord::new(
                DiagnosticKind::Eviction,
                format!("evicted {count} entries"),
                self.clock.now_ms(),
            )
            .with_data(json!({ "evicted": count, "keys": evicted })),
        );
    }
}

impl<V> InvalidationTarget for QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn invalidate_all(&self) -> usize {
        self.clear_all()
    }

    fn invalidate_matching(&self, pattern: &KeyPattern) -> usize {
        self.clear_matching(pattern)
    }
}
