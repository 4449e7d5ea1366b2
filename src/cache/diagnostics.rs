//! Diagnostics sink.
//!
//! Write-only observability channel for cache hits, misses, invalidations,
//! evictions and forwarded domain events. The cache never reads from a sink
//! and never depends on one succeeding: [`emit`] swallows panics.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::lock::{mutex_lock, panic_message};

const SOURCE: &str = "cache::diagnostics";
const DEFAULT_MEMORY_SINK_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// What a diagnostic record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagnosticKind {
    #[serde(rename = "cache.hit")]
    CacheHit,
    #[serde(rename = "cache.miss")]
    CacheMiss,
    #[serde(rename = "cache.invalidation")]
    Invalidation,
    #[serde(rename = "cache.eviction")]
    Eviction,
    #[serde(rename = "cache.update")]
    Update,
    #[serde(rename = "cache.storage")]
    Storage,
    #[serde(rename = "domain.event")]
    DomainEvent,
}

impl DiagnosticKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CacheHit => "cache.hit",
            Self::CacheMiss => "cache.miss",
            Self::Invalidation => "cache.invalidation",
            Self::Eviction => "cache.eviction",
            Self::Update => "cache.update",
            Self::Storage => "cache.storage",
            Self::DomainEvent => "domain.event",
        }
    }
}

/// One appended diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticRecord {
    #[serde(rename = "type")]
    pub kind: DiagnosticKind,
    pub message: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: u64,
}

impl DiagnosticRecord {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>, timestamp: u64) -> Self {
        Self {
            kind,
            message: message.into(),
            severity: Severity::Info,
            data: None,
            timestamp,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Append-only destination for diagnostic records.
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, record: DiagnosticRecord);
}

/// Hand a record to `sink`, isolating the caller from a panicking sink.
pub fn emit(sink: &dyn DiagnosticsSink, record: DiagnosticRecord) {
    let kind = record.kind;
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| sink.record(record))) {
        warn!(
            kind = kind.as_str(),
            panic = %panic_message(payload.as_ref()),
            "Diagnostics sink panicked; record dropped"
        );
    }
}

/// Forwards records to `tracing` at the record's severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn record(&self, record: DiagnosticRecord) {
        let kind = record.kind.as_str();
        let data = record.data.as_ref().map(Value::to_string).unwrap_or_default();
        match record.severity {
            Severity::Debug => debug!(
                target: "courier_cache::diagnostics",
                kind,
                data = %data,
                timestamp = record.timestamp,
                "{}",
                record.message
            ),
            Severity::Info => info!(
                target: "courier_cache::diagnostics",
                kind,
                data = %data,
                timestamp = record.timestamp,
                "{}",
                record.message
            ),
            Severity::Warn => warn!(
                target: "courier_cache::diagnostics",
                kind,
                data = %data,
                timestamp = record.timestamp,
                "{}",
                record.message
            ),
            Severity::Error => error!(
                target: "courier_cache::diagnostics",
                kind,
                data = %data,
                timestamp = record.timestamp,
                "{}",
                record.message
            ),
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticsSink for NullSink {
    fn record(&self, _record: DiagnosticRecord) {}
}

/// Keeps the most recent records in memory.
///
/// Oldest records are dropped once `capacity` is reached.
pub struct MemorySink {
    records: Mutex<VecDeque<DiagnosticRecord>>,
    capacity: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_SINK_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Snapshot of retained records, oldest first.
    pub fn records(&self) -> Vec<DiagnosticRecord> {
        mutex_lock(&self.records, SOURCE, "records")
            .iter()
            .cloned()
            .collect()
    }

    /// Retained records of one kind, oldest first.
    pub fn records_of(&self, kind: DiagnosticKind) -> Vec<DiagnosticRecord> {
        mutex_lock(&self.records, SOURCE, "records_of")
            .iter()
            .filter(|record| record.kind == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.records, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.records, SOURCE, "clear").clear();
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsSink for MemorySink {
    fn record(&self, record: DiagnosticRecord) {
        let mut records = mutex_lock(&self.records, SOURCE, "record");
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct PanickingSink;

    impl DiagnosticsSink for PanickingSink {
        fn record(&self, _record: DiagnosticRecord) {
            panic!("sink exploded");
        }
    }

    #[test]
    fn memory_sink_keeps_most_recent_records() {
        let sink = MemorySink::with_capacity(2);
        for i in 0..3 {
            sink.record(DiagnosticRecord::new(
                DiagnosticKind::CacheHit,
                format!("hit {i}"),
                i,
            ));
        }

        let messages: Vec<_> = sink.records().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["hit 1", "hit 2"]);
    }

    #[test]
    fn records_of_filters_by_kind() {
        let sink = MemorySink::new();
        sink.record(DiagnosticRecord::new(DiagnosticKind::CacheHit, "hit", 1));
        sink.record(DiagnosticRecord::new(DiagnosticKind::CacheMiss, "miss", 2));

        assert_eq!(sink.records_of(DiagnosticKind::CacheMiss).len(), 1);
        assert_eq!(sink.records_of(DiagnosticKind::Eviction).len(), 0);
    }

    #[test]
    fn emit_survives_panicking_sink() {
        emit(
            &PanickingSink,
            DiagnosticRecord::new(DiagnosticKind::Storage, "boom", 0),
        );
    }

    #[test]
    fn record_serializes_with_wire_names() {
        let record = DiagnosticRecord::new(DiagnosticKind::Invalidation, "cleared", 7)
            .with_severity(Severity::Warn)
            .with_data(json!({ "cleared": 2 }));

        let value = serde_json::to_value(&record).expect("record should serialize");
        assert_eq!(value["type"], "cache.invalidation");
        assert_eq!(value["severity"], "warn");
        assert_eq!(value["data"]["cleared"], 2);
        assert_eq!(value["timestamp"], 7);
    }
}
