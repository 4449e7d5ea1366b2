//! Offline replay of domain events against a seeded query cache.
//!
//! Answers "which cached keys would this sequence of events clear?" without
//! a running application: keys are seeded into a fresh cache, each event
//! line is published through fully wired services, and whatever survives is
//! reported.

use std::io::BufRead;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::cache::{CacheServices, CacheStats, WireEvent};
use crate::infra::error::InfraError;

/// Event line that could not be replayed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedLine {
    /// 1-based line number in the events input.
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub seeded: usize,
    pub published: usize,
    pub skipped: Vec<SkippedLine>,
    pub surviving_keys: Vec<String>,
    pub stats: CacheStats,
}

/// Seed `services` with one key per line of `keys`, then publish every
/// JSON-lines event from `events` in order.
///
/// Blank lines are ignored in both inputs. Event lines that fail to parse
/// are skipped and listed in the report.
pub fn replay<K, E>(services: &CacheServices, keys: K, events: E) -> Result<ReplayReport, InfraError>
where
    K: BufRead,
    E: BufRead,
{
    services.start();

    let mut seeded = 0;
    for line in keys.lines() {
        let line = line?;
        let key = line.trim();
        if key.is_empty() {
            continue;
        }
        services.query_cache.set(key, Value::Null);
        seeded += 1;
    }

    let mut published = 0;
    let mut skipped = Vec::new();
    for (index, line) in events.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let parsed = serde_json::from_str::<WireEvent>(&line)
            .and_then(|wire| wire.into_event(services.clock.now_ms()));
        match parsed {
            Ok(event) => {
                services.bus.publish(&event);
                published += 1;
            }
            Err(err) => {
                warn!(line = index + 1, error = %err, "Skipping unparseable event line");
                skipped.push(SkippedLine {
                    line: index + 1,
                    reason: err.to_string(),
                });
            }
        }
    }

    let surviving_keys = services.query_cache.keys();
    info!(
        seeded,
        published,
        skipped = skipped.len(),
        surviving = surviving_keys.len(),
        "Replay finished"
    );

    Ok(ReplayReport {
        seeded,
        published,
        skipped,
        surviving_keys,
        stats: services.stats(),
    })
}
