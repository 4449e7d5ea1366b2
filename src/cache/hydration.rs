//! Cache hydration service.
//!
//! Wires the rule table to the event bus: one subscription per event type,
//! each clearing the cache keys its patterns match when the event fires.
//! Patterns are looked up when the event arrives, so rules unioned into an
//! already-subscribed event type apply immediately.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::json;
use tracing::{debug, info};

use super::clock::Clock;
use super::diagnostics::{DiagnosticKind, DiagnosticRecord, DiagnosticsSink, emit};
use super::error::CacheError;
use super::events::{DomainEvent, EventBus, Subscription};
use super::lock::{mutex_lock, rw_read, rw_write};
use super::query::InvalidationTarget;
use super::rules::HydrationRules;

const SOURCE: &str = "cache::hydration";
const METRIC_INVALIDATED_TOTAL: &str = "courier_cache_invalidated_total";
const METRIC_HYDRATION_MS: &str = "courier_cache_hydration_ms";

#[derive(Default)]
struct HydrationState {
    initialized: bool,
    subscriptions: HashMap<String, Subscription>,
}

/// Handler state shared by every rule subscription.
#[derive(Clone)]
struct Invalidator {
    rules: Arc<RwLock<HydrationRules>>,
    target: Arc<dyn InvalidationTarget>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn DiagnosticsSink>,
}

impl Invalidator {
    fn handle(&self, event: &DomainEvent) {
        let started_at = Instant::now();
        let event_type = event.event_type();

        // Cloned out so the table is not locked while the cache is cleared.
        let patterns = rw_read(&self.rules, SOURCE, "handle")
            .patterns_for(event_type)
            .map(<[_]>::to_vec)
            .unwrap_or_default();

        let mut total = 0;
        for pattern in &patterns {
            let cleared = if pattern.is_wildcard() {
                self.target.invalidate_all()
            } else {
                self.target.invalidate_matching(pattern)
            };
            total += cleared;

            counter!(METRIC_INVALIDATED_TOTAL).increment(cleared as u64);
            info!(
                event_type,
                event_id = %event.id,
                pattern = %pattern,
                cleared,
                "Cache invalidated by domain event"
            );
            emit(
                self.sink.as_ref(),
                DiagnosticRecord::new(
                    DiagnosticKind::Invalidation,
                    format!("{event_type} cleared {cleared} keys matching {pattern}"),
                    self.clock.now_ms(),
                )
                .with_data(json!({
                    "event_type": event_type,
                    "event_id": event.id,
                    "pattern": pattern.as_str(),
                    "cleared": cleared,
                })),
            );
        }

        histogram!(METRIC_HYDRATION_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        debug!(
            event_type,
            patterns = patterns.len(),
            cleared = total,
            "Hydration rules applied"
        );
    }
}

/// Applies hydration rules to a cache whenever matching events are published.
pub struct CacheHydrationService {
    bus: EventBus,
    invalidator: Invalidator,
    state: Mutex<HydrationState>,
}

impl CacheHydrationService {
    pub fn new(
        bus: EventBus,
        target: Arc<dyn InvalidationTarget>,
        rules: HydrationRules,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        Self {
            bus,
            invalidator: Invalidator {
                rules: Arc::new(RwLock::new(rules)),
                target,
                clock,
                sink,
            },
            state: Mutex::new(HydrationState::default()),
        }
    }

    /// Subscribe one handler per event type in the table.
    ///
    /// Returns `false` (and changes nothing) when already initialized.
    pub fn initialize(&self) -> bool {
        let mut state = mutex_lock(&self.state, SOURCE, "initialize");
        if state.initialized {
            info!("Cache hydration already initialized; skipping");
            return false;
        }

        let event_types: Vec<String> = rw_read(&self.invalidator.rules, SOURCE, "initialize")
            .event_types()
            .map(str::to_string)
            .collect();
        for event_type in event_types {
            let subscription = self.subscribe(&event_type);
            state.subscriptions.insert(event_type, subscription);
        }
        state.initialized = true;

        info!(
            subscriptions = state.subscriptions.len(),
            "Cache hydration initialized"
        );
        true
    }

    /// Union `patterns` into the rule for `event_type`.
    ///
    /// A new event type is subscribed straight away when the service is
    /// initialized. A malformed pattern rejects the whole call.
    pub fn add_rule<I, S>(&self, event_type: &str, patterns: I) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = mutex_lock(&self.state, SOURCE, "add_rule");
        rw_write(&self.invalidator.rules, SOURCE, "add_rule").add(event_type, patterns)?;

        if state.initialized && !state.subscriptions.contains_key(event_type) {
            let subscription = self.subscribe(event_type);
            state
                .subscriptions
                .insert(event_type.to_string(), subscription);
        }
        info!(event_type, "Hydration rule added");
        Ok(())
    }

    /// Drop the rule for `event_type` and its subscription.
    pub fn remove_rule(&self, event_type: &str) -> bool {
        let mut state = mutex_lock(&self.state, SOURCE, "remove_rule");
        let removed = rw_write(&self.invalidator.rules, SOURCE, "remove_rule").remove(event_type);
        if let Some(subscription) = state.subscriptions.remove(event_type) {
            subscription.unsubscribe();
        }
        if removed {
            info!(event_type, "Hydration rule removed");
        }
        removed
    }

    /// Unsubscribe every handler and return to the uninitialized state.
    ///
    /// The rule table itself is kept.
    pub fn reset(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "reset");
        for (_, subscription) in state.subscriptions.drain() {
            subscription.unsubscribe();
        }
        state.initialized = false;
        info!("Cache hydration reset");
    }

    /// Copy of the current rule table.
    pub fn get_rules(&self) -> BTreeMap<String, Vec<String>> {
        rw_read(&self.invalidator.rules, SOURCE, "get_rules").to_map()
    }

    pub fn is_initialized(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "is_initialized").initialized
    }

    fn subscribe(&self, event_type: &str) -> Subscription {
        let invalidator = self.invalidator.clone();
        self.bus
            .subscribe(event_type, move |event| invalidator.handle(event))
    }
}
