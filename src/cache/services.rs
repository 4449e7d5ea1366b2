//! Cache service container.
//!
//! Builds the bus, both cache tiers and the hydration wiring once, so the
//! application holds a single shared handle instead of process globals.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use super::clock::{Clock, SystemClock};
use super::config::CacheConfig;
use super::diagnostics::{DiagnosticsSink, TracingSink};
use super::error::CacheError;
use super::events::{DomainEvent, EventBus, EventKind};
use super::handlers::DomainEventHandlers;
use super::hydration::CacheHydrationService;
use super::persistent::PersistentCache;
use super::query::{CacheStats, QueryCache};
use super::rules::HydrationRules;
use super::storage::{self, StorageProvider};

/// Everything the event-driven cache needs, wired together.
pub struct CacheServices {
    pub config: CacheConfig,
    pub bus: EventBus,
    pub query_cache: Arc<QueryCache<Value>>,
    pub persistent: PersistentCache,
    pub hydration: Arc<CacheHydrationService>,
    pub handlers: DomainEventHandlers,
    pub clock: Arc<dyn Clock>,
    pub sink: Arc<dyn DiagnosticsSink>,
}

impl CacheServices {
    /// Wire services from explicit collaborators.
    ///
    /// Rules from `config.rules` are merged into the built-in table; a
    /// malformed one fails construction.
    pub fn new(
        config: CacheConfig,
        storage: Arc<dyn StorageProvider>,
        sink: Arc<dyn DiagnosticsSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        let mut rules = HydrationRules::builtin();
        for (event_type, patterns) in &config.rules {
            rules.add(event_type, patterns)?;
        }

        let bus = EventBus::new();
        let query_cache = Arc::new(QueryCache::new(
            &config,
            Arc::clone(&clock),
            Arc::clone(&sink),
        ));
        let persistent =
            PersistentCache::new(storage, &config, Arc::clone(&clock), Arc::clone(&sink));
        let hydration = Arc::new(CacheHydrationService::new(
            bus.clone(),
            query_cache.clone(),
            rules,
            Arc::clone(&clock),
            Arc::clone(&sink),
        ));
        let handlers =
            DomainEventHandlers::new(bus.clone(), Arc::clone(&hydration), Arc::clone(&sink));

        Ok(Self {
            config,
            bus,
            query_cache,
            persistent,
            hydration,
            handlers,
            clock,
            sink,
        })
    }

    /// Production wiring: system clock, tracing sink, storage per config.
    pub fn from_config(config: CacheConfig) -> Result<Self, CacheError> {
        let storage = storage::from_config(&config);
        Self::new(config, storage, Arc::new(TracingSink), Arc::new(SystemClock))
    }

    /// Initialize event handling. Safe to call from several entry points.
    pub fn start(&self) -> bool {
        let started = self.handlers.initialize();
        if started {
            info!(
                max_entries = self.config.max_entries,
                persistent_available = self.persistent.is_available(),
                "Cache services started"
            );
        }
        started
    }

    /// Stamp `kind` with an id and the current time, then publish it.
    pub fn publish(&self, kind: EventKind) -> DomainEvent {
        let event = DomainEvent::new(kind, self.clock.now_ms());
        self.bus.publish(&event);
        event
    }

    /// In-memory statistics plus the persistent tier's size.
    pub fn stats(&self) -> CacheStats {
        self.query_cache
            .stats()
            .with_persistent_keys(self.persistent.size())
    }
}
