//! Domain event handlers.
//!
//! Single startup entry point for the event-driven cache: initializes
//! hydration and attaches passthrough listeners that forward every known
//! business event to the diagnostics sink. Passthrough listeners never
//! touch cache state.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::info;

use super::diagnostics::{DiagnosticKind, DiagnosticRecord, DiagnosticsSink, emit};
use super::events::{EventBus, KNOWN_EVENT_TYPES, Subscription};
use super::hydration::CacheHydrationService;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::handlers";

#[derive(Default)]
struct HandlerState {
    initialized: bool,
    passthrough: Vec<Subscription>,
}

pub struct DomainEventHandlers {
    bus: EventBus,
    hydration: Arc<CacheHydrationService>,
    sink: Arc<dyn DiagnosticsSink>,
    state: Mutex<HandlerState>,
}

impl DomainEventHandlers {
    pub fn new(
        bus: EventBus,
        hydration: Arc<CacheHydrationService>,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        Self {
            bus,
            hydration,
            sink,
            state: Mutex::new(HandlerState::default()),
        }
    }

    /// Initialize hydration, then attach the passthrough listeners.
    ///
    /// Only the first call does anything; returns whether it was this one.
    pub fn initialize(&self) -> bool {
        let mut state = mutex_lock(&self.state, SOURCE, "initialize");
        if state.initialized {
            info!("Domain event handlers already initialized; skipping");
            return false;
        }

        self.hydration.initialize();

        for event_type in KNOWN_EVENT_TYPES {
            let sink = Arc::clone(&self.sink);
            let subscription = self.bus.subscribe(event_type, move |event| {
                emit(
                    sink.as_ref(),
                    DiagnosticRecord::new(
                        DiagnosticKind::DomainEvent,
                        format!("domain event {}", event.event_type()),
                        event.timestamp,
                    )
                    .with_data(json!({
                        "event_type": event.event_type(),
                        "event_id": event.id,
                        "payload": event.kind.payload(),
                    })),
                );
            });
            state.passthrough.push(subscription);
        }
        state.initialized = true;

        info!(
            passthrough = state.passthrough.len(),
            "Domain event handlers initialized"
        );
        true
    }

    /// Tear down hydration and passthrough listeners.
    pub fn reset(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "reset");
        self.hydration.reset();
        for subscription in state.passthrough.drain(..) {
            subscription.unsubscribe();
        }
        state.initialized = false;
        info!("Domain event handlers reset");
    }

    pub fn is_initialized(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "is_initialized").initialized
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use uuid::Uuid;

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::config::CacheConfig;
    use crate::cache::diagnostics::MemorySink;
    use crate::cache::events::{
        ChatMessage, DomainEvent, EventKind, InventoryAdjustment, event_types,
    };
    use crate::cache::query::QueryCache;
    use crate::cache::rules::HydrationRules;

    struct Fixture {
        bus: EventBus,
        cache: Arc<QueryCache<Value>>,
        sink: Arc<MemorySink>,
        handlers: DomainEventHandlers,
    }

    fn fixture() -> Fixture {
        let bus = EventBus::new();
        let clock = Arc::new(ManualClock::new(0));
        let sink = Arc::new(MemorySink::new());
        let cache = Arc::new(QueryCache::new(
            &CacheConfig::default(),
            clock.clone(),
            sink.clone(),
        ));
        let hydration = Arc::new(CacheHydrationService::new(
            bus.clone(),
            cache.clone(),
            HydrationRules::builtin(),
            clock,
            sink.clone(),
        ));
        let handlers = DomainEventHandlers::new(bus.clone(), hydration, sink.clone());
        Fixture {
            bus,
            cache,
            sink,
            handlers,
        }
    }

    #[test]
    fn initialize_wires_hydration_and_passthrough_once() {
        let f = fixture();
        assert!(f.handlers.initialize());
        assert!(!f.handlers.initialize());

        // One hydration handler plus one passthrough per known type.
        assert_eq!(f.bus.subscriber_count(event_types::AUTH_LOGOUT), 2);
        assert_eq!(f.bus.total_subscribers(), KNOWN_EVENT_TYPES.len() * 2);
    }

    #[test]
    fn passthrough_forwards_without_touching_cache() {
        let f = fixture();
        f.handlers.initialize();
        f.cache.set("unrelated:key", Value::Null);

        let message = ChatMessage {
            thread_id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
        };
        f.bus
            .publish(&DomainEvent::new(EventKind::ChatMessageSent(message.clone()), 42));

        let forwarded = f.sink.records_of(DiagnosticKind::DomainEvent);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].timestamp, 42);
        let data = forwarded[0].data.as_ref().expect("data present");
        assert_eq!(data["event_type"], "chat.message_sent");
        assert_eq!(data["payload"]["thread_id"], json!(message.thread_id));
        assert_eq!(f.cache.len(), 1);
    }

    #[test]
    fn reset_unsubscribes_everything() {
        let f = fixture();
        f.handlers.initialize();
        f.handlers.reset();

        assert!(!f.handlers.is_initialized());
        assert_eq!(f.bus.total_subscribers(), 0);

        f.cache.set("inventory:sku:1", Value::Null);
        f.bus.publish(&DomainEvent::new(
            EventKind::InventoryUpdated(InventoryAdjustment {
                product_id: Uuid::nil(),
                delta: -1,
            }),
            0,
        ));
        assert_eq!(f.cache.len(), 1);
        assert!(f.sink.records_of(DiagnosticKind::DomainEvent).is_empty());

        assert!(f.handlers.initialize());
        f.bus.publish(&DomainEvent::new(
            EventKind::InventoryUpdated(InventoryAdjustment {
                product_id: Uuid::nil(),
                delta: -1,
            }),
            0,
        ));
        assert!(f.cache.is_empty());
    }
}
