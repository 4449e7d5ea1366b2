//! Domain events and the in-process event bus.
//!
//! Write paths publish a [`DomainEvent`] once their change has committed.
//! The bus fans it out synchronously to every handler subscribed to the
//! event's type string, in subscription order.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::lock::{panic_message, rw_read, rw_write};

const SOURCE: &str = "cache::events";

/// Wire names of the built-in event types.
pub mod event_types {
    pub const ORDER_CREATED: &str = "order.created";
    pub const ORDER_UPDATED: &str = "order.updated";
    pub const ORDER_ASSIGNED: &str = "order.assigned";
    pub const ORDER_STATUS_CHANGED: &str = "order.status_changed";
    pub const ORDER_DELETED: &str = "order.deleted";
    pub const DRIVER_STATUS_CHANGED: &str = "driver.status_changed";
    pub const DRIVER_LOCATION_UPDATED: &str = "driver.location_updated";
    pub const BUSINESS_UPDATED: &str = "business.updated";
    pub const INVENTORY_UPDATED: &str = "inventory.updated";
    pub const PRODUCT_UPDATED: &str = "product.updated";
    pub const CHAT_MESSAGE_SENT: &str = "chat.message_sent";
    pub const AUTH_LOGOUT: &str = "auth.logout";
}

/// Every built-in event type, in declaration order.
pub const KNOWN_EVENT_TYPES: &[&str] = &[
    event_types::ORDER_CREATED,
    event_types::ORDER_UPDATED,
    event_types::ORDER_ASSIGNED,
    event_types::ORDER_STATUS_CHANGED,
    event_types::ORDER_DELETED,
    event_types::DRIVER_STATUS_CHANGED,
    event_types::DRIVER_LOCATION_UPDATED,
    event_types::BUSINESS_UPDATED,
    event_types::INVENTORY_UPDATED,
    event_types::PRODUCT_UPDATED,
    event_types::CHAT_MESSAGE_SENT,
    event_types::AUTH_LOGOUT,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRef {
    pub order_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAssignment {
    pub order_id: Uuid,
    pub driver_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChange {
    pub order_id: Uuid,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStatusChange {
    pub driver_id: Uuid,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverLocation {
    pub driver_id: Uuid,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessRef {
    pub business_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryAdjustment {
    pub product_id: Uuid,
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRef {
    pub product_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub thread_id: Uuid,
    pub message_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub user_id: Uuid,
}

/// Business state changes that may invalidate cached reads.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    // Orders
    OrderCreated(OrderRef),
    OrderUpdated(OrderRef),
    OrderAssigned(OrderAssignment),
    OrderStatusChanged(OrderStatusChange),
    OrderDeleted(OrderRef),

    // Drivers
    DriverStatusChanged(DriverStatusChange),
    DriverLocationUpdated(DriverLocation),

    // Catalogue
    BusinessUpdated(BusinessRef),
    InventoryUpdated(InventoryAdjustment),
    ProductUpdated(ProductRef),

    // Chat / auth
    ChatMessageSent(ChatMessage),
    AuthLogout(SessionRef),

    /// Event type outside the built-in set, e.g. one registered at runtime.
    Custom { event_type: String, payload: Value },
}

impl EventKind {
    /// Dot-namespaced wire name used for dispatch and rule lookup.
    pub fn event_type(&self) -> &str {
        use event_types::*;
        match self {
            Self::OrderCreated(_) => ORDER_CREATED,
            Self::OrderUpdated(_) => ORDER_UPDATED,
            Self::OrderAssigned(_) => ORDER_ASSIGNED,
            Self::OrderStatusChanged(_) => ORDER_STATUS_CHANGED,
            Self::OrderDeleted(_) => ORDER_DELETED,
            Self::DriverStatusChanged(_) => DRIVER_STATUS_CHANGED,
            Self::DriverLocationUpdated(_) => DRIVER_LOCATION_UPDATED,
            Self::BusinessUpdated(_) => BUSINESS_UPDATED,
            Self::InventoryUpdated(_) => INVENTORY_UPDATED,
            Self::ProductUpdated(_) => PRODUCT_UPDATED,
            Self::ChatMessageSent(_) => CHAT_MESSAGE_SENT,
            Self::AuthLogout(_) => AUTH_LOGOUT,
            Self::Custom { event_type, .. } => event_type.as_str(),
        }
    }

    /// Payload as JSON; `Null` if it cannot be represented.
    pub fn payload(&self) -> Value {
        let result = match self {
            Self::OrderCreated(p) | Self::OrderUpdated(p) | Self::OrderDeleted(p) => {
                serde_json::to_value(p)
            }
            Self::OrderAssigned(p) => serde_json::to_value(p),
            Self::OrderStatusChanged(p) => serde_json::to_value(p),
            Self::DriverStatusChanged(p) => serde_json::to_value(p),
            Self::DriverLocationUpdated(p) => serde_json::to_value(p),
            Self::BusinessUpdated(p) => serde_json::to_value(p),
            Self::InventoryUpdated(p) => serde_json::to_value(p),
            Self::ProductUpdated(p) => serde_json::to_value(p),
            Self::ChatMessageSent(p) => serde_json::to_value(p),
            Self::AuthLogout(p) => serde_json::to_value(p),
            Self::Custom { payload, .. } => Ok(payload.clone()),
        };
        result.unwrap_or(Value::Null)
    }

    /// Rebuild a typed event from its wire name and JSON payload.
    ///
    /// Unknown names become [`EventKind::Custom`]; a known name with a
    /// payload of the wrong shape is an error.
    pub fn from_wire(event_type: &str, payload: Value) -> Result<Self, serde_json::Error> {
        use event_types::*;

        fn typed<T: DeserializeOwned>(payload: Value) -> Result<T, serde_json::Error> {
            serde_json::from_value(payload)
        }

        Ok(match event_type {
            ORDER_CREATED => Self::OrderCreated(typed(payload)?),
            ORDER_UPDATED => Self::OrderUpdated(typed(payload)?),
            ORDER_ASSIGNED => Self::OrderAssigned(typed(payload)?),
            ORDER_STATUS_CHANGED => Self::OrderStatusChanged(typed(payload)?),
            ORDER_DELETED => Self::OrderDeleted(typed(payload)?),
            DRIVER_STATUS_CHANGED => Self::DriverStatusChanged(typed(payload)?),
            DRIVER_LOCATION_UPDATED => Self::DriverLocationUpdated(typed(payload)?),
            BUSINESS_UPDATED => Self::BusinessUpdated(typed(payload)?),
            INVENTORY_UPDATED => Self::InventoryUpdated(typed(payload)?),
            PRODUCT_UPDATED => Self::ProductUpdated(typed(payload)?),
            CHAT_MESSAGE_SENT => Self::ChatMessageSent(typed(payload)?),
            AUTH_LOGOUT => Self::AuthLogout(typed(payload)?),
            other => Self::Custom {
                event_type: other.to_string(),
                payload,
            },
        })
    }
}

/// Immutable record of a committed business change.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    /// Unique identifier, for correlating diagnostics.
    pub id: Uuid,
    pub kind: EventKind,
    /// Publish time in ms since the Unix epoch.
    pub timestamp: u64,
}

impl DomainEvent {
    pub fn new(kind: EventKind, timestamp: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp,
        }
    }

    pub fn event_type(&self) -> &str {
        self.kind.event_type()
    }

    pub fn to_wire(&self) -> WireEvent {
        WireEvent {
            event_type: self.event_type().to_string(),
            payload: self.kind.payload(),
            timestamp: Some(self.timestamp),
        }
    }
}

/// JSON form of an event: `{"type", "payload", "timestamp"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl WireEvent {
    /// Convert to a typed event, stamping `now_ms` when no timestamp was sent.
    pub fn into_event(self, now_ms: u64) -> Result<DomainEvent, serde_json::Error> {
        let timestamp = self.timestamp.unwrap_or(now_ms);
        let kind = EventKind::from_wire(&self.event_type, self.payload)?;
        Ok(DomainEvent::new(kind, timestamp))
    }
}

/// Shared handler invoked for each delivered event.
pub type EventHandler = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

struct Listener {
    id: u64,
    handler: EventHandler,
}

#[derive(Default)]
struct BusInner {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, event_type: &str, id: u64) {
        let mut listeners = rw_write(&self.listeners, SOURCE, "unsubscribe");
        if let Some(list) = listeners.get_mut(event_type) {
            list.retain(|listener| listener.id != id);
            if list.is_empty() {
                listeners.remove(event_type);
            }
        }
    }
}

/// Synchronous publish/subscribe channel keyed by event type.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`.
    ///
    /// The handler stays registered until [`Subscription::unsubscribe`] is
    /// called; dropping the subscription does not remove it.
    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> Subscription
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        rw_write(&self.inner.listeners, SOURCE, "subscribe")
            .entry(event_type.to_string())
            .or_default()
            .push(Listener {
                id,
                handler: Arc::new(handler),
            });

        debug!(event_type, subscription_id = id, "Event handler subscribed");

        Subscription {
            bus: Arc::downgrade(&self.inner),
            event_type: event_type.to_string(),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Deliver `event` to every handler for its type, in subscription order.
    ///
    /// Handlers run on the caller's thread and complete before this returns.
    /// A panicking handler is logged and skipped; the rest still run.
    /// Returns the number of handlers invoked.
    pub fn publish(&self, event: &DomainEvent) -> usize {
        let event_type = event.event_type();
        // Snapshot so handlers may subscribe or publish re-entrantly.
        let handlers: Vec<EventHandler> = rw_read(&self.inner.listeners, SOURCE, "publish")
            .get(event_type)
            .map(|list| list.iter().map(|l| Arc::clone(&l.handler)).collect())
            .unwrap_or_default();

        for handler in &handlers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                warn!(
                    event_type,
                    event_id = %event.id,
                    panic = %panic_message(payload.as_ref()),
                    "Event handler panicked; continuing with remaining handlers"
                );
            }
        }

        debug!(
            event_type,
            event_id = %event.id,
            handlers = handlers.len(),
            "Event published"
        );
        handlers.len()
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        rw_read(&self.inner.listeners, SOURCE, "subscriber_count")
            .get(event_type)
            .map_or(0, Vec::len)
    }

    pub fn total_subscribers(&self) -> usize {
        rw_read(&self.inner.listeners, SOURCE, "total_subscribers")
            .values()
            .map(Vec::len)
            .sum()
    }
}

/// Handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    bus: Weak<BusInner>,
    event_type: String,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    /// Remove the handler. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.event_type, self.id);
            debug!(
                event_type = %self.event_type,
                subscription_id = self.id,
                "Event handler unsubscribed"
            );
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.event_type)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    fn logout() -> DomainEvent {
        DomainEvent::new(
            EventKind::AuthLogout(SessionRef {
                user_id: Uuid::nil(),
            }),
            0,
        )
    }

    #[test]
    fn delivers_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            let _ = bus.subscribe(event_types::AUTH_LOGOUT, move |_| {
                seen.lock().expect("seen lock").push(label);
            });
        }

        assert_eq!(bus.publish(&logout()), 3);
        assert_eq!(
            *seen.lock().expect("seen lock"),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn only_matching_type_is_delivered() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let _ = bus.subscribe(event_types::ORDER_CREATED, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.publish(&logout()), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_handler_does_not_stop_siblings() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));

        let _ = bus.subscribe(event_types::AUTH_LOGOUT, |_| panic!("handler failure"));
        let counter = Arc::clone(&hits);
        let _ = bus.subscribe(event_types::AUTH_LOGOUT, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.publish(&logout()), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let first = bus.subscribe(event_types::AUTH_LOGOUT, |_| {});
        let _second = bus.subscribe(event_types::AUTH_LOGOUT, |_| {});
        assert_eq!(bus.subscriber_count(event_types::AUTH_LOGOUT), 2);

        first.unsubscribe();
        first.unsubscribe();

        assert!(!first.is_active());
        assert_eq!(bus.subscriber_count(event_types::AUTH_LOGOUT), 1);
        assert_eq!(bus.total_subscribers(), 1);
    }

    #[test]
    fn handler_may_publish_reentrantly() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));

        let inner_bus = bus.clone();
        let _ = bus.subscribe(event_types::ORDER_DELETED, move |_| {
            inner_bus.publish(&logout());
        });
        let counter = Arc::clone(&hits);
        let _ = bus.subscribe(event_types::AUTH_LOGOUT, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&DomainEvent::new(
            EventKind::OrderDeleted(OrderRef {
                order_id: Uuid::nil(),
            }),
            0,
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_after_bus_dropped_is_harmless() {
        let bus = EventBus::new();
        let subscription = bus.subscribe(event_types::AUTH_LOGOUT, |_| {});
        drop(bus);
        subscription.unsubscribe();
        assert!(!subscription.is_active());
    }

    #[test]
    fn wire_round_trip_for_typed_event() {
        let order_id = Uuid::new_v4();
        let driver_id = Uuid::new_v4();
        let wire = WireEvent {
            event_type: "order.assigned".to_string(),
            payload: json!({ "order_id": order_id, "driver_id": driver_id }),
            timestamp: None,
        };

        let event = wire.into_event(99).expect("event should parse");
        assert_eq!(event.timestamp, 99);
        assert_eq!(
            event.kind,
            EventKind::OrderAssigned(OrderAssignment {
                order_id,
                driver_id
            })
        );
        assert_eq!(event.to_wire().payload["driver_id"], json!(driver_id));
    }

    #[test]
    fn unknown_type_becomes_custom() {
        let kind = EventKind::from_wire("route.closed", json!({ "route": 3 }))
            .expect("custom event should parse");
        assert_eq!(kind.event_type(), "route.closed");
        assert_eq!(kind.payload(), json!({ "route": 3 }));
    }

    #[test]
    fn known_type_with_bad_payload_is_rejected() {
        assert!(EventKind::from_wire("order.created", json!({ "nope": true })).is_err());
    }

    #[test]
    fn known_event_types_are_unique() {
        let mut types = KNOWN_EVENT_TYPES.to_vec();
        types.sort_unstable();
        types.dedup();
        assert_eq!(types.len(), KNOWN_EVENT_TYPES.len());
    }
}
