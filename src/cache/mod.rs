//! Event-driven query cache.
//!
//! Two independent tiers plus declarative invalidation:
//!
//! - **Query cache**: in-memory, TTL-based staleness, write-time eviction
//! - **Persistent cache**: best-effort durable store with an expiry index
//! - **Hydration**: domain events published on the [`EventBus`] clear the
//!   query cache keys their rules match
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `courier-cache.toml`:
//!
//! ```toml
//! [cache]
//! max_entries = 500
//! default_ttl_ms = 300000
//! persistent_ttl_ms = 60000
//!
//! [cache.rules]
//! "route.closed" = ["routes:*"]
//! # ... see config.rs for all options
//! ```

mod clock;
mod config;
mod diagnostics;
mod error;
mod events;
mod handlers;
mod hydration;
mod keys;
mod lock;
mod pattern;
mod persistent;
mod query;
mod rules;
mod services;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock, duration_ms};
pub use config::CacheConfig;
pub use diagnostics::{
    DiagnosticKind, DiagnosticRecord, DiagnosticsSink, MemorySink, NullSink, Severity,
    TracingSink, emit,
};
pub use error::CacheError;
pub use events::{
    BusinessRef, ChatMessage, DomainEvent, DriverLocation, DriverStatusChange, EventBus,
    EventHandler, EventKind, InventoryAdjustment, KNOWN_EVENT_TYPES, OrderAssignment, OrderRef,
    OrderStatusChange, ProductRef, SessionRef, Subscription, WireEvent, event_types,
};
pub use handlers::DomainEventHandlers;
pub use hydration::CacheHydrationService;
pub use keys::{QueryKey, hash_filter, hash_value};
pub use pattern::{KeyPattern, WILDCARD};
pub use persistent::PersistentCache;
pub use query::{CacheStats, InvalidationTarget, QueryCache};
pub use rules::{DEFAULT_RULES, HydrationRules};
pub use services::CacheServices;
pub use storage::{FileStorage, MemoryStorage, StorageError, StorageProvider, UnavailableStorage};
