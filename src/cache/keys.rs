//! Cache key definitions.
//!
//! Query cache keys are flat strings; hydration patterns only work if every
//! consumer spells them the same way. [`QueryKey`] renders the conventional
//! `<resource>:<view>:<discriminator>` layout the built-in rules target.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use uuid::Uuid;

/// A query cache key in the conventional prefix layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    // Orders
    /// Filtered order list (`orders:list:<filter>`)
    OrdersList { filter_hash: u64 },
    /// One page of a filtered order list (`orders:page:<filter>:<page>`)
    OrdersPage { filter_hash: u64, page: u32 },
    OrderDetail(Uuid),

    // Drivers
    DriversList { filter_hash: u64 },
    DriverDetail(Uuid),
    /// Orders assigned to a driver
    DriverOrders(Uuid),
    /// Available drivers around a zone
    DriversAvailable { zone: String },
    DriverLocation(Uuid),

    // Business
    BusinessDetail(Uuid),
    BusinessStats(Uuid),

    // Catalogue
    InventoryForProduct(Uuid),
    ProductsList { filter_hash: u64 },
    ProductDetail(Uuid),

    // Chat
    ChatMessages(Uuid),
    ChatThreads(Uuid),
}

impl QueryKey {
    pub fn as_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrdersList { filter_hash } => write!(f, "orders:list:{filter_hash:016x}"),
            Self::OrdersPage { filter_hash, page } => {
                write!(f, "orders:page:{filter_hash:016x}:{page}")
            }
            Self::OrderDetail(id) => write!(f, "orders:detail:{id}"),
            Self::DriversList { filter_hash } => write!(f, "drivers:list:{filter_hash:016x}"),
            Self::DriverDetail(id) => write!(f, "drivers:detail:{id}"),
            Self::DriverOrders(id) => write!(f, "drivers:orders:{id}"),
            Self::DriversAvailable { zone } => write!(f, "drivers:available:{zone}"),
            Self::DriverLocation(id) => write!(f, "drivers:location:{id}"),
            Self::BusinessDetail(id) => write!(f, "business:detail:{id}"),
            Self::BusinessStats(id) => write!(f, "business:stats:{id}"),
            Self::InventoryForProduct(id) => write!(f, "inventory:product:{id}"),
            Self::ProductsList { filter_hash } => write!(f, "products:list:{filter_hash:016x}"),
            Self::ProductDetail(id) => write!(f, "products:detail:{id}"),
            Self::ChatMessages(thread_id) => write!(f, "chat:messages:{thread_id}"),
            Self::ChatThreads(user_id) => write!(f, "chat:threads:{user_id}"),
        }
    }
}

impl From<QueryKey> for String {
    fn from(key: QueryKey) -> Self {
        key.to_string()
    }
}

// ============================================================================
// Hash Utilities
// ============================================================================

/// Compute a hash for any hashable value.
pub fn hash_value<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Hash list filter parameters independent of their order.
pub fn hash_filter<'a, I>(params: I) -> u64
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut params: Vec<_> = params.into_iter().collect();
    params.sort_unstable();
    hash_value(&params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::events::event_types;
    use crate::cache::pattern::KeyPattern;
    use crate::cache::rules::HydrationRules;

    fn invalidated_by(event_type: &str, key: &QueryKey) -> bool {
        let rules = HydrationRules::builtin();
        rules
            .patterns_for(event_type)
            .unwrap_or_default()
            .iter()
            .any(|pattern: &KeyPattern| pattern.matches(&key.as_key()))
    }

    #[test]
    fn filter_hash_ignores_param_order() {
        let a = hash_filter([("status", "new"), ("zone", "north")]);
        let b = hash_filter([("zone", "north"), ("status", "new")]);
        assert_eq!(a, b);
        assert_ne!(a, hash_filter([("status", "done")]));
    }

    #[test]
    fn keys_render_conventional_prefixes() {
        let id = Uuid::nil();
        assert_eq!(
            QueryKey::OrdersPage {
                filter_hash: 0xab,
                page: 3
            }
            .as_key(),
            "orders:page:00000000000000ab:3"
        );
        assert_eq!(
            QueryKey::DriverOrders(id).as_key(),
            format!("drivers:orders:{id}")
        );
        assert_eq!(
            String::from(QueryKey::DriversAvailable {
                zone: "north".to_string()
            }),
            "drivers:available:north"
        );
    }

    #[test]
    fn built_in_rules_reach_conventional_keys() {
        let order = Uuid::new_v4();
        let driver = Uuid::new_v4();

        assert!(invalidated_by(
            event_types::ORDER_ASSIGNED,
            &QueryKey::DriverOrders(driver)
        ));
        assert!(invalidated_by(
            event_types::ORDER_UPDATED,
            &QueryKey::OrderDetail(order)
        ));
        assert!(!invalidated_by(
            event_types::ORDER_CREATED,
            &QueryKey::OrderDetail(order)
        ));
        assert!(invalidated_by(
            event_types::INVENTORY_UPDATED,
            &QueryKey::ProductDetail(order)
        ));
        assert!(!invalidated_by(
            event_types::INVENTORY_UPDATED,
            &QueryKey::ProductsList { filter_hash: 1 }
        ));
        assert!(invalidated_by(
            event_types::DRIVER_LOCATION_UPDATED,
            &QueryKey::DriverLocation(driver)
        ));
        assert!(invalidated_by(
            event_types::AUTH_LOGOUT,
            &QueryKey::ChatThreads(driver)
        ));
    }
}
