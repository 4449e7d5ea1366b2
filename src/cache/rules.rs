//! Hydration rule table.
//!
//! Maps an event type to the ordered, de-duplicated key patterns it
//! invalidates. Patterns are compiled on insertion, so a malformed pattern
//! is rejected when the rule is registered rather than when an event fires.

use std::collections::BTreeMap;

use tracing::error;

use super::error::CacheError;
use super::events::event_types::*;
use super::pattern::KeyPattern;

/// Built-in rules, in table order.
pub const DEFAULT_RULES: &[(&str, &[&str])] = &[
    (
        ORDER_CREATED,
        &["orders:list:*", "orders:page:*", "business:stats:*"],
    ),
    (
        ORDER_UPDATED,
        &["orders:list:*", "orders:detail:*", "orders:page:*"],
    ),
    (
        ORDER_ASSIGNED,
        &[
            "orders:list:*",
            "orders:detail:*",
            "orders:page:*",
            "drivers:detail:*",
            "drivers:orders:*",
        ],
    ),
    (
        ORDER_STATUS_CHANGED,
        &[
            "orders:list:*",
            "orders:detail:*",
            "orders:page:*",
            "drivers:orders:*",
            "business:stats:*",
        ],
    ),
    (
        ORDER_DELETED,
        &[
            "orders:list:*",
            "orders:detail:*",
            "orders:page:*",
            "business:stats:*",
        ],
    ),
    (
        DRIVER_STATUS_CHANGED,
        &["drivers:list:*", "drivers:detail:*", "drivers:available:*"],
    ),
    (DRIVER_LOCATION_UPDATED, &["drivers:location:*"]),
    (BUSINESS_UPDATED, &["business:*"]),
    (INVENTORY_UPDATED, &["inventory:*", "products:detail:*"]),
    (PRODUCT_UPDATED, &["products:*", "inventory:*"]),
    (CHAT_MESSAGE_SENT, &["chat:messages:*", "chat:threads:*"]),
    (AUTH_LOGOUT, &["*"]),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HydrationRules {
    rules: BTreeMap<String, Vec<KeyPattern>>,
}

impl HydrationRules {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in table.
    pub fn builtin() -> Self {
        let mut rules = Self::empty();
        for (event_type, patterns) in DEFAULT_RULES {
            if let Err(err) = rules.add(event_type, patterns.iter().copied()) {
                error!(event_type, error = %err, "Built-in hydration rule rejected");
            }
        }
        rules
    }

    /// Union `patterns` into the rule for `event_type`.
    ///
    /// Either every pattern compiles and is merged, or the table is left
    /// untouched. Returns `true` when `event_type` had no rule before.
    pub fn add<I, S>(&mut self, event_type: &str, patterns: I) -> Result<bool, CacheError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if event_type.trim().is_empty() {
            return Err(CacheError::invalid_rule(event_type, "event type is empty"));
        }

        let compiled = patterns
            .into_iter()
            .map(|pattern| KeyPattern::compile(pattern.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let is_new = !self.rules.contains_key(event_type);
        let existing = self.rules.entry(event_type.to_string()).or_default();
        for pattern in compiled {
            if !existing.contains(&pattern) {
                existing.push(pattern);
            }
        }
        Ok(is_new)
    }

    /// Drop the rule for `event_type`; returns whether one existed.
    pub fn remove(&mut self, event_type: &str) -> bool {
        self.rules.remove(event_type).is_some()
    }

    pub fn patterns_for(&self, event_type: &str) -> Option<&[KeyPattern]> {
        self.rules.get(event_type).map(Vec::as_slice)
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.rules.contains_key(event_type)
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    /// Owned copy of the table as plain strings.
    pub fn to_map(&self) -> BTreeMap<String, Vec<String>> {
        self.rules
            .iter()
            .map(|(event_type, patterns)| {
                (
                    event_type.clone(),
                    patterns.iter().map(|p| p.as_str().to_string()).collect(),
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
