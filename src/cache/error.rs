use thiserror::Error;

/// Errors surfaced by cache configuration paths.
///
/// Runtime conditions (storage failures, panicking handlers) never reach
/// callers; only a malformed key pattern does, because it means the rule
/// table or a call site is misconfigured.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid key pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid hydration rule for `{event_type}`: {reason}")]
    InvalidRule { event_type: String, reason: String },
}

impl CacheError {
    pub fn invalid_rule(event_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            event_type: event_type.into(),
            reason: reason.into(),
        }
    }
}
