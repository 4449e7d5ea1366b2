//! Glob key patterns.
//!
//! `*` matches any run of characters (including none); everything else is
//! literal. Matches are anchored to the whole key, so `orders:list:*` never
//! matches `archived:orders:list:1`. The single-character pattern `*` is the
//! wildcard: it is never compiled and callers treat it as "clear everything".

use std::fmt;

use regex::{Regex, RegexBuilder};

use super::error::CacheError;

/// Pattern that stands for every key.
pub const WILDCARD: &str = "*";

const PATTERN_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone)]
enum Matcher {
    Everything,
    Regex(Regex),
}

/// A compiled cache-key glob.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    source: String,
    matcher: Matcher,
}

impl KeyPattern {
    pub fn compile(pattern: &str) -> Result<Self, CacheError> {
        if pattern == WILDCARD {
            return Ok(Self {
                source: pattern.to_string(),
                matcher: Matcher::Everything,
            });
        }

        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");

        let regex = RegexBuilder::new(&format!("^{body}$"))
            .dot_matches_new_line(true)
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .map_err(|source| CacheError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;

        Ok(Self {
            source: pattern.to_string(),
            matcher: Matcher::Regex(regex),
        })
    }

    /// True for the reserved "clear everything" pattern.
    pub fn is_wildcard(&self) -> bool {
        matches!(self.matcher, Matcher::Everything)
    }

    pub fn matches(&self, key: &str) -> bool {
        match &self.matcher {
            Matcher::Everything => true,
            Matcher::Regex(regex) => regex.is_match(key),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl PartialEq for KeyPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for KeyPattern {}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(pattern: &str) -> KeyPattern {
        KeyPattern::compile(pattern).expect("pattern should compile")
    }

    #[test]
    fn trailing_star_matches_prefix() {
        let pattern = compile("orders:list:*");
        assert!(pattern.matches("orders:list:a"));
        assert!(pattern.matches("orders:list:"));
        assert!(!pattern.matches("orders:detail:1"));
    }

    #[test]
    fn match_is_anchored_to_whole_key() {
        let pattern = compile("orders:list:*");
        assert!(!pattern.matches("archived:orders:list:1"));

        let exact = compile("orders:detail:1");
        assert!(exact.matches("orders:detail:1"));
        assert!(!exact.matches("orders:detail:10"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let pattern = compile("orders:list:status=new.(today)+*");
        assert!(pattern.matches("orders:list:status=new.(today)+page=2"));
        assert!(!pattern.matches("orders:list:status=newX(today)+page=2"));
        assert!(!pattern.matches("orders:list:status=new.todayy"));
    }

    #[test]
    fn inner_stars_match_any_run() {
        let pattern = compile("drivers:*:orders:*");
        assert!(pattern.matches("drivers:7:orders:open"));
        assert!(pattern.matches("drivers::orders:"));
        assert!(!pattern.matches("drivers:7:detail"));
    }

    #[test]
    fn star_spans_newlines() {
        let pattern = compile("chat:*");
        assert!(pattern.matches("chat:line\nbreak"));
    }

    #[test]
    fn lone_star_is_wildcard() {
        let pattern = compile(WILDCARD);
        assert!(pattern.is_wildcard());
        assert!(pattern.matches("anything:at:all"));
        assert!(!compile("**").is_wildcard());
        assert!(compile("**").matches("anything"));
    }

    #[test]
    fn equality_uses_source() {
        assert_eq!(compile("a:*"), compile("a:*"));
        assert_ne!(compile("a:*"), compile("b:*"));
        assert_eq!(compile("a:*").to_string(), "a:*");
    }
}
