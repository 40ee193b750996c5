//! Topic pattern validation and matching
//!
//! Two pattern forms are accepted:
//!
//! - **Exact**: any string without a wildcard is compared literally.
//! - **Prefix wildcard**: `<prefix>.*` matches any topic that starts with
//!   `<prefix>.` and has at least one more character after the dot.
//!
//! Anything else carrying a `*` is rejected at validation time, so matching
//! is always a single string comparison.
//!
//! # Examples
//! - `order.*` matches `order.created` and `order.line.added`
//! - `order.*` does NOT match `order`, `order.` or `orders.created`
//! - `*`, `order.*.created`, `*.created` and `order.**` are invalid

use std::fmt;

const WILDCARD: char = '*';
const PREFIX_SUFFIX: &str = ".*";

/// Reasons a pattern is refused by [`TopicPattern::parse`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("pattern must not be empty")]
    Empty,

    #[error("lone wildcard is not a valid pattern")]
    LoneWildcard,

    #[error("pattern '{0}' contains more than one wildcard")]
    MultipleWildcards(String),

    #[error("wildcard in '{0}' must be the final segment, as in 'prefix.*'")]
    MisplacedWildcard(String),
}

/// A validated topic pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicPattern {
    /// Literal topic
    Exact(String),
    /// Stored with the trailing dot, e.g. `order.` for `order.*`
    Prefix(String),
}

impl TopicPattern {
    /// Validate a raw pattern string
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }
        if pattern == "*" {
            return Err(PatternError::LoneWildcard);
        }

        match pattern.matches(WILDCARD).count() {
            0 => Ok(Self::Exact(pattern.to_string())),
            1 => {
                let Some(prefix) = pattern.strip_suffix(PREFIX_SUFFIX) else {
                    return Err(PatternError::MisplacedWildcard(pattern.to_string()));
                };
                // ".*" alone has nothing before the dot
                if prefix.is_empty() {
                    return Err(PatternError::MisplacedWildcard(pattern.to_string()));
                }
                Ok(Self::Prefix(format!("{prefix}.")))
            }
            _ => Err(PatternError::MultipleWildcards(pattern.to_string())),
        }
    }

    /// Check a concrete topic against this pattern
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == topic,
            Self::Prefix(prefix) => topic.len() > prefix.len() && topic.starts_with(prefix.as_str()),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Prefix(_))
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(exact) => f.write_str(exact),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

/// True when the string uses the `prefix.*` form rather than naming a topic
pub fn looks_like_pattern(raw: &str) -> bool {
    raw.contains(WILDCARD)
}
