//! Progress marker into the upstream document stream.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Position in an upstream stream: a source id and an offset within it.
///
/// Locators from different sources are incomparable. An offset below zero
/// means the position is unknown; an unknown locator covers nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    /// Identifier of the upstream source.
    #[serde(default)]
    pub src: u64,
    /// Offset inside the source.
    #[serde(default = "unknown_offset")]
    pub offset: i64,
}

const fn unknown_offset() -> i64 {
    -1
}

impl Default for Locator {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl Locator {
    /// The unknown position.
    pub const UNKNOWN: Self = Self { src: 0, offset: -1 };

    /// Creates a locator.
    #[must_use]
    pub const fn new(src: u64, offset: i64) -> Self {
        Self { src, offset }
    }

    /// Returns true if the offset is unknown.
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        self.offset < 0
    }

    /// Returns true if the two locators can be ordered.
    ///
    /// Unknown locators are comparable with everything.
    #[must_use]
    pub const fn is_comparable(&self, other: &Self) -> bool {
        self.is_unknown() || other.is_unknown() || self.src == other.src
    }

    /// Returns true if `other` is already included in the progress described by `self`.
    #[must_use]
    pub const fn covers(&self, other: &Self) -> bool {
        !self.is_unknown()
            && !other.is_unknown()
            && self.src == other.src
            && other.offset <= self.offset
    }

    /// Returns the furthest of two positions.
    ///
    /// When the sources differ the newer observation (`other`) wins, since a
    /// source switch restarts progress tracking.
    #[must_use]
    pub fn advance(self, other: Self) -> Self {
        if other.is_unknown() {
            return self;
        }
        if self.is_unknown() || self.src != other.src {
            return other;
        }
        if other.offset > self.offset {
            other
        } else {
            self
        }
    }
}

impl PartialOrd for Locator {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.src != other.src {
            return None;
        }
        Some(self.offset.cmp(&other.offset))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "{}:?", self.src)
        } else {
            write!(f, "{}:{}", self.src, self.offset)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn unknown_covers_nothing() {
        let known = Locator::new(1, 10);
        assert!(!Locator::UNKNOWN.covers(&known));
        assert!(!known.covers(&Locator::UNKNOWN));
        assert!(known.is_comparable(&Locator::UNKNOWN));
    }

    #[test]
    fn different_sources_are_incomparable() {
        let a = Locator::new(1, 10);
        let b = Locator::new(2, 5);
        assert!(!a.is_comparable(&b));
        assert_eq!(a.partial_cmp(&b), None);
        assert!(!a.covers(&b));
        assert_eq!(a.advance(b), b);
    }

    #[test]
    fn advance_keeps_furthest_offset() {
        let a = Locator::new(1, 10);
        assert_eq!(a.advance(Locator::new(1, 4)), a);
        assert_eq!(a.advance(Locator::new(1, 12)), Locator::new(1, 12));
        assert_eq!(Locator::UNKNOWN.advance(a), a);
    }

    #[test]
    fn legacy_json_defaults_to_unknown() {
        let locator: Locator = serde_json::from_str("{}").unwrap();
        assert!(locator.is_unknown());
    }

    proptest! {
        #[test]
        fn advance_covers_both_inputs(src in 0u64..3, a in 0i64..1000, b in 0i64..1000) {
            let merged = Locator::new(src, a).advance(Locator::new(src, b));
            prop_assert!(merged.covers(&Locator::new(src, a)));
            prop_assert!(merged.covers(&Locator::new(src, b)));
        }
    }
}
