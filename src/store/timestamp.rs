//! Logical Timestamps
//!
//! Timestamps are only comparable within one key (and provider, for link
//! fragments). They are never a global clock.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Mastership-based logical timestamp: `(term, sequence)`, ordered
/// lexicographically
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Mastership term of the issuing device master
    pub term: u64,
    /// Sequence within the term
    pub sequence: u64,
}

impl Timestamp {
    pub const fn new(term: u64, sequence: u64) -> Self {
        Self { term, sequence }
    }

    /// Whether this timestamp is strictly newer than `other`
    pub fn is_newer_than(&self, other: &Timestamp) -> bool {
        self > other
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.sequence)
    }
}

/// A value paired with the logical time it was declared at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamped<T> {
    value: T,
    timestamp: Timestamp,
}

impl<T> Timestamped<T> {
    pub fn new(value: T, timestamp: Timestamp) -> Self {
        Self { value, timestamp }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn into_value(self) -> T {
        self.value
    }

    /// Whether this value is strictly newer than the given timestamp
    pub fn is_newer_than(&self, other: &Timestamp) -> bool {
        self.timestamp.is_newer_than(other)
    }

    /// Whether this value is strictly newer than another timestamped value
    pub fn is_newer(&self, other: &Timestamped<T>) -> bool {
        self.is_newer_than(&other.timestamp)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Timestamped<U> {
        Timestamped {
            value: f(self.value),
            timestamp: self.timestamp,
        }
    }
}
