//! Ordering of upstream message IDs.
//!
//! IDs are decimal strings without leading zeros that can exceed the range of
//! a double. They are compared as strings: a longer ID is always larger, and
//! equal-length IDs compare lexicographically.

use std::cmp::Ordering;

use crate::models::RemoteMessage;

/// Numeric order of two IDs, without parsing them.
pub fn compare(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// True when the upstream has something newer than the last bridged message.
pub fn should_backfill(last_known: &str, last_seen_upstream: &str) -> bool {
    compare(last_known, last_seen_upstream) == Ordering::Less
}

/// Wrapper giving a Snowflake string its numeric ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnowflakeKey<'a>(pub &'a str);

impl Ord for SnowflakeKey<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(self.0, other.0)
    }
}

impl PartialOrd for SnowflakeKey<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Upstream pages arrive newest-first; everything downstream expects oldest-first.
pub fn sort_oldest_first(messages: &mut [RemoteMessage]) {
    messages.sort_by(|a, b| compare(&a.id, &b.id));
}
