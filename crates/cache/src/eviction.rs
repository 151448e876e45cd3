//! Victim selection for the age and pressure sweeps
//!
//! These functions only choose keys. Removing them, and keeping the
//! counters straight, is the store's job.

use crate::entry::EntryInfo;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Share of entries removed by each pressure pass
pub const PRESSURE_FRACTION: f64 = 0.25;

/// What a pressure sweep removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Removed by the first 25% pass
    pub first_pass: usize,
    /// Removed by the second 25% pass (only run when still above target)
    pub second_pass: usize,
    /// Removed afterwards to get under the hard maxima
    pub enforced: usize,
    pub bytes_freed: u64,
}

impl EvictionReport {
    pub fn total(&self) -> usize {
        self.first_pass + self.second_pass + self.enforced
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Keys strictly older than `max_age`
pub fn expired_keys(
    index: &HashMap<String, EntryInfo>,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Vec<String> {
    index
        .iter()
        .filter(|(_, info)| info.is_expired(max_age, now))
        .map(|(key, _)| key.clone())
        .collect()
}

/// Every key, least recently accessed first.
///
/// Ties break on creation time and then on the key itself so the order is
/// total and repeatable.
pub fn by_recency(index: &HashMap<String, EntryInfo>) -> Vec<String> {
    let mut keys: Vec<(&String, &EntryInfo)> = index.iter().collect();
    keys.sort_by(|(ka, a), (kb, b)| {
        a.last_accessed
            .cmp(&b.last_accessed)
            .then(a.created_at.cmp(&b.created_at))
            .then(ka.cmp(kb))
    });
    keys.into_iter().map(|(key, _)| key.clone()).collect()
}

/// The least recently accessed `fraction` of keys, at least one when the
/// index is not empty
pub fn least_recently_accessed(index: &HashMap<String, EntryInfo>, fraction: f64) -> Vec<String> {
    if index.is_empty() {
        return Vec::new();
    }
    let count = ((index.len() as f64) * fraction).ceil().max(1.0) as usize;
    let mut keys = by_recency(index);
    keys.truncate(count.min(index.len()));
    keys
}
