//! Single-slot, TTL-bounded cache for expensive aggregates
//!
//! Holds at most one value under a coarse key (e.g. the ISO week). A lookup
//! with a different key, or after the TTL, is a miss. Owned by whoever
//! composes the aggregator; `invalidate` is called when upstream content is
//! republished.

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Slot<K, V> {
    key: K,
    value: V,
    expires_at: Instant,
}

pub struct EphemeralCache<K, V> {
    default_ttl: Duration,
    slot: Mutex<Option<Slot<K, V>>>,
}

impl<K: PartialEq, V: Clone> EphemeralCache<K, V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            slot: Mutex::new(None),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let slot = self.slot.lock().ok()?;
        let slot = slot.as_ref()?;
        (slot.key == *key && slot.expires_at > Instant::now()).then(|| slot.value.clone())
    }

    /// Replace the slot
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(Slot {
                key,
                value,
                expires_at: Instant::now() + ttl,
            });
        }
    }

    pub fn set_default(&self, key: K, value: V) {
        self.set(key, value, self.default_ttl);
    }

    pub fn invalidate(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

/// ISO week key such as `2025-W14`
pub fn iso_week_key(instant: chrono::DateTime<chrono::Utc>) -> String {
    use chrono::Datelike;
    let week = instant.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}
