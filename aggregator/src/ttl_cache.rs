use std::{
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

struct Entry<T> {
    value: Arc<T>,
    stored_at: Instant,
    stored_at_utc: DateTime<Utc>,
}

/// A single value that expires a fixed time after it was stored.
///
/// Writers replace the whole entry under the lock, so readers always see a value
/// together with the timestamp it was stored with. Expired values are kept around
/// and remain reachable through [`TtlCell::last`] for last-known-good fallbacks.
pub struct TtlCell<T> {
    ttl: Duration,
    entry: RwLock<Option<Entry<T>>>,
}

impl<T> TtlCell<T> {
    pub fn new(ttl: Duration) -> Self {
        TtlCell {
            ttl,
            entry: RwLock::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The stored value if it is younger than the TTL.
    pub fn get(&self) -> Option<Arc<T>> {
        self.get_at(Instant::now())
    }

    /// Like [`TtlCell::get`], evaluated at `now`.
    pub fn get_at(&self, now: Instant) -> Option<Arc<T>> {
        self.entry
            .read()
            .unwrap()
            .as_ref()
            .filter(|entry| now.saturating_duration_since(entry.stored_at) < self.ttl)
            .map(|entry| entry.value.clone())
    }

    /// The stored value regardless of age.
    pub fn last(&self) -> Option<Arc<T>> {
        self.entry
            .read()
            .unwrap()
            .as_ref()
            .map(|entry| entry.value.clone())
    }

    pub fn set(&self, value: T) -> Arc<T> {
        self.set_at(value, Instant::now())
    }

    pub fn set_at(&self, value: T, now: Instant) -> Arc<T> {
        let value = Arc::new(value);
        *self.entry.write().unwrap() = Some(Entry {
            value: value.clone(),
            stored_at: now,
            stored_at_utc: Utc::now(),
        });
        value
    }

    /// Stores `value` unless `replace` rejects the current one, in which case the
    /// current value is returned and its age is left untouched.
    pub fn set_if(&self, value: T, replace: impl FnOnce(&T) -> bool) -> Arc<T> {
        let mut entry = self.entry.write().unwrap();
        if let Some(current) = entry.as_ref() {
            if !replace(&current.value) {
                return current.value.clone();
            }
        }
        let value = Arc::new(value);
        *entry = Some(Entry {
            value: value.clone(),
            stored_at: Instant::now(),
            stored_at_utc: Utc::now(),
        });
        value
    }

    /// Wall-clock time of the last `set`.
    pub fn stored_at_utc(&self) -> Option<DateTime<Utc>> {
        self.entry
            .read()
            .unwrap()
            .as_ref()
            .map(|entry| entry.stored_at_utc)
    }
}
