//! TTL cache of successful operation results, used as a fallback.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::core::clock::deadline_after;
use crate::core::lock;

struct CacheEntry {
    value: Arc<dyn Any + Send + Sync>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
pub struct ResultCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T>(&self, key: impl Into<String>, value: T, ttl: Duration)
    where
        T: Send + Sync + 'static,
    {
        let entry = CacheEntry {
            value: Arc::new(value),
            expires_at: deadline_after(ttl),
        };
        lock(&self.entries).insert(key.into(), entry);
    }

    /// Returns the cached value, or `None` when it is missing, expired, or of
    /// another type. Expired entries are dropped on the way.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut entries = lock(&self.entries);
        let entry = entries.get(key)?;
        if !entry.is_live(Instant::now()) {
            entries.remove(key);
            return None;
        }
        entry.value.downcast_ref::<T>().cloned()
    }

    pub fn remove(&self, key: &str) -> bool {
        lock(&self.entries).remove(key).is_some()
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        lock(&self.entries)
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
