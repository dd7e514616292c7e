//! TTL cache for capability results.
//!
//! The cache is an explicit object handed to the orchestrator, so a caller
//! (or a test) decides its lifetime and can swap in [`ResultCache::disabled`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::config::CacheConfig;

#[derive(Debug)]
struct CacheEntry {
    value: String,
    inserted_at: Instant,
}

/// A bounded, TTL-expiring string cache keyed by `capability:arguments`.
#[derive(Debug)]
pub struct ResultCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
    enabled: bool,
}

impl ResultCache {
    /// Create a cache with the given TTL and capacity.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
            enabled: max_entries > 0,
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::ZERO,
            max_entries: 0,
            enabled: false,
        }
    }

    /// Build from configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        Self::new(Duration::from_secs(config.ttl_secs), config.max_entries)
    }

    /// Key for a capability invocation.
    pub fn key(capability: &str, arguments: &str) -> String {
        format!("{}:{}", capability, arguments)
    }

    /// Whether the cache stores values.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up a live entry, dropping it if it has expired.
    pub fn get(&self, key: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                trace!(key, "cache hit");
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a value, evicting expired entries and then the oldest when full.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.lock();
        let ttl = self.ttl;
        entries.retain(|_, e| e.inserted_at.elapsed() <= ttl);

        let key = key.into();
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value: value.into(),
                inserted_at: Instant::now(),
            },
        );
    }

    /// Number of stored entries (including not-yet-evicted expired ones).
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_hit_and_miss() {
        let cache = ResultCache::new(Duration::from_secs(60), 8);
        let key = ResultCache::key("add", r#"{"a":1}"#);
        assert_eq!(key, r#"add:{"a":1}"#);
        assert!(cache.get(&key).is_none());

        cache.insert(key.clone(), "1");
        assert_eq!(cache.get(&key).as_deref(), Some("1"));
    }

    #[test]
    fn test_expiration() {
        let cache = ResultCache::new(Duration::from_millis(10), 8);
        cache.insert("k", "v");
        thread::sleep(Duration::from_millis(30));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = ResultCache::new(Duration::from_secs(60), 2);
        cache.insert("a", "1");
        thread::sleep(Duration::from_millis(2));
        cache.insert("b", "2");
        thread::sleep(Duration::from_millis(2));
        cache.insert("c", "3");

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("c").as_deref(), Some("3"));
    }

    #[test]
    fn test_disabled_stores_nothing() {
        let cache = ResultCache::disabled();
        cache.insert("k", "v");
        assert!(!cache.is_enabled());
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }
}
