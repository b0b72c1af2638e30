// In-process TTL cache for registry reads
//
// The registry is read-heavy (every agent polls discovery) and write-light
// (registrations, heartbeats). A short per-entry TTL absorbs the read load;
// any write clears the whole cache. That is deliberately coarse: keys are
// derived from query parameters, so selective invalidation cannot see which
// entries a given write affects, and the 30s TTL bounds the staleness
// window anyway.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default time-to-live for cached query results.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Default entry cap.
pub const DEFAULT_CAPACITY: usize = 1000;

struct Entry<V> {
    stored_at: Instant,
    value: V,
}

/// Bounded map with per-entry expiry. Reads and the occasional write are
/// both safe under the internal mutex; eviction is O(n) over the (small)
/// map only when the cap is hit.
pub struct TtlCache<V> {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }

    /// Fetch a live entry; expired entries are removed on access.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().expect("cache poisoned");
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let mut entries = self.entries.lock().expect("cache poisoned");
        if entries.len() >= self.capacity {
            // Drop expired entries first; if everything is still live, drop
            // the oldest so the insert always succeeds.
            let ttl = self.ttl;
            entries.retain(|_, e| e.stored_at.elapsed() <= ttl);
            if entries.len() >= self.capacity {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.stored_at)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key.into(),
            Entry {
                stored_at: Instant::now(),
                value,
            },
        );
    }

    /// Invalidate everything. Called on every write path.
    pub fn clear(&self) {
        self.entries.lock().expect("cache poisoned").clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().expect("cache poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_then_expiry() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_millis(20), 10);
        cache.insert("k", "v".to_string());
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn clear_invalidates_all_entries() {
        let cache: TtlCache<i32> = TtlCache::with_defaults();
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.clear();
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn capacity_is_enforced() {
        let cache: TtlCache<usize> = TtlCache::new(Duration::from_secs(60), 4);
        for n in 0..20 {
            cache.insert(format!("k{}", n), n);
        }
        assert!(cache.len() <= 4);
        // The most recent insert always survives.
        assert_eq!(cache.get("k19"), Some(19));
    }

    #[test]
    fn missing_key_is_none() {
        let cache: TtlCache<i32> = TtlCache::with_defaults();
        assert_eq!(cache.get("nope"), None);
    }
}
