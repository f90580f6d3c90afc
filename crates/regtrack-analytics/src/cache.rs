//! Request-scoped TTL memoization for analytics responses
//!
//! Coarse string keys joined from every request-defining parameter plus
//! the per-release data version, so a successful import makes stale
//! entries unreachable without any explicit invalidation. No negative
//! caching; errors never land here.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// One cached value with its expiry deadline
struct Entry<T> {
    value: T,
    expires_at: Instant,
}

/// In-process TTL map
pub struct TtlCache<T: Clone> {
    entries: DashMap<String, Entry<T>>,
    ttl: Duration,
}

impl<T: Clone> TtlCache<T> {
    /// Create a cache whose entries live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Fetch a live entry
    pub fn get(&self, key: &str) -> Option<T> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Store a value under the key, restarting its TTL
    pub fn put(&self, key: String, value: T) {
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop every expired entry, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Number of live and not-yet-swept entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache currently holds nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Join request parameters into a cache key
///
/// Every parameter that changes the response must appear here, including
/// flags like `compare` and the release data version.
pub fn cache_key(parts: &[&str]) -> String {
    parts.join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put_round_trip() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60));
        assert!(cache.get("k").is_none());

        cache.put("k".to_string(), "v".to_string());
        assert_eq!(cache.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn test_expiry_and_sweep() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_millis(0));
        cache.put("k".to_string(), 7);

        // TTL of zero: already dead
        assert!(cache.get("k").is_none());

        cache.put("k2".to_string(), 8);
        let removed = cache.sweep();
        assert_eq!(removed, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_key_separates_parameters() {
        let with_compare = cache_key(&["summary", "6.1.0", "12", "P0,P1", "compare=true", "v3"]);
        let without = cache_key(&["summary", "6.1.0", "12", "P0,P1", "compare=false", "v3"]);
        assert_ne!(with_compare, without);

        // A bumped data version makes the old key unreachable
        let next_version = cache_key(&["summary", "6.1.0", "12", "P0,P1", "compare=true", "v4"]);
        assert_ne!(with_compare, next_version);
    }
}
