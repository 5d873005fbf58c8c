//! In-process memory tier.

use super::entry::CacheEntry;
use chrono::{DateTime, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;

/// Fixed-capacity LRU tier.
///
/// Recency order is maintained on every hit, so the LRU tail is always the entry
/// with the oldest `last_accessed`. Inserting into a full tier evicts that tail
/// before the new entry lands, so the tier never exceeds its capacity.
pub(crate) struct MemoryTier<V> {
    entries: LruCache<String, CacheEntry<V>>,
}

impl<V> MemoryTier<V> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Look up `key`, moving it to the most-recent position.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry<V>> {
        self.entries.get_mut(key)
    }

    pub fn peek(&self, key: &str) -> Option<&CacheEntry<V>> {
        self.entries.peek(key)
    }

    #[cfg(test)]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    /// Insert `entry`, returning the evicted victim when the tier was full.
    ///
    /// Replacing an existing key is not an eviction and returns `None`.
    pub fn insert(&mut self, entry: CacheEntry<V>) -> Option<CacheEntry<V>> {
        let key = entry.key.clone();
        match self.entries.push(key.clone(), entry) {
            Some((old_key, victim)) if old_key != key => Some(victim),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        self.entries.pop(key)
    }

    /// Keys (and tags) matching `pred`, without touching recency.
    pub fn keys_where<F>(&self, mut pred: F) -> Vec<String>
    where
        F: FnMut(&CacheEntry<V>) -> bool,
    {
        self.entries
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn expired_keys(&self, now: DateTime<Utc>) -> Vec<String> {
        self.keys_where(|e| e.is_expired_at(now))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.iter().map(|(k, _)| k)
    }

    /// The entry that the next insert into a full tier would evict.
    #[cfg(test)]
    pub fn lru_key(&self) -> Option<&str> {
        self.entries.peek_lru().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(key: &str) -> CacheEntry<u32> {
        CacheEntry::new(key, 0, Duration::ZERO, Utc::now())
    }

    fn tier(cap: usize) -> MemoryTier<u32> {
        MemoryTier::new(NonZeroUsize::new(cap).unwrap())
    }

    #[test]
    fn test_insert_evicts_least_recent() {
        let mut t = tier(2);
        assert!(t.insert(entry("a")).is_none());
        assert!(t.insert(entry("b")).is_none());
        t.get_mut("a").unwrap().touch(Utc::now());
        let victim = t.insert(entry("c")).unwrap();
        assert_eq!(victim.key, "b");
        assert_eq!(t.len(), 2);
        assert!(t.contains("a") && t.contains("c"));
    }

    #[test]
    fn test_replace_is_not_eviction() {
        let mut t = tier(1);
        t.insert(entry("a"));
        assert!(t.insert(entry("a")).is_none());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_peek_does_not_change_order() {
        let mut t = tier(2);
        t.insert(entry("a"));
        t.insert(entry("b"));
        assert!(t.peek("a").is_some());
        assert_eq!(t.lru_key(), Some("a"));
    }
}
