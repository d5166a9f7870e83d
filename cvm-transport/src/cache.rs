//! Capacity-bounded insertion-ordered maps.
//!
//! [`BoundedLruMap`] is the only place eviction policy lives; the correlation
//! stores, session store, and duplicate-suppression caches all compose it
//! (or the underlying [`lru::LruCache`]) rather than rolling their own.

use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::warn;

/// Invoked with the evicted `(key, value)` when an insert overflows
/// capacity. A failing callback is logged and swallowed; eviction itself
/// never fails.
pub type EvictionCallback<V> =
    Box<dyn FnMut(&str, &V) -> anyhow::Result<()> + Send>;

/// A bounded map from string keys to `V` with least-recently-used eviction.
///
/// Not internally synchronized; owners wrap it in a mutex. None of its
/// operations suspend.
pub struct BoundedLruMap<V> {
    cache: LruCache<String, V>,
    on_evict: Option<EvictionCallback<V>>,
}

impl<V> BoundedLruMap<V> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            cache: LruCache::new(capacity),
            on_evict: None,
        }
    }

    pub fn with_eviction_callback(
        capacity: NonZeroUsize,
        on_evict: EvictionCallback<V>,
    ) -> Self {
        Self {
            cache: LruCache::new(capacity),
            on_evict: Some(on_evict),
        }
    }

    /// Returns the value and marks the key most-recently-used.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        self.cache.get(key)
    }

    /// Membership check without touching recency order.
    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains(key)
    }

    /// Read without touching recency order.
    pub fn peek(&self, key: &str) -> Option<&V> {
        self.cache.peek(key)
    }

    /// Inserts or updates. If inserting a new key overflows capacity, the
    /// least-recently-used entry is evicted, the eviction callback runs,
    /// and the evicted pair is returned. Updating an existing key never
    /// evicts.
    pub fn insert(&mut self, key: String, value: V) -> Option<(String, V)> {
        match self.cache.push(key.clone(), value) {
            // `push` also returns the *old value* when the key already
            // existed; that's an update, not an eviction.
            Some((evicted_key, evicted_value)) if evicted_key != key => {
                if let Some(on_evict) = &mut self.on_evict {
                    if let Err(e) = on_evict(&evicted_key, &evicted_value) {
                        warn!(
                            "Eviction callback failed for '{evicted_key}': \
                             {e:#}"
                        );
                    }
                }
                Some((evicted_key, evicted_value))
            }
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.cache.pop(key)
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Entries in MRU-to-LRU order.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &V)> {
        self.cache.iter()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// An LRU *set* of event ids, used to suppress duplicate dispatch and
/// duplicate decryption. Bounded, so suppression is best-effort over the
/// most recent window rather than a replay-protection guarantee.
pub struct SeenCache {
    ids: LruCache<String, ()>,
}

impl SeenCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            ids: LruCache::new(capacity),
        }
    }

    /// Marks `id` seen. Returns `false` if it was already present, i.e. the
    /// caller should skip the work guarded by this cache.
    pub fn first_sighting(&mut self, id: &str) -> bool {
        self.ids.put(id.to_owned(), ()).is_none()
    }

    /// Un-marks `id`, e.g. when the work it guards failed and should be
    /// allowed to retry.
    pub fn forget(&mut self, id: &str) {
        self.ids.pop(id);
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn cap(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut map = BoundedLruMap::new(cap(2));
        assert_eq!(map.insert("a".into(), 1), None);
        assert_eq!(map.insert("b".into(), 2), None);

        // Touch "a" so "b" becomes the eviction candidate.
        assert_eq!(map.get("a"), Some(&1));
        assert_eq!(map.insert("c".into(), 3), Some(("b".into(), 2)));

        assert!(map.contains("a"));
        assert!(map.contains("c"));
        assert!(!map.contains("b"));
    }

    #[test]
    fn update_existing_key_does_not_evict() {
        let mut map = BoundedLruMap::new(cap(2));
        map.insert("a".into(), 1);
        map.insert("b".into(), 2);
        assert_eq!(map.insert("a".into(), 10), None);
        assert_eq!(map.len(), 2);
        assert_eq!(map.peek("a"), Some(&10));
    }

    #[test]
    fn eviction_callback_runs_and_failures_are_swallowed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cb_calls = calls.clone();
        let mut map = BoundedLruMap::with_eviction_callback(
            cap(1),
            Box::new(move |key, _value: &u32| {
                cb_calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("callback failure for {key}")
            }),
        );

        map.insert("a".into(), 1);
        // The callback fails, but insert still completes and reports the
        // evicted pair.
        assert_eq!(map.insert("b".into(), 2), Some(("a".into(), 1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn entries_iterate_mru_to_lru() {
        let mut map = BoundedLruMap::new(cap(3));
        map.insert("a".into(), 1);
        map.insert("b".into(), 2);
        map.insert("c".into(), 3);
        map.get("a");

        let keys = map
            .entries()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["a", "c", "b"]);
    }

    #[test]
    fn seen_cache_reports_first_sighting_once() {
        let mut seen = SeenCache::new(cap(2));
        assert!(seen.first_sighting("e1"));
        assert!(!seen.first_sighting("e1"));

        // Bounded: evicting "e1" forgets it.
        assert!(seen.first_sighting("e2"));
        assert!(seen.first_sighting("e3"));
        assert!(seen.first_sighting("e1"));
    }
}
