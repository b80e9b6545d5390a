//! Result cache
//!
//! Keyed by `(topology fingerprint, cumulative task count)`: two windows with
//! the same key would feed the simulator bit-identical input, so one result
//! serves both. A topology change clears the cache and bumps the generation;
//! writes tagged with an older generation are dropped, which keeps in-flight
//! simulator results from polluting the cache after a calibration update.

use std::collections::HashMap;
use std::sync::Mutex;

use opendt_core::{CacheKey, SimulationResult};

struct CacheInner {
    entries: HashMap<CacheKey, SimulationResult>,
    /// Access order, least recently used first.
    order: Vec<CacheKey>,
    generation: u64,
    stale_writes: u64,
}

/// Bounded LRU cache of simulation results. Single writer (the engine loop),
/// any number of snapshot readers.
pub struct ResultCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
}

impl ResultCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: Vec::new(),
                generation: 0,
                stale_writes: 0,
            }),
            max_entries: max_entries.max(1),
        }
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<SimulationResult> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(result) = inner.entries.get(key).cloned() {
            // Touch for LRU
            inner.order.retain(|k| k != key);
            inner.order.push(key.clone());
            Some(result)
        } else {
            None
        }
    }

    /// Insert a result produced under `generation`. Stale generations are
    /// silently dropped (counted, for the status surface).
    pub fn put(&self, key: CacheKey, result: SimulationResult, generation: u64) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if generation != inner.generation {
            inner.stale_writes += 1;
            tracing::debug!(
                ?key,
                generation,
                current = inner.generation,
                "dropping stale cache write"
            );
            return;
        }
        if inner.entries.insert(key.clone(), result).is_none() {
            inner.order.push(key);
        } else {
            inner.order.retain(|k| k != &key);
            inner.order.push(key);
        }
        while inner.entries.len() > self.max_entries {
            let evicted = inner.order.remove(0);
            inner.entries.remove(&evicted);
        }
    }

    /// Drop everything and advance to the given generation.
    pub fn clear(&self, generation: u64) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.clear();
        inner.order.clear();
        inner.generation = generation;
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().expect("cache lock poisoned").generation
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stale_writes(&self) -> u64 {
        self.inner.lock().expect("cache lock poisoned").stale_writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fp: &str, count: u64) -> CacheKey {
        CacheKey {
            topology_fingerprint: fp.to_string(),
            cumulative_task_count: count,
        }
    }

    fn result() -> SimulationResult {
        SimulationResult::empty()
    }

    #[test]
    fn test_put_then_lookup() {
        let cache = ResultCache::new(16);
        cache.put(key("a", 1), result(), 0);
        assert!(cache.lookup(&key("a", 1)).is_some());
        assert!(cache.lookup(&key("a", 2)).is_none());
        assert!(cache.lookup(&key("b", 1)).is_none());
    }

    #[test]
    fn test_stale_generation_write_is_dropped() {
        let cache = ResultCache::new(16);
        cache.clear(2);
        cache.put(key("a", 1), result(), 1);
        assert!(cache.lookup(&key("a", 1)).is_none());
        assert_eq!(cache.stale_writes(), 1);

        cache.put(key("a", 1), result(), 2);
        assert!(cache.lookup(&key("a", 1)).is_some());
    }

    #[test]
    fn test_clear_empties_entries() {
        let cache = ResultCache::new(16);
        cache.put(key("a", 1), result(), 0);
        cache.put(key("a", 2), result(), 0);
        cache.clear(1);
        assert!(cache.is_empty());
        assert_eq!(cache.generation(), 1);
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache = ResultCache::new(2);
        cache.put(key("a", 1), result(), 0);
        cache.put(key("a", 2), result(), 0);
        // Touch the first entry so the second is now least recently used
        assert!(cache.lookup(&key("a", 1)).is_some());
        cache.put(key("a", 3), result(), 0);

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&key("a", 1)).is_some());
        assert!(cache.lookup(&key("a", 2)).is_none(), "LRU entry must be evicted");
        assert!(cache.lookup(&key("a", 3)).is_some());
    }
}
