use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;

use crate::config::InMemoryCacheConfig;

use super::ResourceKey;

/// An item saved in the in-memory cache.
#[derive(Debug)]
struct InMemoryItem<R> {
    resource: Arc<R>,
    size: u64,
}

#[derive(Debug)]
struct Inner<R> {
    /// The entries, ordered from least to most recently touched.
    ///
    /// The map and the recency order are a single structure, so they can never get out of sync.
    entries: LruCache<ResourceKey, InMemoryItem<R>>,
    /// Sum of the sizes of all `entries`.
    total_size: u64,
}

impl<R> Inner<R> {
    fn remove(&mut self, key: &ResourceKey) -> Option<InMemoryItem<R>> {
        let item = self.entries.pop(key)?;
        self.total_size -= item.size;
        Some(item)
    }

    fn evict_oldest(&mut self) -> Option<(ResourceKey, InMemoryItem<R>)> {
        let (key, item) = self.entries.pop_lru()?;
        self.total_size -= item.size;
        Some((key, item))
    }
}

/// An in-memory LRU cache of decoded images, bounded by an entry count and a byte budget.
///
/// All mutations (insert, evict, size accounting) happen under one lock, so the total size
/// always equals the sum of the sizes of the cached entries.
pub struct MemoryCache<R> {
    max_count: usize,
    size_budget: u64,
    inner: Mutex<Inner<R>>,
}

impl<R> fmt::Debug for MemoryCache<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("MemoryCache")
            .field("max_count", &self.max_count)
            .field("size_budget", &self.size_budget)
            .field("count", &inner.entries.len())
            .field("total_size", &inner.total_size)
            .finish()
    }
}

impl<R> MemoryCache<R> {
    /// Creates a cache holding at most `max_count` entries and `size_budget` bytes.
    ///
    /// A `max_count` of `0` is treated as `1`. Configurations with a `max_count` of `0` are
    /// rejected by [`Config::validate`](crate::config::Config::validate).
    pub fn new(max_count: usize, size_budget: u64) -> Self {
        Self {
            max_count: max_count.max(1),
            size_budget,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_size: 0,
            }),
        }
    }

    /// Creates a cache whose byte budget is a fraction of the given memory ceiling.
    ///
    /// The fraction is clamped to `[0, 1]`, NaN counts as `0`.
    pub fn with_budget_fraction(max_count: usize, fraction: f64, memory_ceiling: u64) -> Self {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        let size_budget = (memory_ceiling as f64 * fraction) as u64;
        Self::new(max_count, size_budget)
    }

    pub fn from_config(config: &InMemoryCacheConfig) -> Self {
        Self::with_budget_fraction(
            config.max_count,
            config.size_budget_fraction,
            config.memory_ceiling,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner<R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up `key`, marking it as the most recently used entry on a hit.
    pub fn get(&self, key: &ResourceKey) -> Option<Arc<R>> {
        let mut inner = self.lock();
        inner
            .entries
            .get(key)
            .map(|item| Arc::clone(&item.resource))
    }

    /// Inserts `resource` as the most recently used entry.
    ///
    /// Any previous entry for `key` is replaced. Least recently used entries are evicted until
    /// both the count limit and the byte budget hold with the new entry included. An entry that
    /// is larger than the whole byte budget is not cached at all, in which case this returns
    /// `false`.
    pub fn put(&self, key: ResourceKey, resource: Arc<R>, size: u64) -> bool {
        let mut inner = self.lock();
        inner.remove(&key);

        if size > self.size_budget {
            tracing::debug!(%key, size, "Image exceeds the in-memory budget, not caching");
            return false;
        }

        while inner.entries.len() >= self.max_count
            || inner.total_size + size > self.size_budget
        {
            let Some((evicted, item)) = inner.evict_oldest() else {
                break;
            };
            tracing::trace!(key = %evicted, size = item.size, "Evicted image from memory");
            metric!(counter("memory.evicted") += 1);
        }

        inner.entries.put(key, InMemoryItem { resource, size });
        inner.total_size += size;

        metric!(gauge("memory.size") = inner.total_size);
        metric!(gauge("memory.count") = inner.entries.len() as u64);
        true
    }

    /// Removes a single entry, returning whether it was present.
    pub fn remove(&self, key: &ResourceKey) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Drops all entries and resets the size counter.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.total_size = 0;
        metric!(counter("memory.cleared") += 1);
    }

    /// Whether `key` is cached, without touching its recency.
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.lock().entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The sum of the sizes of all cached entries.
    pub fn total_size(&self) -> u64 {
        self.lock().total_size
    }

    pub fn size_budget(&self) -> u64 {
        self.size_budget
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }
}
