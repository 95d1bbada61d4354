use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

pub type EvictionListener<K, V> = Box<dyn Fn(&K, V) + Send + Sync>;

/// Size-bounded cache with deterministic least-recently-used eviction.
///
/// Capacity is the only eviction trigger. Evicted entries are handed to the optional
/// eviction listener after the cache lock is released, so a listener may stop services
/// or take other locks without blocking readers.
pub struct BoundedCache<K, V>
where
    K: Hash + Eq,
{
    cache_id: &'static str,
    entries: Mutex<LruCache<K, V>>,
    on_evict: Option<EvictionListener<K, V>>,
    evictions: AtomicU64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// A capacity of 0 is raised to 1.
    pub fn new(cache_id: &'static str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache_id,
            entries: Mutex::new(LruCache::new(capacity)),
            on_evict: None,
            evictions: AtomicU64::new(0),
        }
    }

    pub fn with_eviction_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&K, V) + Send + Sync + 'static,
    {
        self.on_evict = Some(Box::new(listener));
        self
    }

    pub fn cache_id(&self) -> &'static str {
        self.cache_id
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Returns a clone of the cached value and marks it as most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().get(key).cloned()
    }

    /// Returns a clone of the cached value without touching its recency.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.entries.lock().peek(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains(key)
    }

    /// Inserts `value`, returning the value it replaced under the same key.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let (replaced, evicted) = {
            let mut entries = self.entries.lock();
            Self::push(&mut entries, key, value)
        };
        self.notify(evicted);
        replaced
    }

    /// Returns the cached value for `key`, or runs `resolver` and caches its result.
    ///
    /// The resolver runs while the cache is locked, so concurrent callers for the same key
    /// never resolve twice. It must be cheap and must not touch this cache; use
    /// [`BoundedCache::insert_if_absent`] for values that are expensive to build.
    pub fn get_or_resolve<E, F>(&self, key: K, resolver: F) -> Result<V, E>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        let (value, evicted) = {
            let mut entries = self.entries.lock();
            if let Some(found) = entries.get(&key) {
                return Ok(found.clone());
            }
            let value = resolver(&key)?;
            let evicted = Self::push(&mut entries, key, value.clone()).1;
            (value, evicted)
        };
        self.notify(evicted);
        Ok(value)
    }

    /// Caches `value` unless `key` already has a value, and returns whichever value is cached.
    /// When two callers race, the first insert wins.
    pub fn insert_if_absent(&self, key: K, value: V) -> V {
        let evicted = {
            let mut entries = self.entries.lock();
            if let Some(found) = entries.get(&key) {
                return found.clone();
            }
            Self::push(&mut entries, key, value.clone()).1
        };
        self.notify(evicted);
        value
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().pop(key)
    }

    pub fn values(&self) -> Vec<V> {
        self.entries
            .lock()
            .iter()
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Empties the cache and returns its entries, most recently used first.
    /// The eviction listener is not called.
    pub fn drain(&self) -> Vec<(K, V)> {
        let mut entries = self.entries.lock();
        let mut drained = Vec::with_capacity(entries.len());
        while let Some((key, value)) = entries.pop_lru() {
            drained.push((key, value));
        }
        drained.reverse();
        drained
    }

    fn push(entries: &mut LruCache<K, V>, key: K, value: V) -> (Option<V>, Option<(K, V)>) {
        let existed = entries.contains(&key);
        match entries.push(key, value) {
            Some((_, old)) if existed => (Some(old), None),
            Some(evicted) => (None, Some(evicted)),
            None => (None, None),
        }
    }

    fn notify(&self, evicted: Option<(K, V)>) {
        let Some((key, value)) = evicted else {
            return;
        };
        self.evictions.fetch_add(1, Ordering::Relaxed);
        log::debug!("Cache '{}' evicted its least recently used entry", self.cache_id);
        if let Some(listener) = &self.on_evict {
            listener(&key, value);
        }
    }
}
