//! In-memory caching.
//!
//! [`MemoryCache`] is a generic cost+count bounded LRU map with
//! per-entry TTL. [`ImageCache`] specializes it for decoded image
//! containers keyed by [`ImageCacheKey`], with the pixel byte count as
//! the cost function.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use std::sync::Arc;

use crate::cache::key::ImageCacheKey;
use crate::image::ImageContainer;

struct Entry<V> {
    value: V,
    cost: usize,
    expires_at: Option<Instant>,
    use_stamp: u64,
}

struct CacheState<K, V> {
    map: HashMap<K, Entry<V>>,
    // use-stamp -> key, oldest first; stamps are unique
    lru: BTreeMap<u64, K>,
    total_cost: usize,
    next_stamp: u64,
}

/// A cost- and count-bounded LRU cache with per-entry TTL.
pub struct MemoryCache<K, V> {
    state: Mutex<CacheState<K, V>>,
    cost_limit: usize,
    count_limit: usize,
    default_ttl: Option<Duration>,
}

impl<K: Hash + Eq + Clone, V: Clone> MemoryCache<K, V> {
    /// Create a cache bounded by total cost and entry count.
    pub fn new(cost_limit: usize, count_limit: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                map: HashMap::new(),
                lru: BTreeMap::new(),
                total_cost: 0,
                next_stamp: 0,
            }),
            cost_limit,
            count_limit,
            default_ttl: Some(Duration::from_secs(120)),
        }
    }

    /// Override the default time-to-live applied by [`Self::set`].
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Fetch a value and mark it most-recently used. Expired entries
    /// read as misses and are dropped.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock().unwrap();
        let stamp = state.next_stamp;
        state.next_stamp += 1;
        let entry = state.map.get_mut(key)?;
        if let Some(expires_at) = entry.expires_at {
            if Instant::now() >= expires_at {
                let old = state.map.remove(key).unwrap();
                state.lru.remove(&old.use_stamp);
                state.total_cost -= old.cost;
                return None;
            }
        }
        let old_stamp = entry.use_stamp;
        entry.use_stamp = stamp;
        let value = entry.value.clone();
        let key = key.clone();
        state.lru.remove(&old_stamp);
        state.lru.insert(stamp, key);
        Some(value)
    }

    /// Insert a value with the default TTL.
    pub fn set(&self, key: K, value: V, cost: usize) {
        self.set_with_ttl(key, value, cost, self.default_ttl);
    }

    /// Insert a value with an explicit TTL (`None` = never expires).
    pub fn set_with_ttl(&self, key: K, value: V, cost: usize, ttl: Option<Duration>) {
        let mut state = self.state.lock().unwrap();
        let stamp = state.next_stamp;
        state.next_stamp += 1;
        if let Some(old) = state.map.remove(&key) {
            state.lru.remove(&old.use_stamp);
            state.total_cost -= old.cost;
        }
        state.total_cost += cost;
        state.lru.insert(stamp, key.clone());
        state.map.insert(
            key,
            Entry {
                value,
                cost,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
                use_stamp: stamp,
            },
        );
        self.trim(&mut state);
    }

    /// Remove a single entry.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock().unwrap();
        let entry = state.map.remove(key)?;
        state.lru.remove(&entry.use_stamp);
        state.total_cost -= entry.cost;
        Some(entry.value)
    }

    /// Remove everything.
    pub fn remove_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.map.clear();
        state.lru.clear();
        state.total_cost = 0;
    }

    /// Current number of entries.
    pub fn count(&self) -> usize {
        self.state.lock().unwrap().map.len()
    }

    /// Current total cost.
    pub fn total_cost(&self) -> usize {
        self.state.lock().unwrap().total_cost
    }

    fn trim(&self, state: &mut CacheState<K, V>) {
        while state.total_cost > self.cost_limit || state.map.len() > self.count_limit {
            let Some((&stamp, _)) = state.lru.iter().next() else {
                break;
            };
            let key = state.lru.remove(&stamp).unwrap();
            if let Some(entry) = state.map.remove(&key) {
                state.total_cost -= entry.cost;
            }
        }
    }
}

/// Contract of the in-memory image cache tier.
///
/// The pipeline talks to this trait only; substitute it to observe or
/// redirect memory-cache traffic.
pub trait ImageCaching: Send + Sync {
    /// Look up a container.
    fn image(&self, key: &ImageCacheKey) -> Option<ImageContainer>;
    /// Store a container.
    fn set_image(&self, key: ImageCacheKey, container: ImageContainer);
    /// Remove a container.
    fn remove_image(&self, key: &ImageCacheKey);
    /// Drop every entry.
    fn remove_all(&self);
}

/// The default memory cache for decoded images.
///
/// Cost is the decoded pixel byte count plus any retained original
/// bytes. When `is_storing_previews` is off, progressive previews
/// submitted to [`ImageCaching::set_image`] are discarded silently.
pub struct ImageCache {
    cache: MemoryCache<ImageCacheKey, ImageContainer>,
    is_storing_previews: bool,
}

impl ImageCache {
    /// Default bound: 256 MiB of decoded pixels, 2000 entries.
    pub fn new() -> Self {
        Self::with_limits(256 * 1024 * 1024, 2000)
    }

    /// Create a cache with explicit cost and count bounds.
    pub fn with_limits(cost_limit: usize, count_limit: usize) -> Self {
        Self {
            cache: MemoryCache::new(cost_limit, count_limit),
            is_storing_previews: false,
        }
    }

    /// Allow progressive previews to be stored.
    pub fn with_storing_previews(mut self, is_storing_previews: bool) -> Self {
        self.is_storing_previews = is_storing_previews;
        self
    }

    /// The process-wide shared instance.
    pub fn shared() -> Arc<ImageCache> {
        static SHARED: Lazy<Arc<ImageCache>> =
            Lazy::new(|| Arc::new(ImageCache::new().with_storing_previews(true)));
        Arc::clone(&SHARED)
    }

    fn cost(container: &ImageContainer) -> usize {
        container.image.cost() + container.data.as_ref().map_or(0, |data| data.len())
    }

    /// Current number of entries.
    pub fn count(&self) -> usize {
        self.cache.count()
    }

    /// Current total cost in bytes.
    pub fn total_cost(&self) -> usize {
        self.cache.total_cost()
    }
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCaching for ImageCache {
    fn image(&self, key: &ImageCacheKey) -> Option<ImageContainer> {
        self.cache.get(key)
    }

    fn set_image(&self, key: ImageCacheKey, container: ImageContainer) {
        if container.is_preview && !self.is_storing_previews {
            return;
        }
        let cost = Self::cost(&container);
        self.cache.set(key, container, cost);
    }

    fn remove_image(&self, key: &ImageCacheKey) {
        self.cache.remove(key);
    }

    fn remove_all(&self) {
        self.cache.remove_all();
    }
}
