//! An LRU (Least Recently Used) cache for storage chunks.
//!
//! When a bottom-up raster is served from top-down storage chunks taller
//! than one row, each storage chunk straddles two logical output blocks.
//! Caching whole chunks lets the second block reuse the fetch the first
//! one paid for.

use std::{collections::HashMap, fmt::Debug, hash::Hash, sync::Arc};

use parking_lot::{Condvar, Mutex};

use crate::errors::{Error, Result};

/// Byte ceiling the chunk cache budget is derived from.
const CACHE_BYTE_CEILING: u64 = 100 << 20;

/// Identifies one on-disk storage chunk of one band.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ChunkKey {
    pub block_col: usize,

    /// Chunk row in *storage* orientation, not logical raster orientation.
    pub chunk_row: usize,

    /// 1-based band index.
    pub band: usize,
}

/// One cached storage chunk: exactly block width x block height elements,
/// partial edges already repaired to the full stride.
pub(crate) struct ChunkBuf(pub Vec<u8>);

impl Cacheable for ChunkBuf {
    fn size(&self) -> u64 {
        self.0.len() as u64
    }
}

/// Entry budget for a raster: enough chunks to cover the two storage chunk
/// rows an output block can straddle, bounded by the byte ceiling. Zero
/// disables caching.
pub(crate) fn chunk_cache_capacity(
    raster_width: usize,
    block_width: usize,
    chunk_bytes: usize,
) -> u64 {
    if chunk_bytes == 0 {
        return 0;
    }
    let stripe = (raster_width + block_width - 1) / block_width;
    let budget = CACHE_BYTE_CEILING / chunk_bytes as u64;
    (2 * stripe as u64).min(budget)
}

/// An LRU cache with single-flight loading.
///
/// Values must implement ``Cacheable``, which self reports size, intended
/// to be the number of bytes (more or less) an object takes up in memory.
///
/// The ``limit`` is passed in when instantiating the Cache. When an object
/// is added to the cache which causes the total size of stored objects to
/// exceed the limit, objects are evicted in least recently used order until
/// the total size is back under the limit.
///
/// The ``Cache`` is thread safe. When interrogating the cache with ``get``,
/// a ``load`` function is passed in that is used to fetch the object from
/// underlying storage on a cache miss. If multiple requests for the same
/// key arrive while it is being loaded, the object is only loaded once;
/// the other requests block until that load finishes and then share its
/// result.
pub(crate) struct Cache<K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Cacheable,
{
    /// The actual cache
    recent: Mutex<Entries<K, V>>,

    /// Synchronization objects for keys that are currently being loaded
    /// from underlying storage.
    loaders: Mutex<HashMap<K, Arc<Loader<V>>>>,
}

/// A trait for objects that can be cached.
///
/// Cacheable objects must be able to self report their size via the
/// ``size`` method.
pub(crate) trait Cacheable: Sized {
    /// Return the number of bytes this object occupies.
    fn size(&self) -> u64;
}

/// Synchronizes one key's load among all the threads waiting for it.
struct Loader<V> {
    /// The loaded object, or the load failure, once the loading thread has
    /// finished.
    object: Mutex<Option<Result<Arc<V>>>>,

    /// Signaled when ``object`` transitions from ``None``.
    done: Condvar,
}

/// The entries stored in this cache.
///
/// Entries are directly accessible via ``map`` and also stored in a doubly
/// linked list where ``most_recent`` and ``least_recent`` are the two ends.
struct Entries<K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Cacheable,
{
    /// Sum of sizes of all entries must stay below this limit.
    limit: u64,

    /// Current sum of sizes of all entries.
    size: u64,

    /// Direct mapping from key to cache entry
    map: HashMap<K, CacheEntry<K, V>>,

    /// The most recently used key
    most_recent: Option<K>,

    /// The least recently used key
    least_recent: Option<K>,
}

/// An entry in the cache
struct CacheEntry<K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Cacheable,
{
    key: K,

    object: Arc<V>,

    /// The next more recent key
    more_recent: Option<K>,

    /// The next less recent key
    less_recent: Option<K>,

    /// Size as reported by ``Cacheable::size`` at insertion time.
    size: u64,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Cacheable,
{
    /// Instantiate an empty cache with given size limit.
    pub fn new(limit: u64) -> Self {
        let recent = Mutex::new(Entries {
            limit,
            size: 0,
            map: HashMap::new(),
            most_recent: None,
            least_recent: None,
        });
        let loaders = Mutex::new(HashMap::new());

        Self { recent, loaders }
    }

    /// Get an object by key.
    ///
    /// If the object isn't in the cache, ``load`` is called to fetch it and
    /// the result is stored. If the same key is already being loaded by
    /// another thread, this blocks until that load finishes and shares its
    /// result.
    pub fn get<L>(&self, key: &K, load: L) -> Result<Arc<V>>
    where
        L: FnOnce() -> Result<V>,
    {
        match self.lookup(key) {
            Some(object) => Ok(object),
            None => self.load(key, load),
        }
    }

    /// Check if an object is already stored in the cache. If it is, move it
    /// to the most recently used position and return a new reference to it.
    fn lookup(&self, key: &K) -> Option<Arc<V>> {
        let mut entries = self.recent.lock();
        let entry = entries.remove(key);
        match entry {
            None => None,
            Some(entry) => {
                let object = Arc::clone(&entry.object);
                entries.push_most_recent(entry);
                Some(object)
            }
        }
    }

    /// Load an object from the underlying data store.
    ///
    /// If another thread is already loading the object, wait for that
    /// thread instead of issuing a second fetch.
    fn load<L>(&self, key: &K, load: L) -> Result<Arc<V>>
    where
        L: FnOnce() -> Result<V>,
    {
        let (first, loader) = {
            let mut loaders = self.loaders.lock();
            match loaders.get(key) {
                Some(loader) => (false, Arc::clone(loader)),
                None => {
                    let loader = Arc::new(Loader::new());
                    loaders.insert(*key, Arc::clone(&loader));

                    (true, loader)
                }
            }
        };

        if first {
            // We're the first thread to ask for this object, so we load it
            match load() {
                Ok(object) => {
                    let object = Arc::new(object);
                    self.recent.lock().insert(*key, &object);

                    // Tell any waiting threads the object is ready
                    loader.finish(Ok(Arc::clone(&object)));
                    self.loaders.lock().remove(key);

                    Ok(object)
                }
                Err(err) => {
                    // We tried
                    loader.finish(Err(Error::Load));
                    self.loaders.lock().remove(key);
                    Err(err)
                }
            }
        } else {
            // Another thread is loading this object already, just wait
            loader.wait()
        }
    }
}

impl<V> Loader<V> {
    fn new() -> Self {
        Loader {
            object: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    /// Inform any waiting threads that the object has been loaded, or that
    /// the loading thread has given up trying.
    fn finish(&self, object: Result<Arc<V>>) {
        *self.object.lock() = Some(match object {
            Ok(object) => Ok(object),
            Err(_) => Err(Error::Load),
        });
        self.done.notify_all();
    }

    /// Block until the loading thread finishes, one way or the other.
    fn wait(&self) -> Result<Arc<V>> {
        let mut guard = self.object.lock();
        while guard.is_none() {
            self.done.wait(&mut guard);
        }
        match guard.as_ref().unwrap() {
            Ok(object) => Ok(Arc::clone(object)),
            Err(_) => Err(Error::Load),
        }
    }
}

impl<K, V> Entries<K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Cacheable,
{
    /// Move an entry to the most recently used spot in the linked list.
    fn push_most_recent(&mut self, entry: CacheEntry<K, V>) {
        let old_head_key = self.most_recent;

        // Try to short circuit this operation
        if let Some(old_head_key) = old_head_key {
            if old_head_key == entry.key {
                // Already at head, nothing to do
                return;
            }

            // The old head needs to point to the new head in its more
            // recent link
            let old_head = self
                .map
                .remove(&old_head_key)
                .expect("Missing key {old_head_key:?}");
            let less_recent = old_head.less_recent;
            let old_head = old_head.update(Some(entry.key), less_recent);
            self.map.insert(old_head_key, old_head);
        }

        let entry = entry.update(None, old_head_key);
        self.most_recent = Some(entry.key);
        if self.least_recent.is_none() {
            // This is the only object in the list, so it is also the tail
            self.least_recent = Some(entry.key);
        }
        self.map.insert(entry.key, entry);
    }

    /// Remove an entry from the cache
    fn remove(&mut self, key: &K) -> Option<CacheEntry<K, V>> {
        match self.map.remove(key) {
            None => None,
            Some(entry) => {
                if self.most_recent.unwrap() == entry.key {
                    self.most_recent = entry.less_recent;
                }

                if self.least_recent.unwrap() == entry.key {
                    self.least_recent = entry.more_recent;
                }

                if let Some(key) = entry.less_recent {
                    let less_recent = self.map.remove(&key).expect("Missing key {key:?}");
                    let less_recent_less_recent = less_recent.less_recent;
                    let less_recent =
                        less_recent.update(entry.more_recent, less_recent_less_recent);
                    self.map.insert(key, less_recent);
                }

                if let Some(key) = entry.more_recent {
                    let more_recent = self.map.remove(&key).expect("Missing key {key:?}");
                    let more_recent_more_recent = more_recent.more_recent;
                    let more_recent =
                        more_recent.update(more_recent_more_recent, entry.less_recent);
                    self.map.insert(key, more_recent);
                }

                Some(entry)
            }
        }
    }

    /// Add a new object to the cache.
    ///
    /// If the addition of this object causes ``size`` to exceed ``limit``,
    /// entries are evicted from the least recent end until ``size`` is back
    /// at or below ``limit``.
    fn insert(&mut self, key: K, object: &Arc<V>) {
        let entry = CacheEntry::new(key, object);
        self.size += entry.size;
        self.push_most_recent(entry);

        while self.size > self.limit && self.map.len() > 1 {
            let evicted = self.remove(&self.least_recent.unwrap()).unwrap();
            self.size -= evicted.size;
        }
    }
}

impl<K, V> CacheEntry<K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Cacheable,
{
    fn new(key: K, object: &Arc<V>) -> Self {
        Self {
            key,
            object: Arc::clone(object),
            more_recent: None,
            less_recent: None,
            size: object.size(),
        }
    }

    /// Create a copy of this cache entry with updated links to the next
    /// entries in the chain.
    ///
    /// Creating new entries rather than mutating existing ones makes
    /// getting along with Rust's borrow checker much easier.
    fn update(self, more_recent: Option<K>, less_recent: Option<K>) -> Self {
        Self {
            key: self.key,
            object: self.object,
            more_recent,
            less_recent,
            size: self.size,
        }
    }
}
