//! Object and delta-base caches.

use std::num::NonZeroUsize;
use std::sync::Arc;

use grit_hash::ObjectId;
use grit_object::{Object, ObjectType};
use lru::LruCache;

/// Count-bounded LRU of parsed objects.
pub struct ObjectCache {
    entries: LruCache<ObjectId, Object>,
}

impl ObjectCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, oid: &ObjectId) -> Option<&Object> {
        self.entries.get(oid)
    }

    pub fn insert(&mut self, oid: ObjectId, obj: Object) {
        self.entries.put(oid, obj);
    }
}

/// Size-bounded LRU of decompressed delta bases, shared across packs.
///
/// Keyed by `(pack basename, entry offset)`; entries are weighed by their
/// decompressed size and evicted oldest-first once the byte budget is
/// exceeded. Default budget: 20 MiB.
pub struct BaseCache {
    entries: LruCache<(String, u64), (ObjectType, Arc<Vec<u8>>)>,
    total_bytes: usize,
    max_bytes: usize,
}

pub const DEFAULT_BASE_CACHE_BYTES: usize = 20 * 1024 * 1024;

impl BaseCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_bytes: 0,
            max_bytes,
        }
    }

    pub fn get(&mut self, pack: &str, offset: u64) -> Option<(ObjectType, Arc<Vec<u8>>)> {
        self.entries
            .get(&(pack.to_string(), offset))
            .map(|(ty, data)| (*ty, Arc::clone(data)))
    }

    pub fn put(&mut self, pack: &str, offset: u64, obj_type: ObjectType, data: Arc<Vec<u8>>) {
        // An object larger than the whole budget would just evict everything.
        if data.len() > self.max_bytes {
            return;
        }
        let key = (pack.to_string(), offset);
        if let Some((_, old)) = self.entries.put(key, (obj_type, Arc::clone(&data))) {
            self.total_bytes -= old.len();
        }
        self.total_bytes += data.len();
        while self.total_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, (_, evicted))) => self.total_bytes -= evicted.len(),
                None => break,
            }
        }
    }

    pub fn bytes_used(&self) -> usize {
        self.total_bytes
    }
}

impl Default for BaseCache {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_CACHE_BYTES)
    }
}

/// Adapter presenting one pack's slice of a [`BaseCache`] to the pack
/// resolver.
pub struct PackBaseCache<'a> {
    pub cache: &'a mut BaseCache,
    pub pack_name: &'a str,
}

impl grit_pack::pack::ResolveCache for PackBaseCache<'_> {
    fn get(&mut self, offset: u64) -> Option<(ObjectType, Vec<u8>)> {
        self.cache
            .get(self.pack_name, offset)
            .map(|(ty, data)| (ty, data.as_ref().clone()))
    }

    fn put(&mut self, offset: u64, obj_type: ObjectType, data: &[u8]) {
        self.cache
            .put(self.pack_name, offset, obj_type, Arc::new(data.to_vec()));
    }
}
