//! Residency of file-backed chunks on the engines.
mod materialize;
mod realign;

use lru::LruCache;

use crate::prelude::*;
use crate::types::{DatasetId, EngineId, LocalArrayId, Region};

pub(crate) use self::materialize::{leave, materialize, write_back, Access, BoundChunk};
pub(crate) use self::realign::{realign, ArraySource, Realigned};

/// A region of a dataset held by one engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    pub(crate) dataset: DatasetId,
    pub(crate) engine: EngineId,
    pub(crate) region: Region,
}

#[derive(Debug)]
struct CacheEntry {
    id: LocalArrayId,
    size: usize,
    pins: usize,
}

/// Counters describing the state of the chunk cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub resident_bytes: usize,
}

/// Tracks which dataset regions are resident on which engine.
///
/// Entries used by the chunk in flight are pinned. Unpinned entries are kept in LRU order and
/// are evicted once room is needed for new entries.
#[derive(Debug)]
pub(crate) struct ChunkCache {
    entries: HashMap<CacheKey, CacheEntry>,
    lru: LruCache<CacheKey, ()>,
    budget: usize,
    used: usize,
    stats: CacheStats,
}

impl ChunkCache {
    pub(crate) fn new(budget: usize) -> Self {
        Self {
            entries: default(),
            lru: LruCache::unbounded(),
            budget,
            used: 0,
            stats: default(),
        }
    }

    /// Returns the local array holding `key` and pins it, or `None` on a miss.
    pub(crate) fn acquire(&mut self, key: &CacheKey) -> Option<LocalArrayId> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                if entry.pins == 0 {
                    self.lru.pop(key);
                }

                entry.pins += 1;
                self.stats.hits += 1;
                Some(entry.id)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Make room for `size` bytes of new entries and account for them. Returns the local
    /// arrays that were evicted; the caller must release them before placing the new entries.
    pub(crate) fn reserve(&mut self, size: usize) -> Vec<(EngineId, LocalArrayId)> {
        let evicted = self.make_room(size);

        if self.used + size > self.budget {
            warn!(
                "chunk cache exceeds its budget of {} bytes, {} bytes are pinned",
                self.budget, self.used
            );
        }

        self.used += size;
        evicted
    }

    /// Return a reservation that will not be filled.
    pub(crate) fn unreserve(&mut self, size: usize) {
        self.used -= size;
    }

    /// Register `key` as resident in local array `id` and pin it. The `size` bytes must have
    /// been reserved. Returns the entry previously registered under `key`, if any.
    pub(crate) fn insert(
        &mut self,
        key: CacheKey,
        id: LocalArrayId,
        size: usize,
    ) -> Option<(EngineId, LocalArrayId)> {
        let engine = key.engine;
        let old = self.entries.insert(key.clone(), CacheEntry { id, size, pins: 1 })?;

        self.lru.pop(&key);
        self.used -= old.size;
        Some((engine, old.id))
    }

    /// Undo one [`ChunkCache::acquire`] or [`ChunkCache::insert`].
    pub(crate) fn unpin(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.pins == 0 {
                warn!("unpinning chunk {:?} which is not pinned", key);
                return;
            }

            entry.pins -= 1;
            if entry.pins == 0 {
                self.lru.put(key.clone(), ());
            }
        }
    }

    /// Forget `key`, returning the local array that held it.
    pub(crate) fn remove(&mut self, key: &CacheKey) -> Option<(EngineId, LocalArrayId)> {
        let entry = self.entries.remove(key)?;
        self.lru.pop(key);
        self.used -= entry.size;
        Some((key.engine, entry.id))
    }

    /// Forget all entries of `dataset`.
    pub(crate) fn evict_dataset(&mut self, dataset: DatasetId) -> Vec<(EngineId, LocalArrayId)> {
        let keys = self
            .entries
            .keys()
            .filter(|k| k.dataset == dataset)
            .cloned()
            .collect::<Vec<_>>();

        keys.iter().filter_map(|k| self.remove(k)).collect()
    }

    /// Engines holding at least one region of `dataset`.
    pub(crate) fn engines_of(&self, dataset: DatasetId) -> Vec<EngineId> {
        self.entries
            .keys()
            .filter(|k| k.dataset == dataset)
            .map(|k| k.engine)
            .sorted()
            .dedup()
            .collect()
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            resident_bytes: self.used,
            ..self.stats
        }
    }

    fn make_room(&mut self, size: usize) -> Vec<(EngineId, LocalArrayId)> {
        let mut evicted = vec![];

        while self.used + size > self.budget {
            let key = match self.lru.pop_lru() {
                Some((key, ())) => key,
                None => break,
            };

            if let Some(entry) = self.entries.remove(&key) {
                trace!("evicting {:?} ({} bytes)", key, entry.size);
                self.used -= entry.size;
                self.stats.evictions += 1;
                evicted.push((key.engine, entry.id));
            }
        }

        evicted
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(dataset: u64, engine: u16, lo: usize) -> CacheKey {
        CacheKey {
            dataset: DatasetId(dataset),
            engine: EngineId(engine),
            region: Region::from_bounds(&[lo], &[lo + 10]),
        }
    }

    fn place(
        cache: &mut ChunkCache,
        key: CacheKey,
        id: u64,
        size: usize,
    ) -> Vec<(EngineId, LocalArrayId)> {
        let evicted = cache.reserve(size);
        assert_eq!(cache.insert(key, LocalArrayId(id), size), None);
        evicted
    }

    #[test]
    fn test_hit_and_miss() {
        let mut cache = ChunkCache::new(100);
        assert_eq!(cache.acquire(&key(1, 0, 0)), None);

        assert!(place(&mut cache, key(1, 0, 0), 5, 40).is_empty());
        cache.unpin(&key(1, 0, 0));

        assert_eq!(cache.acquire(&key(1, 0, 0)), Some(LocalArrayId(5)));
        assert_eq!(cache.acquire(&key(1, 1, 0)), None);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 2));
        assert_eq!(stats.resident_bytes, 40);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache = ChunkCache::new(100);

        for (i, lo) in [0, 10, 20].iter().enumerate() {
            assert!(place(&mut cache, key(1, 0, *lo), i as u64, 30).is_empty());
            cache.unpin(&key(1, 0, *lo));
        }

        // Touch the oldest entry so the second one becomes least recently used.
        assert!(cache.acquire(&key(1, 0, 0)).is_some());
        cache.unpin(&key(1, 0, 0));

        let evicted = place(&mut cache, key(1, 0, 30), 3, 30);
        assert_eq!(evicted, vec![(EngineId(0), LocalArrayId(1))]);
        assert_eq!(cache.stats().resident_bytes, 90);
    }

    #[test]
    fn test_reserve_evicts_before_insert() {
        let mut cache = ChunkCache::new(100);
        place(&mut cache, key(1, 0, 0), 0, 50);
        place(&mut cache, key(1, 1, 0), 1, 50);
        cache.unpin(&key(1, 0, 0));
        cache.unpin(&key(1, 1, 0));

        // A full-budget reservation clears every unpinned entry up front.
        let mut evicted = cache.reserve(100);
        evicted.sort();
        assert_eq!(
            evicted,
            vec![(EngineId(0), LocalArrayId(0)), (EngineId(1), LocalArrayId(1))]
        );
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().resident_bytes, 100);

        cache.unreserve(100);
        assert_eq!(cache.stats().resident_bytes, 0);
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_pinned_entries_are_kept() {
        let mut cache = ChunkCache::new(50);
        place(&mut cache, key(1, 0, 0), 0, 40);

        // Over budget, but the only other entry is pinned.
        let evicted = place(&mut cache, key(1, 1, 0), 1, 40);
        assert!(evicted.is_empty());
        assert_eq!(cache.stats().resident_bytes, 80);

        cache.unpin(&key(1, 0, 0));
        cache.unpin(&key(1, 1, 0));

        let evicted = place(&mut cache, key(2, 0, 0), 2, 10);
        assert_eq!(evicted, vec![(EngineId(0), LocalArrayId(0))]);
        assert_eq!(cache.engines_of(DatasetId(1)), vec![EngineId(1)]);
    }

    #[test]
    fn test_insert_replaces() {
        let mut cache = ChunkCache::new(100);
        place(&mut cache, key(1, 0, 0), 0, 10);

        cache.reserve(10);
        let old = cache.insert(key(1, 0, 0), LocalArrayId(1), 10);
        assert_eq!(old, Some((EngineId(0), LocalArrayId(0))));
        assert_eq!(cache.stats().resident_bytes, 10);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_evict_dataset() {
        let mut cache = ChunkCache::new(1000);
        place(&mut cache, key(1, 0, 0), 0, 10);
        place(&mut cache, key(1, 2, 0), 1, 10);
        place(&mut cache, key(2, 0, 0), 2, 10);

        let mut evicted = cache.evict_dataset(DatasetId(1));
        evicted.sort();
        assert_eq!(
            evicted,
            vec![(EngineId(0), LocalArrayId(0)), (EngineId(2), LocalArrayId(1))]
        );
        assert!(cache.engines_of(DatasetId(1)).is_empty());
        assert_eq!(cache.stats().entries, 1);
    }
}
