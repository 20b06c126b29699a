//! Read-through cache for keyset metadata.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::models::{KeysetId, KeysetMetadata};

pub const DEFAULT_MAX_ENTRIES: usize = 2048;

/// Fired synchronously after a manager transaction commits and before its event is published.
pub trait CommitHook: Send + Sync {
    fn on_commit(&self, keyset_id: &KeysetId);
}

struct CacheEntry {
    inserted_at: Instant,
    value: KeysetMetadata,
}

/// TTL cache with least-recently-used eviction once `max_entries` is exceeded.
///
/// Every invalidation bumps a generation counter. Readers that populate the
/// cache after a store read go through [`KeysetCache::put_if_unchanged`] so a
/// row read before a commit can never land after that commit's invalidation.
pub struct KeysetCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<CacheStore>,
}

struct CacheStore {
    map: HashMap<KeysetId, CacheEntry>,
    order: VecDeque<KeysetId>,
    generation: u64,
}

impl KeysetCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(CacheStore {
                map: HashMap::new(),
                order: VecDeque::new(),
                generation: 0,
            }),
        }
    }

    pub fn get(&self, id: &KeysetId) -> Option<KeysetMetadata> {
        let mut entries = self.entries.lock();
        entries.evict_expired(self.ttl);
        if let Some(value) = entries.get(id, self.ttl) {
            metrics::counter!("keyset_cache_hit_total").increment(1);
            return Some(value);
        }
        metrics::counter!("keyset_cache_miss_total").increment(1);
        None
    }

    pub fn put(&self, value: KeysetMetadata) {
        let mut entries = self.entries.lock();
        entries.evict_expired(self.ttl);
        entries.insert(value, self.max_entries);
    }

    /// Snapshot to take before reading the store on a miss.
    pub fn generation(&self) -> u64 {
        self.entries.lock().generation
    }

    /// Insert `value` only if nothing was invalidated since `generation` was taken.
    pub fn put_if_unchanged(&self, value: KeysetMetadata, generation: u64) -> bool {
        let mut entries = self.entries.lock();
        if entries.generation != generation {
            return false;
        }
        entries.evict_expired(self.ttl);
        entries.insert(value, self.max_entries);
        true
    }

    pub fn invalidate(&self, id: &KeysetId) {
        let mut entries = self.entries.lock();
        entries.generation = entries.generation.wrapping_add(1);
        entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CommitHook for KeysetCache {
    fn on_commit(&self, keyset_id: &KeysetId) {
        self.invalidate(keyset_id);
    }
}

impl CacheStore {
    fn evict_expired(&mut self, ttl: Duration) {
        self.order.retain(|id| {
            self.map
                .get(id)
                .is_some_and(|entry| entry.inserted_at.elapsed() <= ttl)
        });
        let order = &self.order;
        self.map.retain(|id, _| order.contains(id));
    }

    fn get(&mut self, id: &KeysetId, ttl: Duration) -> Option<KeysetMetadata> {
        let value = self
            .map
            .get(id)
            .filter(|entry| entry.inserted_at.elapsed() <= ttl)
            .map(|entry| entry.value.clone())?;
        self.touch(id);
        Some(value)
    }

    fn insert(&mut self, value: KeysetMetadata, max_entries: usize) {
        let id = value.id;
        self.remove(&id);
        self.order.push_back(id);
        self.map.insert(
            id,
            CacheEntry {
                inserted_at: Instant::now(),
                value,
            },
        );
        while self.map.len() > max_entries {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.map.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn remove(&mut self, id: &KeysetId) {
        if self.map.remove(id).is_some()
            && let Some(pos) = self.order.iter().position(|existing| existing == id)
        {
            self.order.remove(pos);
        }
    }

    fn touch(&mut self, id: &KeysetId) {
        if let Some(pos) = self.order.iter().position(|existing| existing == id) {
            self.order.remove(pos);
            self.order.push_back(*id);
        }
    }
}
