//! Resident Payloads
//!
//! Decoded keys and objects are kept in memory by record offset, inside a
//! byte budget measured in package bytes. Least recently used payloads are
//! dropped once the budget is exceeded; the index still holds the offset and
//! lengths, so a dropped payload is simply read back from disk.
//!
//! The store remembers which offsets it dropped. A miss on such an offset is
//! reported as [`Residency::Lost`] rather than [`Residency::NotLoaded`], which
//! is what the memory-loss statistics are built from.

use std::collections::HashSet;
use std::sync::Arc;

use lru::LruCache;

/// Which half of a record a payload belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    Key,
    Object,
}

enum Payload<K, V> {
    Key(Arc<K>),
    Object(Arc<V>),
}

struct Held<K, V> {
    payload: Payload<K, V>,
    size: u64,
}

/// Outcome of asking the store for a payload
#[derive(Debug)]
pub enum Residency<T> {
    /// The decoded value is in memory
    Resident(Arc<T>),
    /// It was in memory once but has been evicted since
    Lost,
    /// It has never been decoded in this session
    NotLoaded,
}

/// Byte-budgeted LRU of decoded keys and objects
pub struct ResidentStore<K, V> {
    items: LruCache<(Slot, u64), Held<K, V>>,
    evicted: HashSet<(Slot, u64)>,
    budget: u64,
    key_bytes: u64,
    object_bytes: u64,
    keys: usize,
}

impl<K, V> ResidentStore<K, V> {
    /// Create a store holding at most `budget` package bytes
    pub fn new(budget: u64) -> Self {
        Self {
            items: LruCache::unbounded(),
            evicted: HashSet::new(),
            budget,
            key_bytes: 0,
            object_bytes: 0,
            keys: 0,
        }
    }

    /// Decoded key of the record at `offset`
    pub fn key(&mut self, offset: u64) -> Residency<K> {
        match self.items.get(&(Slot::Key, offset)) {
            Some(Held {
                payload: Payload::Key(key),
                ..
            }) => Residency::Resident(Arc::clone(key)),
            _ => self.absent(Slot::Key, offset),
        }
    }

    /// Decoded object of the record at `offset`
    pub fn object(&mut self, offset: u64) -> Residency<V> {
        match self.items.get(&(Slot::Object, offset)) {
            Some(Held {
                payload: Payload::Object(object),
                ..
            }) => Residency::Resident(Arc::clone(object)),
            _ => self.absent(Slot::Object, offset),
        }
    }

    /// Keep a decoded key whose package is `size` bytes
    pub fn insert_key(&mut self, offset: u64, key: Arc<K>, size: u64) {
        self.insert(Slot::Key, offset, Payload::Key(key), size);
    }

    /// Keep a decoded object whose package is `size` bytes
    pub fn insert_object(&mut self, offset: u64, object: Arc<V>, size: u64) {
        self.insert(Slot::Object, offset, Payload::Object(object), size);
    }

    /// Drop both payloads of a record that left the index
    pub fn forget(&mut self, offset: u64) {
        for slot in [Slot::Key, Slot::Object] {
            if let Some(held) = self.items.pop(&(slot, offset)) {
                self.account_removed(slot, held.size);
            }
            self.evicted.remove(&(slot, offset));
        }
    }

    /// Drop everything, including the memory of evictions
    ///
    /// Used when the index is reloaded and offsets lose their meaning.
    pub fn clear(&mut self) {
        self.items.clear();
        self.evicted.clear();
        self.key_bytes = 0;
        self.object_bytes = 0;
        self.keys = 0;
    }

    /// Number of resident keys
    pub fn resident_keys(&self) -> usize {
        self.keys
    }

    /// Number of resident objects
    pub fn resident_objects(&self) -> usize {
        self.items.len() - self.keys
    }

    /// Package bytes of resident keys
    pub fn key_bytes(&self) -> u64 {
        self.key_bytes
    }

    /// Package bytes of resident objects
    pub fn object_bytes(&self) -> u64 {
        self.object_bytes
    }

    fn absent<T>(&self, slot: Slot, offset: u64) -> Residency<T> {
        if self.evicted.contains(&(slot, offset)) {
            Residency::Lost
        } else {
            Residency::NotLoaded
        }
    }

    fn insert(&mut self, slot: Slot, offset: u64, payload: Payload<K, V>, size: u64) {
        if size > self.budget {
            return;
        }
        self.evicted.remove(&(slot, offset));
        if let Some(old) = self.items.put((slot, offset), Held { payload, size }) {
            self.account_removed(slot, old.size);
        }
        self.account_added(slot, size);

        while self.key_bytes + self.object_bytes > self.budget {
            match self.items.pop_lru() {
                Some(((slot, offset), held)) => {
                    self.account_removed(slot, held.size);
                    self.evicted.insert((slot, offset));
                }
                None => break,
            }
        }
    }

    fn account_added(&mut self, slot: Slot, size: u64) {
        match slot {
            Slot::Key => {
                self.key_bytes += size;
                self.keys += 1;
            }
            Slot::Object => self.object_bytes += size,
        }
    }

    fn account_removed(&mut self, slot: Slot, size: u64) {
        match slot {
            Slot::Key => {
                self.key_bytes -= size;
                self.keys -= 1;
            }
            Slot::Object => self.object_bytes -= size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_insert_and_get() {
        let mut store: ResidentStore<String, Vec<u8>> = ResidentStore::new(1024);
        assert_matches!(store.key(10), Residency::NotLoaded);

        store.insert_key(10, Arc::new("k".into()), 3);
        store.insert_object(10, Arc::new(vec![1, 2]), 5);

        assert_matches!(store.key(10), Residency::Resident(k) if *k == "k");
        assert_matches!(store.object(10), Residency::Resident(o) if *o == vec![1, 2]);
        assert_eq!(store.resident_keys(), 1);
        assert_eq!(store.resident_objects(), 1);
        assert_eq!(store.key_bytes(), 3);
        assert_eq!(store.object_bytes(), 5);
    }

    #[test]
    fn test_budget_evicts_least_recent() {
        let mut store: ResidentStore<u32, u32> = ResidentStore::new(10);
        store.insert_object(1, Arc::new(1), 4);
        store.insert_object(2, Arc::new(2), 4);
        // touch 1 so 2 becomes the eviction candidate
        assert_matches!(store.object(1), Residency::Resident(_));
        store.insert_object(3, Arc::new(3), 4);

        assert_matches!(store.object(1), Residency::Resident(_));
        assert_matches!(store.object(2), Residency::Lost);
        assert_matches!(store.object(3), Residency::Resident(_));
        assert_eq!(store.object_bytes(), 8);
    }

    #[test]
    fn test_reinsert_clears_lost_mark() {
        let mut store: ResidentStore<u32, u32> = ResidentStore::new(4);
        store.insert_object(1, Arc::new(1), 4);
        store.insert_object(2, Arc::new(2), 4);
        assert_matches!(store.object(1), Residency::Lost);

        store.insert_object(1, Arc::new(1), 4);
        assert_matches!(store.object(1), Residency::Resident(_));
    }

    #[test]
    fn test_oversized_payload_not_kept() {
        let mut store: ResidentStore<u32, u32> = ResidentStore::new(4);
        store.insert_object(1, Arc::new(1), 100);
        assert_matches!(store.object(1), Residency::NotLoaded);
        assert_eq!(store.object_bytes(), 0);
    }

    #[test]
    fn test_forget_and_clear() {
        let mut store: ResidentStore<u32, u32> = ResidentStore::new(100);
        store.insert_key(1, Arc::new(7), 2);
        store.insert_object(1, Arc::new(8), 2);
        store.insert_key(2, Arc::new(9), 2);

        store.forget(1);
        assert_matches!(store.key(1), Residency::NotLoaded);
        assert_matches!(store.object(1), Residency::NotLoaded);
        assert_eq!(store.resident_keys(), 1);

        store.clear();
        assert_matches!(store.key(2), Residency::NotLoaded);
        assert_eq!(store.key_bytes(), 0);
    }

    #[test]
    fn test_replacing_payload_keeps_accounting() {
        let mut store: ResidentStore<u32, u32> = ResidentStore::new(100);
        store.insert_key(1, Arc::new(1), 10);
        store.insert_key(1, Arc::new(1), 6);
        assert_eq!(store.key_bytes(), 6);
        assert_eq!(store.resident_keys(), 1);
    }
}
