use std::sync::Mutex;

use hashlink::LinkedHashMap;

/// Memory accounting hook. Each typed cache layer supplies the size of its
/// own entries; the slab only ever sees opaque totals
pub trait EntrySize {
    fn size_bytes(&self) -> usize;
}

impl<T: EntrySize> EntrySize for std::sync::Arc<T> {
    fn size_bytes(&self) -> usize {
        self.as_ref().size_bytes()
    }
}

struct Slab<V> {
    entries: LinkedHashMap<u128, V>,
    bytes: usize,
    max_bytes: usize,
}

impl<V: EntrySize> Slab<V> {
    fn evict_to_budget(&mut self) {
        while self.bytes > self.max_bytes && !self.entries.is_empty() {
            if let Some((_, evicted)) = self.entries.pop_front() {
                self.bytes = self.bytes.saturating_sub(evicted.size_bytes());
            }
        }
    }
}

/// A fixed array of independent LRU tables. The top bits of the hash select
/// the slab; each slab has its own lock, its own LRU list, and enforces
/// `maxmem / N` on its own. There is no global lock and no rebalancing
pub struct SlabCache<V> {
    slabs: Vec<Mutex<Slab<V>>>,
    slab_bits: u32,
}

impl<V: EntrySize + Clone> SlabCache<V> {
    pub fn new(maxmem: usize, slabs: usize) -> Self {
        let slabs = slabs.max(1).next_power_of_two();
        let slab_bits = slabs.trailing_zeros();
        let per_slab = (maxmem / slabs).max(1);
        SlabCache {
            slabs: (0..slabs)
                .map(|_| {
                    Mutex::new(Slab {
                        entries: LinkedHashMap::new(),
                        bytes: 0,
                        max_bytes: per_slab,
                    })
                })
                .collect(),
            slab_bits,
        }
    }

    fn slab_for(&self, hash: u128) -> &Mutex<Slab<V>> {
        let idx = if self.slab_bits == 0 {
            0
        } else {
            (hash >> (128 - self.slab_bits)) as usize
        };
        &self.slabs[idx]
    }

    /// Returns a clone of the entry and touches the LRU. The caller's clone
    /// stays valid after eviction, so nothing is freed under a reader
    pub fn lookup(&self, hash: u128) -> Option<V> {
        let mut slab = self.slab_for(hash).lock().expect("slab lock poisoned");
        let value = slab.entries.remove(&hash)?;
        // Re-insert to move the entry to the MRU end
        slab.entries.insert(hash, value.clone());
        Some(value)
    }

    /// Reads without touching the LRU
    pub fn peek(&self, hash: u128) -> Option<V> {
        let slab = self.slab_for(hash).lock().expect("slab lock poisoned");
        slab.entries.get(&hash).cloned()
    }

    pub fn insert(&self, hash: u128, value: V) {
        let mut slab = self.slab_for(hash).lock().expect("slab lock poisoned");
        let added = value.size_bytes();
        if let Some(old) = slab.entries.remove(&hash) {
            slab.bytes = slab.bytes.saturating_sub(old.size_bytes());
        }
        slab.entries.insert(hash, value);
        slab.bytes += added;
        slab.evict_to_budget();
    }

    /// Atomic read-modify-write under the slab lock. The closure sees the
    /// current entry (if any) and returns the entry to store; returning
    /// `None` keeps the map unchanged. The stored/kept entry is returned,
    /// and the caller must use it instead of its own input
    pub fn update(&self, hash: u128, decide: impl FnOnce(Option<&V>) -> Option<V>) -> Option<V> {
        let mut slab = self.slab_for(hash).lock().expect("slab lock poisoned");
        let current = slab.entries.get(&hash);
        match decide(current) {
            Some(new_value) => {
                let added = new_value.size_bytes();
                if let Some(old) = slab.entries.remove(&hash) {
                    slab.bytes = slab.bytes.saturating_sub(old.size_bytes());
                }
                slab.entries.insert(hash, new_value.clone());
                slab.bytes += added;
                slab.evict_to_budget();
                Some(new_value)
            }
            None => {
                // Keep the existing entry, but refresh its LRU position
                let kept = slab.entries.remove(&hash);
                if let Some(kept) = kept {
                    slab.entries.insert(hash, kept.clone());
                    Some(kept)
                } else {
                    None
                }
            }
        }
    }

    pub fn remove(&self, hash: u128) {
        let mut slab = self.slab_for(hash).lock().expect("slab lock poisoned");
        if let Some(old) = slab.entries.remove(&hash) {
            slab.bytes = slab.bytes.saturating_sub(old.size_bytes());
        }
    }

    pub fn len(&self) -> usize {
        self.slabs
            .iter()
            .map(|slab| slab.lock().expect("slab lock poisoned").entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_mem(&self) -> usize {
        self.slabs
            .iter()
            .map(|slab| slab.lock().expect("slab lock poisoned").bytes)
            .sum()
    }
}
