use std::sync::Arc;

use kestrel_dns_lib::utils::canonical_wire_name;
use kestrel_dns_lib::ResourceData;

use super::slab::{EntrySize, SlabCache};
use crate::util::hash_to_u128;

/// A failed trust-anchor prime is remembered this long (seconds)
pub const NULL_KEY_TTL: u64 = 900;

/// What we know about a zone's keys: a validated DNSKEY set, a proof that
/// the zone is unsigned, or a NULL marker left by a failed prime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyState {
    /// Validated DNSKEY RDATAs for the zone
    Good(Vec<ResourceData<'static>>),
    /// A validated chain proved there is no DS, so the zone is insecure
    Insecure,
    /// Priming failed; do not retry until the entry expires
    Null,
}

#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub name: String,
    pub class: u16,
    pub state: KeyState,
    /// Absolute expiry, seconds
    pub expiry: u64,
}

impl KeyEntry {
    pub fn is_good(&self) -> bool {
        matches!(self.state, KeyState::Good(_))
    }

    pub fn dnskeys(&self) -> &[ResourceData<'static>] {
        match &self.state {
            KeyState::Good(keys) => keys,
            _ => &[],
        }
    }
}

impl EntrySize for KeyEntry {
    fn size_bytes(&self) -> usize {
        let keys_bytes: usize = self
            .dnskeys()
            .iter()
            .map(|key| key.get_encoded_size(None))
            .sum();
        std::mem::size_of::<KeyEntry>() + self.name.len() + keys_bytes
    }
}

pub struct KeyCache {
    slab: SlabCache<Arc<KeyEntry>>,
}

impl KeyCache {
    pub fn new(maxmem: usize, slabs: usize) -> Self {
        KeyCache {
            slab: SlabCache::new(maxmem, slabs),
        }
    }

    fn entry_hash(name: &str, class: u16) -> u128 {
        hash_to_u128(canonical_wire_name(name), Some(&class.to_be_bytes()))
    }

    pub fn get(&self, name: &str, class: u16, now: u64) -> Option<Arc<KeyEntry>> {
        self.slab
            .lookup(Self::entry_hash(name, class))
            .filter(|entry| entry.expiry > now)
    }

    pub fn insert(&self, entry: KeyEntry) {
        let hash = Self::entry_hash(&entry.name, entry.class);
        self.slab.insert(hash, Arc::new(entry));
    }

    /// Records a failed prime with the bounded NULL TTL
    pub fn insert_null(&self, name: &str, class: u16, now: u64) {
        self.insert(KeyEntry {
            name: name.to_string(),
            class,
            state: KeyState::Null,
            expiry: now + NULL_KEY_TTL,
        });
    }

    pub fn remove(&self, name: &str, class: u16) {
        self.slab.remove(Self::entry_hash(name, class));
    }

    pub fn get_mem(&self) -> usize {
        self.slab.get_mem()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dnskey() -> ResourceData<'static> {
        ResourceData::DNSKEY {
            flags: 256,
            protocol: 3,
            algorithm: 13,
            public_key: vec![7u8; 64].into(),
        }
    }

    #[test]
    fn good_entry_roundtrip() {
        let cache = KeyCache::new(1 << 20, 2);
        cache.insert(KeyEntry {
            name: "example.com".into(),
            class: 1,
            state: KeyState::Good(vec![dnskey()]),
            expiry: 1000,
        });
        let entry = cache.get("example.com", 1, 500).expect("should be present");
        assert!(entry.is_good());
        assert_eq!(entry.dnskeys().len(), 1);
        assert!(cache.get("example.com", 1, 1000).is_none());
    }

    #[test]
    fn null_entry_expires_after_fixed_ttl() {
        let cache = KeyCache::new(1 << 20, 2);
        cache.insert_null("example.com", 1, 100);
        let entry = cache.get("example.com", 1, 100 + NULL_KEY_TTL - 1).expect("still cached");
        assert_eq!(entry.state, KeyState::Null);
        assert!(cache.get("example.com", 1, 100 + NULL_KEY_TTL).is_none());
    }

    #[test]
    fn name_case_does_not_matter() {
        let cache = KeyCache::new(1 << 20, 2);
        cache.insert(KeyEntry {
            name: "Example.COM".into(),
            class: 1,
            state: KeyState::Insecure,
            expiry: 1000,
        });
        assert!(cache.get("example.com", 1, 0).is_some());
    }
}
