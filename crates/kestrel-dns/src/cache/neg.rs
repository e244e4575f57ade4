use std::sync::Arc;

use super::slab::{EntrySize, SlabCache};
use crate::util::QueryInfo;

/// A validation verdict we refuse to recompute for a while. Bogus results
/// land here with `bogus-ttl` so a broken zone cannot grind the validator
#[derive(Debug, Clone)]
pub struct NegEntry {
    pub reason: String,
    /// Absolute expiry, seconds
    pub expiry: u64,
}

impl EntrySize for NegEntry {
    fn size_bytes(&self) -> usize {
        std::mem::size_of::<NegEntry>() + self.reason.len()
    }
}

pub struct NegCache {
    slab: SlabCache<Arc<NegEntry>>,
}

impl NegCache {
    pub fn new(maxmem: usize) -> Self {
        NegCache {
            slab: SlabCache::new(maxmem, 1),
        }
    }

    pub fn insert(&self, qinfo: &QueryInfo, reason: String, expiry: u64) {
        self.slab.insert(
            qinfo.fingerprint(false, false),
            Arc::new(NegEntry { reason, expiry }),
        );
    }

    pub fn get(&self, qinfo: &QueryInfo, now: u64) -> Option<Arc<NegEntry>> {
        self.slab
            .lookup(qinfo.fingerprint(false, false))
            .filter(|entry| entry.expiry > now)
    }

    pub fn get_mem(&self) -> usize {
        self.slab.get_mem()
    }
}
