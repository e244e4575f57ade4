use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use kestrel_dns_lib::utils::canonical_wire_name;
use kestrel_dns_lib::QueryType;

use super::slab::{EntrySize, SlabCache};
use crate::util::hash_to_u128;

/// Timeout seed for a server we have never measured
pub const RTT_SEED_MS: u64 = 376;
/// Hard ceiling on any computed timeout
pub const RTT_MAX_MS: u64 = 120_000;
/// Consecutive failures after which a target is skipped within host-ttl
pub const FAILURE_SKIP_THRESHOLD: u32 = 3;

/// Per (zone, server address) state: smoothed RTT, EDNS capability,
/// lameness per query type, and a failure streak that drives backoff
#[derive(Debug, Clone)]
pub struct InfraEntry {
    pub srtt_ms: u64,
    pub probed: bool,
    pub edns_supported: Option<bool>,
    pub lame_types: HashSet<u16>,
    pub consecutive_failures: u32,
    /// Absolute seconds of the last recorded failure
    pub last_failure: u64,
    /// Entry validity horizon, absolute seconds
    pub expiry: u64,
}

impl InfraEntry {
    fn new(now: u64, host_ttl: u64) -> Self {
        InfraEntry {
            srtt_ms: RTT_SEED_MS,
            probed: false,
            edns_supported: None,
            lame_types: HashSet::new(),
            consecutive_failures: 0,
            last_failure: 0,
            expiry: now + host_ttl,
        }
    }
}

impl EntrySize for InfraEntry {
    fn size_bytes(&self) -> usize {
        std::mem::size_of::<InfraEntry>() + self.lame_types.len() * std::mem::size_of::<u16>()
    }
}

pub struct InfraCache {
    slab: SlabCache<Arc<InfraEntry>>,
    host_ttl: u64,
}

impl InfraCache {
    pub fn new(numhosts: usize, slabs: usize, host_ttl: u64) -> Self {
        // Hosts are budgeted by count; approximate with the entry size
        let maxmem = numhosts * std::mem::size_of::<InfraEntry>();
        InfraCache {
            slab: SlabCache::new(maxmem, slabs),
            host_ttl,
        }
    }

    fn entry_hash(addr: &IpAddr, zone: &str) -> u128 {
        let key = match addr {
            IpAddr::V4(addr) => addr.octets().to_vec(),
            IpAddr::V6(addr) => addr.octets().to_vec(),
        };
        hash_to_u128(canonical_wire_name(zone), Some(&key))
    }

    pub fn get(&self, addr: &IpAddr, zone: &str, now: u64) -> Option<Arc<InfraEntry>> {
        self.slab
            .lookup(Self::entry_hash(addr, zone))
            .filter(|entry| entry.expiry > now)
    }

    fn update_entry(&self, addr: &IpAddr, zone: &str, now: u64, apply: impl FnOnce(&mut InfraEntry)) {
        let host_ttl = self.host_ttl;
        self.slab.update(Self::entry_hash(addr, zone), |current| {
            let mut entry = match current {
                Some(existing) if existing.expiry > now => existing.as_ref().clone(),
                _ => InfraEntry::new(now, host_ttl),
            };
            apply(&mut entry);
            Some(Arc::new(entry))
        });
    }

    /// Smoothed RTT update on a successful exchange; clears the failure streak
    pub fn note_success(&self, addr: &IpAddr, zone: &str, rtt: Duration, now: u64) {
        let measured = (rtt.as_millis() as u64).min(RTT_MAX_MS);
        self.update_entry(addr, zone, now, |entry| {
            entry.srtt_ms = if entry.probed {
                // Classic 7/8 smoothing
                (entry.srtt_ms * 7 + measured) / 8
            } else {
                measured
            };
            entry.probed = true;
            entry.consecutive_failures = 0;
        });
    }

    pub fn note_failure(&self, addr: &IpAddr, zone: &str, now: u64) {
        self.update_entry(addr, zone, now, |entry| {
            entry.consecutive_failures += 1;
            entry.last_failure = now;
            // Exponential backoff on the timeout estimate
            entry.srtt_ms = (entry.srtt_ms * 2).min(RTT_MAX_MS);
        });
    }

    pub fn note_lame(&self, addr: &IpAddr, zone: &str, qtype: QueryType, now: u64) {
        self.update_entry(addr, zone, now, |entry| {
            entry.lame_types.insert(qtype.into());
        });
    }

    pub fn note_edns(&self, addr: &IpAddr, zone: &str, supported: bool, now: u64) {
        self.update_entry(addr, zone, now, |entry| {
            entry.edns_supported = Some(supported);
        });
    }

    pub fn is_lame(&self, addr: &IpAddr, zone: &str, qtype: QueryType, now: u64) -> bool {
        self.get(addr, zone, now)
            .is_some_and(|entry| entry.lame_types.contains(&qtype.into()))
    }

    /// The RTT estimate used for target selection. Unprobed hosts use the seed
    pub fn rtt_ms(&self, addr: &IpAddr, zone: &str, now: u64) -> u64 {
        self.get(addr, zone, now)
            .map(|entry| entry.srtt_ms)
            .unwrap_or(RTT_SEED_MS)
    }

    /// The timeout for the next query to this server
    pub fn timeout_for(&self, addr: &IpAddr, zone: &str, now: u64) -> Duration {
        Duration::from_millis(self.rtt_ms(addr, zone, now).clamp(RTT_SEED_MS, RTT_MAX_MS))
    }

    /// Targets with a recent failure streak are skipped during selection
    pub fn should_skip(&self, addr: &IpAddr, zone: &str, now: u64) -> bool {
        self.get(addr, zone, now).is_some_and(|entry| {
            entry.consecutive_failures >= FAILURE_SKIP_THRESHOLD && now < entry.last_failure + self.host_ttl
        })
    }

    pub fn get_mem(&self) -> usize {
        self.slab.get_mem()
    }
}
