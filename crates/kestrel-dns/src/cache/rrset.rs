use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use kestrel_dns_lib::utils::canonical_wire_name;
use kestrel_dns_lib::{QueryType, ResourceData, ResourceRecord};

use super::slab::{EntrySize, SlabCache};
use crate::util::hash_to_u128;

bitflags! {
    /// Part of the cache key: an NSEC stored at a zone apex proves a
    /// different thing than one stored below it
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RrsetFlags: u8 {
        const NSEC_AT_APEX = 1;
    }
}

/// How much we believe an RRset, by where in a response it appeared.
/// Ascending; the cache only ever replaces upwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrustLevel {
    AdditionalNoAddr,
    AdditionalAddr,
    Authority,
    AnswerAa,
    Validated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SecurityStatus {
    #[default]
    Indeterminate,
    Insecure,
    Bogus,
    Secure,
}

/// An RRset in compact cache form. TTLs are absolute wall-clock seconds;
/// `id` is bumped on every replacement so stale references can be detected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedRrset {
    pub name: String,
    pub rtype: QueryType,
    pub class: u16,
    pub flags: RrsetFlags,
    /// Absolute expiry, seconds since the epoch
    pub expiry: u64,
    pub rdatas: Vec<ResourceData<'static>>,
    pub rrsigs: Vec<ResourceData<'static>>,
    pub trust: TrustLevel,
    pub security: SecurityStatus,
    pub id: u64,
}

impl PackedRrset {
    pub fn ttl_remaining(&self, now: u64) -> u64 {
        self.expiry.saturating_sub(now)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry <= now
    }

    pub fn has_signatures(&self) -> bool {
        !self.rrsigs.is_empty()
    }

    /// Exports cache records back into wire records with relative TTLs
    pub fn to_records(&self, now: u64, include_rrsigs: bool) -> Vec<ResourceRecord<'static>> {
        let ttl = self.ttl_remaining(now) as u32;
        let mut records: Vec<ResourceRecord<'static>> = self
            .rdatas
            .iter()
            .map(|rdata| ResourceRecord::new(self.name.clone(), rdata.clone(), Some(ttl), Some(self.class)))
            .collect();
        if include_rrsigs {
            records.extend(
                self.rrsigs
                    .iter()
                    .map(|rrsig| ResourceRecord::new(self.name.clone(), rrsig.clone(), Some(ttl), Some(self.class))),
            );
        }
        records
    }
}

impl EntrySize for PackedRrset {
    fn size_bytes(&self) -> usize {
        let rdata_bytes: usize = self
            .rdatas
            .iter()
            .chain(self.rrsigs.iter())
            .map(|rdata| rdata.get_encoded_size(None))
            .sum();
        std::mem::size_of::<PackedRrset>() + self.name.len() + rdata_bytes
    }
}

/// A versioned reference into the RRset cache: the entry key plus the
/// version id observed at capture time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RrsetRef {
    pub hash: u128,
    pub id: u64,
}

pub struct RrsetCache {
    slab: SlabCache<Arc<PackedRrset>>,
    next_id: AtomicU64,
}

impl RrsetCache {
    pub fn new(maxmem: usize, slabs: usize) -> Self {
        RrsetCache {
            slab: SlabCache::new(maxmem, slabs),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn entry_hash(name: &str, rtype: QueryType, class: u16, flags: RrsetFlags) -> u128 {
        let mut key = canonical_wire_name(name);
        key.extend(Into::<u16>::into(rtype).to_be_bytes());
        key.extend(class.to_be_bytes());
        key.push(flags.bits());
        hash_to_u128(key, None)
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn lookup(
        &self,
        name: &str,
        rtype: QueryType,
        class: u16,
        flags: RrsetFlags,
        now: u64,
    ) -> Option<Arc<PackedRrset>> {
        let hash = Self::entry_hash(name, rtype, class, flags);
        self.slab
            .lookup(hash)
            .filter(|entry| !entry.is_expired(now))
    }

    /// Resolves a captured reference, failing on eviction, replacement, or expiry
    pub fn get_by_ref(&self, rref: &RrsetRef, now: u64) -> Option<Arc<PackedRrset>> {
        self.slab
            .lookup(rref.hash)
            .filter(|entry| entry.id == rref.id && !entry.is_expired(now))
    }

    /// The §4.2 update policy: insert if absent, otherwise replace only if
    /// the incoming set dominates (higher trust; or equal trust and later
    /// expiry; or equal trust and expiry but the incoming one is signed).
    /// Returns the entry the cache actually holds and the key it lives under.
    /// The caller must use the returned entry, not its input
    pub fn update(&self, mut incoming: PackedRrset, now: u64) -> (RrsetRef, Arc<PackedRrset>) {
        let hash = Self::entry_hash(&incoming.name, incoming.rtype, incoming.class, incoming.flags);
        let stored = self
            .slab
            .update(hash, |current| match current {
                Some(existing) if !existing.is_expired(now) && !Self::dominates(&incoming, existing) => None,
                _ => {
                    incoming.id = self.fresh_id();
                    Some(Arc::new(incoming.clone()))
                }
            })
            .expect("update always yields an entry");
        (RrsetRef { hash, id: stored.id }, stored)
    }

    fn dominates(new: &PackedRrset, old: &PackedRrset) -> bool {
        if new.trust != old.trust {
            return new.trust > old.trust;
        }
        if new.expiry != old.expiry {
            return new.expiry > old.expiry;
        }
        new.has_signatures() && !old.has_signatures()
    }

    /// Security-status upgrade after validation. Keeps the version id, so
    /// message back-references stay valid
    pub fn upgrade_security(&self, rref: &RrsetRef, security: SecurityStatus) {
        self.slab.update(rref.hash, |current| match current {
            Some(existing) if existing.id == rref.id && security > existing.security => {
                let mut upgraded = existing.as_ref().clone();
                upgraded.security = security;
                if security == SecurityStatus::Secure {
                    upgraded.trust = TrustLevel::Validated;
                }
                Some(Arc::new(upgraded))
            }
            _ => None,
        });
    }

    pub fn remove(&self, name: &str, rtype: QueryType, class: u16, flags: RrsetFlags) {
        self.slab
            .remove(Self::entry_hash(name, rtype, class, flags));
    }

    pub fn get_mem(&self) -> usize {
        self.slab.get_mem()
    }
}

/// Groups a response section into packed RRsets, attaching covering RRSIGs
/// to the set they sign. TTLs are made absolute and clamped to the
/// configured bounds
pub fn pack_rrsets(
    records: &[ResourceRecord<'static>],
    trust: TrustLevel,
    now: u64,
    min_ttl: u64,
    max_ttl: u64,
) -> Vec<PackedRrset> {
    let mut order: Vec<(String, QueryType, u16)> = Vec::new();
    let mut sets: HashMap<(String, QueryType, u16), PackedRrset> = HashMap::new();

    for record in records {
        let qtype = record.resource_data.get_query_type();
        if qtype == QueryType::OPT {
            continue;
        }
        let (set_type, covered_key) = match &record.resource_data {
            ResourceData::RRSIG { type_covered, .. } => {
                let covered: QueryType = (*type_covered).into();
                (qtype, Some(covered))
            }
            _ => (qtype, None),
        };
        let keyed_type = covered_key.unwrap_or(set_type);
        let key = (record.name.to_lowercase(), keyed_type, record.class);

        let entry = sets.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            let ttl = (record.ttl as u64).clamp(min_ttl, max_ttl);
            PackedRrset {
                name: record.name.to_string(),
                rtype: keyed_type,
                class: record.class,
                flags: RrsetFlags::empty(),
                expiry: now + ttl,
                rdatas: Vec::new(),
                rrsigs: Vec::new(),
                trust,
                security: SecurityStatus::Indeterminate,
                id: 0,
            }
        });
        let ttl = (record.ttl as u64).clamp(min_ttl, max_ttl);
        entry.expiry = entry.expiry.min(now + ttl);
        if covered_key.is_some() {
            entry.rrsigs.push(record.resource_data.clone());
        } else {
            entry.rdatas.push(record.resource_data.clone());
        }
    }

    order
        .into_iter()
        .filter_map(|key| sets.remove(&key))
        // An RRSIG with no covered set is not a set of its own
        .filter(|set| !set.rdatas.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rrset(name: &str, trust: TrustLevel, expiry: u64, signed: bool) -> PackedRrset {
        PackedRrset {
            name: name.into(),
            rtype: QueryType::A,
            class: 1,
            flags: RrsetFlags::empty(),
            expiry,
            rdatas: vec![ResourceData::A {
                address: "192.0.2.1".parse().unwrap(),
            }],
            rrsigs: if signed {
                vec![ResourceData::RRSIG {
                    type_covered: 1,
                    algorithm: 8,
                    labels: 2,
                    original_ttl: 300,
                    signature_expiration: 0,
                    signature_inception: 0,
                    key_tag: 1,
                    signer_name: "example.com".into(),
                    signature: vec![0u8; 64].into(),
                }]
            } else {
                Vec::new()
            },
            trust,
            security: SecurityStatus::Indeterminate,
            id: 0,
        }
    }

    #[test]
    fn lower_trust_does_not_replace() {
        let cache = RrsetCache::new(1 << 20, 2);
        let (first_ref, first) = cache.update(rrset("example.com", TrustLevel::AnswerAa, 1000, false), 100);

        // An additional-section copy with a longer TTL must lose
        let (second_ref, second) = cache.update(rrset("example.com", TrustLevel::AdditionalAddr, 5000, false), 100);
        assert_eq!(second.expiry, 1000);
        assert_eq!(second.id, first.id);
        assert_eq!(first_ref, second_ref);
    }

    #[test]
    fn higher_trust_replaces_and_bumps_id() {
        let cache = RrsetCache::new(1 << 20, 2);
        let (old_ref, _) = cache.update(rrset("example.com", TrustLevel::Authority, 5000, false), 100);
        let (new_ref, stored) = cache.update(rrset("example.com", TrustLevel::Validated, 1000, false), 100);
        assert_eq!(stored.trust, TrustLevel::Validated);
        assert!(new_ref.id > old_ref.id);
        // The old reference is now dangling
        assert!(cache.get_by_ref(&old_ref, 100).is_none());
        assert!(cache.get_by_ref(&new_ref, 100).is_some());
    }

    #[test]
    fn equal_trust_later_expiry_wins() {
        let cache = RrsetCache::new(1 << 20, 2);
        cache.update(rrset("example.com", TrustLevel::AnswerAa, 1000, false), 100);
        let (_, stored) = cache.update(rrset("example.com", TrustLevel::AnswerAa, 2000, false), 100);
        assert_eq!(stored.expiry, 2000);

        // Shorter expiry at the same trust loses
        let (_, stored) = cache.update(rrset("example.com", TrustLevel::AnswerAa, 500, false), 100);
        assert_eq!(stored.expiry, 2000);
    }

    #[test]
    fn signed_set_beats_unsigned_at_same_trust_and_expiry() {
        let cache = RrsetCache::new(1 << 20, 2);
        cache.update(rrset("example.com", TrustLevel::AnswerAa, 1000, false), 100);
        let (_, stored) = cache.update(rrset("example.com", TrustLevel::AnswerAa, 1000, true), 100);
        assert!(stored.has_signatures());
    }

    #[test]
    fn expired_entry_is_always_replaced() {
        let cache = RrsetCache::new(1 << 20, 2);
        cache.update(rrset("example.com", TrustLevel::Validated, 150, false), 100);
        // Same name at lower trust, but the old entry is past its expiry
        let (_, stored) = cache.update(rrset("example.com", TrustLevel::Authority, 9000, false), 200);
        assert_eq!(stored.trust, TrustLevel::Authority);
    }

    #[test]
    fn expired_lookup_is_a_miss() {
        let cache = RrsetCache::new(1 << 20, 2);
        cache.update(rrset("example.com", TrustLevel::AnswerAa, 150, false), 100);
        assert!(cache
            .lookup("example.com", QueryType::A, 1, RrsetFlags::empty(), 149)
            .is_some());
        assert!(cache
            .lookup("example.com", QueryType::A, 1, RrsetFlags::empty(), 150)
            .is_none());
    }

    #[test]
    fn security_upgrade_keeps_id() {
        let cache = RrsetCache::new(1 << 20, 2);
        let (rref, _) = cache.update(rrset("example.com", TrustLevel::AnswerAa, 1000, true), 100);
        cache.upgrade_security(&rref, SecurityStatus::Secure);
        let entry = cache.get_by_ref(&rref, 100).expect("reference must stay valid");
        assert_eq!(entry.security, SecurityStatus::Secure);
        assert_eq!(entry.trust, TrustLevel::Validated);

        // Downgrades are not applied
        cache.upgrade_security(&rref, SecurityStatus::Insecure);
        let entry = cache.get_by_ref(&rref, 100).expect("reference must stay valid");
        assert_eq!(entry.security, SecurityStatus::Secure);
    }

    #[test]
    fn pack_groups_by_owner_and_type_with_rrsigs() {
        let records = vec![
            ResourceRecord::new(
                "example.com",
                ResourceData::A {
                    address: "192.0.2.1".parse().unwrap(),
                },
                Some(300),
                None,
            ),
            ResourceRecord::new(
                "example.com",
                ResourceData::A {
                    address: "192.0.2.2".parse().unwrap(),
                },
                Some(200),
                None,
            ),
            ResourceRecord::new(
                "example.com",
                ResourceData::RRSIG {
                    type_covered: 1,
                    algorithm: 13,
                    labels: 2,
                    original_ttl: 300,
                    signature_expiration: 10_000,
                    signature_inception: 0,
                    key_tag: 7,
                    signer_name: "example.com".into(),
                    signature: vec![1u8; 64].into(),
                },
                Some(300),
                None,
            ),
            ResourceRecord::new(
                "example.com",
                ResourceData::NS {
                    ns_domain_name: "ns1.example.com".into(),
                },
                Some(3600),
                None,
            ),
        ];
        let sets = pack_rrsets(&records, TrustLevel::AnswerAa, 1000, 0, 86_400);
        assert_eq!(sets.len(), 2);

        let a_set = &sets[0];
        assert_eq!(a_set.rtype, QueryType::A);
        assert_eq!(a_set.rdatas.len(), 2);
        assert_eq!(a_set.rrsigs.len(), 1);
        // Minimum TTL of the components
        assert_eq!(a_set.expiry, 1200);

        let ns_set = &sets[1];
        assert_eq!(ns_set.rtype, QueryType::NS);
        assert!(ns_set.rrsigs.is_empty());
    }

    #[test]
    fn pack_clamps_ttl_bounds() {
        let records = vec![ResourceRecord::new(
            "example.com",
            ResourceData::A {
                address: "192.0.2.1".parse().unwrap(),
            },
            Some(1_000_000),
            None,
        )];
        let sets = pack_rrsets(&records, TrustLevel::AnswerAa, 0, 60, 86_400);
        assert_eq!(sets[0].expiry, 86_400);

        let records = vec![ResourceRecord::new(
            "example.com",
            ResourceData::A {
                address: "192.0.2.1".parse().unwrap(),
            },
            Some(1),
            None,
        )];
        let sets = pack_rrsets(&records, TrustLevel::AnswerAa, 0, 60, 86_400);
        assert_eq!(sets[0].expiry, 60);
    }
}
