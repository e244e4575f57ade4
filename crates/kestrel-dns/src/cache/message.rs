use std::sync::Arc;

use kestrel_dns_lib::ResponseCode;

use super::rrset::{PackedRrset, RrsetCache, RrsetRef, SecurityStatus, TrustLevel};
use super::slab::{EntrySize, SlabCache};
use crate::util::QueryInfo;

bitflags::bitflags! {
    /// Header bits worth remembering about a cached reply
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReplyFlags: u8 {
        const AA = 1;
        const AD = 1 << 1;
        const CD = 1 << 2;
    }
}

/// The cached shape of a full reply: ordered RRset references split into
/// section counts, with the version id each reference was captured at
#[derive(Debug, Clone)]
pub struct ReplyInfo {
    pub flags: ReplyFlags,
    pub rcode: ResponseCode,
    pub an_count: usize,
    pub ns_count: usize,
    pub ar_count: usize,
    pub rrsets: Vec<RrsetRef>,
    /// Minimum of the component expiries, absolute seconds
    pub expiry: u64,
    /// When the entry was written; lets prefetch find the last 10% of TTL
    pub stored_at: u64,
    pub security: SecurityStatus,
}

#[derive(Debug)]
struct MessageEntry {
    qinfo: QueryInfo,
    reply: ReplyInfo,
}

impl EntrySize for MessageEntry {
    fn size_bytes(&self) -> usize {
        std::mem::size_of::<MessageEntry>()
            + self.qinfo.qname.len()
            + self.reply.rrsets.len() * std::mem::size_of::<RrsetRef>()
    }
}

/// A reply resolved back out of the cache: every reference checked out
/// against the RRset cache at the captured version
#[derive(Debug, Clone)]
pub struct CachedReply {
    pub flags: ReplyFlags,
    pub rcode: ResponseCode,
    pub an_count: usize,
    pub ns_count: usize,
    pub ar_count: usize,
    pub rrsets: Vec<Arc<PackedRrset>>,
    pub expiry: u64,
    pub stored_at: u64,
    pub security: SecurityStatus,
}

impl CachedReply {
    pub fn answer_sets(&self) -> &[Arc<PackedRrset>] {
        &self.rrsets[..self.an_count]
    }

    pub fn authority_sets(&self) -> &[Arc<PackedRrset>] {
        &self.rrsets[self.an_count..self.an_count + self.ns_count]
    }

    pub fn additional_sets(&self) -> &[Arc<PackedRrset>] {
        &self.rrsets[self.an_count + self.ns_count..]
    }

    pub fn ttl_remaining(&self, now: u64) -> u64 {
        self.expiry.saturating_sub(now)
    }
}

pub struct MessageCache {
    slab: SlabCache<Arc<MessageEntry>>,
}

impl MessageCache {
    pub fn new(maxmem: usize, slabs: usize) -> Self {
        MessageCache {
            slab: SlabCache::new(maxmem, slabs),
        }
    }

    /// Stores a reply: writes each RRset through the RRset cache, captures
    /// the (key, version id) pairs the cache handed back, then inserts.
    /// Section membership is given by the (an, ns, ar) split of `rrsets`
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &self,
        qinfo: &QueryInfo,
        cd_bit: bool,
        flags: ReplyFlags,
        rcode: ResponseCode,
        sections: [Vec<PackedRrset>; 3],
        security: SecurityStatus,
        rrset_cache: &RrsetCache,
        now: u64,
    ) {
        let [answer, authority, additional] = sections;
        let an_count = answer.len();
        let ns_count = authority.len();
        let ar_count = additional.len();

        let mut expiry = u64::MAX;
        let mut refs = Vec::with_capacity(an_count + ns_count + ar_count);
        for rrset in answer.into_iter().chain(authority).chain(additional) {
            let (rref, stored) = rrset_cache.update(rrset, now);
            expiry = expiry.min(stored.expiry);
            refs.push(rref);
        }
        if refs.is_empty() {
            // Negative replies carry no sets; fall back to the reply TTL the
            // caller encoded in `now`-relative terms elsewhere. Give them a
            // modest fixed lifetime derived from the rcode
            expiry = now + 60;
        }

        let entry = MessageEntry {
            qinfo: qinfo.clone(),
            reply: ReplyInfo {
                flags,
                rcode,
                an_count,
                ns_count,
                ar_count,
                rrsets: refs,
                expiry,
                stored_at: now,
                security,
            },
        };
        self.slab.insert(qinfo.fingerprint(cd_bit, false), Arc::new(entry));
    }

    /// Stores a negative or synthetic reply with an explicit absolute expiry
    #[allow(clippy::too_many_arguments)]
    pub fn store_with_expiry(
        &self,
        qinfo: &QueryInfo,
        cd_bit: bool,
        flags: ReplyFlags,
        rcode: ResponseCode,
        sections: [Vec<PackedRrset>; 3],
        security: SecurityStatus,
        rrset_cache: &RrsetCache,
        now: u64,
        expiry: u64,
    ) {
        let [answer, authority, additional] = sections;
        let an_count = answer.len();
        let ns_count = authority.len();
        let ar_count = additional.len();

        let mut refs = Vec::with_capacity(an_count + ns_count + ar_count);
        let mut min_expiry = expiry;
        for rrset in answer.into_iter().chain(authority).chain(additional) {
            let (rref, stored) = rrset_cache.update(rrset, now);
            min_expiry = min_expiry.min(stored.expiry);
            refs.push(rref);
        }

        let entry = MessageEntry {
            qinfo: qinfo.clone(),
            reply: ReplyInfo {
                flags,
                rcode,
                an_count,
                ns_count,
                ar_count,
                rrsets: refs,
                expiry: min_expiry,
                stored_at: now,
                security,
            },
        };
        self.slab.insert(qinfo.fingerprint(cd_bit, false), Arc::new(entry));
    }

    /// Looks a reply up and revalidates every back-reference. Any evicted,
    /// replaced, or expired RRset turns the whole entry into a miss
    pub fn lookup(&self, qinfo: &QueryInfo, cd_bit: bool, rrset_cache: &RrsetCache, now: u64) -> Option<CachedReply> {
        let hash = qinfo.fingerprint(cd_bit, false);
        let entry = self.slab.lookup(hash)?;

        if entry.reply.expiry <= now {
            tracing::debug!(
                qname = ?qinfo.qname,
                qtype = ?qinfo.qtype,
                "Found entry in cache, but it's stale. Doing a lookup"
            );
            return None;
        }

        let mut rrsets = Vec::with_capacity(entry.reply.rrsets.len());
        for rref in &entry.reply.rrsets {
            let Some(rrset) = rrset_cache.get_by_ref(rref, now) else {
                tracing::debug!(
                    qname = ?qinfo.qname,
                    qtype = ?qinfo.qtype,
                    "Referenced RRset was replaced or evicted. Doing a lookup"
                );
                self.slab.remove(hash);
                return None;
            };
            rrsets.push(rrset);
        }

        Some(CachedReply {
            flags: entry.reply.flags,
            rcode: entry.reply.rcode,
            an_count: entry.reply.an_count,
            ns_count: entry.reply.ns_count,
            ar_count: entry.reply.ar_count,
            rrsets,
            expiry: entry.reply.expiry,
            stored_at: entry.reply.stored_at,
            security: entry.reply.security,
        })
    }

    pub fn remove(&self, qinfo: &QueryInfo, cd_bit: bool) {
        self.slab.remove(qinfo.fingerprint(cd_bit, false));
    }

    pub fn get_mem(&self) -> usize {
        self.slab.get_mem()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::rrset::RrsetFlags;
    use kestrel_dns_lib::{QueryType, ResourceData};

    fn a_rrset(name: &str, expiry: u64, trust: TrustLevel) -> PackedRrset {
        PackedRrset {
            name: name.into(),
            rtype: QueryType::A,
            class: 1,
            flags: RrsetFlags::empty(),
            expiry,
            rdatas: vec![ResourceData::A {
                address: "192.0.2.1".parse().unwrap(),
            }],
            rrsigs: Vec::new(),
            trust,
            security: SecurityStatus::Indeterminate,
            id: 0,
        }
    }

    fn qinfo(name: &str) -> QueryInfo {
        QueryInfo::new(name, QueryType::A, 1)
    }

    #[test]
    fn store_then_lookup_roundtrip() {
        let rrsets = RrsetCache::new(1 << 20, 2);
        let messages = MessageCache::new(1 << 20, 2);
        let qinfo = qinfo("example.com");

        messages.store(
            &qinfo,
            false,
            ReplyFlags::AA,
            ResponseCode::Success,
            [vec![a_rrset("example.com", 1000, TrustLevel::AnswerAa)], vec![], vec![]],
            SecurityStatus::Indeterminate,
            &rrsets,
            100,
        );

        let reply = messages.lookup(&qinfo, false, &rrsets, 500).expect("should be cached");
        assert_eq!(reply.an_count, 1);
        assert_eq!(reply.answer_sets()[0].name, "example.com");
        assert_eq!(reply.ttl_remaining(500), 500);

        // Expired at its minimum component TTL
        assert!(messages.lookup(&qinfo, false, &rrsets, 1000).is_none());
    }

    #[test]
    fn storing_twice_is_idempotent() {
        let rrsets = RrsetCache::new(1 << 20, 2);
        let messages = MessageCache::new(1 << 20, 2);
        let qinfo = qinfo("example.com");

        for _ in 0..2 {
            messages.store(
                &qinfo,
                false,
                ReplyFlags::AA,
                ResponseCode::Success,
                [vec![a_rrset("example.com", 1000, TrustLevel::AnswerAa)], vec![], vec![]],
                SecurityStatus::Indeterminate,
                &rrsets,
                100,
            );
        }
        let reply = messages.lookup(&qinfo, false, &rrsets, 200).expect("should be cached");
        assert_eq!(reply.an_count, 1);
        assert_eq!(reply.rrsets.len(), 1);
    }

    #[test]
    fn replaced_rrset_invalidates_message() {
        let rrsets = RrsetCache::new(1 << 20, 2);
        let messages = MessageCache::new(1 << 20, 2);
        let qinfo = qinfo("example.com");

        messages.store(
            &qinfo,
            false,
            ReplyFlags::empty(),
            ResponseCode::Success,
            [vec![a_rrset("example.com", 1000, TrustLevel::Authority)], vec![], vec![]],
            SecurityStatus::Indeterminate,
            &rrsets,
            100,
        );
        assert!(messages.lookup(&qinfo, false, &rrsets, 200).is_some());

        // A higher-trust update replaces the RRset and bumps its version id,
        // so the captured back-reference no longer verifies
        rrsets.update(a_rrset("example.com", 2000, TrustLevel::Validated), 100);
        assert!(messages.lookup(&qinfo, false, &rrsets, 200).is_none());
    }

    #[test]
    fn cd_bit_is_part_of_the_key() {
        let rrsets = RrsetCache::new(1 << 20, 2);
        let messages = MessageCache::new(1 << 20, 2);
        let qinfo = qinfo("example.com");

        messages.store(
            &qinfo,
            true,
            ReplyFlags::CD,
            ResponseCode::Success,
            [vec![a_rrset("example.com", 1000, TrustLevel::AnswerAa)], vec![], vec![]],
            SecurityStatus::Indeterminate,
            &rrsets,
            100,
        );
        assert!(messages.lookup(&qinfo, false, &rrsets, 200).is_none());
        assert!(messages.lookup(&qinfo, true, &rrsets, 200).is_some());
    }
}
