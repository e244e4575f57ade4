use std::net::{IpAddr, SocketAddr};

use kestrel_dns_lib::{QueryType, ResourceData};

use crate::cache::{InfraCache, PackedRrset, RrsetCache, RrsetFlags};

/// Per-address probe state inside one resolution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Unused,
    InFlight,
    ProbedGood,
    ProbedBad,
    BlacklistedUntil(u64),
}

#[derive(Debug, Clone)]
pub struct DelegationTarget {
    pub addr: SocketAddr,
    pub ns_name: String,
    pub state: TargetState,
}

#[derive(Debug, Clone)]
pub struct NsName {
    pub name: String,
    pub fetched_v4: bool,
    pub fetched_v6: bool,
}

/// The zone cut currently being queried: the NS names of the cut and every
/// resolved address with its probe state
#[derive(Debug, Clone)]
pub struct DelegationPoint {
    /// Owner name of the zone cut. Always an ancestor of (or equal to) the
    /// qname being chased
    pub name: String,
    pub ns_names: Vec<NsName>,
    pub targets: Vec<DelegationTarget>,
    /// Forwarder lists skip referral logic entirely
    pub is_forward: bool,
}

impl DelegationPoint {
    pub fn new(name: impl Into<String>) -> Self {
        DelegationPoint {
            name: name.into(),
            ns_names: Vec::new(),
            targets: Vec::new(),
            is_forward: false,
        }
    }

    /// A delegation made of fixed addresses (root hints, stubs, forwarders)
    pub fn from_hints(name: impl Into<String>, addrs: &[SocketAddr], is_forward: bool) -> Self {
        let name = name.into();
        let mut dp = DelegationPoint::new(name);
        dp.is_forward = is_forward;
        for addr in addrs {
            dp.targets.push(DelegationTarget {
                addr: *addr,
                ns_name: String::new(),
                state: TargetState::Unused,
            });
        }
        dp
    }

    /// Builds a delegation from a cached NS RRset, merging any A/AAAA
    /// records the RRset cache already has for the NS names
    pub fn from_ns_rrset(ns: &PackedRrset, rrset_cache: &RrsetCache, now: u64) -> Self {
        let mut dp = DelegationPoint::new(ns.name.clone());
        for rdata in &ns.rdatas {
            if let ResourceData::NS { ns_domain_name } = rdata {
                dp.add_ns(ns_domain_name.as_ref());
            }
        }
        dp.merge_cached_addresses(rrset_cache, now);
        dp
    }

    pub fn add_ns(&mut self, name: &str) {
        if self
            .ns_names
            .iter()
            .any(|existing| existing.name.eq_ignore_ascii_case(name))
        {
            return;
        }
        self.ns_names.push(NsName {
            name: name.to_string(),
            fetched_v4: false,
            fetched_v6: false,
        });
    }

    pub fn add_target(&mut self, ns_name: &str, addr: IpAddr) {
        let addr = SocketAddr::new(addr, 53);
        if self.targets.iter().any(|target| target.addr == addr) {
            return;
        }
        self.targets.push(DelegationTarget {
            addr,
            ns_name: ns_name.to_string(),
            state: TargetState::Unused,
        });
        if let Some(ns) = self
            .ns_names
            .iter_mut()
            .find(|ns| ns.name.eq_ignore_ascii_case(ns_name))
        {
            match addr {
                SocketAddr::V4(_) => ns.fetched_v4 = true,
                SocketAddr::V6(_) => ns.fetched_v6 = true,
            }
        }
    }

    /// Pulls A/AAAA RRsets out of the cache for every NS name
    pub fn merge_cached_addresses(&mut self, rrset_cache: &RrsetCache, now: u64) {
        let names: Vec<String> = self.ns_names.iter().map(|ns| ns.name.clone()).collect();
        for name in names {
            for qtype in [QueryType::A, QueryType::AAAA] {
                if let Some(rrset) = rrset_cache.lookup(&name, qtype, 1, RrsetFlags::empty(), now) {
                    for rdata in &rrset.rdatas {
                        match rdata {
                            ResourceData::A { address } => self.add_target(&name, IpAddr::V4(*address)),
                            ResourceData::AAAA { address } => self.add_target(&name, IpAddr::V6(*address)),
                            _ => {}
                        }
                    }
                }
            }
        }
    }

    /// NS names that still need address fetches, as (name, want_v4, want_v6)
    pub fn missing_targets(&self, do_ip4: bool, do_ip6: bool) -> Vec<(String, bool, bool)> {
        self.ns_names
            .iter()
            .filter_map(|ns| {
                let want_v4 = do_ip4 && !ns.fetched_v4;
                let want_v6 = do_ip6 && !ns.fetched_v6;
                (want_v4 || want_v6).then(|| (ns.name.clone(), want_v4, want_v6))
            })
            .collect()
    }

    pub fn mark_target(&mut self, addr: SocketAddr, state: TargetState) {
        if let Some(target) = self.targets.iter_mut().find(|target| target.addr == addr) {
            target.state = state;
        }
    }

    pub fn mark_ns_fetched(&mut self, name: &str, v4: bool, v6: bool) {
        if let Some(ns) = self
            .ns_names
            .iter_mut()
            .find(|ns| ns.name.eq_ignore_ascii_case(name))
        {
            ns.fetched_v4 |= v4;
            ns.fetched_v6 |= v6;
        }
    }

    /// Deterministic target selection: skip in-flight, blacklisted, denied,
    /// and failure-looped addresses; then prefer lowest RTT, then IPv6 when
    /// enabled, then lexicographic address order. Unmeasured targets carry
    /// the RTT seed
    pub fn select_target(
        &self,
        infra: &InfraCache,
        now: u64,
        do_ip4: bool,
        do_ip6: bool,
        denied: impl Fn(&IpAddr) -> bool,
    ) -> Option<SocketAddr> {
        self.targets
            .iter()
            .filter(|target| match target.state {
                TargetState::Unused | TargetState::ProbedGood => true,
                TargetState::BlacklistedUntil(until) => now >= until,
                TargetState::InFlight | TargetState::ProbedBad => false,
            })
            .filter(|target| match target.addr.ip() {
                IpAddr::V4(_) => do_ip4,
                IpAddr::V6(_) => do_ip6,
            })
            .filter(|target| !denied(&target.addr.ip()))
            .filter(|target| !infra.should_skip(&target.addr.ip(), &self.name, now))
            .min_by_key(|target| {
                let rtt = infra.rtt_ms(&target.addr.ip(), &self.name, now);
                let v4_penalty = matches!(target.addr.ip(), IpAddr::V4(_)) && do_ip6;
                (rtt, v4_penalty, target.addr.ip())
            })
            .map(|target| target.addr)
    }

    pub fn usable_target_count(&self, now: u64) -> usize {
        self.targets
            .iter()
            .filter(|target| match target.state {
                TargetState::Unused | TargetState::ProbedGood => true,
                TargetState::BlacklistedUntil(until) => now >= until,
                _ => false,
            })
            .count()
    }

    /// Clears probe state so a fresh retry round can walk the list again
    pub fn reset_probes(&mut self) {
        for target in &mut self.targets {
            if matches!(target.state, TargetState::ProbedBad | TargetState::InFlight) {
                target.state = TargetState::Unused;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InfraCache;
    use std::time::Duration;

    fn dp_with_targets(addrs: &[&str]) -> DelegationPoint {
        let mut dp = DelegationPoint::new("example.com");
        dp.add_ns("ns1.example.com");
        for addr in addrs {
            dp.add_target("ns1.example.com", addr.parse().unwrap());
        }
        dp
    }

    #[test]
    fn selection_prefers_lowest_rtt() {
        let infra = InfraCache::new(100, 2, 900);
        let dp = dp_with_targets(&["192.0.2.1", "192.0.2.2"]);

        infra.note_success(&"192.0.2.2".parse().unwrap(), "example.com", Duration::from_millis(10), 0);
        // 192.0.2.1 stays at the 376ms seed
        let selected = dp.select_target(&infra, 0, true, true, |_| false).unwrap();
        assert_eq!(selected.ip(), "192.0.2.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn selection_prefers_ipv6_on_rtt_tie() {
        let infra = InfraCache::new(100, 2, 900);
        let dp = dp_with_targets(&["192.0.2.1", "2001:db8::1"]);

        let selected = dp.select_target(&infra, 0, true, true, |_| false).unwrap();
        assert_eq!(selected.ip(), "2001:db8::1".parse::<IpAddr>().unwrap());

        // With IPv6 disabled the IPv4 target is the only candidate
        let selected = dp.select_target(&infra, 0, true, false, |_| false).unwrap();
        assert_eq!(selected.ip(), "192.0.2.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn selection_breaks_full_ties_lexicographically() {
        let infra = InfraCache::new(100, 2, 900);
        let dp = dp_with_targets(&["192.0.2.9", "192.0.2.1"]);
        let selected = dp.select_target(&infra, 0, true, true, |_| false).unwrap();
        assert_eq!(selected.ip(), "192.0.2.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn in_flight_and_bad_targets_are_skipped() {
        let infra = InfraCache::new(100, 2, 900);
        let mut dp = dp_with_targets(&["192.0.2.1", "192.0.2.2"]);
        dp.mark_target("192.0.2.1:53".parse().unwrap(), TargetState::InFlight);
        let selected = dp.select_target(&infra, 0, true, true, |_| false).unwrap();
        assert_eq!(selected.ip(), "192.0.2.2".parse::<IpAddr>().unwrap());

        dp.mark_target("192.0.2.2:53".parse().unwrap(), TargetState::ProbedBad);
        assert!(dp.select_target(&infra, 0, true, true, |_| false).is_none());

        dp.reset_probes();
        assert!(dp.select_target(&infra, 0, true, true, |_| false).is_some());
    }

    #[test]
    fn blacklisted_targets_return_after_expiry() {
        let infra = InfraCache::new(100, 2, 900);
        let mut dp = dp_with_targets(&["192.0.2.1"]);
        dp.mark_target("192.0.2.1:53".parse().unwrap(), TargetState::BlacklistedUntil(500));
        assert!(dp.select_target(&infra, 499, true, true, |_| false).is_none());
        assert!(dp.select_target(&infra, 500, true, true, |_| false).is_some());
    }

    #[test]
    fn failure_looped_targets_are_skipped() {
        let infra = InfraCache::new(100, 2, 900);
        let dp = dp_with_targets(&["192.0.2.1"]);
        for _ in 0..3 {
            infra.note_failure(&"192.0.2.1".parse().unwrap(), "example.com", 100);
        }
        assert!(dp.select_target(&infra, 100, true, true, |_| false).is_none());
    }

    #[test]
    fn denied_addresses_are_never_selected() {
        let infra = InfraCache::new(100, 2, 900);
        let dp = dp_with_targets(&["192.0.2.1"]);
        assert!(dp
            .select_target(&infra, 0, true, true, |addr| *addr == "192.0.2.1".parse::<IpAddr>().unwrap())
            .is_none());
    }

    #[test]
    fn missing_targets_tracks_address_families() {
        let mut dp = DelegationPoint::new("example.com");
        dp.add_ns("ns1.example.com");
        dp.add_ns("ns2.example.com");
        dp.add_target("ns1.example.com", "192.0.2.1".parse().unwrap());

        let missing = dp.missing_targets(true, true);
        assert_eq!(missing.len(), 2);
        // ns1 still wants v6
        assert!(missing.contains(&("ns1.example.com".to_string(), false, true)));
        assert!(missing.contains(&("ns2.example.com".to_string(), true, true)));

        let missing = dp.missing_targets(true, false);
        assert_eq!(missing, vec![("ns2.example.com".to_string(), true, false)]);
    }
}
