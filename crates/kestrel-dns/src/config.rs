use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;

/// The options the core recognizes. The config-file parser lives outside
/// this crate and hands us a finished struct; tests use the defaults
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    // Cache sizing
    pub msg_cache_size: usize,
    pub msg_cache_slabs: usize,
    pub rrset_cache_size: usize,
    pub rrset_cache_slabs: usize,
    pub key_cache_size: usize,
    pub key_cache_slabs: usize,
    pub infra_cache_numhosts: usize,
    pub infra_cache_slabs: usize,
    pub neg_cache_size: usize,
    /// Accepted legacy options. Kept so configs keep loading, never read
    pub infra_lame_ttl: Option<u64>,
    pub infra_cache_lame_size: Option<usize>,
    pub infra_host_ttl: u64,

    // Resolution
    /// Allowed target (A/AAAA) fetches per delegation, indexed by sub-query depth
    pub target_fetch_policy: Vec<u8>,
    pub harden_referral_path: bool,
    pub harden_glue: bool,
    pub harden_dnssec_stripped: bool,
    pub harden_below_nxdomain: bool,
    pub use_caps_for_id: bool,
    pub prefetch: bool,
    pub prefetch_key: bool,
    pub unwanted_reply_threshold: u64,
    pub do_not_query_address: Vec<IpAddr>,
    pub do_not_query_localhost: bool,

    // TTL bounds
    pub cache_min_ttl: u64,
    pub cache_max_ttl: u64,
    pub bogus_ttl: u64,

    // Validation
    pub trust_anchor_file: Option<PathBuf>,
    pub trust_anchor: Vec<String>,
    pub auto_trust_anchor_file: Option<PathBuf>,
    pub trusted_keys_file: Option<PathBuf>,
    pub dlv_anchor_file: Option<PathBuf>,
    pub domain_insecure: Vec<String>,
    /// 0 means "use the wall clock"
    pub val_override_date: u64,
    pub val_sig_skew_min: u64,
    pub val_sig_skew_max: u64,
    pub val_clean_additional: bool,
    pub val_permissive_mode: bool,
    pub ignore_cd_flag: bool,
    /// Sorted (keysize, max-iterations) pairs
    pub val_nsec3_keysize_iterations: Vec<(u16, u16)>,
    pub add_holddown: u64,
    pub del_holddown: u64,
    pub keep_missing: u64,

    // Network
    pub port: u16,
    pub interface: Vec<IpAddr>,
    pub outgoing_interface: Vec<IpAddr>,
    pub outgoing_range: usize,
    pub outgoing_port_permit: Vec<RangeInclusive<u16>>,
    pub outgoing_port_avoid: Vec<RangeInclusive<u16>>,
    pub do_ip4: bool,
    pub do_ip6: bool,
    pub do_udp: bool,
    pub do_tcp: bool,
    pub so_rcvbuf: usize,
    pub so_sndbuf: usize,
    pub so_reuseport: bool,
    pub edns_buffer_size: u16,
    pub max_udp_size: u16,
    pub jostle_timeout_ms: u64,
    pub delay_close_ms: u64,

    // Zones
    pub root_hints: Vec<SocketAddr>,
    pub stub_zones: Vec<StubZone>,
    pub forward_zones: Vec<ForwardZone>,

    pub num_threads: usize,
}

#[derive(Debug, Clone)]
pub struct StubZone {
    pub name: String,
    pub hosts: Vec<String>,
    pub addrs: Vec<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct ForwardZone {
    pub name: String,
    pub addrs: Vec<SocketAddr>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            msg_cache_size: 4 * 1024 * 1024,
            msg_cache_slabs: 4,
            rrset_cache_size: 4 * 1024 * 1024,
            rrset_cache_slabs: 4,
            key_cache_size: 4 * 1024 * 1024,
            key_cache_slabs: 4,
            infra_cache_numhosts: 10_000,
            infra_cache_slabs: 4,
            neg_cache_size: 1024 * 1024,
            infra_lame_ttl: None,
            infra_cache_lame_size: None,
            infra_host_ttl: 900,

            target_fetch_policy: vec![3, 2, 1, 0, 0],
            harden_referral_path: false,
            harden_glue: true,
            harden_dnssec_stripped: true,
            harden_below_nxdomain: false,
            use_caps_for_id: false,
            prefetch: false,
            prefetch_key: false,
            unwanted_reply_threshold: 0,
            do_not_query_address: Vec::new(),
            do_not_query_localhost: true,

            cache_min_ttl: 0,
            cache_max_ttl: 86_400,
            bogus_ttl: 60,

            trust_anchor_file: None,
            trust_anchor: Vec::new(),
            auto_trust_anchor_file: None,
            trusted_keys_file: None,
            dlv_anchor_file: None,
            domain_insecure: Vec::new(),
            val_override_date: 0,
            val_sig_skew_min: 3_600,
            val_sig_skew_max: 86_400,
            val_clean_additional: true,
            val_permissive_mode: false,
            ignore_cd_flag: false,
            val_nsec3_keysize_iterations: vec![(1024, 150), (2048, 500), (4096, 2500)],
            add_holddown: 30 * 24 * 3_600,
            del_holddown: 30 * 24 * 3_600,
            keep_missing: 366 * 24 * 3_600,

            port: 53,
            interface: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            outgoing_interface: Vec::new(),
            outgoing_range: 256,
            outgoing_port_permit: Vec::new(),
            outgoing_port_avoid: Vec::new(),
            do_ip4: true,
            do_ip6: true,
            do_udp: true,
            do_tcp: true,
            so_rcvbuf: 0,
            so_sndbuf: 0,
            so_reuseport: false,
            edns_buffer_size: 1232,
            max_udp_size: 1232,
            jostle_timeout_ms: 200,
            delay_close_ms: 0,

            root_hints: default_root_hints(),
            stub_zones: Vec::new(),
            forward_zones: Vec::new(),

            num_threads: 4,
        }
    }
}

impl ResolverConfig {
    /// Max NSEC3 iterations acceptable for a verifying key of `key_bits`.
    /// The table is sorted by key size; the smallest entry >= the key wins
    pub fn nsec3_max_iterations(&self, key_bits: u16) -> u16 {
        for (size, iterations) in &self.val_nsec3_keysize_iterations {
            if key_bits <= *size {
                return *iterations;
            }
        }
        self.val_nsec3_keysize_iterations
            .last()
            .map(|(_, iterations)| *iterations)
            .unwrap_or(0)
    }

    /// The per-depth cap on NS-address fetches. Out-of-range depths fetch nothing
    pub fn target_fetch_limit(&self, depth: usize) -> u8 {
        self.target_fetch_policy.get(depth).copied().unwrap_or(0)
    }

    pub fn max_subquery_depth(&self) -> usize {
        self.target_fetch_policy.len()
    }

    /// do-not-query policy for an upstream target address
    pub fn address_is_denied(&self, addr: &IpAddr) -> bool {
        if self.do_not_query_localhost && addr.is_loopback() {
            return true;
        }
        self.do_not_query_address.contains(addr)
    }

    pub fn forward_zone_for(&self, qname: &str) -> Option<&ForwardZone> {
        self.forward_zones
            .iter()
            .filter(|zone| kestrel_dns_lib::utils::name_in_zone(qname, &zone.name))
            .max_by_key(|zone| zone.name.len())
    }

    pub fn stub_zone_for(&self, qname: &str) -> Option<&StubZone> {
        self.stub_zones
            .iter()
            .filter(|zone| kestrel_dns_lib::utils::name_in_zone(qname, &zone.name))
            .max_by_key(|zone| zone.name.len())
    }

    pub fn domain_is_insecure(&self, qname: &str) -> bool {
        self.domain_insecure
            .iter()
            .any(|zone| kestrel_dns_lib::utils::name_in_zone(qname, zone))
    }
}

/// The root server addresses used when no root NS set is cached yet.
/// Normally overridden by a root-hints file parsed by the config layer
fn default_root_hints() -> Vec<SocketAddr> {
    let v4: [Ipv4Addr; 13] = [
        Ipv4Addr::new(198, 41, 0, 4),
        Ipv4Addr::new(170, 247, 170, 2),
        Ipv4Addr::new(192, 33, 4, 12),
        Ipv4Addr::new(199, 7, 91, 13),
        Ipv4Addr::new(192, 203, 230, 10),
        Ipv4Addr::new(192, 5, 5, 241),
        Ipv4Addr::new(192, 112, 36, 4),
        Ipv4Addr::new(198, 97, 190, 53),
        Ipv4Addr::new(192, 36, 148, 17),
        Ipv4Addr::new(192, 58, 128, 30),
        Ipv4Addr::new(193, 0, 14, 129),
        Ipv4Addr::new(199, 7, 83, 42),
        Ipv4Addr::new(202, 12, 27, 33),
    ];
    let v6: [Ipv6Addr; 2] = [
        "2001:503:ba3e::2:30".parse().unwrap(),
        "2001:500:2f::f".parse().unwrap(),
    ];
    v4.iter()
        .map(|addr| SocketAddr::new(IpAddr::V4(*addr), 53))
        .chain(v6.iter().map(|addr| SocketAddr::new(IpAddr::V6(*addr), 53)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nsec3_iteration_table_lookup() {
        let cfg = ResolverConfig::default();
        assert_eq!(cfg.nsec3_max_iterations(1024), 150);
        assert_eq!(cfg.nsec3_max_iterations(1025), 500);
        assert_eq!(cfg.nsec3_max_iterations(2048), 500);
        assert_eq!(cfg.nsec3_max_iterations(4096), 2500);
        // Larger than any table entry: clamp to the last row
        assert_eq!(cfg.nsec3_max_iterations(8192), 2500);
    }

    #[test]
    fn target_fetch_policy_bounds() {
        let cfg = ResolverConfig::default();
        assert_eq!(cfg.target_fetch_limit(0), 3);
        assert_eq!(cfg.target_fetch_limit(3), 0);
        assert_eq!(cfg.target_fetch_limit(100), 0);
    }

    #[test]
    fn do_not_query_denies_localhost_by_default() {
        let cfg = ResolverConfig::default();
        assert!(cfg.address_is_denied(&"127.0.0.1".parse().unwrap()));
        assert!(!cfg.address_is_denied(&"192.0.2.1".parse().unwrap()));

        let mut cfg = cfg;
        cfg.do_not_query_address.push("192.0.2.1".parse().unwrap());
        assert!(cfg.address_is_denied(&"192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn longest_forward_zone_wins() {
        let mut cfg = ResolverConfig::default();
        cfg.forward_zones.push(ForwardZone {
            name: "example.com".into(),
            addrs: vec!["192.0.2.1:53".parse().unwrap()],
        });
        cfg.forward_zones.push(ForwardZone {
            name: "sub.example.com".into(),
            addrs: vec!["192.0.2.2:53".parse().unwrap()],
        });
        let zone = cfg.forward_zone_for("host.sub.example.com").unwrap();
        assert_eq!(zone.name, "sub.example.com");
        assert!(cfg.forward_zone_for("example.org").is_none());
    }
}
