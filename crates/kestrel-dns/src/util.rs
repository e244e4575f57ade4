use std::borrow::Cow;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use kestrel_dns_lib::utils::canonical_wire_name;
use kestrel_dns_lib::{DnsPacket, QueryType, Question, ResourceData, ResourceRecord};
use rand::Rng;
use sha1::Digest;

/// The (qname, qtype, qclass) tuple every cache and sub-query is keyed by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryInfo {
    pub qname: String,
    pub qtype: QueryType,
    pub qclass: u16,
}

impl QueryInfo {
    pub fn new(qname: impl Into<String>, qtype: QueryType, qclass: u16) -> Self {
        QueryInfo {
            qname: qname.into(),
            qtype,
            qclass,
        }
    }

    pub fn from_question(question: &Question<'_>) -> Self {
        QueryInfo {
            qname: question.qname.to_string(),
            qtype: question.query_type,
            qclass: question.qclass,
        }
    }

    pub fn as_question(&self) -> Question<'_> {
        Question::new(&self.qname, self.qtype, Some(self.qclass))
    }

    /// The primary cache key: a fingerprint over the canonical wire form of
    /// the name plus type, class, and the flags that change processing
    pub fn fingerprint(&self, cd_bit: bool, dnssec_ok: bool) -> u128 {
        let mut hasher = sha1::Sha1::new();
        hasher.update(canonical_wire_name(&self.qname));
        hasher.update(Into::<u16>::into(self.qtype).to_be_bytes());
        hasher.update(self.qclass.to_be_bytes());
        hasher.update([cd_bit as u8, dnssec_ok as u8]);
        let hash = hasher.finalize();
        u128::from_be_bytes(hash[..16].try_into().unwrap())
    }
}

pub fn hash_to_u128(data: impl AsRef<[u8]>, prefix: Option<&[u8]>) -> u128 {
    let mut hasher = sha1::Sha1::new();

    prefix.into_iter().for_each(|prefix| hasher.update(prefix));
    hasher.update(data);

    let hash = hasher.finalize();
    u128::from_be_bytes(hash[..16].try_into().unwrap())
}

/// Wall clock in whole seconds. All cache TTLs are absolute values of this
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

pub fn get_response_dns_packet(request: Option<&DnsPacket<'_>>, edns_buf_size: Option<usize>) -> DnsPacket<'static> {
    let mut packet = DnsPacket::new();
    packet.header.is_response = true;
    packet.header.recursion_available = true;
    if let Some(buf_size) = edns_buf_size {
        packet.additionals.push(get_edns_rr(buf_size as u16, false, None));
        packet.header.additional_rr_count += 1;
        packet.edns = Some(0);
    }
    if let Some(request) = request {
        packet.header.id = request.header.id;
        packet.header.recursion_desired = request.header.recursion_desired;
        packet.header.checking_disabled = request.header.checking_disabled;
    }
    packet
}

pub fn get_query_dns_packet(id: Option<u16>, edns_buf_size: u16, dnssec_ok: bool) -> DnsPacket<'static> {
    let mut packet = DnsPacket::new();
    packet.header.id = id.unwrap_or_else(|| rand::thread_rng().gen());
    packet.additionals.push(get_edns_rr(edns_buf_size, dnssec_ok, None));
    packet.header.additional_rr_count += 1;
    packet.edns = Some(0);
    packet
}

pub fn get_edns_rr(buf_size: u16, dnssec_ok: bool, options: Option<HashMap<u16, Cow<'_, [u8]>>>) -> ResourceRecord<'_> {
    let ttl = if dnssec_ok { 1u32 << 15 } else { 0 };
    ResourceRecord::new("", ResourceData::OPT { options }, Some(ttl), Some(buf_size))
}

/// 0x20 hardening: randomize the letter case of a query name. The reply's
/// question section must echo the exact same spelling
pub fn randomize_qname_case(qname: &str) -> String {
    let mut rng = rand::thread_rng();
    qname
        .chars()
        .map(|symbol| {
            if symbol.is_ascii_alphabetic() && rng.gen::<bool>() {
                symbol.to_ascii_uppercase()
            } else {
                symbol.to_ascii_lowercase()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_name_case() {
        let a = QueryInfo::new("Example.COM", QueryType::A, 1);
        let b = QueryInfo::new("example.com", QueryType::A, 1);
        assert_eq!(a.fingerprint(false, true), b.fingerprint(false, true));
    }

    #[test]
    fn fingerprint_depends_on_flags_and_type() {
        let qinfo = QueryInfo::new("example.com", QueryType::A, 1);
        assert_ne!(qinfo.fingerprint(false, false), qinfo.fingerprint(false, true));
        assert_ne!(qinfo.fingerprint(false, false), qinfo.fingerprint(true, false));

        let other = QueryInfo::new("example.com", QueryType::AAAA, 1);
        assert_ne!(qinfo.fingerprint(false, false), other.fingerprint(false, false));
    }

    #[test]
    fn caps_randomization_preserves_name() {
        let qname = "www.example.com";
        let randomized = randomize_qname_case(qname);
        assert!(randomized.eq_ignore_ascii_case(qname));
    }
}
