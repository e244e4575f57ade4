use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use kestrel_dns_lib::{ByteBuf, DnsPacket, FromBuf as _, Question};
use rand::Rng as _;
use tokio::net::{TcpStream, UdpSocket};

use crate::connection::Connection;
use crate::module::OutboundSpec;
use crate::util::{get_query_dns_packet, now_secs, QueryInfo};
use crate::{ModuleEnv, DEFAULT_EDNS_BUF_CAPACITY, MAX_STANDARD_DNS_MSG_SIZE};

pub struct ExchangeResult {
    pub packet: DnsPacket<'static>,
    pub rtt: Duration,
}

/// Picks a local port honoring outgoing-port-permit/avoid. Zero means
/// "let the kernel choose"
fn pick_outgoing_port(env: &ModuleEnv) -> u16 {
    let cfg = &env.cfg;
    if cfg.outgoing_port_permit.is_empty() && cfg.outgoing_port_avoid.is_empty() {
        return 0;
    }
    let mut rng = rand::thread_rng();
    for _ in 0..64 {
        let candidate: u16 = if cfg.outgoing_port_permit.is_empty() {
            rng.gen_range(1025..=u16::MAX)
        } else {
            let range = &cfg.outgoing_port_permit[rng.gen_range(0..cfg.outgoing_port_permit.len())];
            rng.gen_range(range.clone())
        };
        if !cfg.outgoing_port_avoid.iter().any(|range| range.contains(&candidate)) {
            return candidate;
        }
    }
    0
}

fn outgoing_bind_addr(env: &ModuleEnv, target: &SocketAddr) -> SocketAddr {
    let port = pick_outgoing_port(env);
    let ip = env
        .cfg
        .outgoing_interface
        .iter()
        .find(|addr| addr.is_ipv4() == target.is_ipv4())
        .copied()
        .unwrap_or(match target {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
    SocketAddr::new(ip, port)
}

/// Checks that a reply actually answers the question we asked. Failing
/// this counts towards the unwanted-reply threshold
fn reply_matches(query_id: u16, qinfo: &QueryInfo, sent_qname: &str, response: &DnsPacket<'static>) -> bool {
    if response.header.id != query_id || !response.header.is_response {
        return false;
    }
    let Some(question) = response.questions.first() else {
        return false;
    };
    question.qname.eq_ignore_ascii_case(sent_qname)
        && question.query_type == qinfo.qtype
        && question.qclass == qinfo.qclass
}

/// One outbound exchange: UDP first with the infra-derived timeout,
/// escalating to TCP on truncation, and retrying without EDNS when the
/// server proves EDNS-ignorant
pub async fn exchange(spec: &OutboundSpec, recursion_desired: bool, env: &ModuleEnv) -> anyhow::Result<ExchangeResult> {
    let now = now_secs();
    let timeout = env.infra_cache.timeout_for(&spec.target.ip(), &spec.zone, now);
    let sent_qname = spec.caps_qname.as_deref().unwrap_or(&spec.qinfo.qname);

    let infra_edns = env
        .infra_cache
        .get(&spec.target.ip(), &spec.zone, now)
        .and_then(|entry| entry.edns_supported);
    let mut use_edns = infra_edns != Some(false);
    let mut force_tcp = !env.cfg.do_udp;

    let started = Instant::now();
    loop {
        let mut packet = if use_edns {
            get_query_dns_packet(None, env.cfg.edns_buffer_size, spec.dnssec_ok)
        } else {
            let mut bare = DnsPacket::new();
            bare.header.id = rand::thread_rng().gen();
            bare
        };
        packet.header.recursion_desired = recursion_desired;
        packet
            .questions
            .push(Question::new(sent_qname, spec.qinfo.qtype, Some(spec.qinfo.qclass)).into_owned());
        packet.header.question_count = 1;
        let query_id = packet.header.id;

        let mut buf = ByteBuf::new_empty(Some(DEFAULT_EDNS_BUF_CAPACITY));
        packet
            // No need to verify the packet's size here, as we can just fall back to TCP if it's too big
            .encode_to_buf(&mut buf, None)
            .context("error while encoding the DNS packet")?;

        let mut connection: Connection<_> = if force_tcp || buf.len() > MAX_STANDARD_DNS_MSG_SIZE {
            anyhow::ensure!(env.cfg.do_tcp, "TCP is required but disabled");
            let stream = tokio::time::timeout(timeout.max(Duration::from_secs(1)), TcpStream::connect(spec.target))
                .await
                .context("TCP: connect timed out")?
                .context("TCP: error while connecting to the target")?;
            Connection::Tcp(stream)
        } else {
            let socket = UdpSocket::bind(outgoing_bind_addr(env, &spec.target))
                .await
                .context("UDP: unable to bind a socket")?;
            socket
                .connect(spec.target)
                .await
                .context("UDP: error while connecting to the target")?;
            Connection::Udp((socket, None))
        };

        connection
            .send_encoded_packet(&buf)
            .await
            .context("error while sending the query")?;

        let response = loop {
            buf.reset_pos();
            tokio::time::timeout(timeout, connection.read(&mut buf))
                .await
                .context("timed out waiting for a reply")?
                .context("error while reading the response")?;

            let mut reader = ByteBuf::new(&buf);
            let response = match DnsPacket::from_buf(&mut reader) {
                Ok(response) => response,
                Err(error) => {
                    tracing::debug!(target = ?spec.target, "Undecodable reply: {:#}", error);
                    env.unwanted_replies.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            if !reply_matches(query_id, &spec.qinfo, sent_qname, &response) {
                tracing::debug!(target = ?spec.target, "Reply does not match the query, ignoring");
                let total = env.unwanted_replies.fetch_add(1, Ordering::Relaxed) + 1;
                let threshold = env.cfg.unwanted_reply_threshold;
                if threshold != 0 && total >= threshold {
                    tracing::warn!(total, "Unwanted reply threshold reached, flushing the suspect entry");
                    env.msg_cache.remove(&spec.qinfo, false);
                    env.unwanted_replies.store(0, Ordering::Relaxed);
                }
                continue;
            }
            break response;
        };

        // A server that answers FORMERR to an EDNS query predates EDNS
        if use_edns && response.header.response_code == kestrel_dns_lib::ResponseCode::FormatError {
            tracing::debug!(target = ?spec.target, "FORMERR to an EDNS query, retrying without EDNS");
            env.infra_cache.note_edns(&spec.target.ip(), &spec.zone, false, now);
            use_edns = false;
            continue;
        }

        if response.header.truncation {
            if connection.is_tcp() {
                anyhow::bail!("response truncation when using TCP");
            }
            // Retry using TCP
            force_tcp = true;
            continue;
        }

        if use_edns {
            env.infra_cache
                .note_edns(&spec.target.ip(), &spec.zone, response.edns.is_some(), now);
        }

        let rtt = started.elapsed();
        break Ok(ExchangeResult { packet: response, rtt });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_dns_lib::QueryType;

    fn spec_qinfo() -> QueryInfo {
        QueryInfo::new("www.example.com", QueryType::A, 1)
    }

    fn response_for(id: u16, qname: &str, qtype: QueryType) -> DnsPacket<'static> {
        let mut packet = DnsPacket::new();
        packet.header.id = id;
        packet.header.is_response = true;
        packet.header.question_count = 1;
        packet.questions.push(Question::new(qname, qtype, None).into_owned());
        packet
    }

    #[test]
    fn reply_matching_checks_id_and_question() {
        let qinfo = spec_qinfo();
        assert!(reply_matches(7, &qinfo, "www.example.com", &response_for(7, "www.example.com", QueryType::A)));
        // 0x20: matching is on the spelling we sent
        assert!(reply_matches(7, &qinfo, "WwW.example.COM", &response_for(7, "www.EXAMPLE.com", QueryType::A)));
        assert!(!reply_matches(8, &qinfo, "www.example.com", &response_for(7, "www.example.com", QueryType::A)));
        assert!(!reply_matches(7, &qinfo, "www.example.com", &response_for(7, "other.example.com", QueryType::A)));
        assert!(!reply_matches(7, &qinfo, "www.example.com", &response_for(7, "www.example.com", QueryType::AAAA)));

        let mut not_a_response = response_for(7, "www.example.com", QueryType::A);
        not_a_response.header.is_response = false;
        assert!(!reply_matches(7, &qinfo, "www.example.com", &not_a_response));
    }

    #[test]
    fn port_selection_honors_permit_and_avoid() {
        let mut cfg = crate::ResolverConfig::default();
        cfg.outgoing_port_permit.push(10_000..=10_010);
        cfg.outgoing_port_avoid.push(10_005..=10_007);
        let env = ModuleEnv::new(cfg).expect("env");
        for _ in 0..50 {
            let port = pick_outgoing_port(&env);
            assert!((10_000..=10_010).contains(&port));
            assert!(!(10_005..=10_007).contains(&port));
        }
    }
}
