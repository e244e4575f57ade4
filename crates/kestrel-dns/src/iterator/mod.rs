mod delegation;
pub use delegation::{DelegationPoint, DelegationTarget, NsName, TargetState};

use std::net::SocketAddr;
use std::sync::Arc;

use kestrel_dns_lib::utils::{name_in_zone, name_strictly_below, names_equal, parent_name};
use kestrel_dns_lib::{DnsPacket, QueryType, ResourceData, ResourceRecord, ResponseCode};

use crate::cache::{pack_rrsets, CachedReply, PackedRrset, ReplyFlags, RrsetCache, RrsetFlags, SecurityStatus, TrustLevel};
use crate::module::{Module, ModuleEvent, ModuleQstate, ModuleState, OutboundSpec, SubquerySpec};
use crate::util::{now_secs, randomize_qname_case, QueryInfo};
use crate::worker::SubqueryResult;
use crate::{ModuleEnv, MAX_QUERY_RESTARTS, MAX_REFERRALS, MAX_TARGET_RETRIES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterState {
    Init,
    Init2,
    Init3,
    QueryTargets,
    QueryResp,
    PrimeResp,
    Finished,
}

/// Iterator per-query scratch state
pub struct IterQstate {
    pub state: IterState,
    /// The name currently being resolved; diverges from the original qname
    /// after CNAME traversal
    pub qchase: QueryInfo,
    pub dp: Option<DelegationPoint>,
    /// CNAME chain collected so far, prepended to the final answer
    pub an_prepend: Vec<Arc<PackedRrset>>,
    pub ns_prepend: Vec<Arc<PackedRrset>>,
    pub query_restart_count: u8,
    pub referral_count: u8,
    /// Full probe rounds left over the current delegation's target list
    pub retry_rounds_left: u8,
    /// Target (A/AAAA) fetches already spent at the current delegation
    pub targets_fetched: u8,
    pub prime_attempted: bool,
    /// Spelling sent on the wire when 0x20 hardening is active
    pub caps_qname: Option<String>,
    pub last_target: Option<SocketAddr>,
}

impl IterQstate {
    pub fn new(qinfo: &QueryInfo) -> Self {
        IterQstate {
            state: IterState::Init,
            qchase: qinfo.clone(),
            dp: None,
            an_prepend: Vec::new(),
            ns_prepend: Vec::new(),
            query_restart_count: 0,
            referral_count: 0,
            retry_rounds_left: MAX_TARGET_RETRIES,
            targets_fetched: 0,
            prime_attempted: false,
            caps_qname: None,
            last_target: None,
        }
    }

    fn set_dp(&mut self, dp: DelegationPoint) {
        self.dp = Some(dp);
        self.retry_rounds_left = MAX_TARGET_RETRIES;
        self.targets_fetched = 0;
    }
}

/// How a scrubbed upstream response relates to the chased query
#[derive(Debug)]
pub enum ResponseClass {
    /// Positive answer, possibly through an in-packet CNAME chain
    Answer {
        chain: Vec<PackedRrset>,
        authority: Vec<PackedRrset>,
        additional: Vec<PackedRrset>,
        authoritative: bool,
    },
    /// A CNAME whose target the packet does not resolve
    Cname {
        chain: Vec<PackedRrset>,
        target: String,
        authoritative: bool,
    },
    Referral {
        zone: String,
        ns: PackedRrset,
        extra: Vec<PackedRrset>,
    },
    NxDomain {
        authority: Vec<PackedRrset>,
        authoritative: bool,
    },
    NoData {
        authority: Vec<PackedRrset>,
        authoritative: bool,
    },
    /// The server answered something useless for this zone
    Lame,
    /// Malformed or out-of-zone garbage; try the next target
    Throwaway,
}

/// Drops records that fall outside the zone the queried server is
/// responsible for. With harden-glue off, additional-section addresses are
/// kept regardless of bailiwick
fn scrub_sections(
    packet: &DnsPacket<'static>,
    dp_name: &str,
    harden_glue: bool,
) -> (Vec<ResourceRecord<'static>>, Vec<ResourceRecord<'static>>, Vec<ResourceRecord<'static>>) {
    let in_zone = |record: &ResourceRecord<'static>| name_in_zone(&record.name, dp_name);
    let answers = packet.answers.iter().filter(|rr| in_zone(rr)).cloned().collect();
    let authorities = packet.authorities.iter().filter(|rr| in_zone(rr)).cloned().collect();
    let additionals = packet
        .additionals
        .iter()
        .filter(|rr| {
            matches!(
                rr.resource_data.get_query_type(),
                QueryType::A | QueryType::AAAA | QueryType::RRSIG
            )
        })
        .filter(|rr| !harden_glue || in_zone(rr))
        .cloned()
        .collect();
    (answers, authorities, additionals)
}

/// Classifies a scrubbed upstream response against the chased query.
/// `dp_name` is the owner of the delegation the query was sent to
pub fn classify_response(
    qchase: &QueryInfo,
    dp_name: &str,
    is_forward: bool,
    packet: &DnsPacket<'static>,
    harden_glue: bool,
    min_ttl: u64,
    max_ttl: u64,
    now: u64,
) -> ResponseClass {
    match packet.header.response_code {
        ResponseCode::Success | ResponseCode::NameError => {}
        _ => return ResponseClass::Lame,
    }

    let scrub_zone = if is_forward { "" } else { dp_name };
    let (answers, authorities, additionals) = scrub_sections(packet, scrub_zone, harden_glue);
    let authoritative = packet.header.is_authoritative;

    let answer_trust = if authoritative { TrustLevel::AnswerAa } else { TrustLevel::Authority };
    let answer_sets = pack_rrsets(&answers, answer_trust, now, min_ttl, max_ttl);
    let authority_sets = pack_rrsets(&authorities, TrustLevel::Authority, now, min_ttl, max_ttl);
    let mut additional_sets = pack_rrsets(&additionals, TrustLevel::AdditionalAddr, now, min_ttl, max_ttl);
    for set in &mut additional_sets {
        if !matches!(set.rtype, QueryType::A | QueryType::AAAA) {
            set.trust = TrustLevel::AdditionalNoAddr;
        }
    }

    if packet.header.response_code == ResponseCode::NameError {
        return ResponseClass::NxDomain {
            authority: authority_sets,
            authoritative,
        };
    }

    // Follow the CNAME chain inside this packet as far as it goes
    let mut chain: Vec<PackedRrset> = Vec::new();
    let mut current = qchase.qname.clone();
    loop {
        if qchase.qtype == QueryType::ANY {
            let all: Vec<PackedRrset> = answer_sets
                .iter()
                .filter(|set| names_equal(&set.name, &current))
                .cloned()
                .collect();
            if !all.is_empty() {
                chain.extend(all);
                return ResponseClass::Answer {
                    chain,
                    authority: authority_sets,
                    additional: additional_sets,
                    authoritative,
                };
            }
            break;
        }

        if let Some(found) = answer_sets
            .iter()
            .find(|set| names_equal(&set.name, &current) && set.rtype == qchase.qtype)
        {
            chain.push(found.clone());
            return ResponseClass::Answer {
                chain,
                authority: authority_sets,
                additional: additional_sets,
                authoritative,
            };
        }

        if qchase.qtype != QueryType::CNAME {
            if let Some(cname_set) = answer_sets
                .iter()
                .find(|set| names_equal(&set.name, &current) && set.rtype == QueryType::CNAME)
            {
                if let Some(ResourceData::CNAME { cname }) = cname_set.rdatas.first() {
                    let target = cname.to_string();
                    chain.push(cname_set.clone());
                    if chain.len() > MAX_QUERY_RESTARTS as usize {
                        // A CNAME loop inside a single packet
                        return ResponseClass::Throwaway;
                    }
                    current = target;
                    continue;
                }
            }
        }
        break;
    }

    if !chain.is_empty() {
        return ResponseClass::Cname {
            chain,
            target: current,
            authoritative,
        };
    }

    // No answer. A fresh NS set in authority is a referral downwards
    if let Some(ns) = authority_sets.iter().find(|set| set.rtype == QueryType::NS) {
        if is_forward {
            // A forwarder must recurse for us, not refer us away
            return ResponseClass::Lame;
        }
        let zone = ns.name.to_lowercase();
        if !name_strictly_below(&zone, dp_name) || !name_in_zone(&qchase.qname, &zone) {
            // Sideways or upward referrals are loops waiting to happen
            return ResponseClass::Throwaway;
        }
        return ResponseClass::Referral {
            zone,
            ns: ns.clone(),
            extra: authority_sets
                .iter()
                .filter(|set| set.rtype != QueryType::NS)
                .cloned()
                .chain(additional_sets)
                .collect(),
        };
    }

    if authority_sets.iter().any(|set| set.rtype == QueryType::SOA) {
        return ResponseClass::NoData {
            authority: authority_sets,
            authoritative,
        };
    }

    ResponseClass::Lame
}

pub struct IterModule;

impl IterModule {
    pub fn new() -> Self {
        IterModule
    }

    fn closest_cached_ns(&self, qname: &str, class: u16, rrset_cache: &RrsetCache, now: u64) -> Option<Arc<PackedRrset>> {
        let mut name = qname;
        loop {
            if let Some(ns) = rrset_cache.lookup(name, QueryType::NS, class, RrsetFlags::empty(), now) {
                return Some(ns);
            }
            name = parent_name(name)?;
        }
    }

    fn assemble_reply(
        &self,
        rcode: ResponseCode,
        flags: ReplyFlags,
        an: Vec<Arc<PackedRrset>>,
        ns: Vec<Arc<PackedRrset>>,
        ar: Vec<Arc<PackedRrset>>,
        now: u64,
    ) -> CachedReply {
        let an_count = an.len();
        let ns_count = ns.len();
        let ar_count = ar.len();
        let rrsets: Vec<Arc<PackedRrset>> = an.into_iter().chain(ns).chain(ar).collect();
        let expiry = rrsets
            .iter()
            .map(|set| set.expiry)
            .min()
            .unwrap_or(now + 60);
        CachedReply {
            flags,
            rcode,
            an_count,
            ns_count,
            ar_count,
            rrsets,
            expiry,
            stored_at: now,
            security: SecurityStatus::Indeterminate,
        }
    }

    /// Writes freshly packed RRsets through the cache and keeps the entries
    /// the cache decided to hold
    fn cache_sets(&self, sets: Vec<PackedRrset>, env: &ModuleEnv, now: u64) -> Vec<Arc<PackedRrset>> {
        sets.into_iter()
            .map(|set| env.rrset_cache.update(set, now).1)
            .collect()
    }

    fn finish_servfail(&self, qstate: &mut ModuleQstate, why: &str) -> ModuleState {
        tracing::debug!(
            qname = ?qstate.qinfo.qname,
            qtype = ?qstate.qinfo.qtype,
            "Resolution failed: {}",
            why
        );
        qstate.return_rcode = ResponseCode::ServerFailure;
        // A partially resolved CNAME chain still goes back to the client,
        // with the failure indicated in the rcode
        if !qstate.iter.an_prepend.is_empty() {
            let an: Vec<_> = qstate.iter.an_prepend.drain(..).collect();
            qstate.reply = Some(self.assemble_reply(
                ResponseCode::ServerFailure,
                ReplyFlags::empty(),
                an,
                Vec::new(),
                Vec::new(),
                now_secs(),
            ));
        }
        qstate.iter.state = IterState::Finished;
        ModuleState::Error
    }

    fn handle_reply(&self, qstate: &mut ModuleQstate, env: &ModuleEnv, packet: &DnsPacket<'static>, from: SocketAddr) {
        let now = now_secs();

        // 0x20: the reply must echo the exact spelling we sent
        if let Some(expected) = qstate.iter.caps_qname.as_deref() {
            let echoed = packet.questions.first().map(|question| question.qname.as_ref());
            if echoed != Some(expected) {
                tracing::debug!(expected, ?echoed, "Case-randomized QNAME mismatch, dropping reply");
                self.mark_last_target(qstate, TargetState::ProbedBad);
                qstate.iter.state = IterState::QueryTargets;
                return;
            }
        }

        let Some(dp) = qstate.iter.dp.as_ref() else {
            qstate.iter.state = IterState::QueryTargets;
            return;
        };
        let dp_name = dp.name.clone();
        let is_forward = dp.is_forward;

        let class = classify_response(
            &qstate.iter.qchase,
            &dp_name,
            is_forward,
            packet,
            env.cfg.harden_glue,
            env.cfg.cache_min_ttl,
            env.cfg.cache_max_ttl,
            now,
        );

        match class {
            ResponseClass::Answer {
                chain,
                authority,
                additional,
                authoritative,
            } => {
                self.mark_last_target(qstate, TargetState::ProbedGood);
                let an: Vec<_> = qstate
                    .iter
                    .an_prepend
                    .drain(..)
                    .chain(self.cache_sets(chain, env, now))
                    .collect();
                let ns = self.cache_sets(authority, env, now);
                let ar = self.cache_sets(additional, env, now);
                let mut flags = ReplyFlags::empty();
                if authoritative {
                    flags |= ReplyFlags::AA;
                }
                qstate.reply = Some(self.assemble_reply(ResponseCode::Success, flags, an, ns, ar, now));
                qstate.return_rcode = ResponseCode::Success;
                qstate.iter.state = IterState::Finished;
            }
            ResponseClass::Cname { chain, target, .. } => {
                self.mark_last_target(qstate, TargetState::ProbedGood);
                let cached = self.cache_sets(chain, env, now);
                qstate.iter.an_prepend.extend(cached);
                tracing::debug!(
                    qname = ?qstate.iter.qchase.qname,
                    target = ?target,
                    restarts = qstate.iter.query_restart_count + 1,
                    "Following CNAME"
                );
                qstate.iter.qchase.qname = target;
                qstate.iter.query_restart_count += 1;
                qstate.iter.dp = None;
                qstate.iter.state = IterState::Init;
            }
            ResponseClass::Referral { zone, ns, extra } => {
                self.mark_last_target(qstate, TargetState::ProbedGood);
                qstate.iter.referral_count += 1;
                let (_, stored_ns) = env.rrset_cache.update(ns, now);
                self.cache_sets(extra, env, now);
                tracing::debug!(
                    qname = ?qstate.iter.qchase.qname,
                    zone = ?zone,
                    referrals = qstate.iter.referral_count,
                    "Referral to a child zone"
                );
                let dp = DelegationPoint::from_ns_rrset(&stored_ns, &env.rrset_cache, now);
                qstate.iter.set_dp(dp);
                qstate.iter.state = IterState::QueryTargets;
            }
            ResponseClass::NxDomain { authority, authoritative } => {
                self.mark_last_target(qstate, TargetState::ProbedGood);
                let ns = self.cache_sets(authority, env, now);
                let an: Vec<_> = qstate.iter.an_prepend.drain(..).collect();
                let mut flags = ReplyFlags::empty();
                if authoritative {
                    flags |= ReplyFlags::AA;
                }
                qstate.reply = Some(self.assemble_reply(ResponseCode::NameError, flags, an, ns, Vec::new(), now));
                qstate.return_rcode = ResponseCode::NameError;
                qstate.iter.state = IterState::Finished;
            }
            ResponseClass::NoData { authority, authoritative } => {
                self.mark_last_target(qstate, TargetState::ProbedGood);
                let ns = self.cache_sets(authority, env, now);
                let an: Vec<_> = qstate.iter.an_prepend.drain(..).collect();
                let mut flags = ReplyFlags::empty();
                if authoritative {
                    flags |= ReplyFlags::AA;
                }
                qstate.reply = Some(self.assemble_reply(ResponseCode::Success, flags, an, ns, Vec::new(), now));
                qstate.return_rcode = ResponseCode::Success;
                qstate.iter.state = IterState::Finished;
            }
            ResponseClass::Lame => {
                tracing::debug!(target = ?from, zone = ?dp_name, "Lame server");
                env.infra_cache.note_lame(&from.ip(), &dp_name, qstate.iter.qchase.qtype, now);
                self.mark_last_target(qstate, TargetState::ProbedBad);
                qstate.iter.state = IterState::QueryTargets;
            }
            ResponseClass::Throwaway => {
                tracing::debug!(target = ?from, zone = ?dp_name, "Throwaway response");
                self.mark_last_target(qstate, TargetState::ProbedBad);
                qstate.iter.state = IterState::QueryTargets;
            }
        }
    }

    fn mark_last_target(&self, qstate: &mut ModuleQstate, state: TargetState) {
        if let (Some(target), Some(dp)) = (qstate.iter.last_target, qstate.iter.dp.as_mut()) {
            dp.mark_target(target, state);
        }
    }

    /// Drives the state machine until it suspends or finishes
    fn run(&self, qstate: &mut ModuleQstate, env: &ModuleEnv) -> ModuleState {
        let now = now_secs();
        loop {
            match qstate.iter.state {
                IterState::Init => {
                    if qstate.iter.query_restart_count > MAX_QUERY_RESTARTS {
                        return self.finish_servfail(qstate, "query restart budget exceeded");
                    }

                    // Serve straight from the message cache when possible.
                    // Prefetch refreshes skip the lookup once, for the
                    // original qname only
                    let qchase = qstate.iter.qchase.clone();
                    let skip_cache = std::mem::take(&mut qstate.no_cache_lookup);
                    if let Some(cached) = (!skip_cache)
                        .then(|| {
                            env.msg_cache
                                .lookup(&qchase, qstate.flags.checking_disabled, &env.rrset_cache, now)
                        })
                        .flatten()
                    {
                        tracing::debug!(
                            qname = ?qchase.qname,
                            qtype = ?qchase.qtype,
                            remaining_time = cached.ttl_remaining(now),
                            "Cache hit"
                        );
                        if env.cfg.prefetch {
                            let span = cached.expiry.saturating_sub(cached.stored_at);
                            if cached.ttl_remaining(now) * 10 < span {
                                qstate.wants_prefetch = true;
                            }
                        }
                        let prepended = !qstate.iter.an_prepend.is_empty();
                        let an: Vec<_> = qstate
                            .iter
                            .an_prepend
                            .drain(..)
                            .chain(cached.answer_sets().iter().cloned())
                            .collect();
                        let ns = cached.authority_sets().to_vec();
                        let ar = cached.additional_sets().to_vec();
                        let reply = self.assemble_reply(cached.rcode, cached.flags, an, ns, ar, now);
                        qstate.return_rcode = cached.rcode;
                        qstate.security = cached.security;
                        qstate.from_cache = !prepended;
                        qstate.reply = Some(reply);
                        qstate.iter.state = IterState::Finished;
                        continue;
                    }

                    // Closest enclosing cached NS forms the starting delegation
                    let covered_by_zone_config = env.cfg.forward_zone_for(&qchase.qname).is_some()
                        || env.cfg.stub_zone_for(&qchase.qname).is_some();
                    if qstate.iter.dp.is_none() && !covered_by_zone_config {
                        if let Some(ns) =
                            self.closest_cached_ns(&qchase.qname, qchase.qclass, &env.rrset_cache, now)
                        {
                            let dp = DelegationPoint::from_ns_rrset(&ns, &env.rrset_cache, now);
                            qstate.iter.set_dp(dp);
                        } else if qstate.is_priming {
                            // The prime query itself starts from the hints
                            let dp = DelegationPoint::from_hints("", &env.cfg.root_hints, false);
                            qstate.iter.set_dp(dp);
                        } else if !qstate.iter.prime_attempted {
                            // No delegation anywhere: arrange root priming and park
                            qstate.iter.prime_attempted = true;
                            qstate.subqueries.push(SubquerySpec {
                                qinfo: QueryInfo::new("", QueryType::NS, qchase.qclass),
                                prime: true,
                                skip_validation: false,
                            });
                            qstate.iter.state = IterState::PrimeResp;
                            return ModuleState::WaitSubquery;
                        } else {
                            return self.finish_servfail(qstate, "root priming failed");
                        }
                    }
                    qstate.iter.state = IterState::Init2;
                }
                IterState::Init2 => {
                    // Stub zones override the cached delegation
                    if let Some(stub) = env.cfg.stub_zone_for(&qstate.iter.qchase.qname) {
                        let replace = qstate
                            .iter
                            .dp
                            .as_ref()
                            .map_or(true, |dp| !name_in_zone(&dp.name, &stub.name));
                        if replace {
                            let mut dp = DelegationPoint::from_hints(stub.name.clone(), &stub.addrs, false);
                            for host in &stub.hosts {
                                dp.add_ns(host);
                            }
                            dp.merge_cached_addresses(&env.rrset_cache, now);
                            qstate.iter.set_dp(dp);
                        }
                    }
                    qstate.iter.state = IterState::Init3;
                }
                IterState::Init3 => {
                    // Forward zones override everything below them
                    if let Some(forward) = env.cfg.forward_zone_for(&qstate.iter.qchase.qname) {
                        let dp = DelegationPoint::from_hints(forward.name.clone(), &forward.addrs, true);
                        qstate.iter.set_dp(dp);
                    }
                    qstate.iter.state = IterState::QueryTargets;
                }
                IterState::QueryTargets => {
                    if qstate.iter.referral_count > MAX_REFERRALS {
                        return self.finish_servfail(qstate, "referral budget exceeded");
                    }
                    if qstate.iter.dp.is_none() {
                        qstate.iter.state = IterState::Init;
                        continue;
                    }

                    let cfg = &env.cfg;
                    let (selected, missing, usable, has_targets, dp_name) = {
                        let dp = qstate.iter.dp.as_ref().expect("checked above");
                        (
                            dp.select_target(&env.infra_cache, now, cfg.do_ip4, cfg.do_ip6, |addr| {
                                cfg.address_is_denied(addr)
                            }),
                            dp.missing_targets(cfg.do_ip4, cfg.do_ip6),
                            dp.usable_target_count(now),
                            !dp.targets.is_empty(),
                            dp.name.clone(),
                        )
                    };

                    if let Some(target) = selected {
                        let dnssec_ok = !env.anchors.is_empty() || qstate.flags.dnssec_ok;
                        let caps_qname = cfg
                            .use_caps_for_id
                            .then(|| randomize_qname_case(&qstate.iter.qchase.qname));
                        qstate.iter.caps_qname = caps_qname.clone();
                        qstate.iter.last_target = Some(target);
                        if let Some(dp) = qstate.iter.dp.as_mut() {
                            dp.mark_target(target, TargetState::InFlight);
                        }
                        qstate.outbound = Some(OutboundSpec {
                            qinfo: qstate.iter.qchase.clone(),
                            target,
                            zone: dp_name,
                            dnssec_ok,
                            caps_qname,
                        });
                        qstate.iter.state = IterState::QueryResp;
                        return ModuleState::WaitReply;
                    }

                    // No usable address. Fetch missing NS addresses if the
                    // per-depth policy still allows it
                    let fetch_budget = cfg
                        .target_fetch_limit(qstate.depth)
                        .saturating_sub(qstate.iter.targets_fetched);
                    if !missing.is_empty() && fetch_budget > 0 {
                        let mut scheduled = 0u8;
                        for (name, want_v4, want_v6) in missing {
                            if scheduled >= fetch_budget {
                                break;
                            }
                            if want_v4 {
                                qstate.subqueries.push(SubquerySpec {
                                    qinfo: QueryInfo::new(name.clone(), QueryType::A, qstate.iter.qchase.qclass),
                                    prime: false,
                                    skip_validation: false,
                                });
                            }
                            if want_v6 {
                                qstate.subqueries.push(SubquerySpec {
                                    qinfo: QueryInfo::new(name.clone(), QueryType::AAAA, qstate.iter.qchase.qclass),
                                    prime: false,
                                    skip_validation: false,
                                });
                            }
                            if let Some(dp) = qstate.iter.dp.as_mut() {
                                dp.mark_ns_fetched(&name, want_v4, want_v6);
                            }
                            scheduled += 1;
                        }
                        if scheduled > 0 {
                            qstate.iter.targets_fetched += scheduled;
                            return ModuleState::WaitSubquery;
                        }
                    }

                    // Another full probe round over targets we already tried
                    if qstate.iter.retry_rounds_left > 0 && usable == 0 && has_targets {
                        qstate.iter.retry_rounds_left -= 1;
                        if let Some(dp) = qstate.iter.dp.as_mut() {
                            dp.reset_probes();
                        }
                        continue;
                    }

                    return self.finish_servfail(qstate, "all targets and retries exhausted");
                }
                IterState::QueryResp | IterState::PrimeResp => {
                    // Still waiting on the worker; operate() re-enters with
                    // the corresponding event
                    return if qstate.iter.state == IterState::QueryResp {
                        ModuleState::WaitReply
                    } else {
                        ModuleState::WaitSubquery
                    };
                }
                IterState::Finished => {
                    return if qstate.return_rcode == ResponseCode::ServerFailure && qstate.reply.is_none() {
                        ModuleState::Error
                    } else {
                        ModuleState::Finished
                    };
                }
            }
        }
    }
}

impl Default for IterModule {
    fn default() -> Self {
        IterModule::new()
    }
}

impl Module for IterModule {
    fn name(&self) -> &'static str {
        "iterator"
    }

    fn operate(&self, qstate: &mut ModuleQstate, event: ModuleEvent<'_>, env: &ModuleEnv) -> ModuleState {
        match event {
            ModuleEvent::NewQuery | ModuleEvent::Pass => self.run(qstate, env),
            ModuleEvent::Reply { packet, from, rtt: _ } => {
                self.handle_reply(qstate, env, packet, from);
                self.run(qstate, env)
            }
            ModuleEvent::SubqueryDone => {
                match qstate.iter.state {
                    IterState::PrimeResp => {
                        // The prime populated the caches; retry from scratch
                        qstate.iter.state = IterState::Init;
                    }
                    _ => {
                        // Target fetches completed; pick up their addresses
                        let now = now_secs();
                        if let Some(dp) = qstate.iter.dp.as_mut() {
                            dp.merge_cached_addresses(&env.rrset_cache, now);
                        }
                        qstate.iter.state = IterState::QueryTargets;
                    }
                }
                self.run(qstate, env)
            }
            ModuleEvent::Timeout => {
                tracing::debug!(
                    qname = ?qstate.iter.qchase.qname,
                    target = ?qstate.iter.last_target,
                    "Outbound query timed out"
                );
                self.mark_last_target(qstate, TargetState::ProbedBad);
                qstate.iter.state = IterState::QueryTargets;
                self.run(qstate, env)
            }
            ModuleEvent::Error => ModuleState::Error,
        }
    }

    fn inform_super(&self, result: &SubqueryResult, super_qstate: &mut ModuleQstate, _env: &ModuleEnv) {
        // Address fetches feed the parent's delegation point directly; the
        // RRset cache merge on SubqueryDone handles the rest
        let Some(reply) = result.reply.as_ref() else {
            return;
        };
        let Some(dp) = super_qstate.iter.dp.as_mut() else {
            return;
        };
        for set in reply.answer_sets() {
            if !names_equal(&set.name, &result.qinfo.qname) {
                continue;
            }
            for rdata in &set.rdatas {
                match rdata {
                    ResourceData::A { address } => dp.add_target(&result.qinfo.qname, std::net::IpAddr::V4(*address)),
                    ResourceData::AAAA { address } => dp.add_target(&result.qinfo.qname, std::net::IpAddr::V6(*address)),
                    _ => {}
                }
            }
        }
    }

    fn clear(&self, qstate: &mut ModuleQstate) {
        qstate.iter = IterQstate::new(&qstate.qinfo);
    }

    fn get_mem(&self, qstate: &ModuleQstate) -> usize {
        std::mem::size_of::<IterQstate>()
            + qstate
                .iter
                .dp
                .as_ref()
                .map(|dp| dp.targets.len() * std::mem::size_of::<DelegationTarget>())
                .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_dns_lib::{DnsHeader, Question};

    fn response(
        qname: &str,
        qtype: QueryType,
        rcode: ResponseCode,
        authoritative: bool,
        answers: Vec<ResourceRecord<'static>>,
        authorities: Vec<ResourceRecord<'static>>,
        additionals: Vec<ResourceRecord<'static>>,
    ) -> DnsPacket<'static> {
        let mut packet = DnsPacket {
            header: DnsHeader {
                is_response: true,
                is_authoritative: authoritative,
                response_code: rcode,
                question_count: 1,
                answer_rr_count: answers.len() as u16,
                authority_rr_count: authorities.len() as u16,
                additional_rr_count: additionals.len() as u16,
                ..Default::default()
            },
            ..Default::default()
        };
        packet.questions.push(Question::new(qname, qtype, None).into_owned());
        packet.answers = answers;
        packet.authorities = authorities;
        packet.additionals = additionals;
        packet
    }

    fn a_rr(name: &str, addr: &str) -> ResourceRecord<'static> {
        ResourceRecord::new(
            name.to_string(),
            ResourceData::A {
                address: addr.parse().unwrap(),
            },
            Some(300),
            None,
        )
    }

    fn ns_rr(zone: &str, ns: &str) -> ResourceRecord<'static> {
        ResourceRecord::new(
            zone.to_string(),
            ResourceData::NS {
                ns_domain_name: ns.to_string().into(),
            },
            Some(3600),
            None,
        )
    }

    fn soa_rr(zone: &str) -> ResourceRecord<'static> {
        ResourceRecord::new(
            zone.to_string(),
            ResourceData::SOA {
                mname: format!("ns1.{}", zone).into(),
                rname: format!("hostmaster.{}", zone).into(),
                serial: 1,
                refresh: 7200,
                retry: 3600,
                expire: 1_209_600,
                minimum: 300,
            },
            Some(300),
            None,
        )
    }

    fn cname_rr(name: &str, target: &str) -> ResourceRecord<'static> {
        ResourceRecord::new(
            name.to_string(),
            ResourceData::CNAME {
                cname: target.to_string().into(),
            },
            Some(300),
            None,
        )
    }

    fn qinfo(name: &str, qtype: QueryType) -> QueryInfo {
        QueryInfo::new(name, qtype, 1)
    }

    fn classify(qchase: &QueryInfo, dp: &str, packet: &DnsPacket<'static>) -> ResponseClass {
        classify_response(qchase, dp, false, packet, true, 0, 86_400, 1000)
    }

    #[test]
    fn positive_answer_is_classified() {
        let packet = response(
            "www.example.com",
            QueryType::A,
            ResponseCode::Success,
            true,
            vec![a_rr("www.example.com", "192.0.2.1")],
            vec![],
            vec![],
        );
        let class = classify(&qinfo("www.example.com", QueryType::A), "example.com", &packet);
        match class {
            ResponseClass::Answer { chain, authoritative, .. } => {
                assert!(authoritative);
                assert_eq!(chain.len(), 1);
                assert_eq!(chain[0].trust, TrustLevel::AnswerAa);
            }
            other => panic!("expected Answer, got {:?}", other),
        }
    }

    #[test]
    fn in_packet_cname_chain_is_followed_to_the_answer() {
        let packet = response(
            "cname.example.com",
            QueryType::A,
            ResponseCode::Success,
            true,
            vec![
                cname_rr("cname.example.com", "target.example.com"),
                a_rr("target.example.com", "192.0.2.7"),
            ],
            vec![],
            vec![],
        );
        let class = classify(&qinfo("cname.example.com", QueryType::A), "example.com", &packet);
        match class {
            ResponseClass::Answer { chain, .. } => {
                assert_eq!(chain.len(), 2);
                assert_eq!(chain[0].rtype, QueryType::CNAME);
                assert_eq!(chain[1].rtype, QueryType::A);
            }
            other => panic!("expected Answer, got {:?}", other),
        }
    }

    #[test]
    fn dangling_cname_asks_for_a_restart() {
        let packet = response(
            "cname.example.com",
            QueryType::A,
            ResponseCode::Success,
            true,
            vec![cname_rr("cname.example.com", "elsewhere.example.net")],
            vec![],
            vec![],
        );
        let class = classify(&qinfo("cname.example.com", QueryType::A), "example.com", &packet);
        match class {
            ResponseClass::Cname { target, chain, .. } => {
                assert_eq!(target, "elsewhere.example.net");
                assert_eq!(chain.len(), 1);
            }
            other => panic!("expected Cname, got {:?}", other),
        }
    }

    #[test]
    fn downward_referral_is_accepted() {
        let packet = response(
            "www.example.com",
            QueryType::A,
            ResponseCode::Success,
            false,
            vec![],
            vec![ns_rr("example.com", "ns1.example.com")],
            vec![a_rr("ns1.example.com", "192.0.2.53")],
        );
        let class = classify(&qinfo("www.example.com", QueryType::A), "com", &packet);
        match class {
            ResponseClass::Referral { zone, ns, extra } => {
                assert_eq!(zone, "example.com");
                assert_eq!(ns.rtype, QueryType::NS);
                // Glue came along
                assert!(extra.iter().any(|set| set.rtype == QueryType::A));
            }
            other => panic!("expected Referral, got {:?}", other),
        }
    }

    #[test]
    fn sideways_referral_is_a_throwaway() {
        // A referral back to the same zone must not loop
        let packet = response(
            "www.example.com",
            QueryType::A,
            ResponseCode::Success,
            false,
            vec![],
            vec![ns_rr("example.com", "ns1.example.com")],
            vec![],
        );
        let class = classify(&qinfo("www.example.com", QueryType::A), "example.com", &packet);
        assert!(matches!(class, ResponseClass::Throwaway));
    }

    #[test]
    fn referral_for_unrelated_name_is_a_throwaway() {
        // A com server referring us to a sibling zone the qname is not under
        let packet = response(
            "www.example.com",
            QueryType::A,
            ResponseCode::Success,
            false,
            vec![],
            vec![ns_rr("other.com", "ns1.other.com")],
            vec![],
        );
        let class = classify(&qinfo("www.example.com", QueryType::A), "com", &packet);
        assert!(matches!(class, ResponseClass::Throwaway));
    }

    #[test]
    fn out_of_zone_referral_is_scrubbed_to_lame() {
        // NS material outside the serving zone never survives the scrub
        let packet = response(
            "www.example.com",
            QueryType::A,
            ResponseCode::Success,
            false,
            vec![],
            vec![ns_rr("example.org", "ns1.example.org")],
            vec![],
        );
        let class = classify(&qinfo("www.example.com", QueryType::A), "com", &packet);
        assert!(matches!(class, ResponseClass::Lame));
    }

    #[test]
    fn nxdomain_and_nodata_are_final() {
        let packet = response(
            "missing.example.com",
            QueryType::A,
            ResponseCode::NameError,
            true,
            vec![],
            vec![soa_rr("example.com")],
            vec![],
        );
        let class = classify(&qinfo("missing.example.com", QueryType::A), "example.com", &packet);
        assert!(matches!(class, ResponseClass::NxDomain { .. }));

        let packet = response(
            "www.example.com",
            QueryType::AAAA,
            ResponseCode::Success,
            true,
            vec![],
            vec![soa_rr("example.com")],
            vec![],
        );
        let class = classify(&qinfo("www.example.com", QueryType::AAAA), "example.com", &packet);
        assert!(matches!(class, ResponseClass::NoData { .. }));
    }

    #[test]
    fn refused_is_lame() {
        let packet = response(
            "www.example.com",
            QueryType::A,
            ResponseCode::Refused,
            false,
            vec![],
            vec![],
            vec![],
        );
        let class = classify(&qinfo("www.example.com", QueryType::A), "example.com", &packet);
        assert!(matches!(class, ResponseClass::Lame));
    }

    #[test]
    fn out_of_zone_records_are_scrubbed() {
        // The answer pretends to also resolve an unrelated name
        let packet = response(
            "www.example.com",
            QueryType::A,
            ResponseCode::Success,
            true,
            vec![a_rr("www.example.com", "192.0.2.1"), a_rr("victim.example.org", "10.0.0.1")],
            vec![],
            vec![a_rr("out.of.zone.net", "10.0.0.2")],
        );
        let (answers, _, additionals) = scrub_sections(&packet, "example.com", true);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].name, "www.example.com");
        assert!(additionals.is_empty());

        // With harden-glue off, the additional address survives
        let (_, _, additionals) = scrub_sections(&packet, "example.com", false);
        assert_eq!(additionals.len(), 1);
    }

    #[test]
    fn forwarder_referral_is_lame() {
        let packet = response(
            "www.example.com",
            QueryType::A,
            ResponseCode::Success,
            false,
            vec![],
            vec![ns_rr("example.com", "ns1.example.com")],
            vec![],
        );
        let class = classify_response(
            &qinfo("www.example.com", QueryType::A),
            "",
            true,
            &packet,
            true,
            0,
            86_400,
            1000,
        );
        assert!(matches!(class, ResponseClass::Lame));
    }
}
