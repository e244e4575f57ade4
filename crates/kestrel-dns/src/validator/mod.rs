pub mod anchors;
pub mod nsec;
pub mod sigverify;

use std::sync::Arc;

use kestrel_dns_lib::utils::{name_in_zone, parent_name};
use kestrel_dns_lib::{QueryType, ResourceData, ResponseCode};

use crate::cache::{CachedReply, KeyEntry, KeyState, PackedRrset, ReplyFlags, RrsetCache, RrsetRef, SecurityStatus};
use crate::module::{Module, ModuleEvent, ModuleQstate, ModuleState, SubquerySpec};
use crate::util::{now_secs, QueryInfo};
use crate::worker::SubqueryResult;
use crate::ModuleEnv;
use anchors::TrustAnchor;
use nsec::{max_nsec3_iterations, nsec3_proves_name_error, nsec3_proves_nodata, nsec_proves_name_error, nsec_proves_nodata};
use sigverify::{ds_matches_key, verify_rrset, KeyView, VerifyOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValState {
    Init,
    FindKey,
    Validate,
    Finished,
}

/// The shape of the reply being validated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplySubtype {
    #[default]
    Positive,
    Referral,
    Cname,
    NxDomain,
    NoData,
    CnameNoAnswer,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingFetch {
    Ds,
    Dnskey,
}

/// Validator per-query scratch state
pub struct ValQstate {
    pub state: ValState,
    pub subtype: ReplySubtype,
    /// The zone whose keys must sign the chased reply
    signer: String,
    /// Most specific configured anchor above the signer
    anchor: Option<TrustAnchor>,
    /// Zone currently being fetched while walking down the chain
    pending_zone: String,
    pending: Option<PendingFetch>,
    /// Validated DS RDATAs for the zone whose DNSKEY is being fetched
    pending_ds: Vec<ResourceData<'static>>,
    /// Stashed by `inform_super` for the next `SubqueryDone`
    pub sub_result: Option<SubqueryResult>,
    key_entry: Option<Arc<KeyEntry>>,
}

impl ValQstate {
    pub fn new() -> Self {
        ValQstate {
            state: ValState::Init,
            subtype: ReplySubtype::Positive,
            signer: String::new(),
            anchor: None,
            pending_zone: String::new(),
            pending: None,
            pending_ds: Vec::new(),
            sub_result: None,
            key_entry: None,
        }
    }
}

impl Default for ValQstate {
    fn default() -> Self {
        ValQstate::new()
    }
}

/// The validator's notion of "now": the configured override date wins
fn val_now(env: &ModuleEnv) -> u64 {
    if env.cfg.val_override_date != 0 {
        env.cfg.val_override_date
    } else {
        now_secs()
    }
}

fn classify_reply(qinfo: &QueryInfo, reply: &CachedReply) -> ReplySubtype {
    if reply.rcode == ResponseCode::NameError {
        return ReplySubtype::NxDomain;
    }
    if qinfo.qtype == QueryType::ANY {
        return ReplySubtype::Any;
    }
    if reply.an_count > 0 {
        let last = &reply.answer_sets()[reply.an_count - 1];
        if last.rtype == QueryType::CNAME && qinfo.qtype != QueryType::CNAME {
            return ReplySubtype::CnameNoAnswer;
        }
        if reply.answer_sets().iter().any(|set| set.rtype == QueryType::CNAME) && qinfo.qtype != QueryType::CNAME {
            return ReplySubtype::Cname;
        }
        return ReplySubtype::Positive;
    }
    let has_ns = reply.authority_sets().iter().any(|set| set.rtype == QueryType::NS);
    let has_soa = reply.authority_sets().iter().any(|set| set.rtype == QueryType::SOA);
    if has_ns && !has_soa {
        ReplySubtype::Referral
    } else {
        ReplySubtype::NoData
    }
}

/// The signer name of the RRset being validated: the RRSIG signer of the
/// first signed answer set, or of the authority material for negatives
fn find_signer(reply: &CachedReply) -> Option<String> {
    let from_sets = |sets: &[Arc<PackedRrset>]| {
        sets.iter().find_map(|set| {
            set.rrsigs.iter().find_map(|rrsig| match rrsig {
                ResourceData::RRSIG { signer_name, .. } => Some(signer_name.to_lowercase()),
                _ => None,
            })
        })
    };
    from_sets(reply.answer_sets()).or_else(|| from_sets(reply.authority_sets()))
}

/// The next zone cut on the walk from `from` down towards `target`
fn next_zone_down(from: &str, target: &str) -> Option<String> {
    if from.eq_ignore_ascii_case(target) {
        return None;
    }
    let mut candidate = target.to_string();
    loop {
        let parent = parent_name(&candidate)?.to_string();
        if parent.eq_ignore_ascii_case(from) {
            return Some(candidate);
        }
        candidate = parent;
    }
}

pub struct ValModule;

impl ValModule {
    pub fn new() -> Self {
        ValModule
    }

    fn finish(&self, qstate: &mut ModuleQstate, security: SecurityStatus, env: &ModuleEnv, reason: &str) -> ModuleState {
        let now = val_now(env);
        qstate.security = security;
        qstate.val.state = ValState::Finished;

        match security {
            SecurityStatus::Secure => {
                if let Some(reply) = qstate.reply.as_mut() {
                    reply.security = SecurityStatus::Secure;
                    reply.flags |= ReplyFlags::AD;
                }
            }
            SecurityStatus::Bogus => {
                tracing::debug!(
                    qname = ?qstate.qinfo.qname,
                    qtype = ?qstate.qinfo.qtype,
                    "Validation failed: {}",
                    reason
                );
                env.neg_cache
                    .insert(&qstate.qinfo, reason.to_string(), now + env.cfg.bogus_ttl);
                if let Some(reply) = qstate.reply.as_mut() {
                    reply.security = SecurityStatus::Bogus;
                }
                if env.cfg.val_permissive_mode {
                    // Serve the unvalidated answer, but never with AD
                    qstate.security = SecurityStatus::Indeterminate;
                } else {
                    qstate.return_rcode = ResponseCode::ServerFailure;
                }
            }
            other => {
                if let Some(reply) = qstate.reply.as_mut() {
                    reply.security = other;
                }
            }
        }
        ModuleState::Finished
    }

    fn init(&self, qstate: &mut ModuleQstate, env: &ModuleEnv) -> ModuleState {
        let now = val_now(env);

        if qstate.skip_validation {
            return self.finish(qstate, qstate.security, env, "validation skipped");
        }
        if qstate.flags.checking_disabled && !env.cfg.ignore_cd_flag {
            return self.finish(qstate, SecurityStatus::Indeterminate, env, "cd flag set");
        }
        if env.anchors.is_empty() {
            return self.finish(qstate, SecurityStatus::Indeterminate, env, "no trust anchors");
        }
        if qstate.from_cache && qstate.security != SecurityStatus::Indeterminate {
            // The cached reply already carries its validated status
            return self.finish(qstate, qstate.security, env, "cached status");
        }
        if qstate.return_rcode == ResponseCode::ServerFailure || qstate.reply.is_none() {
            return self.finish(qstate, SecurityStatus::Indeterminate, env, "nothing to validate");
        }

        // A recent bogus verdict for the same question is not recomputed
        if let Some(neg) = env.neg_cache.get(&qstate.qinfo, now) {
            qstate.security = SecurityStatus::Bogus;
            if env.cfg.val_permissive_mode {
                qstate.security = SecurityStatus::Indeterminate;
            } else {
                qstate.return_rcode = ResponseCode::ServerFailure;
                qstate.reply = None;
            }
            tracing::debug!(
                qname = ?qstate.qinfo.qname,
                reason = ?neg.reason,
                "Bogus verdict still cached, refusing to revalidate"
            );
            qstate.val.state = ValState::Finished;
            return ModuleState::Finished;
        }

        if env.cfg.domain_is_insecure(&qstate.qinfo.qname) {
            return self.finish(qstate, SecurityStatus::Insecure, env, "domain-insecure");
        }

        let reply = qstate.reply.as_ref().expect("checked above");
        qstate.val.subtype = classify_reply(&qstate.qinfo, reply);

        let signer = match find_signer(reply) {
            Some(signer) => signer,
            None => {
                // Unsigned reply. If no anchor governs the name this is
                // simply indeterminate; under an anchor we must prove the
                // zone insecure before accepting it
                if !env.anchors.covers(&qstate.qinfo.qname) {
                    return self.finish(qstate, SecurityStatus::Indeterminate, env, "outside any anchor");
                }
                if !env.cfg.harden_dnssec_stripped {
                    return self.finish(qstate, SecurityStatus::Insecure, env, "unsigned, hardening off");
                }
                qstate.iter.qchase.qname.to_lowercase()
            }
        };

        let Some(anchor) = env.anchors.closest_ancestor(&signer) else {
            return self.finish(qstate, SecurityStatus::Indeterminate, env, "no anchor above signer");
        };
        qstate.val.signer = signer;
        qstate.val.anchor = Some(anchor);
        qstate.val.state = ValState::FindKey;
        self.findkey(qstate, env)
    }

    fn push_key_fetch(&self, qstate: &mut ModuleQstate, zone: &str, kind: PendingFetch) -> ModuleState {
        let qtype = match kind {
            PendingFetch::Ds => QueryType::DS,
            PendingFetch::Dnskey => QueryType::DNSKEY,
        };
        qstate.val.pending_zone = zone.to_string();
        qstate.val.pending = Some(kind);
        qstate.subqueries.push(SubquerySpec {
            qinfo: QueryInfo::new(zone, qtype, qstate.qinfo.qclass),
            prime: true,
            skip_validation: true,
        });
        ModuleState::WaitSubquery
    }

    /// Walks DS -> DNSKEY links down from the trust anchor towards the
    /// signer until the signer's key entry is established
    fn findkey(&self, qstate: &mut ModuleQstate, env: &ModuleEnv) -> ModuleState {
        let now = val_now(env);
        let signer = qstate.val.signer.clone();
        let anchor = qstate.val.anchor.clone().expect("set in init");

        loop {
            // Done once the signer zone has a usable key entry
            if let Some(entry) = env.key_cache.get(&signer, qstate.qinfo.qclass, now) {
                match &entry.state {
                    KeyState::Good(_) => {
                        qstate.val.key_entry = Some(entry);
                        qstate.val.state = ValState::Validate;
                        return self.validate(qstate, env);
                    }
                    KeyState::Insecure => {
                        return self.finish(qstate, SecurityStatus::Insecure, env, "zone proved insecure");
                    }
                    KeyState::Null => {
                        return self.finish(qstate, SecurityStatus::Bogus, env, "key prime recently failed");
                    }
                }
            }

            // Deepest zone from the anchor towards the signer that already
            // has a validated key entry
            let mut chain_zone: Option<String> = None;
            let mut walk = signer.clone();
            loop {
                if let Some(entry) = env.key_cache.get(&walk, qstate.qinfo.qclass, now) {
                    match &entry.state {
                        KeyState::Good(_) => {
                            chain_zone = Some(walk.clone());
                        }
                        KeyState::Insecure => {
                            return self.finish(qstate, SecurityStatus::Insecure, env, "chain zone proved insecure");
                        }
                        KeyState::Null => {
                            return self.finish(qstate, SecurityStatus::Bogus, env, "chain key prime recently failed");
                        }
                    }
                    break;
                }
                if walk.eq_ignore_ascii_case(&anchor.name) {
                    break;
                }
                match parent_name(&walk) {
                    Some(parent) if name_in_zone(parent, &anchor.name) => walk = parent.to_string(),
                    _ => break,
                }
            }

            let Some(chain_zone) = chain_zone else {
                // Establish the anchor zone itself first
                if !anchor.dnskey_set.is_empty() {
                    // Directly trusted keys need no prime
                    env.key_cache.insert(KeyEntry {
                        name: anchor.name.clone(),
                        class: qstate.qinfo.qclass,
                        state: KeyState::Good(anchor.dnskey_set.clone()),
                        expiry: now + 3600,
                    });
                    continue;
                }
                qstate.val.pending_ds = anchor.ds_set.clone();
                return self.push_key_fetch(qstate, &anchor.name.clone(), PendingFetch::Dnskey);
            };

            // Step one zone cut further down
            let Some(child) = next_zone_down(&chain_zone, &signer) else {
                // chain_zone == signer, handled at the top of the loop
                continue;
            };
            return self.push_key_fetch(qstate, &child, PendingFetch::Ds);
        }
    }

    /// Handles a completed DS/DNSKEY fetch and resumes the chain walk
    fn findkey_subquery_done(&self, qstate: &mut ModuleQstate, env: &ModuleEnv) -> ModuleState {
        let now = val_now(env);
        let Some(kind) = qstate.val.pending.take() else {
            return self.findkey(qstate, env);
        };
        let zone = qstate.val.pending_zone.clone();
        let result = qstate.val.sub_result.take();
        let reply = result.as_ref().and_then(|result| result.reply.as_ref());

        let parent_keys: Vec<ResourceData<'static>> = match kind {
            PendingFetch::Ds => {
                let parent = parent_name(&zone).unwrap_or("").to_string();
                let mut keys = Vec::new();
                let mut walk = parent;
                loop {
                    if let Some(entry) = env.key_cache.get(&walk, qstate.qinfo.qclass, now) {
                        keys = entry.dnskeys().to_vec();
                        break;
                    }
                    match parent_name(&walk) {
                        Some(up) => walk = up.to_string(),
                        None => break,
                    }
                }
                keys
            }
            PendingFetch::Dnskey => Vec::new(),
        };

        match kind {
            PendingFetch::Ds => {
                let Some(reply) = reply else {
                    return self.finish(qstate, SecurityStatus::Bogus, env, "DS fetch failed");
                };

                // Positive DS answer: verify it with the parent zone's keys
                if let Some(ds_set) = reply
                    .answer_sets()
                    .iter()
                    .find(|set| set.rtype == QueryType::DS && set.name.eq_ignore_ascii_case(&zone))
                {
                    let outcome = verify_rrset(ds_set, &parent_keys, now, env.cfg.val_sig_skew_min, env.cfg.val_sig_skew_max);
                    if outcome != VerifyOutcome::Secure {
                        return self.finish(qstate, SecurityStatus::Bogus, env, "DS RRset failed validation");
                    }
                    let supported = ds_set.rdatas.iter().any(|ds| {
                        matches!(ds, ResourceData::DS { algorithm, .. } if sigverify::algorithm_supported(*algorithm))
                    });
                    if !supported {
                        // A DS pointing only at unknown algorithms makes the
                        // child unverifiable, not bogus
                        env.key_cache.insert(KeyEntry {
                            name: zone.clone(),
                            class: qstate.qinfo.qclass,
                            state: KeyState::Insecure,
                            expiry: ds_set.expiry,
                        });
                        return self.finish(qstate, SecurityStatus::Insecure, env, "DS algorithms unsupported");
                    }
                    qstate.val.pending_ds = ds_set.rdatas.clone();
                    return self.push_key_fetch(qstate, &zone, PendingFetch::Dnskey);
                }

                // Negative answer: a validated NSEC/NSEC3 proof of no DS
                // makes the delegation insecure
                let authority: Vec<&PackedRrset> = reply.authority_sets().iter().map(Arc::as_ref).collect();
                let nsec_sets: Vec<&PackedRrset> = authority
                    .iter()
                    .copied()
                    .filter(|set| set.rtype == QueryType::NSEC)
                    .collect();
                let nsec3_sets: Vec<&PackedRrset> = authority
                    .iter()
                    .copied()
                    .filter(|set| set.rtype == QueryType::NSEC3)
                    .collect();

                let mut proof_sets_valid = !nsec_sets.is_empty() || !nsec3_sets.is_empty();
                for set in nsec_sets.iter().chain(nsec3_sets.iter()) {
                    if verify_rrset(set, &parent_keys, now, env.cfg.val_sig_skew_min, env.cfg.val_sig_skew_max)
                        != VerifyOutcome::Secure
                    {
                        proof_sets_valid = false;
                        break;
                    }
                }

                if proof_sets_valid {
                    let smallest_key_bits = parent_keys
                        .iter()
                        .filter_map(|key| KeyView::from_rdata(key).map(|view| view.size_bits()))
                        .min()
                        .unwrap_or(0);
                    if max_nsec3_iterations(&nsec3_sets) > env.cfg.nsec3_max_iterations(smallest_key_bits) {
                        return self.finish(qstate, SecurityStatus::Insecure, env, "NSEC3 iterations over limit");
                    }

                    let no_ds_proven = nsec_proves_nodata(&nsec_sets, &zone, QueryType::DS)
                        || nsec3_proves_nodata(&nsec3_sets, &zone, QueryType::DS)
                        || nsec3_sets.iter().any(|set| {
                            // Opt-out span over the delegation
                            set.rdatas
                                .iter()
                                .any(|rdata| matches!(rdata, ResourceData::NSEC3 { flags, .. } if flags & 1 != 0))
                        });
                    if no_ds_proven {
                        env.key_cache.insert(KeyEntry {
                            name: zone.clone(),
                            class: qstate.qinfo.qclass,
                            state: KeyState::Insecure,
                            expiry: reply.expiry.max(now + 60),
                        });
                        return self.finish(qstate, SecurityStatus::Insecure, env, "no-DS proven");
                    }
                }

                self.finish(qstate, SecurityStatus::Bogus, env, "DS absence not proven")
            }
            PendingFetch::Dnskey => {
                let anchor = qstate.val.anchor.clone().expect("set in init");
                let at_anchor = zone.eq_ignore_ascii_case(&anchor.name);

                let dnskey_set = reply.and_then(|reply| {
                    reply
                        .answer_sets()
                        .iter()
                        .find(|set| set.rtype == QueryType::DNSKEY && set.name.eq_ignore_ascii_case(&zone))
                        .cloned()
                });
                let Some(dnskey_set) = dnskey_set else {
                    if at_anchor {
                        env.key_cache.insert_null(&zone, qstate.qinfo.qclass, now);
                        return self.finish(qstate, SecurityStatus::Bogus, env, "trust anchor prime failed");
                    }
                    return self.finish(qstate, SecurityStatus::Bogus, env, "DNSKEY fetch failed");
                };

                // Keys the DS set (or the anchor itself) vouches for
                let ds_set = qstate.val.pending_ds.clone();
                let mut trusted: Vec<ResourceData<'static>> = Vec::new();
                for key_rdata in &dnskey_set.rdatas {
                    let Some(view) = KeyView::from_rdata(key_rdata) else {
                        continue;
                    };
                    let ds_backed = ds_set.iter().any(|ds| ds_matches_key(ds, &zone, &view));
                    let anchor_backed = at_anchor && anchor.dnskey_set.iter().any(|anchor_key| anchor_key == key_rdata);
                    if ds_backed || anchor_backed {
                        trusted.push(key_rdata.clone());
                    }
                }

                // The DNSKEY set must self-sign with a vouched-for key
                let self_signed = !trusted.is_empty()
                    && verify_rrset(&dnskey_set, &trusted, now, env.cfg.val_sig_skew_min, env.cfg.val_sig_skew_max)
                        == VerifyOutcome::Secure;
                if !self_signed {
                    if at_anchor {
                        env.key_cache.insert_null(&zone, qstate.qinfo.qclass, now);
                    }
                    return self.finish(qstate, SecurityStatus::Bogus, env, "DNSKEY set failed validation");
                }

                env.key_cache.insert(KeyEntry {
                    name: zone.clone(),
                    class: qstate.qinfo.qclass,
                    state: KeyState::Good(dnskey_set.rdatas.clone()),
                    expiry: dnskey_set.expiry,
                });
                if at_anchor {
                    env.anchors.note_key_prime(&zone, &dnskey_set.rdatas);
                }
                qstate.val.pending_ds = Vec::new();
                self.findkey(qstate, env)
            }
        }
    }

    /// Verifies every RRSIG on every RRset of the chased reply, plus the
    /// negative proofs where the reply denies existence
    fn validate(&self, qstate: &mut ModuleQstate, env: &ModuleEnv) -> ModuleState {
        let now = val_now(env);
        let keys: Vec<ResourceData<'static>> = qstate
            .val
            .key_entry
            .as_ref()
            .map(|entry| entry.dnskeys().to_vec())
            .unwrap_or_default();
        let Some(reply) = qstate.reply.as_ref() else {
            return self.finish(qstate, SecurityStatus::Indeterminate, env, "nothing to validate");
        };
        let skew_min = env.cfg.val_sig_skew_min;
        let skew_max = env.cfg.val_sig_skew_max;
        let subtype = qstate.val.subtype;

        let mut overall = SecurityStatus::Secure;
        let mut reason = String::new();
        let mut upgrades: Vec<(RrsetRefParts, SecurityStatus)> = Vec::new();

        for set in reply.answer_sets() {
            let outcome = verify_rrset(set, &keys, now, skew_min, skew_max);
            match outcome {
                VerifyOutcome::Secure => {
                    upgrades.push((RrsetRefParts::of(set), SecurityStatus::Secure));
                }
                VerifyOutcome::Unsigned => {
                    if env.cfg.harden_dnssec_stripped {
                        overall = SecurityStatus::Bogus;
                        reason = format!("unsigned answer RRset {} under a signed zone", set.name);
                        break;
                    }
                    overall = overall.min(SecurityStatus::Insecure);
                }
                VerifyOutcome::UnsupportedOnly => {
                    overall = overall.min(SecurityStatus::Insecure);
                }
                VerifyOutcome::Bogus => {
                    overall = SecurityStatus::Bogus;
                    reason = format!("answer RRset {} failed signature validation", set.name);
                    break;
                }
            }
        }

        if overall != SecurityStatus::Bogus {
            for set in reply.authority_sets() {
                if set.rrsigs.is_empty() {
                    continue;
                }
                match verify_rrset(set, &keys, now, skew_min, skew_max) {
                    VerifyOutcome::Secure => {
                        upgrades.push((RrsetRefParts::of(set), SecurityStatus::Secure));
                    }
                    VerifyOutcome::Bogus => {
                        overall = SecurityStatus::Bogus;
                        reason = format!("authority RRset {} failed signature validation", set.name);
                        break;
                    }
                    _ => {
                        overall = overall.min(SecurityStatus::Insecure);
                    }
                }
            }
        }

        // Negative answers additionally need an existence-denial proof
        if overall == SecurityStatus::Secure
            && matches!(subtype, ReplySubtype::NxDomain | ReplySubtype::NoData | ReplySubtype::CnameNoAnswer)
        {
            let authority: Vec<&PackedRrset> = reply.authority_sets().iter().map(Arc::as_ref).collect();
            let nsec_sets: Vec<&PackedRrset> = authority
                .iter()
                .copied()
                .filter(|set| set.rtype == QueryType::NSEC)
                .collect();
            let nsec3_sets: Vec<&PackedRrset> = authority
                .iter()
                .copied()
                .filter(|set| set.rtype == QueryType::NSEC3)
                .collect();

            let smallest_key_bits = keys
                .iter()
                .filter_map(|key| KeyView::from_rdata(key).map(|view| view.size_bits()))
                .min()
                .unwrap_or(0);
            if max_nsec3_iterations(&nsec3_sets) > env.cfg.nsec3_max_iterations(smallest_key_bits) {
                // Expensive hashing is a denial-of-service vector, not proof
                return self.finish(qstate, SecurityStatus::Insecure, env, "NSEC3 iterations over limit");
            }

            // The name the proof is about: the end of the CNAME chain
            let chased = &qstate.iter.qchase.qname;
            let proven = match subtype {
                ReplySubtype::NxDomain => {
                    nsec_proves_name_error(&nsec_sets, chased) || nsec3_proves_name_error(&nsec3_sets, chased)
                }
                _ => {
                    nsec_proves_nodata(&nsec_sets, chased, qstate.iter.qchase.qtype)
                        || nsec3_proves_nodata(&nsec3_sets, chased, qstate.iter.qchase.qtype)
                }
            };
            if !proven {
                overall = SecurityStatus::Bogus;
                reason = "negative reply lacks a valid NSEC/NSEC3 proof".to_string();
            }
        }

        for (parts, security) in upgrades {
            env.rrset_cache.upgrade_security(&parts.as_ref_key(), security);
        }

        match overall {
            SecurityStatus::Secure => self.finish(qstate, SecurityStatus::Secure, env, "validated"),
            SecurityStatus::Bogus => self.finish(qstate, SecurityStatus::Bogus, env, &reason),
            other => self.finish(qstate, other, env, "chain incomplete"),
        }
    }
}

/// The key parts needed to address an RRset cache entry after the fact
struct RrsetRefParts {
    hash: u128,
    id: u64,
}

impl RrsetRefParts {
    fn of(set: &PackedRrset) -> Self {
        RrsetRefParts {
            hash: RrsetCache::entry_hash(&set.name, set.rtype, set.class, set.flags),
            id: set.id,
        }
    }

    fn as_ref_key(&self) -> RrsetRef {
        RrsetRef {
            hash: self.hash,
            id: self.id,
        }
    }
}

impl Default for ValModule {
    fn default() -> Self {
        ValModule::new()
    }
}



impl Module for ValModule {
    fn name(&self) -> &'static str {
        "validator"
    }

    fn operate(&self, qstate: &mut ModuleQstate, event: ModuleEvent<'_>, env: &ModuleEnv) -> ModuleState {
        match event {
            ModuleEvent::NewQuery | ModuleEvent::Pass => self.init(qstate, env),
            ModuleEvent::SubqueryDone => match qstate.val.state {
                ValState::FindKey => self.findkey_subquery_done(qstate, env),
                _ => self.init(qstate, env),
            },
            ModuleEvent::Reply { .. } | ModuleEvent::Timeout => {
                // The validator never talks to the network directly
                self.init(qstate, env)
            }
            ModuleEvent::Error => ModuleState::Error,
        }
    }

    fn inform_super(&self, result: &SubqueryResult, super_qstate: &mut ModuleQstate, _env: &ModuleEnv) {
        super_qstate.val.sub_result = Some(result.clone());
    }

    fn clear(&self, qstate: &mut ModuleQstate) {
        qstate.val = ValQstate::new();
    }

    fn get_mem(&self, qstate: &ModuleQstate) -> usize {
        std::mem::size_of::<ValQstate>()
            + qstate
                .val
                .pending_ds
                .iter()
                .map(|ds| ds.get_encoded_size(None))
                .sum::<usize>()
    }
}
