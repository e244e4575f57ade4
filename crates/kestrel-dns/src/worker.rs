use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt as _;
use kestrel_dns_lib::{ByteBuf, DnsPacket, QueryType, ResponseCode};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};

use crate::cache::{CachedReply, PackedRrset, SecurityStatus};
use crate::connection::Connection;
use crate::iterator::IterModule;
use crate::module::{Module, ModuleEvent, ModuleQstate, ModuleState, QueryFlags, SubquerySpec};
use crate::outbound;
use crate::util::{get_response_dns_packet, now_secs, QueryInfo};
use crate::validator::ValModule;
use crate::{ModuleEnv, DEFAULT_EDNS_BUF_CAPACITY, MAX_STANDARD_DNS_MSG_SIZE};

/// Hard cap on sub-query nesting, over and above the target-fetch policy
const MAX_SUBQUERY_DEPTH: usize = 8;

/// What a finished (sub-)query hands back: enough for `inform_super` and
/// for fan-out through the in-flight table
#[derive(Debug, Clone)]
pub struct SubqueryResult {
    pub qinfo: QueryInfo,
    pub rcode: ResponseCode,
    pub reply: Option<CachedReply>,
    pub security: SecurityStatus,
    pub wants_prefetch: bool,
}

impl SubqueryResult {
    fn servfail(qinfo: QueryInfo) -> Self {
        SubqueryResult {
            qinfo,
            rcode: ResponseCode::ServerFailure,
            reply: None,
            security: SecurityStatus::Indeterminate,
            wants_prefetch: false,
        }
    }
}

/// Where a resolution sits in the sub-query tree. The ancestor trail is
/// what keeps mutually-dependent name servers from deadlocking the
/// de-duplication table
#[derive(Debug, Clone, Default)]
pub struct ResolveCtx {
    pub depth: usize,
    pub prime: bool,
    pub skip_validation: bool,
    /// Skip the message-cache lookup (prefetch refreshes)
    pub no_cache: bool,
    /// Fingerprints of every query above this one in the tree
    pub ancestors: Vec<u128>,
}

/// Owned form of the event fed into the next `operate` call
enum PendingEvent {
    New,
    Pass,
    Reply {
        packet: DnsPacket<'static>,
        from: SocketAddr,
        rtt: Duration,
    },
    SubqueryDone,
    Timeout,
    Error,
}

struct OutstandingQuery {
    id: u64,
    started: Instant,
    prime: bool,
    cancel: Arc<Notify>,
}

/// Registry of in-flight outbound queries, for the jostle policy: when the
/// worker is saturated, the oldest low-priority outbound is dropped to make
/// room for new work
struct OutstandingQueries {
    queries: Mutex<VecDeque<OutstandingQuery>>,
    next_id: AtomicU64,
}

struct SlotGuard<'a> {
    registry: &'a OutstandingQueries,
    id: u64,
    cancel: Arc<Notify>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut queries = self.registry.queries.lock().expect("registry lock poisoned");
        queries.retain(|entry| entry.id != self.id);
    }
}

impl OutstandingQueries {
    fn new() -> Self {
        OutstandingQueries {
            queries: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Takes an outbound slot, jostling an old low-priority query if the
    /// range is full. Priming queries always get a slot
    fn acquire(&self, limit: usize, jostle_timeout: Duration, prime: bool) -> Option<SlotGuard<'_>> {
        let mut queries = self.queries.lock().expect("registry lock poisoned");
        if queries.len() >= limit {
            let jostled = queries
                .iter()
                .position(|entry| !entry.prime && entry.started.elapsed() >= jostle_timeout);
            match jostled {
                Some(idx) => {
                    let victim = queries.remove(idx).expect("idx is valid");
                    tracing::debug!("Jostling an outbound query to make room");
                    victim.cancel.notify_waiters();
                }
                None if prime => {
                    // High-priority work proceeds even past the limit
                }
                None => return None,
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(Notify::new());
        queries.push_back(OutstandingQuery {
            id,
            started: Instant::now(),
            prime,
            cancel: cancel.clone(),
        });
        Some(SlotGuard {
            registry: self,
            id,
            cancel,
        })
    }

    fn len(&self) -> usize {
        self.queries.lock().expect("registry lock poisoned").len()
    }
}

/// Drives the module pipeline for every query assigned to it. Module code
/// runs synchronously between suspension points; I/O happens in the awaits
/// between them
pub struct Worker {
    env: Arc<ModuleEnv>,
    modules: Vec<Box<dyn Module>>,
    outstanding: OutstandingQueries,
}

impl Worker {
    pub fn new(env: Arc<ModuleEnv>) -> Self {
        Worker {
            env,
            modules: vec![Box::new(IterModule::new()), Box::new(ValModule::new())],
            outstanding: OutstandingQueries::new(),
        }
    }

    pub fn env(&self) -> &ModuleEnv {
        &self.env
    }

    pub fn outstanding_outbound(&self) -> usize {
        self.outstanding.len()
    }

    /// Resolves one query through the module pipeline. Sub-queries recurse
    /// through here, so the future must be boxed
    pub fn resolve(self: &Arc<Self>, qinfo: QueryInfo, flags: QueryFlags, ctx: ResolveCtx) -> BoxFuture<'static, SubqueryResult> {
        let worker = self.clone();
        async move {
            let mut qstate = ModuleQstate::new(qinfo, flags, ctx.depth);
            qstate.is_priming = ctx.prime;
            qstate.skip_validation = ctx.skip_validation;
            qstate.no_cache_lookup = ctx.no_cache;

            let mut module_idx = 0usize;
            let mut event = PendingEvent::New;

            loop {
                let state = {
                    let module_event = match &event {
                        PendingEvent::New => ModuleEvent::NewQuery,
                        PendingEvent::Pass => ModuleEvent::Pass,
                        PendingEvent::Reply { packet, from, rtt } => ModuleEvent::Reply {
                            packet,
                            from: *from,
                            rtt: *rtt,
                        },
                        PendingEvent::SubqueryDone => ModuleEvent::SubqueryDone,
                        PendingEvent::Timeout => ModuleEvent::Timeout,
                        PendingEvent::Error => ModuleEvent::Error,
                    };
                    worker.modules[module_idx].operate(&mut qstate, module_event, &worker.env)
                };

                match state {
                    ModuleState::WaitReply => {
                        let Some(spec) = qstate.outbound.take() else {
                            event = PendingEvent::Error;
                            continue;
                        };
                        let recursion_desired = qstate
                            .iter
                            .dp
                            .as_ref()
                            .map(|dp| dp.is_forward)
                            .unwrap_or(false);
                        event = worker.run_exchange(&spec, recursion_desired, ctx.prime).await;
                    }
                    ModuleState::WaitSubquery => {
                        let specs = std::mem::take(&mut qstate.subqueries);
                        if specs.is_empty() {
                            event = PendingEvent::Error;
                            continue;
                        }
                        if ctx.depth >= MAX_SUBQUERY_DEPTH {
                            tracing::debug!(
                                qname = ?qstate.qinfo.qname,
                                "Sub-query depth limit reached"
                            );
                            event = PendingEvent::Error;
                            continue;
                        }
                        let parent_flags = qstate.flags;
                        let results = join_all(
                            specs
                                .into_iter()
                                .map(|spec| worker.subquery(spec, parent_flags, &ctx)),
                        )
                        .await;
                        for result in &results {
                            worker.modules[module_idx].inform_super(result, &mut qstate, &worker.env);
                        }
                        event = PendingEvent::SubqueryDone;
                    }
                    ModuleState::WaitModule => {
                        module_idx += 1;
                        if module_idx >= worker.modules.len() {
                            break;
                        }
                        event = PendingEvent::Pass;
                    }
                    ModuleState::Finished => {
                        if module_idx + 1 < worker.modules.len() {
                            module_idx += 1;
                            event = PendingEvent::Pass;
                        } else {
                            break;
                        }
                    }
                    ModuleState::Error => {
                        if qstate.return_rcode == ResponseCode::Success {
                            qstate.return_rcode = ResponseCode::ServerFailure;
                        }
                        break;
                    }
                }
            }

            worker.store_result(&mut qstate);
            let result = SubqueryResult {
                qinfo: qstate.qinfo.clone(),
                rcode: qstate.return_rcode,
                reply: qstate.reply.take(),
                security: qstate.security,
                wants_prefetch: qstate.wants_prefetch,
            };
            for module in &worker.modules {
                module.clear(&mut qstate);
            }
            result
        }
        .boxed()
    }

    /// One outbound exchange under the jostle policy
    async fn run_exchange(&self, spec: &crate::module::OutboundSpec, recursion_desired: bool, prime: bool) -> PendingEvent {
        let now = now_secs();
        let Some(slot) = self.outstanding.acquire(
            self.env.cfg.outgoing_range,
            Duration::from_millis(self.env.cfg.jostle_timeout_ms),
            prime,
        ) else {
            tracing::debug!(target = ?spec.target, "Outgoing range exhausted, failing over");
            return PendingEvent::Timeout;
        };

        let cancelled = slot.cancel.clone();
        let exchange = outbound::exchange(spec, recursion_desired, &self.env);
        tokio::select! {
            result = exchange => match result {
                Ok(result) => {
                    self.env
                        .infra_cache
                        .note_success(&spec.target.ip(), &spec.zone, result.rtt, now);
                    PendingEvent::Reply {
                        packet: result.packet,
                        from: spec.target,
                        rtt: result.rtt,
                    }
                }
                Err(error) => {
                    tracing::debug!(target = ?spec.target, "Exchange failed: {:#}", error);
                    self.env.infra_cache.note_failure(&spec.target.ip(), &spec.zone, now);
                    PendingEvent::Timeout
                }
            },
            _ = cancelled.notified() => {
                tracing::debug!(target = ?spec.target, "Outbound query was jostled out");
                PendingEvent::Timeout
            }
        }
    }

    /// Runs a sub-query with global de-duplication: a second request for
    /// the same fingerprint attaches to the first one's result channel.
    /// A fingerprint already on our own ancestor trail is a dependency
    /// cycle and fails immediately
    fn subquery(self: &Arc<Self>, spec: SubquerySpec, parent_flags: QueryFlags, parent_ctx: &ResolveCtx) -> BoxFuture<'static, SubqueryResult> {
        let worker = self.clone();
        let parent_ctx = parent_ctx.clone();
        async move {
            let fingerprint = spec.qinfo.fingerprint(spec.skip_validation, spec.prime);

            if parent_ctx.ancestors.contains(&fingerprint) {
                tracing::debug!(
                    qname = ?spec.qinfo.qname,
                    qtype = ?spec.qinfo.qtype,
                    "Sub-query dependency cycle detected"
                );
                return SubqueryResult::servfail(spec.qinfo);
            }

            // Attach to an in-flight query for the same fingerprint, or
            // claim the slot for ourselves in one critical section
            let (tx, attach_rx) = {
                let mut inflight = worker.env.inflight.lock().expect("inflight lock poisoned");
                if let Some(rx) = inflight.get(&fingerprint) {
                    (None, Some(rx.clone()))
                } else {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(fingerprint, rx);
                    (Some(tx), None)
                }
            };

            if let Some(mut rx) = attach_rx {
                loop {
                    if let Some(result) = rx.borrow().clone() {
                        return result;
                    }
                    if rx.changed().await.is_err() {
                        return SubqueryResult::servfail(spec.qinfo);
                    }
                }
            }
            let tx = tx.expect("either attached or claimed");

            let flags = QueryFlags {
                recursion_desired: true,
                checking_disabled: parent_flags.checking_disabled,
                dnssec_ok: parent_flags.dnssec_ok,
            };
            let mut ancestors = parent_ctx.ancestors.clone();
            ancestors.push(fingerprint);
            let ctx = ResolveCtx {
                depth: parent_ctx.depth + 1,
                prime: spec.prime,
                skip_validation: spec.skip_validation,
                no_cache: false,
                ancestors,
            };
            let result = worker.resolve(spec.qinfo.clone(), flags, ctx).await;

            worker
                .env
                .inflight
                .lock()
                .expect("inflight lock poisoned")
                .remove(&fingerprint);
            // Late attachers still holding the receiver get the result
            let _ = tx.send(Some(result.clone()));

            result
        }
        .boxed()
    }

    /// Writes the finished reply through the message cache, unless it was
    /// served from there in the first place
    fn store_result(&self, qstate: &mut ModuleQstate) {
        if qstate.from_cache {
            return;
        }
        let Some(reply) = qstate.reply.as_ref() else {
            return;
        };
        if reply.rcode == ResponseCode::ServerFailure {
            // Partial chains are per-query, never cached
            return;
        }
        let now = now_secs();

        let to_packed = |sets: &[Arc<PackedRrset>]| -> Vec<PackedRrset> {
            sets.iter().map(|set| set.as_ref().clone()).collect()
        };
        let sections = [
            to_packed(reply.answer_sets()),
            to_packed(reply.authority_sets()),
            to_packed(reply.additional_sets()),
        ];

        if reply.security == SecurityStatus::Bogus {
            // Rate-limit revalidation of broken data
            self.env.msg_cache.store_with_expiry(
                &qstate.qinfo,
                qstate.flags.checking_disabled,
                reply.flags,
                reply.rcode,
                sections,
                SecurityStatus::Bogus,
                &self.env.rrset_cache,
                now,
                now + self.env.cfg.bogus_ttl,
            );
        } else {
            self.env.msg_cache.store(
                &qstate.qinfo,
                qstate.flags.checking_disabled,
                reply.flags,
                reply.rcode,
                sections,
                reply.security,
                &self.env.rrset_cache,
                now,
            );
        }
    }

    /// Entry point for one client request: parse, resolve, emit
    pub async fn handle_query(
        self: Arc<Self>,
        mut connection: Connection<Arc<UdpSocket>>,
        parsed_packet: anyhow::Result<DnsPacket<'static>>,
    ) -> anyhow::Result<()> {
        let requestor_edns_buf_size = parsed_packet
            .as_ref()
            .ok()
            .and_then(|packet| packet.get_edns_data().map(|data| data.udp_payload_size));

        // Our reply advertises our own buffer size; theirs caps what we send
        let client_udp_limit = requestor_edns_buf_size
            .map(|requested| (requested as u16).min(self.env.cfg.max_udp_size) as usize);
        let mut response_packet = get_response_dns_packet(
            parsed_packet.as_ref().ok(),
            requestor_edns_buf_size.map(|_| self.env.cfg.edns_buffer_size as usize),
        );

        'resolve: {
            let Ok(query_packet) = parsed_packet.as_ref() else {
                response_packet.header.response_code = ResponseCode::FormatError;
                break 'resolve;
            };

            if query_packet.header.question_count != 1 || query_packet.questions.len() != 1 {
                response_packet.header.response_code = ResponseCode::FormatError;
                break 'resolve;
            }
            let question = &query_packet.questions[0];
            let qinfo = QueryInfo::from_question(question);
            let dnssec_ok = query_packet
                .get_edns_data()
                .map(|data| data.dnssec_ok_bit)
                .unwrap_or(false);
            let flags = QueryFlags {
                recursion_desired: query_packet.header.recursion_desired,
                checking_disabled: query_packet.header.checking_disabled && !self.env.cfg.ignore_cd_flag,
                dnssec_ok,
            };

            if !flags.recursion_desired {
                // Without RD we only answer from cache
                let now = now_secs();
                if let Some(cached) =
                    self.env
                        .msg_cache
                        .lookup(&qinfo, flags.checking_disabled, &self.env.rrset_cache, now)
                {
                    let security = cached.security;
                    self.fill_response(&mut response_packet, &qinfo, &cached, security, flags, now);
                } else {
                    response_packet.header.response_code = ResponseCode::Refused;
                }
                break 'resolve;
            }

            let result = self.resolve(qinfo.clone(), flags, ResolveCtx::default()).await;

            tracing::debug!(
                qname = ?qinfo.qname,
                qtype = ?qinfo.qtype,
                rcode = ?result.rcode,
                security = ?result.security,
                "Query resolved"
            );

            if let Some(reply) = result.reply.as_ref() {
                // On SERVFAIL only a partial CNAME chain (which carries the
                // failing rcode itself) is worth returning
                if result.rcode != ResponseCode::ServerFailure || reply.rcode == ResponseCode::ServerFailure {
                    self.fill_response(&mut response_packet, &qinfo, reply, result.security, flags, now_secs());
                }
            }
            response_packet.header.response_code = result.rcode;

            if result.wants_prefetch {
                // Refresh the entry in the background after answering
                let worker = self.clone();
                let prefetch_qinfo = qinfo.clone();
                tokio::spawn(async move {
                    let ctx = ResolveCtx {
                        no_cache: true,
                        ..ResolveCtx::default()
                    };
                    let _ = worker.resolve(prefetch_qinfo, flags, ctx).await;
                });
            }
        }

        // Add original questions to the response if possible and wasn't done before
        if response_packet.questions.is_empty() {
            if let Ok(packet) = parsed_packet.as_ref() {
                response_packet.questions = packet.questions.clone();
                response_packet.header.question_count = packet.header.question_count;
            }
        }

        let mut dst = ByteBuf::new_empty(Some(DEFAULT_EDNS_BUF_CAPACITY));
        response_packet
            .encode_to_buf(
                &mut dst,
                // UDP: truncate the response if the requestor's buffer is too small
                (!connection.is_tcp()).then(|| client_udp_limit.unwrap_or(MAX_STANDARD_DNS_MSG_SIZE)),
            )
            .context("error while encoding the response")?;

        if let Err(error) = connection.send_encoded_packet(&dst).await {
            // Do not propagate the error, as it's per-user and thus recoverable
            tracing::error!("Error while sending a DNS response: {:#}", error)
        };

        Ok(())
    }

    /// Exports a cached reply into the wire packet, applying the AD bit and
    /// additional-section cleaning rules
    fn fill_response(
        &self,
        response_packet: &mut DnsPacket<'static>,
        qinfo: &QueryInfo,
        reply: &CachedReply,
        security: SecurityStatus,
        flags: QueryFlags,
        now: u64,
    ) {
        let include_rrsigs = flags.dnssec_ok || qinfo.qtype.is_dnssec_type();

        for set in reply.answer_sets() {
            for record in set.to_records(now, include_rrsigs) {
                response_packet.answers.push(record);
                response_packet.header.answer_rr_count += 1;
            }
        }
        for set in reply.authority_sets() {
            for record in set.to_records(now, include_rrsigs) {
                response_packet.authorities.push(record);
                response_packet.header.authority_rr_count += 1;
            }
        }
        let clean_additional = self.env.cfg.val_clean_additional && security == SecurityStatus::Secure;
        for set in reply.additional_sets() {
            if clean_additional && set.security != SecurityStatus::Secure {
                continue;
            }
            if set.rtype == QueryType::OPT {
                continue;
            }
            for record in set.to_records(now, include_rrsigs) {
                response_packet.additionals.push(record);
                response_packet.header.additional_rr_count += 1;
            }
        }

        response_packet.header.response_code = reply.rcode;
        // AD only for validated data, and only to clients who asked for it
        response_packet.header.authentic_data = flags.dnssec_ok && security == SecurityStatus::Secure;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResolverConfig;

    #[test]
    fn jostle_registry_respects_limit_and_priority() {
        let registry = OutstandingQueries::new();
        let jostle = Duration::from_millis(0);

        let _first = registry.acquire(2, jostle, false).expect("slot one");
        let second = registry.acquire(2, jostle, false).expect("slot two");
        assert_eq!(registry.len(), 2);

        // Full: the oldest low-priority entry (the first) is jostled out
        let _third = registry.acquire(2, jostle, false).expect("jostled in");
        assert_eq!(registry.len(), 2);

        // Releasing a live slot shrinks the registry
        drop(second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn jostle_refuses_young_queue_but_admits_prime() {
        let registry = OutstandingQueries::new();
        // Entries younger than the jostle timeout are not dropped
        let jostle = Duration::from_secs(3600);

        let _first = registry.acquire(1, jostle, false).expect("slot one");
        assert!(registry.acquire(1, jostle, false).is_none());
        // Priming queries push past the limit instead
        assert!(registry.acquire(1, jostle, true).is_some());
    }

    #[tokio::test]
    async fn cycle_detection_fails_fast() {
        let env = Arc::new(ModuleEnv::new(ResolverConfig::default()).expect("env"));
        let worker = Arc::new(Worker::new(env));

        let qinfo = QueryInfo::new("ns1.example.com", QueryType::A, 1);
        let spec = SubquerySpec {
            qinfo: qinfo.clone(),
            prime: false,
            skip_validation: false,
        };
        let ctx = ResolveCtx {
            depth: 1,
            ancestors: vec![qinfo.fingerprint(false, false)],
            ..ResolveCtx::default()
        };
        let result = worker.subquery(spec, QueryFlags::default(), &ctx).await;
        assert_eq!(result.rcode, ResponseCode::ServerFailure);
    }
}
