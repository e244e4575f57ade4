use std::net::SocketAddr;
use std::time::Duration;

use kestrel_dns_lib::{DnsPacket, ResponseCode};

use crate::cache::{CachedReply, SecurityStatus};
use crate::iterator::IterQstate;
use crate::util::QueryInfo;
use crate::validator::ValQstate;
use crate::worker::SubqueryResult;
use crate::ModuleEnv;

/// What a module hands back to the worker after each event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// An outbound DNS query is pending (`qstate.outbound` is set)
    WaitReply,
    /// Dependent resolver tasks are pending (`qstate.subqueries` is set)
    WaitSubquery,
    /// Handing off to the next module in the pipeline
    WaitModule,
    Error,
    Finished,
}

/// Events the worker delivers into `operate`
#[derive(Debug)]
pub enum ModuleEvent<'a> {
    NewQuery,
    /// Control passed from the module below
    Pass,
    /// An outbound exchange completed
    Reply {
        packet: &'a DnsPacket<'static>,
        from: SocketAddr,
        rtt: Duration,
    },
    /// All requested sub-queries completed (results were merged through
    /// `inform_super` before this event)
    SubqueryDone,
    Timeout,
    Error,
}

/// Flags copied off the client request that change processing
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryFlags {
    pub recursion_desired: bool,
    pub checking_disabled: bool,
    pub dnssec_ok: bool,
}

/// A sub-query a module wants resolved before it can continue
#[derive(Debug, Clone)]
pub struct SubquerySpec {
    pub qinfo: QueryInfo,
    /// Priming queries bypass the jostle drop policy
    pub prime: bool,
    /// Key-fetch sub-queries verify their material themselves; running
    /// them through the validator again would recurse
    pub skip_validation: bool,
}

/// One outbound query the worker should put on the wire
#[derive(Debug, Clone)]
pub struct OutboundSpec {
    pub qinfo: QueryInfo,
    pub target: SocketAddr,
    /// Zone the target serves; keys the infra cache
    pub zone: String,
    pub dnssec_ok: bool,
    /// 0x20-randomized spelling of the qname, when enabled
    pub caps_qname: Option<String>,
}

/// Per-query state threaded through the module stack. Created on arrival,
/// destroyed on response emission; owned by exactly one worker task
pub struct ModuleQstate {
    pub qinfo: QueryInfo,
    pub flags: QueryFlags,
    /// Sub-query nesting depth, for the target-fetch policy
    pub depth: usize,
    pub return_rcode: ResponseCode,
    /// The working reply: filled by the iterator, stamped by the validator
    pub reply: Option<CachedReply>,
    pub security: SecurityStatus,
    /// True when the reply was served from the message cache untouched
    pub from_cache: bool,
    /// Cache hit close to expiry: refresh in the background after replying
    pub wants_prefetch: bool,
    pub is_priming: bool,
    /// Set for validator-spawned sub-queries
    pub skip_validation: bool,
    /// Prefetch refreshes skip the message cache on their first pass
    pub no_cache_lookup: bool,
    /// Drained by the worker on `WaitSubquery`
    pub subqueries: Vec<SubquerySpec>,
    /// Drained by the worker on `WaitReply`
    pub outbound: Option<OutboundSpec>,
    pub iter: IterQstate,
    pub val: ValQstate,
}

impl ModuleQstate {
    pub fn new(qinfo: QueryInfo, flags: QueryFlags, depth: usize) -> Self {
        let iter = IterQstate::new(&qinfo);
        ModuleQstate {
            qinfo,
            flags,
            depth,
            return_rcode: ResponseCode::Success,
            reply: None,
            security: SecurityStatus::Indeterminate,
            from_cache: false,
            wants_prefetch: false,
            is_priming: false,
            skip_validation: false,
            no_cache_lookup: false,
            subqueries: Vec::new(),
            outbound: None,
            iter,
            val: ValQstate::new(),
        }
    }
}

/// A module is a state machine with a fixed capability set. The pipeline is
/// an ordered list of these; per-query state lives in `ModuleQstate`
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    /// Advances the module's state machine in response to one event
    fn operate(&self, qstate: &mut ModuleQstate, event: ModuleEvent<'_>, env: &ModuleEnv) -> ModuleState;

    /// Delivers a finished sub-query's result into the parent query
    fn inform_super(&self, result: &SubqueryResult, super_qstate: &mut ModuleQstate, env: &ModuleEnv);

    /// Drops per-query scratch state
    fn clear(&self, qstate: &mut ModuleQstate);

    /// Memory attributable to this module's per-query state
    fn get_mem(&self, qstate: &ModuleQstate) -> usize;
}
