mod logging;
pub use logging::setup_logging;
pub mod cache;
mod config;
pub use config::ResolverConfig;
mod connection;
pub use connection::Connection;
pub mod iterator;
mod module;
pub use module::{Module, ModuleEvent, ModuleQstate, ModuleState, OutboundSpec, QueryFlags, SubquerySpec};
mod outbound;
mod server;
pub use server::DnsServer;
pub mod validator;
mod worker;
pub use worker::{ResolveCtx, SubqueryResult, Worker};
mod cli;
pub use cli::Args;
pub mod util;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Mutex;

use cache::{InfraCache, KeyCache, MessageCache, NegCache, RrsetCache};
use tokio::sync::watch;
use validator::anchors::TrustAnchorStore;

/// Recommended eDNS buf size
pub const DEFAULT_EDNS_BUF_CAPACITY: usize = 1232;
/// RFC1035
pub const MAX_STANDARD_DNS_MSG_SIZE: usize = 512;

/// Hard per-query budgets. Exceeding either terminates the query with SERVFAIL
pub const MAX_QUERY_RESTARTS: u8 = 8;
pub const MAX_REFERRALS: u8 = 30;
/// Outbound send attempts per delegation target
pub const MAX_TARGET_RETRIES: u8 = 4;

/// Everything the modules share: configuration, the caches, the trust
/// anchors, and the cross-query bookkeeping. Passed explicitly to every
/// module entry point, never accessed ambiently
pub struct ModuleEnv {
    pub cfg: ResolverConfig,
    pub msg_cache: MessageCache,
    pub rrset_cache: RrsetCache,
    pub infra_cache: InfraCache,
    pub key_cache: KeyCache,
    pub neg_cache: NegCache,
    pub anchors: TrustAnchorStore,
    /// Sub-query de-duplication: fingerprint -> broadcast of the result.
    /// A second asker attaches to the existing channel instead of spawning
    pub inflight: Mutex<HashMap<u128, watch::Receiver<Option<SubqueryResult>>>>,
    /// Replies that failed the id/question echo check, across all workers
    pub unwanted_replies: AtomicU64,
}

impl ModuleEnv {
    pub fn new(cfg: ResolverConfig) -> anyhow::Result<Self> {
        let anchors = TrustAnchorStore::from_config(&cfg)?;
        Ok(ModuleEnv {
            msg_cache: MessageCache::new(cfg.msg_cache_size, cfg.msg_cache_slabs),
            rrset_cache: RrsetCache::new(cfg.rrset_cache_size, cfg.rrset_cache_slabs),
            infra_cache: InfraCache::new(cfg.infra_cache_numhosts, cfg.infra_cache_slabs, cfg.infra_host_ttl),
            key_cache: KeyCache::new(cfg.key_cache_size, cfg.key_cache_slabs),
            neg_cache: NegCache::new(cfg.neg_cache_size),
            anchors,
            inflight: Mutex::new(HashMap::new()),
            unwanted_replies: AtomicU64::new(0),
            cfg,
        })
    }
}
