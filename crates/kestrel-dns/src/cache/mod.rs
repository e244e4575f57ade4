mod infra;
mod key;
mod message;
mod neg;
mod rrset;
mod slab;

pub use infra::{InfraCache, InfraEntry, FAILURE_SKIP_THRESHOLD, RTT_MAX_MS, RTT_SEED_MS};
pub use key::{KeyCache, KeyEntry, KeyState, NULL_KEY_TTL};
pub use message::{CachedReply, MessageCache, ReplyFlags, ReplyInfo};
pub use neg::{NegCache, NegEntry};
pub use rrset::{pack_rrsets, PackedRrset, RrsetCache, RrsetFlags, RrsetRef, SecurityStatus, TrustLevel};
pub use slab::{EntrySize, SlabCache};
