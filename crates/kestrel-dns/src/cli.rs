use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

use crate::config::{ForwardZone, ResolverConfig};

#[derive(Parser)]
#[command(version, name = "kestrel-dns")]
pub struct Args {
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1")]
    pub host: IpAddr,
    #[arg(short('p'), long, value_name = "PORT", default_value_t = 53)]
    pub port: u16,
    #[arg(long, value_name = "THREADS", default_value_t = 4, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub num_threads: u8,
    /// Forward every query to this resolver instead of iterating from the roots
    #[arg(long, value_name = "ADDR")]
    pub forward: Option<SocketAddr>,
    /// File with DS/DNSKEY trust anchors in zone-file presentation
    #[arg(long, value_name = "PATH")]
    pub trust_anchor_file: Option<PathBuf>,
    /// Inline trust anchor, e.g. ". IN DS 20326 8 2 <hex>"
    #[arg(long, value_name = "ANCHOR")]
    pub trust_anchor: Vec<String>,
    /// RFC 5011 managed anchor file, re-written on key state changes
    #[arg(long, value_name = "PATH")]
    pub auto_trust_anchor_file: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub permissive: bool,
    #[arg(long, default_value_t = false)]
    pub use_caps_for_id: bool,
    #[arg(long, default_value_t = false)]
    pub prefetch: bool,
}

impl Args {
    pub fn into_config(self) -> ResolverConfig {
        let mut cfg = ResolverConfig {
            port: self.port,
            interface: vec![self.host],
            num_threads: self.num_threads as usize,
            trust_anchor_file: self.trust_anchor_file,
            trust_anchor: self.trust_anchor,
            auto_trust_anchor_file: self.auto_trust_anchor_file,
            val_permissive_mode: self.permissive,
            use_caps_for_id: self.use_caps_for_id,
            prefetch: self.prefetch,
            ..ResolverConfig::default()
        };
        if let Some(forward) = self.forward {
            cfg.forward_zones.push(ForwardZone {
                name: String::new(),
                addrs: vec![forward],
            });
        }
        cfg
    }
}
