use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Context;
use data_encoding::{BASE64, HEXUPPER_PERMISSIVE};
use kestrel_dns_lib::utils::{name_in_zone, parent_name};
use kestrel_dns_lib::ResourceData;

use crate::config::ResolverConfig;
use crate::util::now_secs;

/// DS and DNSKEY material trusted a priori for one zone
#[derive(Debug, Clone, Default)]
pub struct TrustAnchor {
    pub name: String,
    pub ds_set: Vec<ResourceData<'static>>,
    pub dnskey_set: Vec<ResourceData<'static>>,
}

impl TrustAnchor {
    pub fn is_empty(&self) -> bool {
        self.ds_set.is_empty() && self.dnskey_set.is_empty()
    }
}

/// The process-wide trust anchor store. Read-mostly; the RFC 5011 write
/// path takes the write lock when a prime refreshes anchor state
pub struct TrustAnchorStore {
    anchors: RwLock<HashMap<String, TrustAnchor>>,
    autotrust_path: Option<PathBuf>,
}

impl TrustAnchorStore {
    pub fn empty() -> Self {
        TrustAnchorStore {
            anchors: RwLock::new(HashMap::new()),
            autotrust_path: None,
        }
    }

    pub fn from_config(cfg: &ResolverConfig) -> anyhow::Result<Self> {
        let mut anchors: HashMap<String, TrustAnchor> = HashMap::new();

        for line in &cfg.trust_anchor {
            if let Some(anchor) = parse_anchor_line(line) {
                merge_anchor(&mut anchors, anchor);
            } else {
                tracing::warn!(line, "Unparseable trust-anchor option, skipping");
            }
        }

        for path in [&cfg.trust_anchor_file, &cfg.trusted_keys_file, &cfg.auto_trust_anchor_file]
            .into_iter()
            .flatten()
        {
            for anchor in parse_anchor_file(path)
                .with_context(|| format!("error while loading trust anchors from {:?}", path))?
            {
                merge_anchor(&mut anchors, anchor);
            }
        }

        Ok(TrustAnchorStore {
            anchors: RwLock::new(anchors),
            autotrust_path: cfg.auto_trust_anchor_file.clone(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.read().expect("anchor lock poisoned").is_empty()
    }

    pub fn get(&self, name: &str) -> Option<TrustAnchor> {
        self.anchors
            .read()
            .expect("anchor lock poisoned")
            .get(&name.to_lowercase())
            .cloned()
    }

    /// The most specific anchor at or above `name`
    pub fn closest_ancestor(&self, name: &str) -> Option<TrustAnchor> {
        let anchors = self.anchors.read().expect("anchor lock poisoned");
        let mut candidate = name.to_lowercase();
        loop {
            if let Some(anchor) = anchors.get(&candidate) {
                return Some(anchor.clone());
            }
            match parent_name(&candidate) {
                Some(parent) => candidate = parent.to_string(),
                None => return None,
            }
        }
    }

    /// True if any anchor governs this name
    pub fn covers(&self, name: &str) -> bool {
        let anchors = self.anchors.read().expect("anchor lock poisoned");
        anchors.values().any(|anchor| name_in_zone(name, &anchor.name))
    }

    /// RFC 5011 write-back: a successful prime refreshes the persisted
    /// DNSKEY state for an auto-trust anchor zone
    pub fn note_key_prime(&self, zone: &str, keys: &[ResourceData<'static>]) {
        let Some(path) = self.autotrust_path.as_ref() else {
            return;
        };
        let zone = zone.to_lowercase();
        {
            let anchors = self.anchors.read().expect("anchor lock poisoned");
            if !anchors.contains_key(&zone) {
                return;
            }
        }
        if let Err(error) = write_autotrust_file(path, &zone, keys) {
            tracing::warn!(path = ?path, "Failed to persist auto-trust-anchor state: {:#}", error);
        }
    }
}

fn merge_anchor(anchors: &mut HashMap<String, TrustAnchor>, anchor: TrustAnchor) {
    let entry = anchors.entry(anchor.name.clone()).or_insert_with(|| TrustAnchor {
        name: anchor.name.clone(),
        ..Default::default()
    });
    entry.ds_set.extend(anchor.ds_set);
    entry.dnskey_set.extend(anchor.dnskey_set);
}

fn parse_anchor_file(path: &Path) -> anyhow::Result<Vec<TrustAnchor>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("error while opening the file {:?}", path))?;
    let mut anchors = Vec::new();
    for line in content.lines() {
        // Strip RFC 5011 state comments and regular comments alike
        let line = line.split(';').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if let Some(anchor) = parse_anchor_line(line) {
            anchors.push(anchor);
        } else {
            tracing::debug!(line, "Skipping unparseable anchor line");
        }
    }
    Ok(anchors)
}

/// Parses one zone-file presentation line:
/// `name [TTL] [IN] DS key_tag algorithm digest_type hex-digest` or
/// `name [TTL] [IN] DNSKEY flags protocol algorithm base64-key`
fn parse_anchor_line(line: &str) -> Option<TrustAnchor> {
    let mut fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 2 {
        return None;
    }

    let name = fields.remove(0).trim_end_matches('.').to_lowercase();

    // Optional TTL and class before the type field
    while !fields.is_empty() {
        let head = fields[0];
        if head.eq_ignore_ascii_case("IN") || head.chars().all(|symbol| symbol.is_ascii_digit()) {
            fields.remove(0);
        } else {
            break;
        }
    }
    if fields.is_empty() {
        return None;
    }

    let rtype = fields.remove(0).to_uppercase();
    match rtype.as_str() {
        "DS" => {
            if fields.len() < 4 {
                return None;
            }
            let key_tag = fields[0].parse().ok()?;
            let algorithm = fields[1].parse().ok()?;
            let digest_type = fields[2].parse().ok()?;
            let digest_hex: String = fields[3..].concat();
            let digest = HEXUPPER_PERMISSIVE.decode(digest_hex.to_uppercase().as_bytes()).ok()?;
            Some(TrustAnchor {
                name,
                ds_set: vec![ResourceData::DS {
                    key_tag,
                    algorithm,
                    digest_type,
                    digest: digest.into(),
                }],
                dnskey_set: Vec::new(),
            })
        }
        "DNSKEY" => {
            if fields.len() < 4 {
                return None;
            }
            let flags = fields[0].parse().ok()?;
            let protocol = fields[1].parse().ok()?;
            let algorithm = fields[2].parse().ok()?;
            let key_base64: String = fields[3..].concat();
            let public_key = BASE64.decode(key_base64.as_bytes()).ok()?;
            Some(TrustAnchor {
                name,
                ds_set: Vec::new(),
                dnskey_set: vec![ResourceData::DNSKEY {
                    flags,
                    protocol,
                    algorithm,
                    public_key: public_key.into(),
                }],
            })
        }
        _ => None,
    }
}

fn write_autotrust_file(path: &Path, zone: &str, keys: &[ResourceData<'static>]) -> anyhow::Result<()> {
    let mut out = String::new();
    out.push_str("; autotrust trust anchor file\n");
    out.push_str(&format!(";;last_success: {}\n", now_secs()));
    for key in keys {
        if let ResourceData::DNSKEY {
            flags,
            protocol,
            algorithm,
            public_key,
        } = key
        {
            out.push_str(&format!(
                "{}. DNSKEY {} {} {} {} ;;state=2\n",
                zone.trim_end_matches('.'),
                flags,
                protocol,
                algorithm,
                BASE64.encode(public_key)
            ));
        }
    }
    std::fs::write(path, out).context("error while writing the anchor file")
}
