use std::cmp::Ordering;

use data_encoding::BASE32HEX_NOPAD;
use kestrel_dns_lib::utils::{canonical_name_cmp, canonical_wire_name, name_in_zone, parent_name};
use kestrel_dns_lib::{type_in_bitmap, QueryType, ResourceData};
use sha1::{Digest as _, Sha1};

use crate::cache::PackedRrset;

/// True if `name` falls in the open interval (owner, next) in canonical
/// order, handling the last-NSEC wrap back to the zone apex
pub fn nsec_covers(owner: &str, next: &str, name: &str) -> bool {
    let after_owner = canonical_name_cmp(name, owner) == Ordering::Greater;
    let before_next = canonical_name_cmp(name, next) == Ordering::Less;
    if canonical_name_cmp(owner, next) == Ordering::Less {
        after_owner && before_next
    } else {
        // The chain wraps: next is the apex
        after_owner || before_next
    }
}

/// NODATA proof: an NSEC at the qname itself whose bitmap has neither the
/// qtype nor CNAME
pub fn nsec_proves_nodata(nsec_sets: &[&PackedRrset], qname: &str, qtype: QueryType) -> bool {
    nsec_sets.iter().any(|set| {
        if !set.name.eq_ignore_ascii_case(qname) {
            return false;
        }
        set.rdatas.iter().any(|rdata| {
            if let ResourceData::NSEC { type_bitmaps, .. } = rdata {
                !type_in_bitmap(qtype, type_bitmaps) && !type_in_bitmap(QueryType::CNAME, type_bitmaps)
            } else {
                false
            }
        })
    })
}

/// NXDOMAIN proof: one NSEC covering the qname, and one covering (or
/// owning) the wildcard at the closest encloser
pub fn nsec_proves_name_error(nsec_sets: &[&PackedRrset], qname: &str) -> bool {
    let mut covering: Option<&PackedRrset> = None;
    for set in nsec_sets {
        for rdata in &set.rdatas {
            if let ResourceData::NSEC { next_domain_name, .. } = rdata {
                if nsec_covers(&set.name, next_domain_name, qname) {
                    covering = Some(set);
                }
            }
        }
    }
    let Some(covering) = covering else {
        return false;
    };

    // The closest encloser is the deepest ancestor of qname shared with
    // the covering interval's endpoints
    let closest_encloser = {
        let mut candidate = None;
        let mut name = qname;
        while let Some(parent) = parent_name(name) {
            let owner_touches = name_in_zone(&covering.name, parent);
            let next_touches = covering.rdatas.iter().any(|rdata| {
                matches!(rdata, ResourceData::NSEC { next_domain_name, .. } if name_in_zone(next_domain_name, parent))
            });
            if owner_touches || next_touches {
                candidate = Some(parent);
                break;
            }
            name = parent;
        }
        match candidate {
            Some(encloser) => encloser.to_string(),
            None => return false,
        }
    };

    // No wildcard expansion may have been possible either
    let wildcard = if closest_encloser.is_empty() {
        "*".to_string()
    } else {
        format!("*.{}", closest_encloser)
    };
    nsec_sets.iter().any(|set| {
        set.rdatas.iter().any(|rdata| {
            if let ResourceData::NSEC { next_domain_name, .. } = rdata {
                set.name.eq_ignore_ascii_case(&wildcard) || nsec_covers(&set.name, next_domain_name, &wildcard)
            } else {
                false
            }
        })
    })
}

/// RFC 5155 §5: iterated SHA-1 over the canonical owner name
pub fn nsec3_hash(name: &str, salt: &[u8], iterations: u16) -> Vec<u8> {
    let mut hash = {
        let mut hasher = Sha1::new();
        hasher.update(canonical_wire_name(name));
        hasher.update(salt);
        hasher.finalize().to_vec()
    };
    for _ in 0..iterations {
        let mut hasher = Sha1::new();
        hasher.update(&hash);
        hasher.update(salt);
        hash = hasher.finalize().to_vec();
    }
    hash
}

pub fn nsec3_hash_to_label(hash: &[u8]) -> String {
    BASE32HEX_NOPAD.encode(hash).to_lowercase()
}

/// The first label of an NSEC3 owner name, which is the base32hex hash
fn nsec3_owner_hash(owner: &str) -> Option<Vec<u8>> {
    let label = owner.split('.').next()?;
    BASE32HEX_NOPAD.decode(label.to_uppercase().as_bytes()).ok()
}

fn nsec3_params(set: &PackedRrset) -> Option<(u8, u16, Vec<u8>)> {
    set.rdatas.iter().find_map(|rdata| match rdata {
        ResourceData::NSEC3 {
            hash_algorithm,
            iterations,
            salt,
            ..
        } => Some((*hash_algorithm, *iterations, salt.to_vec())),
        _ => None,
    })
}

fn nsec3_matches(set: &PackedRrset, hash: &[u8]) -> bool {
    nsec3_owner_hash(&set.name).is_some_and(|owner_hash| owner_hash == hash)
}

fn nsec3_covers(set: &PackedRrset, hash: &[u8]) -> bool {
    let Some(owner_hash) = nsec3_owner_hash(&set.name) else {
        return false;
    };
    set.rdatas.iter().any(|rdata| {
        if let ResourceData::NSEC3 { next_hashed_owner, .. } = rdata {
            let next = next_hashed_owner.as_ref();
            if owner_hash.as_slice() < next {
                owner_hash.as_slice() < hash && hash < next
            } else {
                // Wrap around the end of the hash space
                hash > owner_hash.as_slice() || hash < next
            }
        } else {
            false
        }
    })
}

/// The largest iteration count used by any NSEC3 in the proof
pub fn max_nsec3_iterations(nsec3_sets: &[&PackedRrset]) -> u16 {
    nsec3_sets
        .iter()
        .filter_map(|set| nsec3_params(set).map(|(_, iterations, _)| iterations))
        .max()
        .unwrap_or(0)
}

/// NSEC3 NODATA proof: a matching NSEC3 for the qname with neither qtype
/// nor CNAME in its bitmap. The zone is the NSEC3 owner's parent side
pub fn nsec3_proves_nodata(nsec3_sets: &[&PackedRrset], qname: &str, qtype: QueryType) -> bool {
    nsec3_sets.iter().any(|set| {
        let Some((hash_algorithm, iterations, salt)) = nsec3_params(set) else {
            return false;
        };
        if hash_algorithm != 1 {
            return false;
        }
        let hash = nsec3_hash(qname, &salt, iterations);
        if !nsec3_matches(set, &hash) {
            return false;
        }
        set.rdatas.iter().any(|rdata| {
            if let ResourceData::NSEC3 { type_bitmaps, .. } = rdata {
                !type_in_bitmap(qtype, type_bitmaps) && !type_in_bitmap(QueryType::CNAME, type_bitmaps)
            } else {
                false
            }
        })
    })
}

/// NSEC3 NXDOMAIN proof (RFC 5155 §8.4): a closest-encloser match, the
/// next-closer name covered, and the wildcard at the encloser covered
pub fn nsec3_proves_name_error(nsec3_sets: &[&PackedRrset], qname: &str) -> bool {
    // Find the closest encloser with a matching NSEC3
    let mut encloser: Option<String> = None;
    let mut next_closer: Option<String> = None;
    let mut candidate = qname.to_string();
    loop {
        let matched = nsec3_sets.iter().any(|set| {
            let Some((hash_algorithm, iterations, salt)) = nsec3_params(set) else {
                return false;
            };
            hash_algorithm == 1 && nsec3_matches(set, &nsec3_hash(&candidate, &salt, iterations))
        });
        if matched {
            encloser = Some(candidate.clone());
            break;
        }
        let Some(parent) = parent_name(&candidate) else {
            break;
        };
        next_closer = Some(candidate.clone());
        candidate = parent.to_string();
    }
    let (Some(encloser), Some(next_closer)) = (encloser, next_closer) else {
        return false;
    };

    let covered = |name: &str| {
        nsec3_sets.iter().any(|set| {
            let Some((hash_algorithm, iterations, salt)) = nsec3_params(set) else {
                return false;
            };
            hash_algorithm == 1 && nsec3_covers(set, &nsec3_hash(name, &salt, iterations))
        })
    };

    let wildcard = if encloser.is_empty() {
        "*".to_string()
    } else {
        format!("*.{}", encloser)
    };
    covered(&next_closer) && covered(&wildcard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{RrsetFlags, SecurityStatus, TrustLevel};
    use kestrel_dns_lib::build_type_bitmap;

    fn nsec_set(owner: &str, next: &str, types: &[QueryType]) -> PackedRrset {
        PackedRrset {
            name: owner.into(),
            rtype: QueryType::NSEC,
            class: 1,
            flags: RrsetFlags::empty(),
            expiry: u64::MAX,
            rdatas: vec![ResourceData::NSEC {
                next_domain_name: next.to_string().into(),
                type_bitmaps: build_type_bitmap(types).into(),
            }],
            rrsigs: Vec::new(),
            trust: TrustLevel::Authority,
            security: SecurityStatus::Secure,
            id: 0,
        }
    }

    fn nsec3_set(zone: &str, hashed_owner: &str, next_hash: Vec<u8>, salt: &[u8], iterations: u16, types: &[QueryType]) -> PackedRrset {
        PackedRrset {
            name: format!("{}.{}", hashed_owner, zone),
            rtype: QueryType::NSEC3,
            class: 1,
            flags: RrsetFlags::empty(),
            expiry: u64::MAX,
            rdatas: vec![ResourceData::NSEC3 {
                hash_algorithm: 1,
                flags: 0,
                iterations,
                salt: salt.to_vec().into(),
                next_hashed_owner: next_hash.into(),
                type_bitmaps: build_type_bitmap(types).into(),
            }],
            rrsigs: Vec::new(),
            trust: TrustLevel::Authority,
            security: SecurityStatus::Secure,
            id: 0,
        }
    }

    #[test]
    fn nsec_interval_covering() {
        assert!(nsec_covers("a.example", "z.example", "m.example"));
        assert!(!nsec_covers("a.example", "z.example", "a.example"));
        assert!(!nsec_covers("a.example", "z.example", "z.example"));
        // Case-insensitive canonical order
        assert!(nsec_covers("a.example", "z.example", "M.EXAMPLE"));
        // Wrap: last NSEC in the zone points back to the apex
        assert!(nsec_covers("z.example", "example", "zz.example"));
        assert!(!nsec_covers("z.example", "example", "b.example"));
    }

    #[test]
    fn nodata_proof_needs_matching_owner_without_type() {
        let nsec = nsec_set("www.example", "zzz.example", &[QueryType::A, QueryType::NSEC]);
        assert!(nsec_proves_nodata(&[&nsec], "www.example", QueryType::AAAA));
        // Type present: no proof
        assert!(!nsec_proves_nodata(&[&nsec], "www.example", QueryType::A));
        // CNAME present means the name answers via the chain
        let cname_nsec = nsec_set("www.example", "zzz.example", &[QueryType::CNAME]);
        assert!(!nsec_proves_nodata(&[&cname_nsec], "www.example", QueryType::AAAA));
        // Wrong owner: no proof
        assert!(!nsec_proves_nodata(&[&nsec], "other.example", QueryType::AAAA));
    }

    #[test]
    fn name_error_proof_needs_cover_and_wildcard_denial() {
        // Zone 'example' with names a.example and z.example; qname m.example
        let cover = nsec_set("a.example", "z.example", &[QueryType::A]);
        // The wildcard *.example sorts before 'a.example': apex NSEC covers it
        let apex = nsec_set("example", "a.example", &[QueryType::SOA, QueryType::NS]);
        assert!(nsec_proves_name_error(&[&cover, &apex], "m.example"));

        // Without the wildcard-denying NSEC the proof is incomplete
        assert!(!nsec_proves_name_error(&[&cover], "m.example"));
    }

    #[test]
    fn nsec3_hashing_is_deterministic_and_iterated() {
        let salt = [0xaa, 0xbb];
        let h0 = nsec3_hash("example.com", &salt, 0);
        let h1 = nsec3_hash("example.com", &salt, 1);
        assert_eq!(h0.len(), 20);
        assert_ne!(h0, h1);
        // Case-insensitive input
        assert_eq!(nsec3_hash("EXAMPLE.COM", &salt, 5), nsec3_hash("example.com", &salt, 5));
        // Label round-trips through base32hex
        let label = nsec3_hash_to_label(&h0);
        assert_eq!(BASE32HEX_NOPAD.decode(label.to_uppercase().as_bytes()).unwrap(), h0);
    }

    #[test]
    fn nsec3_nodata_proof() {
        let salt = [0x01];
        let iterations = 2;
        let qname = "www.example.com";
        let hash = nsec3_hash(qname, &salt, iterations);
        let owner_label = nsec3_hash_to_label(&hash);

        let mut next = hash.clone();
        next[19] = next[19].wrapping_add(1);
        let set = nsec3_set("example.com", &owner_label, next, &salt, iterations, &[QueryType::A]);

        assert!(nsec3_proves_nodata(&[&set], qname, QueryType::AAAA));
        assert!(!nsec3_proves_nodata(&[&set], qname, QueryType::A));
        assert!(!nsec3_proves_nodata(&[&set], "other.example.com", QueryType::AAAA));
    }

    #[test]
    fn nsec3_name_error_proof() {
        let salt = [0x02];
        let iterations = 1;
        let qname = "missing.example.com";
        let encloser = "example.com";

        // Matching NSEC3 for the closest encloser
        let encloser_hash = nsec3_hash(encloser, &salt, iterations);
        let mut encloser_next = encloser_hash.clone();
        encloser_next[19] = encloser_next[19].wrapping_add(1);
        let encloser_set = nsec3_set(
            "example.com",
            &nsec3_hash_to_label(&encloser_hash),
            encloser_next,
            &salt,
            iterations,
            &[QueryType::SOA],
        );

        // One NSEC3 covering the whole hash space handles both the
        // next-closer name and the wildcard
        let low = vec![0u8; 20];
        let high = vec![0xffu8; 20];
        let covering_set = nsec3_set(
            "example.com",
            &nsec3_hash_to_label(&low),
            high,
            &salt,
            iterations,
            &[QueryType::A],
        );

        let sets = [&encloser_set, &covering_set];
        assert!(nsec3_proves_name_error(&sets, qname));
        // Without the covering interval the proof fails
        assert!(!nsec3_proves_name_error(&[&encloser_set], qname));
        assert_eq!(max_nsec3_iterations(&sets), 1);
    }
}
