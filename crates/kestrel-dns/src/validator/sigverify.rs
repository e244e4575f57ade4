use anyhow::Context;
use kestrel_dns_lib::utils::{canonical_wire_name, label_count, name_in_zone};
use kestrel_dns_lib::{ByteBuf, ResourceData};
use ring::signature;
use sha1::Digest as _;
use sha2::{Sha256, Sha384};

use crate::cache::PackedRrset;

/// DNSSEC algorithm numbers we can verify
pub const ALG_RSASHA1: u8 = 5;
pub const ALG_RSASHA1_NSEC3: u8 = 7;
pub const ALG_RSASHA256: u8 = 8;
pub const ALG_RSASHA512: u8 = 10;
pub const ALG_ECDSAP256SHA256: u8 = 13;
pub const ALG_ECDSAP384SHA384: u8 = 14;
pub const ALG_ED25519: u8 = 15;

pub const DIGEST_SHA1: u8 = 1;
pub const DIGEST_SHA256: u8 = 2;
pub const DIGEST_SHA384: u8 = 4;

pub fn algorithm_supported(algorithm: u8) -> bool {
    matches!(
        algorithm,
        ALG_RSASHA1 | ALG_RSASHA1_NSEC3 | ALG_RSASHA256 | ALG_RSASHA512 | ALG_ECDSAP256SHA256 | ALG_ECDSAP384SHA384 | ALG_ED25519
    )
}

/// Borrowed view of an RRSIG RDATA
#[derive(Debug, Clone, Copy)]
pub struct SigView<'a> {
    pub type_covered: u16,
    pub algorithm: u8,
    pub labels: u8,
    pub original_ttl: u32,
    pub expiration: u32,
    pub inception: u32,
    pub key_tag: u16,
    pub signer: &'a str,
    pub signature: &'a [u8],
}

impl<'a> SigView<'a> {
    pub fn from_rdata(rdata: &'a ResourceData<'_>) -> Option<Self> {
        match rdata {
            ResourceData::RRSIG {
                type_covered,
                algorithm,
                labels,
                original_ttl,
                signature_expiration,
                signature_inception,
                key_tag,
                signer_name,
                signature,
            } => Some(SigView {
                type_covered: *type_covered,
                algorithm: *algorithm,
                labels: *labels,
                original_ttl: *original_ttl,
                expiration: *signature_expiration,
                inception: *signature_inception,
                key_tag: *key_tag,
                signer: signer_name.as_ref(),
                signature: signature.as_ref(),
            }),
            _ => None,
        }
    }
}

/// Borrowed view of a DNSKEY RDATA
#[derive(Debug, Clone, Copy)]
pub struct KeyView<'a> {
    pub flags: u16,
    pub protocol: u8,
    pub algorithm: u8,
    pub public_key: &'a [u8],
}

impl<'a> KeyView<'a> {
    pub fn from_rdata(rdata: &'a ResourceData<'_>) -> Option<Self> {
        match rdata {
            ResourceData::DNSKEY {
                flags,
                protocol,
                algorithm,
                public_key,
            } => Some(KeyView {
                flags: *flags,
                protocol: *protocol,
                algorithm: *algorithm,
                public_key: public_key.as_ref(),
            }),
            _ => None,
        }
    }

    pub fn is_zone_key(&self) -> bool {
        self.flags & 0x100 != 0
    }

    pub fn is_revoked(&self) -> bool {
        self.flags & 0x80 != 0
    }

    /// DNSKEY RDATA in wire form, as hashed for key tags and DS digests
    pub fn rdata_wire(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(4 + self.public_key.len());
        wire.extend(self.flags.to_be_bytes());
        wire.push(self.protocol);
        wire.push(self.algorithm);
        wire.extend_from_slice(self.public_key);
        wire
    }

    /// RFC 4034 Appendix B key tag
    pub fn key_tag(&self) -> u16 {
        let wire = self.rdata_wire();
        let mut accumulator: u32 = 0;
        for (idx, byte) in wire.iter().enumerate() {
            if idx % 2 == 0 {
                accumulator += (*byte as u32) << 8;
            } else {
                accumulator += *byte as u32;
            }
        }
        accumulator += (accumulator >> 16) & 0xffff;
        (accumulator & 0xffff) as u16
    }

    /// Rough key size in bits, for the NSEC3 iteration table
    pub fn size_bits(&self) -> u16 {
        match self.algorithm {
            ALG_ECDSAP256SHA256 | ALG_ED25519 => 256,
            ALG_ECDSAP384SHA384 => 384,
            ALG_RSASHA1 | ALG_RSASHA1_NSEC3 | ALG_RSASHA256 | ALG_RSASHA512 => {
                // Exponent-length prefix, then exponent, then the modulus
                let key = self.public_key;
                let (exponent_len, header) = match key.first() {
                    Some(0) if key.len() >= 3 => {
                        (u16::from_be_bytes([key[1], key[2]]) as usize, 3)
                    }
                    Some(len) => (*len as usize, 1),
                    None => return 0,
                };
                let modulus_len = key.len().saturating_sub(header + exponent_len);
                (modulus_len * 8) as u16
            }
            _ => (self.public_key.len() * 8) as u16,
        }
    }
}

/// DS digest check: the digest is over canonical(owner) || DNSKEY RDATA
pub fn ds_matches_key(ds: &ResourceData<'_>, owner: &str, key: &KeyView<'_>) -> bool {
    let ResourceData::DS {
        key_tag,
        algorithm,
        digest_type,
        digest,
    } = ds
    else {
        return false;
    };
    if *key_tag != key.key_tag() || *algorithm != key.algorithm {
        return false;
    }

    let mut message = canonical_wire_name(owner);
    message.extend(key.rdata_wire());

    let computed: Vec<u8> = match *digest_type {
        DIGEST_SHA1 => sha1::Sha1::digest(&message).to_vec(),
        DIGEST_SHA256 => Sha256::digest(&message).to_vec(),
        DIGEST_SHA384 => Sha384::digest(&message).to_vec(),
        _ => return false,
    };
    computed.as_slice() == digest.as_ref()
}

/// RFC 1982 serial comparison for the 32-bit signature timestamps
fn serial_lt(s1: u32, s2: u32) -> bool {
    let i1 = s1 as i64;
    let i2 = s2 as i64;
    ((i1 < i2) && ((i2 - i1) < (1 << 31))) || ((i1 > i2) && ((i1 - i2) > (1 << 31)))
}

/// The owner name the signature actually covers. Fewer labels in the RRSIG
/// than in the owner means a wildcard expansion
fn signed_owner(owner: &str, sig_labels: u8) -> String {
    let owner_labels = label_count(owner);
    if sig_labels >= owner_labels {
        return owner.to_string();
    }
    let skip = (owner_labels - sig_labels) as usize;
    let rest: Vec<&str> = owner.split('.').skip(skip).collect();
    format!("*.{}", rest.join("."))
}

/// Builds the RFC 4034 §3.1.8.1 "signed data": RRSIG RDATA (minus the
/// signature) followed by every RR of the set in canonical form and order
pub fn build_signed_data(
    owner: &str,
    class: u16,
    sig: &SigView<'_>,
    rdatas: &[ResourceData<'static>],
) -> anyhow::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(1024);
    data.extend(sig.type_covered.to_be_bytes());
    data.push(sig.algorithm);
    data.push(sig.labels);
    data.extend(sig.original_ttl.to_be_bytes());
    data.extend(sig.expiration.to_be_bytes());
    data.extend(sig.inception.to_be_bytes());
    data.extend(sig.key_tag.to_be_bytes());
    data.extend(canonical_wire_name(sig.signer));

    let owner_wire = canonical_wire_name(&signed_owner(owner, sig.labels));

    // Canonical RDATA ordering, duplicates removed
    let mut encoded: Vec<Vec<u8>> = rdatas
        .iter()
        .map(|rdata| {
            let mut buf = ByteBuf::new_empty(None);
            rdata
                .encode_rdata_canonical(&mut buf)
                .context("canonical RDATA encoding")?;
            Ok(buf.into_inner().into_owned())
        })
        .collect::<anyhow::Result<_>>()?;
    encoded.sort();
    encoded.dedup();

    for rdata_wire in encoded {
        data.extend_from_slice(&owner_wire);
        data.extend(sig.type_covered.to_be_bytes());
        data.extend(class.to_be_bytes());
        data.extend(sig.original_ttl.to_be_bytes());
        // rdata_wire already carries its RDLENGTH prefix
        data.extend_from_slice(&rdata_wire);
    }

    Ok(data)
}

fn verify_raw(algorithm: u8, public_key: &[u8], message: &[u8], sig: &[u8]) -> anyhow::Result<()> {
    match algorithm {
        ALG_RSASHA1 | ALG_RSASHA1_NSEC3 | ALG_RSASHA256 | ALG_RSASHA512 => {
            // DNSKEY RSA keys use the RFC 3110 exponent-length format
            let (exponent, modulus) = match public_key.first() {
                Some(0) if public_key.len() >= 3 => {
                    let exponent_len = u16::from_be_bytes([public_key[1], public_key[2]]) as usize;
                    let rest = &public_key[3..];
                    anyhow::ensure!(rest.len() > exponent_len, "RSA key is too short");
                    rest.split_at(exponent_len)
                }
                Some(exponent_len) => {
                    let exponent_len = *exponent_len as usize;
                    let rest = &public_key[1..];
                    anyhow::ensure!(rest.len() > exponent_len, "RSA key is too short");
                    rest.split_at(exponent_len)
                }
                None => anyhow::bail!("empty RSA key"),
            };
            let params: &signature::RsaParameters = match algorithm {
                ALG_RSASHA256 => &signature::RSA_PKCS1_1024_8192_SHA256_FOR_LEGACY_USE_ONLY,
                ALG_RSASHA512 => &signature::RSA_PKCS1_1024_8192_SHA512_FOR_LEGACY_USE_ONLY,
                _ => &signature::RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY,
            };
            signature::RsaPublicKeyComponents { n: modulus, e: exponent }
                .verify(params, message, sig)
                .map_err(|_| anyhow::anyhow!("RSA signature verification failed"))
        }
        ALG_ECDSAP256SHA256 | ALG_ECDSAP384SHA384 => {
            // DNSKEY stores the bare X||Y point; ring wants it uncompressed
            let mut uncompressed = Vec::with_capacity(1 + public_key.len());
            uncompressed.push(0x04);
            uncompressed.extend_from_slice(public_key);
            let params: &signature::EcdsaVerificationAlgorithm = if algorithm == ALG_ECDSAP256SHA256 {
                &signature::ECDSA_P256_SHA256_FIXED
            } else {
                &signature::ECDSA_P384_SHA384_FIXED
            };
            signature::UnparsedPublicKey::new(params, &uncompressed)
                .verify(message, sig)
                .map_err(|_| anyhow::anyhow!("ECDSA signature verification failed"))
        }
        ALG_ED25519 => signature::UnparsedPublicKey::new(&signature::ED25519, public_key)
            .verify(message, sig)
            .map_err(|_| anyhow::anyhow!("Ed25519 signature verification failed")),
        other => anyhow::bail!("unsupported DNSSEC algorithm {}", other),
    }
}

/// Verifies one RRSIG of a packed RRset against one DNSKEY. `now` honors
/// the configured date override; skews loosen the inception/expiration
/// window to absorb clock drift
pub fn verify_rrset_with_key(
    rrset: &PackedRrset,
    sig: &SigView<'_>,
    key: &KeyView<'_>,
    now: u64,
    skew_min: u64,
    skew_max: u64,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        sig.type_covered == Into::<u16>::into(rrset.rtype),
        "RRSIG does not cover the record type"
    );
    anyhow::ensure!(
        name_in_zone(&rrset.name, sig.signer),
        "signer is not an ancestor of the owner"
    );
    anyhow::ensure!(sig.labels <= label_count(&rrset.name), "RRSIG label count exceeds the owner");
    anyhow::ensure!(key.is_zone_key(), "DNSKEY lacks the zone flag");
    anyhow::ensure!(!key.is_revoked(), "DNSKEY is revoked");
    anyhow::ensure!(sig.key_tag == key.key_tag(), "key tag mismatch");
    anyhow::ensure!(sig.algorithm == key.algorithm, "algorithm mismatch");
    anyhow::ensure!(
        !serial_lt(sig.expiration, sig.inception),
        "signature expires before its inception"
    );

    let now32 = now as u32;
    anyhow::ensure!(
        !serial_lt(now32.wrapping_add(skew_min as u32), sig.inception),
        "signature is not yet valid"
    );
    anyhow::ensure!(
        !serial_lt(sig.expiration, now32.wrapping_sub(skew_max as u32)),
        "signature has expired"
    );

    let message = build_signed_data(&rrset.name, rrset.class, sig, &rrset.rdatas)?;
    verify_raw(sig.algorithm, key.public_key, &message, sig.signature)
}

/// Outcome of verifying a whole RRset against a key set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// At least one signature validated
    Secure,
    /// Every signature uses an algorithm we cannot check
    UnsupportedOnly,
    /// Signatures exist but none validated
    Bogus,
    /// The set carries no signatures at all
    Unsigned,
}

/// Tries every RRSIG of the set against every candidate key
pub fn verify_rrset(
    rrset: &PackedRrset,
    keys: &[ResourceData<'static>],
    now: u64,
    skew_min: u64,
    skew_max: u64,
) -> VerifyOutcome {
    if rrset.rrsigs.is_empty() {
        return VerifyOutcome::Unsigned;
    }

    let mut any_supported = false;
    for rrsig in &rrset.rrsigs {
        let Some(sig) = SigView::from_rdata(rrsig) else {
            continue;
        };
        if !algorithm_supported(sig.algorithm) {
            continue;
        }
        any_supported = true;
        for key_rdata in keys {
            let Some(key) = KeyView::from_rdata(key_rdata) else {
                continue;
            };
            if key.key_tag() != sig.key_tag || key.algorithm != sig.algorithm {
                continue;
            }
            match verify_rrset_with_key(rrset, &sig, &key, now, skew_min, skew_max) {
                Ok(()) => return VerifyOutcome::Secure,
                Err(error) => {
                    tracing::debug!(
                        owner = ?rrset.name,
                        rtype = ?rrset.rtype,
                        key_tag = sig.key_tag,
                        "RRSIG failed: {:#}",
                        error
                    );
                }
            }
        }
    }

    if any_supported {
        VerifyOutcome::Bogus
    } else {
        VerifyOutcome::UnsupportedOnly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{RrsetFlags, SecurityStatus, TrustLevel};
    use data_encoding::BASE64;
    use kestrel_dns_lib::QueryType;
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair as _};

    fn packed_a(owner: &str, addr: &str, rrsig: Option<ResourceData<'static>>) -> PackedRrset {
        PackedRrset {
            name: owner.into(),
            rtype: QueryType::A,
            class: 1,
            flags: RrsetFlags::empty(),
            expiry: u64::MAX,
            rdatas: vec![ResourceData::A {
                address: addr.parse().unwrap(),
            }],
            rrsigs: rrsig.into_iter().collect(),
            trust: TrustLevel::AnswerAa,
            security: SecurityStatus::Indeterminate,
            id: 0,
        }
    }

    /// RFC 6605 §6.1: the published ECDSAP256SHA256 example for
    /// www.example.net, validated at a date inside the signature window
    #[test]
    fn rfc6605_ecdsa_p256_example_validates() {
        let public_key = BASE64
            .decode(b"GojIhhXUN/u4v54ZQqGSnyhWJwaubCvTmeexv7bR6edbkrSqQpF64cYbcB7wNcP+e+MAnLr+Wi9xMWyQLc8NAA==")
            .unwrap();
        let signature = BASE64
            .decode(b"qx6wLYqmh+l9oCKTN6qIc+bw6ya+KJ8oMz0YP107epXAyGmt+3SNruPFKG7tZoLBLlUzGGus7ZwmwWep666VCw==")
            .unwrap();

        let key = ResourceData::DNSKEY {
            flags: 257,
            protocol: 3,
            algorithm: ALG_ECDSAP256SHA256,
            public_key: public_key.into(),
        };
        let key_view = KeyView::from_rdata(&key).unwrap();
        // Key tag printed in the RFC
        assert_eq!(key_view.key_tag(), 55648);
        assert_eq!(key_view.size_bits(), 256);

        let rrsig = ResourceData::RRSIG {
            type_covered: 1,
            algorithm: ALG_ECDSAP256SHA256,
            labels: 3,
            original_ttl: 3600,
            // 20100909100439 and 20100812100439 as epoch seconds
            signature_expiration: 1284026679,
            signature_inception: 1281607479,
            key_tag: 55648,
            signer_name: "example.net".into(),
            signature: signature.into(),
        };

        let mut rrset = packed_a("www.example.net", "192.0.2.1", Some(rrsig));
        let outcome = verify_rrset(&rrset, std::slice::from_ref(&key), 1282000000, 3600, 86400);
        assert_eq!(outcome, VerifyOutcome::Secure);

        // Tampering with the RDATA must break the signature
        rrset.rdatas[0] = ResourceData::A {
            address: "192.0.2.2".parse().unwrap(),
        };
        let outcome = verify_rrset(&rrset, std::slice::from_ref(&key), 1282000000, 3600, 86400);
        assert_eq!(outcome, VerifyOutcome::Bogus);
    }

    fn ed25519_signed_rrset(now: u64) -> (PackedRrset, ResourceData<'static>) {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).expect("keygen");
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).expect("keypair");
        let public_key = pair.public_key().as_ref().to_vec();

        let key = ResourceData::DNSKEY {
            flags: 256,
            protocol: 3,
            algorithm: ALG_ED25519,
            public_key: public_key.into(),
        };
        let key_tag = KeyView::from_rdata(&key).unwrap().key_tag();

        let mut rrset = packed_a("host.example.org", "192.0.2.9", None);
        let sig_template = SigView {
            type_covered: 1,
            algorithm: ALG_ED25519,
            labels: 3,
            original_ttl: 300,
            expiration: (now + 3600) as u32,
            inception: (now - 3600) as u32,
            key_tag,
            signer: "example.org",
            signature: &[],
        };
        let message = build_signed_data(&rrset.name, rrset.class, &sig_template, &rrset.rdatas).unwrap();
        let signature = pair.sign(&message).as_ref().to_vec();

        rrset.rrsigs.push(ResourceData::RRSIG {
            type_covered: 1,
            algorithm: ALG_ED25519,
            labels: 3,
            original_ttl: 300,
            signature_expiration: (now + 3600) as u32,
            signature_inception: (now - 3600) as u32,
            key_tag,
            signer_name: "example.org".into(),
            signature: signature.into(),
        });
        (rrset, key)
    }

    #[test]
    fn ed25519_roundtrip_and_expiry_window() {
        let now = 1_700_000_000u64;
        let (rrset, key) = ed25519_signed_rrset(now);

        let keys = vec![key];
        assert_eq!(verify_rrset(&rrset, &keys, now, 3600, 86400), VerifyOutcome::Secure);

        // Past expiration plus the allowed skew
        let late = now + 3600 + 86400 + 10;
        assert_eq!(verify_rrset(&rrset, &keys, late, 3600, 86400), VerifyOutcome::Bogus);

        // Well before inception
        let early = now - 3600 - 7200;
        assert_eq!(verify_rrset(&rrset, &keys, early, 3600, 86400), VerifyOutcome::Bogus);
    }

    #[test]
    fn wrong_signer_zone_is_rejected() {
        let now = 1_700_000_000u64;
        let (mut rrset, key) = ed25519_signed_rrset(now);
        // An owner outside the signer's zone must not validate
        rrset.name = "host.elsewhere.net".into();
        assert_eq!(verify_rrset(&rrset, &[key], now, 3600, 86400), VerifyOutcome::Bogus);
    }

    #[test]
    fn unsigned_and_unsupported_outcomes() {
        let rrset = packed_a("www.example.com", "192.0.2.1", None);
        assert_eq!(verify_rrset(&rrset, &[], 0, 0, 0), VerifyOutcome::Unsigned);

        let rrsig = ResourceData::RRSIG {
            type_covered: 1,
            algorithm: 200,
            labels: 3,
            original_ttl: 300,
            signature_expiration: 100,
            signature_inception: 0,
            key_tag: 1,
            signer_name: "example.com".into(),
            signature: vec![0u8; 64].into(),
        };
        let rrset = packed_a("www.example.com", "192.0.2.1", Some(rrsig));
        assert_eq!(verify_rrset(&rrset, &[], 0, 0, 0), VerifyOutcome::UnsupportedOnly);
    }

    #[test]
    fn ds_digest_matching() {
        let public_key = BASE64
            .decode(b"GojIhhXUN/u4v54ZQqGSnyhWJwaubCvTmeexv7bR6edbkrSqQpF64cYbcB7wNcP+e+MAnLr+Wi9xMWyQLc8NAA==")
            .unwrap();
        let key = ResourceData::DNSKEY {
            flags: 257,
            protocol: 3,
            algorithm: ALG_ECDSAP256SHA256,
            public_key: public_key.into(),
        };
        let key_view = KeyView::from_rdata(&key).unwrap();

        // Build the matching DS ourselves, then check both accept and reject
        let mut message = canonical_wire_name("example.net");
        message.extend(key_view.rdata_wire());
        let digest = Sha256::digest(&message).to_vec();

        let ds = ResourceData::DS {
            key_tag: 55648,
            algorithm: ALG_ECDSAP256SHA256,
            digest_type: DIGEST_SHA256,
            digest: digest.clone().into(),
        };
        assert!(ds_matches_key(&ds, "example.net", &key_view));
        assert!(!ds_matches_key(&ds, "example.org", &key_view));

        let wrong_tag = ResourceData::DS {
            key_tag: 1,
            algorithm: ALG_ECDSAP256SHA256,
            digest_type: DIGEST_SHA256,
            digest: digest.into(),
        };
        assert!(!ds_matches_key(&wrong_tag, "example.net", &key_view));
    }

    #[test]
    fn wildcard_owner_reconstruction() {
        assert_eq!(signed_owner("www.example.com", 3), "www.example.com");
        assert_eq!(signed_owner("www.example.com", 2), "*.example.com");
        assert_eq!(signed_owner("a.b.example.com", 2), "*.example.com");
    }
}
