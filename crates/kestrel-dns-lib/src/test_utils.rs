use std::borrow::Cow;
use std::net::{Ipv4Addr, Ipv6Addr};

use prop::strategy::Union;
use proptest::collection::{hash_map, vec};
use proptest::prelude::*;

use crate::{QueryType, Question, ResourceData, ResourceRecord};

prop_compose! {
    pub fn arb_question()(qname in arb_qname(), query_type: QueryType, qclass: u16) -> Question<'static> {
        Question { qname, query_type, qclass}
    }
}

prop_compose! {
    pub fn arb_resource_record()(name in arb_qname(), resource_data in arb_resource_data(), class: u16, ttl: u32) -> ResourceRecord<'static> {
        ResourceRecord { name, class, ttl, resource_data }
    }
}

pub fn arb_resource_data() -> impl Strategy<Value = ResourceData<'static>> {
    let variants = vec![
        vec(any::<u8>(), 1..100)
            .prop_map(Cow::Owned)
            .prop_map(|rdata| ResourceData::UNKNOWN {
                // Use the reserved QTYPE to avoid collisions with QTYPEs that we handle
                qtype: 65535,
                rdata,
            })
            .boxed(),
        any::<Ipv4Addr>()
            .prop_map(|address| ResourceData::A { address })
            .boxed(),
        arb_qname()
            .prop_map(|qname| ResourceData::NS {
                ns_domain_name: qname,
            })
            .boxed(),
        arb_qname()
            .prop_map(|qname| ResourceData::CNAME { cname: qname })
            .boxed(),
        (arb_qname(), arb_qname(), any::<[u32; 5]>())
            .prop_map(|(mname, rname, timers)| ResourceData::SOA {
                mname,
                rname,
                serial: timers[0],
                refresh: timers[1],
                retry: timers[2],
                expire: timers[3],
                minimum: timers[4],
            })
            .boxed(),
        arb_qname()
            .prop_map(|qname| ResourceData::PTR {
                ptr_domain_name: qname,
            })
            .boxed(),
        (any::<u16>(), arb_qname())
            .prop_map(|(preference, exchange)| ResourceData::MX { preference, exchange })
            .boxed(),
        vec(vec(any::<u8>(), 0..100).prop_map(Cow::Owned), 0..4)
            .prop_map(|strings| ResourceData::TXT { strings })
            .boxed(),
        any::<Ipv6Addr>()
            .prop_map(|address| ResourceData::AAAA { address })
            .boxed(),
        proptest::option::of(hash_map(
            any::<u16>(),
            vec(any::<u8>(), 1..100).prop_map(Cow::Owned),
            1..10,
        ))
        .prop_map(|options| ResourceData::OPT { options })
        .boxed(),
        (any::<u16>(), any::<u8>(), any::<u8>(), vec(any::<u8>(), 1..64).prop_map(Cow::Owned))
            .prop_map(|(key_tag, algorithm, digest_type, digest)| ResourceData::DS {
                key_tag,
                algorithm,
                digest_type,
                digest,
            })
            .boxed(),
        (
            (any::<u16>(), any::<u8>(), any::<u8>(), any::<u32>()),
            (any::<u32>(), any::<u32>(), any::<u16>()),
            arb_qname(),
            vec(any::<u8>(), 1..128).prop_map(Cow::Owned),
        )
            .prop_map(
                |(
                    (type_covered, algorithm, labels, original_ttl),
                    (signature_expiration, signature_inception, key_tag),
                    signer_name,
                    signature,
                )| ResourceData::RRSIG {
                    type_covered,
                    algorithm,
                    labels,
                    original_ttl,
                    signature_expiration,
                    signature_inception,
                    key_tag,
                    signer_name,
                    signature,
                },
            )
            .boxed(),
        (arb_qname(), vec(any::<u8>(), 0..32).prop_map(Cow::Owned))
            .prop_map(|(next_domain_name, type_bitmaps)| ResourceData::NSEC {
                next_domain_name,
                type_bitmaps,
            })
            .boxed(),
        (any::<u16>(), any::<u8>(), any::<u8>(), vec(any::<u8>(), 1..128).prop_map(Cow::Owned))
            .prop_map(|(flags, protocol, algorithm, public_key)| ResourceData::DNSKEY {
                flags,
                protocol,
                algorithm,
                public_key,
            })
            .boxed(),
        (
            (any::<u8>(), any::<u8>(), any::<u16>()),
            vec(any::<u8>(), 0..16).prop_map(Cow::Owned),
            vec(any::<u8>(), 1..33).prop_map(Cow::Owned),
            vec(any::<u8>(), 0..32).prop_map(Cow::Owned),
        )
            .prop_map(
                |((hash_algorithm, flags, iterations), salt, next_hashed_owner, type_bitmaps)| {
                    ResourceData::NSEC3 {
                        hash_algorithm,
                        flags,
                        iterations,
                        salt,
                        next_hashed_owner,
                        type_bitmaps,
                    }
                },
            )
            .boxed(),
        (any::<u8>(), any::<u8>(), any::<u16>(), vec(any::<u8>(), 0..16).prop_map(Cow::Owned))
            .prop_map(|(hash_algorithm, flags, iterations, salt)| ResourceData::NSEC3PARAM {
                hash_algorithm,
                flags,
                iterations,
                salt,
            })
            .boxed(),
    ];

    Union::new(variants)
}

fn arb_qname() -> impl Strategy<Value = Cow<'static, str>> {
    proptest::string::string_regex(r"(([a-za-z0-9][a-za-z0-9-]{1,62}\.)+[a-za-z0-9]{2,63})|")
        .expect("regex should be valid")
        .prop_map(Cow::Owned)
}
