use std::borrow::Cow;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::num::NonZero;

use anyhow::Context;

use crate::buf::EncodedSize;
use crate::utils::get_max_encoded_qname_size;
use crate::{ByteBuf, EncodeToBuf, FromBuf, QueryType};

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ResourceRecord<'a> {
    pub name: Cow<'a, str>,
    pub class: u16,
    pub ttl: u32,
    pub resource_data: ResourceData<'a>,
}

impl<'a> ResourceRecord<'a> {
    pub fn new(
        name: impl Into<Cow<'a, str>>,
        resource_data: ResourceData<'a>,
        ttl: Option<u32>,
        class: Option<u16>,
    ) -> Self {
        ResourceRecord {
            name: name.into(),
            ttl: ttl.unwrap_or_default(),
            class: class.unwrap_or(1),
            resource_data,
        }
    }

    pub fn into_owned(self) -> ResourceRecord<'static> {
        ResourceRecord {
            name: self.name.into_owned().into(),
            class: self.class,
            ttl: self.ttl,
            resource_data: self.resource_data.into_owned(),
        }
    }

    pub fn get_edns_data(&self) -> Option<EdnsData> {
        match self.resource_data.get_query_type() {
            QueryType::OPT => {
                let udp_payload_size = self.class as usize;
                let ttl_bytes = self.ttl.to_be_bytes();
                let extended_rcode = NonZero::new(ttl_bytes[0]);
                let version = ttl_bytes[1];
                let dnssec_ok_bit = ttl_bytes[2] & 0x80 == 0x80;
                Some(EdnsData {
                    udp_payload_size,
                    extended_rcode,
                    dnssec_ok_bit,
                    version,
                })
            }
            _ => None,
        }
    }
}

impl FromBuf for ResourceRecord<'_> {
    fn from_buf(buf: &mut ByteBuf<'_>) -> anyhow::Result<ResourceRecord<'static>> {
        let name = buf.read_qname().context("NAME is missing")?;
        let query_type: QueryType = buf.read_u16().context("TYPE is missing")?.into();
        let class = buf.read_u16().context("CLASS is missing")?;
        let ttl = buf.read_u32().context("TTL is missing")?;
        let resource_data =
            ResourceData::from_buf_with_type(buf, query_type).context("can't decode RDATA")?;
        Ok(ResourceRecord {
            name,
            ttl,
            resource_data,
            class,
        })
    }
}

impl<'a> EncodeToBuf for ResourceRecord<'a> {
    fn encode_to_buf_with_cache<'cache, 'r: 'cache>(
        &'r self,
        buf: &mut ByteBuf,
        mut label_cache: Option<&mut HashMap<&'cache str, usize>>,
        max_size: Option<usize>,
    ) -> anyhow::Result<usize> {
        let encoded_size = self.get_encoded_size(label_cache.as_deref());
        if max_size.is_some_and(|max_size| encoded_size > max_size) {
            return Ok(0);
        }

        let start_len = buf.len();
        buf.write_qname(&self.name, label_cache.as_deref_mut())
            .context("writing NAME")?;
        buf.write_u16(self.resource_data.get_query_type().into())
            .context("writing TYPE")?;
        buf.write_u16(self.class).context("writing CLASS")?;
        buf.write_u32(self.ttl).context("writing TTL")?;

        self.resource_data
            .encode_to_buf_with_cache(buf, label_cache, None)
            .context("writing RDATA")?;

        Ok(buf.len() - start_len)
    }
}

impl EncodedSize for ResourceRecord<'_> {
    fn get_encoded_size(&self, label_cache: Option<&HashMap<&str, usize>>) -> usize {
        get_max_encoded_qname_size(&self.name, label_cache) + 2 /* TYPE */ + 2 /* CLASS */ + 4 /* TTL */
            + self.resource_data.get_encoded_size(None)
    }
}

#[derive(Debug)]
pub struct EdnsData {
    pub udp_payload_size: usize,
    pub extended_rcode: Option<NonZero<u8>>,
    /// Is set to `true` by DNSSEC-aware clients
    pub dnssec_ok_bit: bool,
    pub version: u8,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ResourceData<'a> {
    UNKNOWN {
        qtype: u16,
        rdata: Cow<'a, [u8]>,
    },
    A {
        address: Ipv4Addr,
    },
    NS {
        ns_domain_name: Cow<'a, str>,
    },
    CNAME {
        cname: Cow<'a, str>,
    },
    SOA {
        mname: Cow<'a, str>,
        rname: Cow<'a, str>,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    PTR {
        ptr_domain_name: Cow<'a, str>,
    },
    MX {
        preference: u16,
        exchange: Cow<'a, str>,
    },
    TXT {
        strings: Vec<Cow<'a, [u8]>>,
    },
    AAAA {
        address: Ipv6Addr,
    },
    OPT {
        options: Option<HashMap<u16, Cow<'a, [u8]>>>,
    },
    DS {
        key_tag: u16,
        algorithm: u8,
        digest_type: u8,
        digest: Cow<'a, [u8]>,
    },
    RRSIG {
        type_covered: u16,
        algorithm: u8,
        labels: u8,
        original_ttl: u32,
        signature_expiration: u32,
        signature_inception: u32,
        key_tag: u16,
        signer_name: Cow<'a, str>,
        signature: Cow<'a, [u8]>,
    },
    NSEC {
        next_domain_name: Cow<'a, str>,
        type_bitmaps: Cow<'a, [u8]>,
    },
    DNSKEY {
        flags: u16,
        protocol: u8,
        algorithm: u8,
        public_key: Cow<'a, [u8]>,
    },
    NSEC3 {
        hash_algorithm: u8,
        flags: u8,
        iterations: u16,
        salt: Cow<'a, [u8]>,
        next_hashed_owner: Cow<'a, [u8]>,
        type_bitmaps: Cow<'a, [u8]>,
    },
    NSEC3PARAM {
        hash_algorithm: u8,
        flags: u8,
        iterations: u16,
        salt: Cow<'a, [u8]>,
    },
}

impl<'a> ResourceData<'a> {
    pub fn from_buf_with_type(
        buf: &mut ByteBuf<'a>,
        query_type: QueryType,
    ) -> anyhow::Result<ResourceData<'static>> {
        let rd_length = buf.read_u16().context("RDLENGTH is missing")? as usize;
        let rdata_start = buf.pos();
        Ok(match query_type {
            QueryType::UNKNOWN(query_type) => {
                let data = buf
                    .read_bytes(rd_length)
                    .context("UNKNOWN record: RDATA is missing")?;
                ResourceData::UNKNOWN {
                    qtype: query_type,
                    rdata: data.to_vec().into(),
                }
            }
            QueryType::ANY => anyhow::bail!("ANY record doesn't exist"),
            QueryType::A => {
                if rd_length != 4 {
                    anyhow::bail!("A record: unexpected RDLENGTH {}", rd_length);
                }
                let address_raw = buf.read_bytes(4).context("A record: ADDRESS is missing")?;
                let address = Ipv4Addr::from(TryInto::<[u8; 4]>::try_into(address_raw).unwrap());
                ResourceData::A { address }
            }
            QueryType::NS => {
                let ns_domain_name = buf.read_qname().context("NS record: NSDNAME is missing")?;
                ResourceData::NS { ns_domain_name }
            }
            QueryType::CNAME => {
                let cname = buf.read_qname().context("CNAME record: CNAME is missing")?;
                ResourceData::CNAME { cname }
            }
            QueryType::SOA => {
                let mname = buf.read_qname().context("SOA record: MNAME is missing")?;
                let rname = buf.read_qname().context("SOA record: RNAME is missing")?;
                let serial = buf.read_u32().context("SOA record: SERIAL is missing")?;
                let refresh = buf.read_u32().context("SOA record: REFRESH is missing")?;
                let retry = buf.read_u32().context("SOA record: RETRY is missing")?;
                let expire = buf.read_u32().context("SOA record: EXPIRE is missing")?;
                let minimum = buf.read_u32().context("SOA record: MINIMUM is missing")?;
                ResourceData::SOA {
                    mname,
                    rname,
                    serial,
                    refresh,
                    retry,
                    expire,
                    minimum,
                }
            }
            QueryType::PTR => {
                let ptr_domain_name = buf.read_qname().context("PTR record: PTRDNAME is missing")?;
                ResourceData::PTR { ptr_domain_name }
            }
            QueryType::MX => {
                let preference = buf.read_u16().context("MX record: PREFERENCE is missing")?;
                let exchange = buf.read_qname().context("MX record: EXCHANGE is missing")?;
                ResourceData::MX { preference, exchange }
            }
            QueryType::TXT => {
                let mut strings = Vec::new();
                while buf.pos() - rdata_start < rd_length {
                    let length = buf.read_u8().context("TXT record: string length is missing")?;
                    let data = buf
                        .read_bytes(length as usize)
                        .context("TXT record: string data is missing")?;
                    strings.push(Cow::Owned(data.to_vec()));
                }
                ResourceData::TXT { strings }
            }
            QueryType::AAAA => {
                if rd_length != 16 {
                    anyhow::bail!("AAAA record: unexpected RDLENGTH {}", rd_length);
                }
                let address_raw = buf
                    .read_bytes(16)
                    .context("AAAA record: ADDRESS is missing")?;
                let address = Ipv6Addr::from(TryInto::<[u8; 16]>::try_into(address_raw).unwrap());
                ResourceData::AAAA { address }
            }
            QueryType::OPT => {
                let mut remaining_rd_length = rd_length;
                let mut options: Option<HashMap<_, _>> = None;
                while remaining_rd_length != 0 {
                    let option = buf.read_u16().with_context(|| {
                        format!(
                            "OPT record: option code is missing at RDLENGTH offset {}",
                            rd_length - remaining_rd_length
                        )
                    })?;
                    let option_length = buf.read_u16().with_context(|| {
                        format!("OPT record: option length is missing for option {}", option)
                    })?;
                    let option_data = buf.read_bytes(option_length as usize).with_context(|| {
                        format!(
                            "OPT record: option data of length {} is missing for option {}",
                            option_length, option
                        )
                    })?;
                    options
                        .get_or_insert_with(Default::default)
                        .insert(option, option_data.to_vec().into());
                    remaining_rd_length = remaining_rd_length
                        .checked_sub(4 + option_length as usize)
                        .context("OPT record: option overruns RDLENGTH")?;
                }
                ResourceData::OPT { options }
            }
            QueryType::DS => {
                let key_tag = buf.read_u16().context("DS record: KEY TAG is missing")?;
                let algorithm = buf.read_u8().context("DS record: ALGORITHM is missing")?;
                let digest_type = buf.read_u8().context("DS record: DIGEST TYPE is missing")?;
                let digest_length = rd_length
                    .checked_sub(4)
                    .context("DS record: RDLENGTH is too small")?;
                let digest = buf
                    .read_bytes(digest_length)
                    .context("DS record: DIGEST is missing")?;
                ResourceData::DS {
                    key_tag,
                    algorithm,
                    digest_type,
                    digest: digest.to_vec().into(),
                }
            }
            QueryType::RRSIG => {
                let type_covered = buf.read_u16().context("RRSIG record: TYPE COVERED is missing")?;
                let algorithm = buf.read_u8().context("RRSIG record: ALGORITHM is missing")?;
                let labels = buf.read_u8().context("RRSIG record: LABELS is missing")?;
                let original_ttl = buf.read_u32().context("RRSIG record: ORIGINAL TTL is missing")?;
                let signature_expiration = buf
                    .read_u32()
                    .context("RRSIG record: SIGNATURE EXPIRATION is missing")?;
                let signature_inception = buf
                    .read_u32()
                    .context("RRSIG record: SIGNATURE INCEPTION is missing")?;
                let key_tag = buf.read_u16().context("RRSIG record: KEY TAG is missing")?;
                // Signer names are never compressed (RFC 4034), so the consumed
                // byte count below is reliable
                let signer_name = buf.read_qname().context("RRSIG record: SIGNER'S NAME is missing")?;
                let signature_length = rd_length
                    .checked_sub(buf.pos() - rdata_start)
                    .context("RRSIG record: RDLENGTH is too small")?;
                let signature = buf
                    .read_bytes(signature_length)
                    .context("RRSIG record: SIGNATURE is missing")?;
                ResourceData::RRSIG {
                    type_covered,
                    algorithm,
                    labels,
                    original_ttl,
                    signature_expiration,
                    signature_inception,
                    key_tag,
                    signer_name,
                    signature: signature.to_vec().into(),
                }
            }
            QueryType::NSEC => {
                let next_domain_name = buf
                    .read_qname()
                    .context("NSEC record: NEXT DOMAIN NAME is missing")?;
                let bitmap_length = rd_length
                    .checked_sub(buf.pos() - rdata_start)
                    .context("NSEC record: RDLENGTH is too small")?;
                let type_bitmaps = buf
                    .read_bytes(bitmap_length)
                    .context("NSEC record: TYPE BIT MAPS is missing")?;
                ResourceData::NSEC {
                    next_domain_name,
                    type_bitmaps: type_bitmaps.to_vec().into(),
                }
            }
            QueryType::DNSKEY => {
                let flags = buf.read_u16().context("DNSKEY record: FLAGS is missing")?;
                let protocol = buf.read_u8().context("DNSKEY record: PROTOCOL is missing")?;
                let algorithm = buf.read_u8().context("DNSKEY record: ALGORITHM is missing")?;
                let key_length = rd_length
                    .checked_sub(4)
                    .context("DNSKEY record: RDLENGTH is too small")?;
                let public_key = buf
                    .read_bytes(key_length)
                    .context("DNSKEY record: PUBLIC KEY is missing")?;
                ResourceData::DNSKEY {
                    flags,
                    protocol,
                    algorithm,
                    public_key: public_key.to_vec().into(),
                }
            }
            QueryType::NSEC3 => {
                let hash_algorithm = buf.read_u8().context("NSEC3 record: HASH ALG is missing")?;
                let flags = buf.read_u8().context("NSEC3 record: FLAGS is missing")?;
                let iterations = buf.read_u16().context("NSEC3 record: ITERATIONS is missing")?;
                let salt_length = buf.read_u8().context("NSEC3 record: SALT LENGTH is missing")?;
                let salt = buf
                    .read_bytes(salt_length as usize)
                    .context("NSEC3 record: SALT is missing")?
                    .to_vec();
                let hash_length = buf.read_u8().context("NSEC3 record: HASH LENGTH is missing")?;
                let next_hashed_owner = buf
                    .read_bytes(hash_length as usize)
                    .context("NSEC3 record: NEXT HASHED OWNER is missing")?
                    .to_vec();
                let bitmap_length = rd_length
                    .checked_sub(buf.pos() - rdata_start)
                    .context("NSEC3 record: RDLENGTH is too small")?;
                let type_bitmaps = buf
                    .read_bytes(bitmap_length)
                    .context("NSEC3 record: TYPE BIT MAPS is missing")?;
                ResourceData::NSEC3 {
                    hash_algorithm,
                    flags,
                    iterations,
                    salt: salt.into(),
                    next_hashed_owner: next_hashed_owner.into(),
                    type_bitmaps: type_bitmaps.to_vec().into(),
                }
            }
            QueryType::NSEC3PARAM => {
                let hash_algorithm = buf.read_u8().context("NSEC3PARAM record: HASH ALG is missing")?;
                let flags = buf.read_u8().context("NSEC3PARAM record: FLAGS is missing")?;
                let iterations = buf.read_u16().context("NSEC3PARAM record: ITERATIONS is missing")?;
                let salt_length = buf.read_u8().context("NSEC3PARAM record: SALT LENGTH is missing")?;
                let salt = buf
                    .read_bytes(salt_length as usize)
                    .context("NSEC3PARAM record: SALT is missing")?;
                ResourceData::NSEC3PARAM {
                    hash_algorithm,
                    flags,
                    iterations,
                    salt: salt.to_vec().into(),
                }
            }
        })
    }

    pub fn get_query_type(&self) -> QueryType {
        match self {
            ResourceData::UNKNOWN { qtype, .. } => QueryType::UNKNOWN(*qtype),
            ResourceData::A { .. } => QueryType::A,
            ResourceData::NS { .. } => QueryType::NS,
            ResourceData::CNAME { .. } => QueryType::CNAME,
            ResourceData::SOA { .. } => QueryType::SOA,
            ResourceData::PTR { .. } => QueryType::PTR,
            ResourceData::MX { .. } => QueryType::MX,
            ResourceData::TXT { .. } => QueryType::TXT,
            ResourceData::AAAA { .. } => QueryType::AAAA,
            ResourceData::OPT { .. } => QueryType::OPT,
            ResourceData::DS { .. } => QueryType::DS,
            ResourceData::RRSIG { .. } => QueryType::RRSIG,
            ResourceData::NSEC { .. } => QueryType::NSEC,
            ResourceData::DNSKEY { .. } => QueryType::DNSKEY,
            ResourceData::NSEC3 { .. } => QueryType::NSEC3,
            ResourceData::NSEC3PARAM { .. } => QueryType::NSEC3PARAM,
        }
    }

    pub fn into_owned(self) -> ResourceData<'static> {
        match self {
            ResourceData::UNKNOWN { qtype, rdata } => ResourceData::UNKNOWN {
                qtype,
                rdata: rdata.into_owned().into(),
            },
            ResourceData::A { address } => ResourceData::A { address },
            ResourceData::NS { ns_domain_name } => ResourceData::NS {
                ns_domain_name: ns_domain_name.into_owned().into(),
            },
            ResourceData::CNAME { cname } => ResourceData::CNAME {
                cname: cname.into_owned().into(),
            },
            ResourceData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => ResourceData::SOA {
                mname: mname.into_owned().into(),
                rname: rname.into_owned().into(),
                serial,
                refresh,
                retry,
                expire,
                minimum,
            },
            ResourceData::PTR { ptr_domain_name } => ResourceData::PTR {
                ptr_domain_name: ptr_domain_name.into_owned().into(),
            },
            ResourceData::MX { preference, exchange } => ResourceData::MX {
                preference,
                exchange: exchange.into_owned().into(),
            },
            ResourceData::TXT { strings } => ResourceData::TXT {
                strings: strings
                    .into_iter()
                    .map(|string| string.into_owned().into())
                    .collect(),
            },
            ResourceData::AAAA { address } => ResourceData::AAAA { address },
            ResourceData::OPT { options } => ResourceData::OPT {
                options: options.map(|options| {
                    options
                        .into_iter()
                        .map(|(code, data)| (code, Cow::Owned(data.into_owned())))
                        .collect()
                }),
            },
            ResourceData::DS {
                key_tag,
                algorithm,
                digest_type,
                digest,
            } => ResourceData::DS {
                key_tag,
                algorithm,
                digest_type,
                digest: digest.into_owned().into(),
            },
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
            } => ResourceData::RRSIG {
                type_covered,
                algorithm,
                labels,
                original_ttl,
                signature_expiration,
                signature_inception,
                key_tag,
                signer_name: signer_name.into_owned().into(),
                signature: signature.into_owned().into(),
            },
            ResourceData::NSEC {
                next_domain_name,
                type_bitmaps,
            } => ResourceData::NSEC {
                next_domain_name: next_domain_name.into_owned().into(),
                type_bitmaps: type_bitmaps.into_owned().into(),
            },
            ResourceData::DNSKEY {
                flags,
                protocol,
                algorithm,
                public_key,
            } => ResourceData::DNSKEY {
                flags,
                protocol,
                algorithm,
                public_key: public_key.into_owned().into(),
            },
            ResourceData::NSEC3 {
                hash_algorithm,
                flags,
                iterations,
                salt,
                next_hashed_owner,
                type_bitmaps,
            } => ResourceData::NSEC3 {
                hash_algorithm,
                flags,
                iterations,
                salt: salt.into_owned().into(),
                next_hashed_owner: next_hashed_owner.into_owned().into(),
                type_bitmaps: type_bitmaps.into_owned().into(),
            },
            ResourceData::NSEC3PARAM {
                hash_algorithm,
                flags,
                iterations,
                salt,
            } => ResourceData::NSEC3PARAM {
                hash_algorithm,
                flags,
                iterations,
                salt: salt.into_owned().into(),
            },
        }
    }

    /// Encodes RDLENGTH + RDATA in DNSSEC canonical form (RFC 4034 §6.2):
    /// embedded names are lowercased and never compressed
    pub fn encode_rdata_canonical(&self, buf: &mut ByteBuf) -> anyhow::Result<()> {
        match self {
            ResourceData::NS { ns_domain_name } => {
                let rdata_pos = buf.len();
                buf.write_u16(0).context("NS record: writing stub RDLENGTH")?;
                let qname_length = buf
                    .write_qname_canonical(ns_domain_name)
                    .context("NS record: writing NSDNAME")?;
                buf.set_u16(rdata_pos, qname_length as u16)
                    .context("NS record: writing RDLENGTH")?;
            }
            ResourceData::CNAME { cname } => {
                let rdata_pos = buf.len();
                buf.write_u16(0).context("CNAME record: writing stub RDLENGTH")?;
                let qname_length = buf
                    .write_qname_canonical(cname)
                    .context("CNAME record: writing CNAME")?;
                buf.set_u16(rdata_pos, qname_length as u16)
                    .context("CNAME record: writing RDLENGTH")?;
            }
            ResourceData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                let rdata_pos = buf.len();
                buf.write_u16(0).context("SOA record: writing stub RDLENGTH")?;
                let mut rd_length = buf
                    .write_qname_canonical(mname)
                    .context("SOA record: writing MNAME")?;
                rd_length += buf
                    .write_qname_canonical(rname)
                    .context("SOA record: writing RNAME")?;
                for field in [serial, refresh, retry, expire, minimum] {
                    buf.write_u32(*field).context("SOA record: writing timers")?;
                }
                rd_length += 20;
                buf.set_u16(rdata_pos, rd_length as u16)
                    .context("SOA record: writing RDLENGTH")?;
            }
            ResourceData::PTR { ptr_domain_name } => {
                let rdata_pos = buf.len();
                buf.write_u16(0).context("PTR record: writing stub RDLENGTH")?;
                let qname_length = buf
                    .write_qname_canonical(ptr_domain_name)
                    .context("PTR record: writing PTRDNAME")?;
                buf.set_u16(rdata_pos, qname_length as u16)
                    .context("PTR record: writing RDLENGTH")?;
            }
            ResourceData::MX { preference, exchange } => {
                let rdata_pos = buf.len();
                buf.write_u16(0).context("MX record: writing stub RDLENGTH")?;
                buf.write_u16(*preference).context("MX record: writing PREFERENCE")?;
                let qname_length = buf
                    .write_qname_canonical(exchange)
                    .context("MX record: writing EXCHANGE")?;
                buf.set_u16(rdata_pos, (qname_length + 2) as u16)
                    .context("MX record: writing RDLENGTH")?;
            }
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
            } => {
                let rdata_pos = buf.len();
                buf.write_u16(0).context("RRSIG record: writing stub RDLENGTH")?;
                buf.write_u16(*type_covered).context("RRSIG record: writing TYPE COVERED")?;
                buf.write_u8(*algorithm);
                buf.write_u8(*labels);
                buf.write_u32(*original_ttl).context("RRSIG record: writing ORIGINAL TTL")?;
                buf.write_u32(*signature_expiration)
                    .context("RRSIG record: writing EXPIRATION")?;
                buf.write_u32(*signature_inception)
                    .context("RRSIG record: writing INCEPTION")?;
                buf.write_u16(*key_tag).context("RRSIG record: writing KEY TAG")?;
                let signer_length = buf
                    .write_qname_canonical(signer_name)
                    .context("RRSIG record: writing SIGNER'S NAME")?;
                buf.write_bytes(signature, None)
                    .context("RRSIG record: writing SIGNATURE")?;
                buf.set_u16(rdata_pos, (18 + signer_length + signature.len()) as u16)
                    .context("RRSIG record: writing RDLENGTH")?;
            }
            ResourceData::NSEC {
                next_domain_name,
                type_bitmaps,
            } => {
                let rdata_pos = buf.len();
                buf.write_u16(0).context("NSEC record: writing stub RDLENGTH")?;
                let qname_length = buf
                    .write_qname_canonical(next_domain_name)
                    .context("NSEC record: writing NEXT DOMAIN NAME")?;
                buf.write_bytes(type_bitmaps, None)
                    .context("NSEC record: writing TYPE BIT MAPS")?;
                buf.set_u16(rdata_pos, (qname_length + type_bitmaps.len()) as u16)
                    .context("NSEC record: writing RDLENGTH")?;
            }
            // All remaining RDATA is name-free and identical to the wire form
            other => {
                other
                    .encode_to_buf(&mut *buf, None)
                    .context("writing name-free RDATA")?;
            }
        }
        Ok(())
    }
}

impl<'a> EncodeToBuf for ResourceData<'a> {
    fn encode_to_buf_with_cache<'cache, 'r: 'cache>(
        &'r self,
        buf: &mut ByteBuf,
        label_cache: Option<&mut HashMap<&'cache str, usize>>,
        _max_size: Option<usize>,
    ) -> anyhow::Result<usize> {
        let start_len = buf.len();
        match self {
            ResourceData::UNKNOWN { rdata: data, .. } => {
                buf.write_u16(data.len() as u16)
                    .context("UNKNOWN record: writing RDLENGTH")?;
                buf.write_bytes(data, None)
                    .context("UNKNOWN record: writing RDATA")?;
            }
            ResourceData::A { address } => {
                buf.write_u16(4).context("A record: writing RDLENGTH")?;
                buf.write_bytes(&address.octets(), None)
                    .context("A record: writing address")?;
            }
            ResourceData::NS { ns_domain_name } => {
                let rdata_pos = buf.len();
                // We don't know how many bytes qname encoding will take in advance,
                // so we can just write a stub value and replace it later
                buf.write_u16(0).context("NS record: writing stub RDLENGTH")?;
                let qname_length = buf
                    .write_qname(ns_domain_name, label_cache)
                    .context("NS record: writing NSDNAME")?;
                // Set actual RDLENGTH
                buf.set_u16(rdata_pos, qname_length as u16)
                    .context("NS record: writing RDLENGTH")?;
            }
            ResourceData::CNAME { cname } => {
                let rdata_pos = buf.len();
                buf.write_u16(0).context("CNAME record: writing stub RDLENGTH")?;
                let qname_length = buf
                    .write_qname(cname, label_cache)
                    .context("CNAME record: writing CNAME")?;
                buf.set_u16(rdata_pos, qname_length as u16)
                    .context("CNAME record: writing RDLENGTH")?;
            }
            ResourceData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                let rdata_pos = buf.len();
                buf.write_u16(0).context("SOA record: writing stub RDLENGTH")?;
                let mut label_cache = label_cache;
                let mut rd_length = buf
                    .write_qname(mname, label_cache.as_deref_mut())
                    .context("SOA record: writing MNAME")?;
                rd_length += buf
                    .write_qname(rname, label_cache)
                    .context("SOA record: writing RNAME")?;
                for field in [serial, refresh, retry, expire, minimum] {
                    buf.write_u32(*field).context("SOA record: writing timers")?;
                }
                rd_length += 20;
                buf.set_u16(rdata_pos, rd_length as u16)
                    .context("SOA record: writing RDLENGTH")?;
            }
            ResourceData::PTR { ptr_domain_name } => {
                let rdata_pos = buf.len();
                buf.write_u16(0).context("PTR record: writing stub RDLENGTH")?;
                let qname_length = buf
                    .write_qname(ptr_domain_name, label_cache)
                    .context("PTR record: writing PTRDNAME")?;
                buf.set_u16(rdata_pos, qname_length as u16)
                    .context("PTR record: writing RDLENGTH")?;
            }
            ResourceData::MX { preference, exchange } => {
                let rdata_pos = buf.len();
                buf.write_u16(0).context("MX record: writing stub RDLENGTH")?;
                buf.write_u16(*preference).context("MX record: writing PREFERENCE")?;
                let qname_length = buf
                    .write_qname(exchange, label_cache)
                    .context("MX record: writing EXCHANGE")?;
                buf.set_u16(rdata_pos, (qname_length + 2) as u16)
                    .context("MX record: writing RDLENGTH")?;
            }
            ResourceData::TXT { strings } => {
                let rd_length = strings.iter().map(|string| 1 + string.len()).sum::<usize>();
                buf.write_u16(rd_length as u16)
                    .context("TXT record: writing RDLENGTH")?;
                for string in strings {
                    if string.len() > 255 {
                        anyhow::bail!("TXT record: string is too long ({})", string.len());
                    }
                    buf.write_u8(string.len() as u8);
                    buf.write_bytes(string, None)
                        .context("TXT record: writing string data")?;
                }
            }
            ResourceData::AAAA { address } => {
                buf.write_u16(16).context("AAAA record: writing RDLENGTH")?;
                buf.write_bytes(&address.octets(), None)
                    .context("AAAA record: writing ADDRESS")?;
            }
            ResourceData::OPT { options } => {
                let rdata_pos = buf.len();
                buf.write_u16(0).context("OPT record: writing stub RDLENGTH")?;

                let mut rd_length = 0;
                if let Some(options) = options {
                    options
                        .iter()
                        .try_for_each(|(&option_code, option_data)| {
                            buf.write_u16(option_code).with_context(|| {
                                format!("OPT record: error while writing option code {}", option_code)
                            })?;
                            buf.write_u16(option_data.len() as u16).with_context(|| {
                                format!(
                                    "OPT record: error while writing option length for option {}",
                                    option_code
                                )
                            })?;
                            buf.write_bytes(option_data, None).with_context(|| {
                                format!(
                                    "OPT record: error while writing option data for option {}",
                                    option_code
                                )
                            })?;
                            rd_length += 4 + option_data.len();

                            anyhow::Result::<()>::Ok(())
                        })
                        .context("OPT record: writing options")?;
                }

                buf.set_u16(rdata_pos, rd_length as u16)
                    .context("OPT record: writing RDLENGTH")?;
            }
            ResourceData::DS {
                key_tag,
                algorithm,
                digest_type,
                digest,
            } => {
                buf.write_u16((4 + digest.len()) as u16)
                    .context("DS record: writing RDLENGTH")?;
                buf.write_u16(*key_tag).context("DS record: writing KEY TAG")?;
                buf.write_u8(*algorithm);
                buf.write_u8(*digest_type);
                buf.write_bytes(digest, None).context("DS record: writing DIGEST")?;
            }
            rrsig @ ResourceData::RRSIG { .. } => {
                // RRSIG wire form never compresses the signer name, so it
                // matches the canonical encoding except for letter case
                rrsig
                    .encode_rdata_canonical_preserving_case(buf)
                    .context("RRSIG record: writing RDATA")?;
            }
            ResourceData::NSEC {
                next_domain_name,
                type_bitmaps,
            } => {
                let rdata_pos = buf.len();
                buf.write_u16(0).context("NSEC record: writing stub RDLENGTH")?;
                let qname_length = buf
                    .write_qname(next_domain_name, None)
                    .context("NSEC record: writing NEXT DOMAIN NAME")?;
                buf.write_bytes(type_bitmaps, None)
                    .context("NSEC record: writing TYPE BIT MAPS")?;
                buf.set_u16(rdata_pos, (qname_length + type_bitmaps.len()) as u16)
                    .context("NSEC record: writing RDLENGTH")?;
            }
            ResourceData::DNSKEY {
                flags,
                protocol,
                algorithm,
                public_key,
            } => {
                buf.write_u16((4 + public_key.len()) as u16)
                    .context("DNSKEY record: writing RDLENGTH")?;
                buf.write_u16(*flags).context("DNSKEY record: writing FLAGS")?;
                buf.write_u8(*protocol);
                buf.write_u8(*algorithm);
                buf.write_bytes(public_key, None)
                    .context("DNSKEY record: writing PUBLIC KEY")?;
            }
            ResourceData::NSEC3 {
                hash_algorithm,
                flags,
                iterations,
                salt,
                next_hashed_owner,
                type_bitmaps,
            } => {
                let rd_length = 4 + 1 + salt.len() + 1 + next_hashed_owner.len() + type_bitmaps.len();
                buf.write_u16(rd_length as u16)
                    .context("NSEC3 record: writing RDLENGTH")?;
                buf.write_u8(*hash_algorithm);
                buf.write_u8(*flags);
                buf.write_u16(*iterations).context("NSEC3 record: writing ITERATIONS")?;
                buf.write_u8(salt.len() as u8);
                buf.write_bytes(salt, None).context("NSEC3 record: writing SALT")?;
                buf.write_u8(next_hashed_owner.len() as u8);
                buf.write_bytes(next_hashed_owner, None)
                    .context("NSEC3 record: writing NEXT HASHED OWNER")?;
                buf.write_bytes(type_bitmaps, None)
                    .context("NSEC3 record: writing TYPE BIT MAPS")?;
            }
            ResourceData::NSEC3PARAM {
                hash_algorithm,
                flags,
                iterations,
                salt,
            } => {
                buf.write_u16((4 + 1 + salt.len()) as u16)
                    .context("NSEC3PARAM record: writing RDLENGTH")?;
                buf.write_u8(*hash_algorithm);
                buf.write_u8(*flags);
                buf.write_u16(*iterations)
                    .context("NSEC3PARAM record: writing ITERATIONS")?;
                buf.write_u8(salt.len() as u8);
                buf.write_bytes(salt, None)
                    .context("NSEC3PARAM record: writing SALT")?;
            }
        };

        Ok(buf.len() - start_len)
    }
}

impl<'a> ResourceData<'a> {
    /// RRSIG RDATA with the signer name uncompressed but in original case.
    /// Shared by the wire encoder and the canonical encoder
    fn encode_rdata_canonical_preserving_case(&self, buf: &mut ByteBuf) -> anyhow::Result<()> {
        let ResourceData::RRSIG {
            type_covered,
            algorithm,
            labels,
            original_ttl,
            signature_expiration,
            signature_inception,
            key_tag,
            signer_name,
            signature,
        } = self
        else {
            anyhow::bail!("bug: not an RRSIG");
        };
        let rdata_pos = buf.len();
        buf.write_u16(0).context("writing stub RDLENGTH")?;
        buf.write_u16(*type_covered).context("writing TYPE COVERED")?;
        buf.write_u8(*algorithm);
        buf.write_u8(*labels);
        buf.write_u32(*original_ttl).context("writing ORIGINAL TTL")?;
        buf.write_u32(*signature_expiration).context("writing EXPIRATION")?;
        buf.write_u32(*signature_inception).context("writing INCEPTION")?;
        buf.write_u16(*key_tag).context("writing KEY TAG")?;
        let signer_length = buf
            .write_qname(signer_name, None)
            .context("writing SIGNER'S NAME")?;
        buf.write_bytes(signature, None).context("writing SIGNATURE")?;
        buf.set_u16(rdata_pos, (18 + signer_length + signature.len()) as u16)
            .context("writing RDLENGTH")?;
        Ok(())
    }

    pub fn get_encoded_size(&self, label_cache: Option<&HashMap<&str, usize>>) -> usize {
        let mut size = 2 /* RDLENGTH */;
        match self {
            ResourceData::UNKNOWN { rdata, .. } => {
                size += rdata.len();
            }
            ResourceData::A { .. } => {
                size += 4 /* Ipv4Addr */;
            }
            ResourceData::NS { ns_domain_name } => {
                size += get_max_encoded_qname_size(ns_domain_name, label_cache);
            }
            ResourceData::CNAME { cname } => {
                size += get_max_encoded_qname_size(cname, label_cache);
            }
            ResourceData::SOA { mname, rname, .. } => {
                size += get_max_encoded_qname_size(mname, label_cache)
                    + get_max_encoded_qname_size(rname, label_cache)
                    + 20 /* timers */;
            }
            ResourceData::PTR { ptr_domain_name } => {
                size += get_max_encoded_qname_size(ptr_domain_name, label_cache);
            }
            ResourceData::MX { exchange, .. } => {
                size += 2 /* PREFERENCE */ + get_max_encoded_qname_size(exchange, label_cache);
            }
            ResourceData::TXT { strings } => {
                size += strings.iter().map(|string| 1 + string.len()).sum::<usize>();
            }
            ResourceData::AAAA { .. } => {
                size += 16 /* Ipv6Addr */;
            }
            ResourceData::OPT { options } => {
                options.iter().for_each(|options| {
                    options.values().for_each(|option| {
                        size += 2 /* option code */ + 2 /* option length */ + option.len();
                    })
                });
            }
            ResourceData::DS { digest, .. } => {
                size += 4 + digest.len();
            }
            ResourceData::RRSIG {
                signer_name, signature, ..
            } => {
                size += 18 + get_max_encoded_qname_size(signer_name, None) + signature.len();
            }
            ResourceData::NSEC {
                next_domain_name,
                type_bitmaps,
            } => {
                size += get_max_encoded_qname_size(next_domain_name, None) + type_bitmaps.len();
            }
            ResourceData::DNSKEY { public_key, .. } => {
                size += 4 + public_key.len();
            }
            ResourceData::NSEC3 {
                salt,
                next_hashed_owner,
                type_bitmaps,
                ..
            } => {
                size += 4 + 1 + salt.len() + 1 + next_hashed_owner.len() + type_bitmaps.len();
            }
            ResourceData::NSEC3PARAM { salt, .. } => {
                size += 4 + 1 + salt.len();
            }
        }
        size
    }
}

/// Builds the NSEC/NSEC3 type bitmap wire form for a set of present types
pub fn build_type_bitmap(types: &[QueryType]) -> Vec<u8> {
    let mut windows: HashMap<u8, [u8; 32]> = HashMap::new();
    let mut max_octet: HashMap<u8, u8> = HashMap::new();
    for qtype in types {
        let raw: u16 = (*qtype).into();
        let window = (raw >> 8) as u8;
        let low = (raw & 0xff) as u8;
        let octet = low / 8;
        let bit = 7 - (low % 8);
        windows.entry(window).or_insert([0u8; 32])[octet as usize] |= 1 << bit;
        let entry = max_octet.entry(window).or_insert(0);
        if octet > *entry {
            *entry = octet;
        }
    }
    let mut window_ids: Vec<u8> = windows.keys().copied().collect();
    window_ids.sort_unstable();
    let mut out = Vec::new();
    for window in window_ids {
        let octets = max_octet[&window] as usize + 1;
        out.push(window);
        out.push(octets as u8);
        out.extend_from_slice(&windows[&window][..octets]);
    }
    out
}

/// Checks whether a type is present in an NSEC/NSEC3 type bitmap
pub fn type_in_bitmap(qtype: QueryType, bitmap: &[u8]) -> bool {
    let raw: u16 = qtype.into();
    let window = (raw >> 8) as u8;
    let low = (raw & 0xff) as u8;
    let octet = (low / 8) as usize;
    let bit = 7 - (low % 8);

    let mut pos = 0;
    while pos + 2 <= bitmap.len() {
        let window_id = bitmap[pos];
        let length = bitmap[pos + 1] as usize;
        if window_id == window {
            return bitmap
                .get(pos + 2 + octet)
                .is_some_and(|found| found & (1 << bit) != 0);
        }
        pos += 2 + length;
    }
    false
}

#[cfg(test)]
mod tests {
    use crate::test_utils::{arb_resource_data, arb_resource_record};

    use super::*;
    use proptest::prelude::*;

    #[test]
    fn type_bitmap_roundtrip() {
        let types = [QueryType::A, QueryType::NS, QueryType::SOA, QueryType::RRSIG, QueryType::DNSKEY];
        let bitmap = build_type_bitmap(&types);
        for qtype in types {
            assert!(type_in_bitmap(qtype, &bitmap), "{:?} should be present", qtype);
        }
        assert!(!type_in_bitmap(QueryType::AAAA, &bitmap));
        assert!(!type_in_bitmap(QueryType::UNKNOWN(1234), &bitmap));
    }

    #[test]
    fn canonical_rdata_lowercases_names() {
        let rdata = ResourceData::NS {
            ns_domain_name: "NS1.Example.COM".into(),
        };
        let mut buf = ByteBuf::new_empty(None);
        rdata.encode_rdata_canonical(&mut buf).expect("shouldn't have failed");
        let roundtripped = ResourceData::from_buf_with_type(&mut buf, QueryType::NS)
            .expect("shouldn't have failed");
        assert_eq!(
            roundtripped,
            ResourceData::NS {
                ns_domain_name: "ns1.example.com".into()
            }
        );
    }

    proptest! {
        #[test]
        fn resource_data_roundtrip(resource_data in arb_resource_data()) {
            let qtype = resource_data.get_query_type();
            let mut buf = ByteBuf::new_empty(None);
            resource_data.encode_to_buf(&mut buf, None).expect("shouldn't have failed");
            let roundtripped_rd = ResourceData::from_buf_with_type(&mut buf, qtype).expect("shouldn't have failed");
            prop_assert_eq!(resource_data, roundtripped_rd, "ResourceData roundtrip test failed");
        }

        #[test]
        fn resource_record_roundtrip(resource_record in arb_resource_record()) {
            let mut buf = ByteBuf::new_empty(None);
            resource_record.encode_to_buf(&mut buf, None).expect("shouldn't have failed");
            let roundtripped_rr = ResourceRecord::from_buf(&mut buf).expect("shouldn't have failed");
            prop_assert_eq!(resource_record, roundtripped_rr, "ResourceRecord roundtrip test failed");
        }
    }
}
