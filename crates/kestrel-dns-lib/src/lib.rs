#[cfg(test)]
pub(crate) mod test_utils;

mod buf;
mod dns_header;
mod question;
mod resource_record;
pub mod utils;

pub use buf::{ByteBuf, EncodeToBuf, EncodedSize, FromBuf, WireError};
pub use dns_header::{DnsHeader, QueryOpcode, ResponseCode};
pub use question::{QueryType, Question};
pub use resource_record::{build_type_bitmap, type_in_bitmap, EdnsData, ResourceData, ResourceRecord};

use anyhow::Context;
use std::collections::HashMap;

/// The Internet class. Everything else is a museum piece
pub const IN_CLASS: u16 = 1;

#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct DnsPacket<'a> {
    pub header: DnsHeader,
    /// Idx of the OPT RR, if present
    pub edns: Option<usize>,
    pub questions: Vec<Question<'a>>,
    pub answers: Vec<ResourceRecord<'a>>,
    pub authorities: Vec<ResourceRecord<'a>>,
    pub additionals: Vec<ResourceRecord<'a>>,
}

impl<'a> DnsPacket<'a> {
    pub fn new() -> Self {
        DnsPacket::default()
    }

    pub fn get_edns_data(&self) -> Option<EdnsData> {
        self.edns
            .and_then(|idx| self.additionals.get(idx))
            .and_then(ResourceRecord::get_edns_data)
    }

    pub fn into_owned(self) -> DnsPacket<'static> {
        DnsPacket {
            header: self.header,
            edns: self.edns,
            questions: self.questions.into_iter().map(Question::into_owned).collect(),
            answers: self.answers.into_iter().map(ResourceRecord::into_owned).collect(),
            authorities: self
                .authorities
                .into_iter()
                .map(ResourceRecord::into_owned)
                .collect(),
            additionals: self
                .additionals
                .into_iter()
                .map(ResourceRecord::into_owned)
                .collect(),
        }
    }
}

impl FromBuf for DnsPacket<'_> {
    fn from_buf(buf: &mut ByteBuf<'_>) -> anyhow::Result<DnsPacket<'static>> {
        let header = DnsHeader::from_buf(buf).context("header parsing error")?;

        let mut questions = Vec::with_capacity(header.question_count as usize);
        for idx in 0..header.question_count {
            let question =
                Question::from_buf(buf).with_context(|| format!("question parsing error at idx {}", idx))?;
            questions.push(question);
        }

        let mut answers = Vec::with_capacity(header.answer_rr_count as usize);
        for idx in 0..header.answer_rr_count {
            let answer = ResourceRecord::from_buf(buf)
                .with_context(|| format!("answer RR parsing error at idx {}", idx))?;
            answers.push(answer);
        }

        let mut authorities = Vec::with_capacity(header.authority_rr_count as usize);
        for idx in 0..header.authority_rr_count {
            let authority = ResourceRecord::from_buf(buf)
                .with_context(|| format!("authority RR parsing error at idx {}", idx))?;
            authorities.push(authority);
        }

        let mut edns = None;
        let mut additionals = Vec::with_capacity(header.additional_rr_count as usize);
        for idx in 0..header.additional_rr_count {
            let additional = ResourceRecord::from_buf(buf)
                .with_context(|| format!("additional RR parsing error at idx {}", idx))?;
            if additional.resource_data.get_query_type() == QueryType::OPT {
                if let Some(old_idx) = edns.replace(additionals.len()) {
                    anyhow::bail!("Multiple OPT records at positions {} and {}", old_idx, idx)
                }
            }
            additionals.push(additional);
        }

        Ok(DnsPacket {
            header,
            questions,
            edns,
            answers,
            authorities,
            additionals,
        })
    }
}

impl<'a> DnsPacket<'a> {
    /// Encodes the packet, truncating RR sections (and setting TC) if the
    /// encoded form would exceed `max_size`. Questions are never truncated
    pub fn encode_to_buf_with_cache<'cache, 'r: 'cache>(
        &'r self,
        buf: &mut ByteBuf,
        mut label_cache: Option<&mut HashMap<&'cache str, usize>>,
        max_size: Option<usize>,
    ) -> anyhow::Result<usize> {
        let start_len = buf.len();
        let header_pos = start_len;
        self.header
            .encode_to_buf_with_cache(buf, label_cache.as_deref_mut(), None)
            .context("writing header")?;

        self.questions
            .iter()
            .enumerate()
            .try_for_each(|(idx, question)| {
                question
                    .encode_to_buf_with_cache(buf, label_cache.as_deref_mut(), None)
                    .with_context(|| format!("writing question at idx {}", idx))
                    .map(|_| ())
            })
            .context("writing questions")?;

        let mut truncated = false;
        let mut written_counts = [0u16; 3];
        let sections = [
            (&self.answers, 0usize, "answer"),
            (&self.authorities, 1, "authority"),
            (&self.additionals, 2, "additional"),
        ];
        'sections: for (section, counts_idx, section_name) in sections {
            for (idx, rr) in section.iter().enumerate() {
                let remaining = max_size.map(|max_size| max_size.saturating_sub(buf.len() - start_len));
                let written = rr
                    .encode_to_buf_with_cache(buf, label_cache.as_deref_mut(), remaining)
                    .with_context(|| format!("writing {} RR at idx {}", section_name, idx))?;
                if written == 0 {
                    // Ran out of room: stop here and let the client retry over TCP
                    truncated = true;
                    break 'sections;
                }
                written_counts[counts_idx] += 1;
            }
        }

        if truncated {
            let mut header = self.header.clone();
            header.truncation = true;
            header.answer_rr_count = written_counts[0];
            header.authority_rr_count = written_counts[1];
            header.additional_rr_count = written_counts[2];
            let mut rewrite = ByteBuf::new_empty(None);
            header.encode_to_buf(&mut rewrite, None).context("re-writing header")?;
            buf.write_bytes(&rewrite, Some(header_pos))
                .context("patching truncated header")?;
        }

        Ok(buf.len() - start_len)
    }

    pub fn encode_to_buf(&self, buf: &mut ByteBuf, max_size: Option<usize>) -> anyhow::Result<usize> {
        let mut label_cache = HashMap::new();
        self.encode_to_buf_with_cache(buf, Some(&mut label_cache), max_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prop::collection::vec;
    use proptest::prelude::*;
    use test_utils::{arb_question, arb_resource_record};

    prop_compose! {
        fn arb_dns_header_with_counts(
            question_count: u16,
            answer_rr_count: u16,
            authority_rr_count: u16,
            additional_rr_count: u16
        )(
            id: u16,
            is_response: bool,
            opcode: QueryOpcode,
            is_authoritative: bool,
            recursion_desired: bool,
            recursion_available: bool,
            z: bool,
            authentic_data: bool,
            checking_disabled: bool,
            response_code: ResponseCode
        ) -> DnsHeader {
            DnsHeader {
                id,
                is_response,
                opcode,
                is_authoritative,
                truncation: false,
                recursion_desired,
                recursion_available,
                z,
                authentic_data,
                checking_disabled,
                response_code,
                question_count,
                answer_rr_count,
                authority_rr_count,
                additional_rr_count
            }
        }
    }

    fn arb_dns_packet() -> impl Strategy<Value = DnsPacket<'static>> {
        (0..5u16, 0..5u16, 0..5u16, 0..5u16)
            .prop_flat_map(|(questions_len, answers_len, authorities_len, additionals_len)| {
                let additionals = vec(arb_resource_record(), additionals_len as usize).prop_filter(
                    "DNS packet with multiple OPT RRs",
                    |vec| {
                        (0..=1).contains(
                            &vec.iter()
                                .filter(|rr| rr.resource_data.get_query_type() == QueryType::OPT)
                                .count(),
                        )
                    },
                );
                (
                    arb_dns_header_with_counts(questions_len, answers_len, authorities_len, additionals_len),
                    vec(arb_question(), questions_len as usize),
                    vec(arb_resource_record(), answers_len as usize),
                    vec(arb_resource_record(), authorities_len as usize),
                    additionals,
                )
                    .prop_map(|(header, questions, answers, authorities, additionals)| {
                        let edns = additionals
                            .iter()
                            .position(|rr| rr.resource_data.get_query_type() == QueryType::OPT);
                        DnsPacket {
                            header,
                            edns,
                            questions,
                            answers,
                            authorities,
                            additionals,
                        }
                    })
            })
            .boxed()
    }

    proptest! {
        #[test]
        fn dns_packet_roundtrip(dns_packet in arb_dns_packet()) {
            let mut buf = ByteBuf::new_empty(None);
            dns_packet.encode_to_buf(&mut buf, None).expect("shouldn't have failed");
            let roundtripped_dns_packet = DnsPacket::from_buf(&mut buf).expect("shouldn't have failed");
            prop_assert_eq!(dns_packet, roundtripped_dns_packet, "DnsPacket roundtrip test failed");
        }
    }

    #[test]
    fn truncation_sets_tc_and_counts() {
        let mut packet = DnsPacket::new();
        packet.questions.push(Question::new("example.com", QueryType::A, None));
        packet.header.question_count = 1;
        for i in 0..20 {
            packet.answers.push(ResourceRecord::new(
                "example.com",
                ResourceData::A {
                    address: std::net::Ipv4Addr::new(192, 0, 2, i),
                },
                Some(300),
                None,
            ));
        }
        packet.header.answer_rr_count = 20;

        let mut buf = ByteBuf::new_empty(None);
        packet.encode_to_buf(&mut buf, Some(100)).expect("shouldn't have failed");
        assert!(buf.len() <= 100);

        let reparsed = DnsPacket::from_buf(&mut buf).expect("shouldn't have failed");
        assert!(reparsed.header.truncation);
        assert!(reparsed.header.answer_rr_count < 20);
        assert_eq!(reparsed.answers.len(), reparsed.header.answer_rr_count as usize);
    }
}
