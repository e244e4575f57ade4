use std::borrow::Cow;
use std::collections::HashMap;

use anyhow::Context;

use crate::buf::EncodedSize;
use crate::utils::get_max_encoded_qname_size;
use crate::{ByteBuf, EncodeToBuf, FromBuf, IN_CLASS};

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum QueryType {
    UNKNOWN(u16),
    A,
    NS,
    CNAME,
    SOA,
    PTR,
    MX,
    TXT,
    AAAA,
    OPT,
    DS,
    RRSIG,
    NSEC,
    DNSKEY,
    NSEC3,
    NSEC3PARAM,
    ANY,
}

impl From<u16> for QueryType {
    fn from(value: u16) -> Self {
        match value {
            1 => QueryType::A,
            2 => QueryType::NS,
            5 => QueryType::CNAME,
            6 => QueryType::SOA,
            12 => QueryType::PTR,
            15 => QueryType::MX,
            16 => QueryType::TXT,
            28 => QueryType::AAAA,
            41 => QueryType::OPT,
            43 => QueryType::DS,
            46 => QueryType::RRSIG,
            47 => QueryType::NSEC,
            48 => QueryType::DNSKEY,
            50 => QueryType::NSEC3,
            51 => QueryType::NSEC3PARAM,
            255 => QueryType::ANY,
            _ => QueryType::UNKNOWN(value),
        }
    }
}

impl From<QueryType> for u16 {
    fn from(val: QueryType) -> Self {
        match val {
            QueryType::A => 1,
            QueryType::NS => 2,
            QueryType::CNAME => 5,
            QueryType::SOA => 6,
            QueryType::PTR => 12,
            QueryType::MX => 15,
            QueryType::TXT => 16,
            QueryType::AAAA => 28,
            QueryType::OPT => 41,
            QueryType::DS => 43,
            QueryType::RRSIG => 46,
            QueryType::NSEC => 47,
            QueryType::DNSKEY => 48,
            QueryType::NSEC3 => 50,
            QueryType::NSEC3PARAM => 51,
            QueryType::ANY => 255,
            QueryType::UNKNOWN(qtype) => qtype,
        }
    }
}

impl QueryType {
    /// Types that only exist to carry DNSSEC proof material
    pub fn is_dnssec_type(&self) -> bool {
        matches!(
            self,
            QueryType::DS | QueryType::RRSIG | QueryType::NSEC | QueryType::DNSKEY | QueryType::NSEC3 | QueryType::NSEC3PARAM
        )
    }
}

// Deriving this would happily emit UNKNOWN(1), which reparses as A and
// breaks roundtrip tests. Go through the u16 mapping instead
#[cfg(test)]
impl proptest::arbitrary::Arbitrary for QueryType {
    type Parameters = ();
    type Strategy = proptest::strategy::BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        use proptest::prelude::*;
        any::<u16>().prop_map(QueryType::from).boxed()
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Question<'a> {
    pub qname: Cow<'a, str>,
    pub query_type: QueryType,
    pub qclass: u16,
}

impl<'a> Question<'a> {
    pub fn new(qname: &'a str, query_type: QueryType, qclass: Option<u16>) -> Self {
        Self {
            qname: Cow::Borrowed(qname),
            query_type,
            qclass: qclass.unwrap_or(IN_CLASS),
        }
    }

    pub fn into_owned(self) -> Question<'static> {
        Question {
            qname: self.qname.into_owned().into(),
            query_type: self.query_type,
            qclass: self.qclass,
        }
    }
}

impl<'a> FromBuf for Question<'a> {
    fn from_buf(buf: &mut ByteBuf) -> anyhow::Result<Question<'static>> {
        let qname = buf.read_qname().context("QNAME is missing")?;
        let qtype_raw = buf.read_u16().context("QTYPE is missing")?;
        let class = buf.read_u16().context("QCLASS is missing")?;

        Ok(Question {
            qname,
            query_type: qtype_raw.into(),
            qclass: class,
        })
    }
}

impl<'a> EncodeToBuf for Question<'a> {
    fn encode_to_buf_with_cache<'cache, 'r: 'cache>(
        &'r self,
        buf: &mut ByteBuf,
        label_cache: Option<&mut HashMap<&'cache str, usize>>,
        max_size: Option<usize>,
    ) -> anyhow::Result<usize> {
        let encoded_size = self.get_encoded_size(label_cache.as_deref());
        if max_size.is_some_and(|max_size| encoded_size > max_size) {
            return Ok(0);
        }
        buf.write_qname(&self.qname, label_cache)
            .context("writing QNAME")?;
        buf.write_u16(self.query_type.into())
            .context("writing QTYPE")?;
        buf.write_u16(self.qclass).context("writing QCLASS")?;

        Ok(encoded_size)
    }
}

impl EncodedSize for Question<'_> {
    fn get_encoded_size(&self, label_cache: Option<&HashMap<&str, usize>>) -> usize {
        let qname_size = get_max_encoded_qname_size(&self.qname, label_cache);
        qname_size + 2 /* QTYPE */ + 2 /* CLASS */
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::arb_question;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn question_roundtrip(question in arb_question()) {
            let mut buf = ByteBuf::new_empty(None);
            let encoded_size = question.encode_to_buf(&mut buf, None).expect("shouldn't have failed");
            assert_eq!(encoded_size, buf.len());
            let roundtripped_question = Question::from_buf(&mut buf).expect("shouldn't have failed");
            prop_assert_eq!(question, roundtripped_question, "Question roundtrip test failed");
        }
    }
}
