use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{Name, RecordType};

use conduit_dns_application::context::QueryContext;
use conduit_dns_application::executable::Matcher;
use conduit_dns_domain::DnsError;

/// Matches when the question type is in the set.
pub struct QTypeMatcher {
    types: Vec<RecordType>,
}

impl QTypeMatcher {
    pub fn new(types: Vec<u16>) -> Self {
        Self {
            types: types.into_iter().map(RecordType::from).collect(),
        }
    }
}

#[async_trait]
impl Matcher for QTypeMatcher {
    async fn matches(&self, qctx: &QueryContext) -> Result<bool, DnsError> {
        let Some(question) = qctx.query().queries().first() else {
            return Ok(false);
        };
        Ok(self.types.contains(&question.query_type()))
    }
}

/// Matches when the question name equals or falls under any listed suffix.
pub struct QNameSuffixMatcher {
    suffixes: Vec<Name>,
}

impl QNameSuffixMatcher {
    pub fn new(suffixes: &[String]) -> Result<Self, DnsError> {
        let suffixes = suffixes
            .iter()
            .map(|s| {
                Name::from_ascii(s)
                    .map(|n| n.to_lowercase())
                    .map_err(|e| DnsError::Config(format!("bad suffix '{}': {}", s, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { suffixes })
    }
}

#[async_trait]
impl Matcher for QNameSuffixMatcher {
    async fn matches(&self, qctx: &QueryContext) -> Result<bool, DnsError> {
        let Some(question) = qctx.query().queries().first() else {
            return Ok(false);
        };
        let name = question.name().to_lowercase();
        Ok(self.suffixes.iter().any(|suffix| suffix.zone_of(&name)))
    }
}

/// Matches on the response code of the current parsed response. False while
/// no response is set.
pub struct RcodeMatcher {
    codes: Vec<ResponseCode>,
}

impl RcodeMatcher {
    pub fn new(codes: Vec<u16>) -> Self {
        Self {
            codes: codes.into_iter().map(rcode_from).collect(),
        }
    }
}

fn rcode_from(code: u16) -> ResponseCode {
    match code {
        0 => ResponseCode::NoError,
        1 => ResponseCode::FormErr,
        2 => ResponseCode::ServFail,
        3 => ResponseCode::NXDomain,
        4 => ResponseCode::NotImp,
        _ => ResponseCode::Refused,
    }
}

#[async_trait]
impl Matcher for RcodeMatcher {
    async fn matches(&self, qctx: &QueryContext) -> Result<bool, DnsError> {
        Ok(qctx
            .response()
            .map(|r| self.codes.contains(&r.response_code()))
            .unwrap_or(false))
    }
}
