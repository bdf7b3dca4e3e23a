use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;

use conduit_dns_application::context::QueryContext;
use conduit_dns_application::executable::{exec_chain, ChainNode, Executable};
use conduit_dns_domain::DnsError;

/// Clamps response TTLs into `[minimal, maximum]` after the rest of the
/// chain has produced a parsed response. OPT is left alone; a raw cached
/// response is already serving patched TTLs and is not touched.
pub struct TtlPlugin {
    minimal: u32,
    maximum: u32,
}

impl TtlPlugin {
    pub fn new(minimal: u32, maximum: u32) -> Result<Self, DnsError> {
        if maximum > 0 && minimal > maximum {
            return Err(DnsError::Config(format!(
                "ttl: minimal {} exceeds maximum {}",
                minimal, maximum
            )));
        }
        Ok(Self { minimal, maximum })
    }

    fn clamp(&self, msg: &mut Message) {
        let minimal = self.minimal;
        let maximum = self.maximum;
        let clamp_one = |records: &mut Vec<hickory_proto::rr::Record>| {
            for record in records.iter_mut() {
                if record.record_type() == RecordType::OPT {
                    continue;
                }
                let mut ttl = record.ttl();
                if minimal > 0 && ttl < minimal {
                    ttl = minimal;
                }
                if maximum > 0 && ttl > maximum {
                    ttl = maximum;
                }
                record.set_ttl(ttl);
            }
        };

        let mut answers = msg.take_answers();
        clamp_one(&mut answers);
        msg.insert_answers(answers);

        let mut authorities = msg.take_name_servers();
        clamp_one(&mut authorities);
        msg.insert_name_servers(authorities);

        let mut additionals = msg.take_additionals();
        clamp_one(&mut additionals);
        msg.insert_additionals(additionals);
    }
}

#[async_trait]
impl Executable for TtlPlugin {
    async fn exec(
        &self,
        qctx: &mut QueryContext,
        next: Option<&Arc<ChainNode>>,
    ) -> Result<(), DnsError> {
        exec_chain(qctx, next).await?;
        if let Some(r) = qctx.response_mut() {
            self.clamp(r);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record};

    #[test]
    fn clamps_both_directions() {
        let plugin = TtlPlugin::new(60, 600).unwrap();
        let name = Name::from_ascii("example.com.").unwrap();
        let mut msg = Message::new();
        msg.add_answer(Record::from_rdata(
            name.clone(),
            5,
            RData::A(A::new(192, 0, 2, 1)),
        ));
        msg.add_answer(Record::from_rdata(
            name,
            86400,
            RData::A(A::new(192, 0, 2, 2)),
        ));

        plugin.clamp(&mut msg);
        assert_eq!(msg.answers()[0].ttl(), 60);
        assert_eq!(msg.answers()[1].ttl(), 600);
    }

    #[test]
    fn inverted_bounds_rejected() {
        assert!(TtlPlugin::new(600, 60).is_err());
    }
}
