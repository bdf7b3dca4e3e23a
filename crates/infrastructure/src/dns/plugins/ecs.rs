use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Edns;
use hickory_proto::rr::rdata::opt::EdnsOption;

use conduit_dns_application::context::QueryContext;
use conduit_dns_application::executable::{exec_chain, ChainNode, Executable};
use conduit_dns_domain::DnsError;

use crate::dns::wire::{self, ClientSubnet};

const ECS_OPTION_CODE: u16 = 8;

/// Attaches a masked EDNS Client Subnet option to the query.
///
/// The subnet comes from the configured preset or, failing that, from the
/// client address. The address is canonicalized (truncated to the netmask
/// with the trailing bits cleared) before it goes on the wire, which is
/// what makes the ECS part of the cache key stable across clients in the
/// same subnet.
pub struct EcsPlugin {
    preset: Option<(IpAddr, u8)>,
    mask_v4: u8,
    mask_v6: u8,
    force_override: bool,
}

impl EcsPlugin {
    pub fn new(
        preset: Option<(IpAddr, u8)>,
        mask_v4: u8,
        mask_v6: u8,
        force_override: bool,
    ) -> Result<Self, DnsError> {
        if mask_v4 > 32 {
            return Err(DnsError::Config(format!("ecs: mask4 {} out of range", mask_v4)));
        }
        if mask_v6 > 128 {
            return Err(DnsError::Config(format!("ecs: mask6 {} out of range", mask_v6)));
        }
        Ok(Self {
            preset,
            mask_v4,
            mask_v6,
            force_override,
        })
    }

    fn subnet_for(&self, qctx: &QueryContext) -> Option<ClientSubnet> {
        let (addr, prefix) = match self.preset {
            Some((addr, prefix)) => (addr, prefix),
            None => {
                let addr = qctx.meta().client_addr()?;
                let prefix = match addr {
                    IpAddr::V4(_) => self.mask_v4,
                    IpAddr::V6(_) => self.mask_v6,
                };
                (addr, prefix)
            }
        };
        if prefix == 0 {
            return None;
        }

        let (family, mut bytes) = match addr {
            IpAddr::V4(v4) => (1u16, v4.octets().to_vec()),
            IpAddr::V6(v6) => (2u16, v6.octets().to_vec()),
        };

        // Canonical form: only the masked prefix bytes, trailing bits zeroed.
        let n = wire::prefix_bytes(prefix).min(bytes.len());
        bytes.truncate(n);
        if n > 0 {
            let rem = prefix % 8;
            if rem != 0 {
                bytes[n - 1] &= 0xFFu8 << (8 - rem);
            }
        }

        Some(ClientSubnet {
            family,
            source_prefix: prefix,
            scope_prefix: 0,
            address: bytes,
        })
    }
}

#[async_trait]
impl Executable for EcsPlugin {
    async fn exec(
        &self,
        qctx: &mut QueryContext,
        next: Option<&Arc<ChainNode>>,
    ) -> Result<(), DnsError> {
        let already_present = wire::client_subnet(qctx.query()).is_some();
        if !already_present || self.force_override {
            if let Some(subnet) = self.subnet_for(qctx) {
                let payload = subnet.to_option_bytes();
                let edns = qctx.query_mut().extensions_mut().get_or_insert_with(|| {
                    let mut edns = Edns::new();
                    edns.set_max_payload(1232);
                    edns
                });
                edns.options_mut()
                    .insert(EdnsOption::Unknown(ECS_OPTION_CODE, payload));
            }
        }

        exec_chain(qctx, next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_dns_application::meta::{RequestMeta, TransportProtocol};
    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::{Name, RecordType};

    fn ctx_with_client(addr: &str) -> QueryContext {
        let mut q = Message::new();
        q.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::A,
        ));
        QueryContext::new(
            q,
            RequestMeta::new(addr.parse().unwrap(), TransportProtocol::Udp),
        )
    }

    #[tokio::test]
    async fn attaches_masked_client_subnet() {
        let plugin = EcsPlugin::new(None, 24, 48, false).unwrap();
        let mut qctx = ctx_with_client("192.0.2.77");
        plugin.exec(&mut qctx, None).await.unwrap();

        let ecs = wire::client_subnet(qctx.query()).expect("ECS attached");
        assert_eq!(ecs.family, 1);
        assert_eq!(ecs.source_prefix, 24);
        assert_eq!(ecs.address, vec![192, 0, 2]);
    }

    #[tokio::test]
    async fn partial_byte_prefix_is_zeroed() {
        let plugin = EcsPlugin::new(Some(("10.1.255.255".parse().unwrap(), 20)), 24, 48, false)
            .unwrap();
        let mut qctx = ctx_with_client("203.0.113.5");
        plugin.exec(&mut qctx, None).await.unwrap();

        let ecs = wire::client_subnet(qctx.query()).expect("ECS attached");
        // 20-bit prefix: 10.1.240 with the low nibble cleared.
        assert_eq!(ecs.address, vec![10, 1, 0xF0]);
    }

    #[tokio::test]
    async fn existing_option_kept_without_override() {
        let plugin = EcsPlugin::new(Some(("198.51.100.0".parse().unwrap(), 24)), 24, 48, false)
            .unwrap();
        let mut qctx = ctx_with_client("192.0.2.1");

        let edns = qctx.query_mut().extensions_mut().get_or_insert_with(Edns::new);
        edns.options_mut().insert(EdnsOption::Unknown(
            ECS_OPTION_CODE,
            vec![0, 1, 24, 0, 203, 0, 113],
        ));

        plugin.exec(&mut qctx, None).await.unwrap();
        let ecs = wire::client_subnet(qctx.query()).unwrap();
        assert_eq!(ecs.address, vec![203, 0, 113]);
    }
}
