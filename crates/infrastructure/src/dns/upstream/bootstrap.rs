//! Startup-time resolution of encrypted-upstream hostnames.
//!
//! A DoH or DoQ endpoint named by hostname cannot be resolved through the
//! pipeline it serves, so its address is looked up once here: through the
//! configured plain bootstrap resolver, or the system resolver when none is
//! set, then pinned for the life of the process.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tracing::info;

use conduit_dns_domain::{DnsError, UpstreamAddr, UpstreamScheme};

use super::udp::UdpUpstream;
use super::Upstream;

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn resolve_host(
    host: &str,
    port: u16,
    bootstrap: &str,
) -> Result<SocketAddr, DnsError> {
    if bootstrap.is_empty() {
        return system_lookup(host, port).await;
    }

    let parsed = UpstreamAddr::parse(bootstrap)?;
    if parsed.scheme != UpstreamScheme::Udp || !parsed.host_is_ip() {
        return Err(DnsError::Config(format!(
            "bootstrap must be a plain-UDP IP address, got '{}'",
            bootstrap
        )));
    }
    let bootstrap_addr = SocketAddr::new(
        parsed.host.parse().expect("checked above"),
        parsed.port,
    );
    let resolver = UdpUpstream::new(bootstrap_addr, &parsed, false);

    for rtype in [RecordType::A, RecordType::AAAA] {
        if let Some(ip) = query_one(&resolver, host, rtype).await? {
            info!(host, %ip, bootstrap, "bootstrap resolved upstream hostname");
            return Ok(SocketAddr::new(ip, port));
        }
    }

    Err(DnsError::Config(format!(
        "bootstrap resolver {} returned no address for '{}'",
        bootstrap, host
    )))
}

async fn query_one(
    resolver: &UdpUpstream,
    host: &str,
    rtype: RecordType,
) -> Result<Option<IpAddr>, DnsError> {
    let name = Name::from_ascii(host)
        .map_err(|e| DnsError::Config(format!("invalid upstream hostname '{}': {}", host, e)))?;

    let mut query = Message::new();
    query
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    query.add_query(Query::query(name, rtype));

    let reply = match tokio::time::timeout(BOOTSTRAP_TIMEOUT, resolver.exchange(&query)).await {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(DnsError::TransportTimeout {
                server: resolver.address().to_string(),
            })
        }
    };

    for record in reply.msg.answers() {
        match record.data() {
            Some(RData::A(a)) => return Ok(Some(IpAddr::V4(a.0))),
            Some(RData::AAAA(aaaa)) => return Ok(Some(IpAddr::V6(aaaa.0))),
            _ => continue,
        }
    }
    Ok(None)
}

async fn system_lookup(host: &str, port: u16) -> Result<SocketAddr, DnsError> {
    let target = format!("{}:{}", host, port);
    let mut addrs = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| DnsError::Config(format!("resolve '{}': {}", target, e)))?;
    addrs
        .next()
        .ok_or_else(|| DnsError::Config(format!("no address found for '{}'", target)))
}
