pub mod bootstrap;
pub mod h3;
pub mod https;
pub mod quic;
pub mod tcp;
pub mod tls;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hickory_proto::op::Message;

use conduit_dns_domain::{DnsError, UpstreamAddr, UpstreamConfig, UpstreamScheme};

/// What an upstream exchange produced: the parsed message plus the wire
/// bytes it was parsed from, so callers that store or forward raw bytes
/// never repack.
#[derive(Debug)]
pub struct Reply {
    pub msg: Message,
    pub wire: Bytes,
}

impl Reply {
    pub fn from_wire(wire: Vec<u8>) -> Result<Self, DnsError> {
        let msg = Message::from_vec(&wire)
            .map_err(|e| DnsError::MalformedMessage(e.to_string()))?;
        Ok(Self {
            msg,
            wire: Bytes::from(wire),
        })
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn exchange(&self, query: &Message) -> Result<Reply, DnsError>;

    /// The logical address used in logs, e.g. `tls://1.1.1.1:853`.
    fn address(&self) -> &str;
}

/// Builds the upstream set from config. Hostnames of encrypted transports
/// are resolved once here, through the per-upstream bootstrap resolver.
pub async fn build_upstreams(
    configs: &[UpstreamConfig],
) -> Result<Vec<Arc<dyn Upstream>>, DnsError> {
    if configs.is_empty() {
        return Err(DnsError::Config("no upstream configured".to_string()));
    }

    let mut out: Vec<Arc<dyn Upstream>> = Vec::with_capacity(configs.len());
    for cfg in configs {
        out.push(build_upstream(cfg).await?);
    }
    Ok(out)
}

pub async fn build_upstream(cfg: &UpstreamConfig) -> Result<Arc<dyn Upstream>, DnsError> {
    let parsed = UpstreamAddr::parse(&cfg.addr)?;

    let socket_addr = dial_addr(&parsed, cfg).await?;

    let upstream: Arc<dyn Upstream> = match parsed.scheme {
        UpstreamScheme::Udp => Arc::new(udp::UdpUpstream::new(socket_addr, &parsed, false)),
        UpstreamScheme::UdpMe => Arc::new(udp::UdpUpstream::new(socket_addr, &parsed, true)),
        UpstreamScheme::Tcp => Arc::new(tcp::TcpUpstream::new(socket_addr, &parsed)),
        UpstreamScheme::Tls => Arc::new(tls::TlsUpstream::new(
            socket_addr,
            &parsed,
            cfg.insecure,
        )?),
        UpstreamScheme::Https => Arc::new(https::HttpsUpstream::new(
            socket_addr,
            &parsed,
            cfg.insecure,
        )?),
        UpstreamScheme::Quic => Arc::new(quic::QuicUpstream::new(
            socket_addr,
            &parsed,
            cfg.insecure,
        )?),
        UpstreamScheme::H3 => Arc::new(h3::H3Upstream::new(socket_addr, &parsed, cfg.insecure)?),
    };
    Ok(upstream)
}

async fn dial_addr(
    parsed: &UpstreamAddr,
    cfg: &UpstreamConfig,
) -> Result<SocketAddr, DnsError> {
    if !cfg.dial_addr.is_empty() {
        return cfg.dial_addr.parse().map_err(|_| {
            DnsError::Config(format!("invalid dial_addr '{}'", cfg.dial_addr))
        });
    }
    if let Ok(ip) = parsed.host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, parsed.port));
    }
    bootstrap::resolve_host(&parsed.host, parsed.port, &cfg.bootstrap).await
}
