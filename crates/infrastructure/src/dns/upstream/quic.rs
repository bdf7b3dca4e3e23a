use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_proto::op::Message;
use tracing::debug;

use conduit_dns_domain::{DnsError, UpstreamAddr};

use crate::dns::wire;

use super::tls::insecure_verifier;
use super::{Reply, Upstream};

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RESPONSE_SIZE: usize = 65535;

static QUIC_ENDPOINT: LazyLock<quinn::Endpoint> = LazyLock::new(|| {
    quinn::Endpoint::client("0.0.0.0:0".parse().expect("static addr"))
        .expect("QUIC client endpoint")
});

type PoolKey = (SocketAddr, String);
static QUIC_POOL: LazyLock<DashMap<PoolKey, quinn::Connection>> = LazyLock::new(DashMap::new);

/// DNS over QUIC (RFC 9250): ALPN `doq`, one bidirectional stream per query,
/// message identifier zero on the wire.
pub struct QuicUpstream {
    server_addr: SocketAddr,
    server_name: String,
    display: String,
    client_config: quinn::ClientConfig,
}

impl QuicUpstream {
    pub fn new(
        server_addr: SocketAddr,
        parsed: &UpstreamAddr,
        insecure: bool,
    ) -> Result<Self, DnsError> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut tls_config = if insecure {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(insecure_verifier())
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };
        tls_config.alpn_protocols = vec![b"doq".to_vec()];

        let quic_config = quinn::crypto::rustls::QuicClientConfig::try_from(Arc::new(tls_config))
            .map_err(|e| DnsError::Tls {
                server: parsed.display_addr(),
                detail: format!("QUIC TLS config: {}", e),
            })?;

        Ok(Self {
            server_addr,
            server_name: parsed.host.clone(),
            display: parsed.display_addr(),
            client_config: quinn::ClientConfig::new(Arc::new(quic_config)),
        })
    }

    async fn get_or_connect(&self) -> Result<quinn::Connection, DnsError> {
        let key = (self.server_addr, self.server_name.clone());
        if let Some(conn) = QUIC_POOL.get(&key) {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
            drop(conn);
            QUIC_POOL.remove(&key);
        }
        let conn = self.connect_new().await?;
        QUIC_POOL.insert(key, conn.clone());
        Ok(conn)
    }

    async fn connect_new(&self) -> Result<quinn::Connection, DnsError> {
        let connecting = QUIC_ENDPOINT
            .connect_with(
                self.client_config.clone(),
                self.server_addr,
                &self.server_name,
            )
            .map_err(|e| DnsError::Io(format!("initiate QUIC to {}: {}", self.display, e)))?;

        tokio::time::timeout(EXCHANGE_TIMEOUT, connecting)
            .await
            .map_err(|_| DnsError::TransportTimeout {
                server: self.display.clone(),
            })?
            .map_err(|_| DnsError::TransportConnectionRefused {
                server: self.display.clone(),
            })
    }

    async fn exchange_on(
        &self,
        conn: &quinn::Connection,
        wire_query: &[u8],
    ) -> Result<Vec<u8>, DnsError> {
        let (mut send, mut recv) = tokio::time::timeout(EXCHANGE_TIMEOUT, conn.open_bi())
            .await
            .map_err(|_| DnsError::TransportTimeout {
                server: self.display.clone(),
            })?
            .map_err(|e| DnsError::Io(format!("open DoQ stream to {}: {}", self.display, e)))?;

        tokio::time::timeout(EXCHANGE_TIMEOUT, send.write_all(wire_query))
            .await
            .map_err(|_| DnsError::TransportTimeout {
                server: self.display.clone(),
            })?
            .map_err(|e| DnsError::Io(format!("write DoQ query to {}: {}", self.display, e)))?;
        send.finish()
            .map_err(|e| DnsError::Io(format!("finish DoQ stream to {}: {}", self.display, e)))?;

        tokio::time::timeout(EXCHANGE_TIMEOUT, recv.read_to_end(MAX_RESPONSE_SIZE))
            .await
            .map_err(|_| DnsError::TransportTimeout {
                server: self.display.clone(),
            })?
            .map_err(|e| DnsError::Io(format!("read DoQ reply from {}: {}", self.display, e)))
    }
}

#[async_trait]
impl Upstream for QuicUpstream {
    async fn exchange(&self, query: &Message) -> Result<Reply, DnsError> {
        let mut wire_query = query
            .to_vec()
            .map_err(|e| DnsError::MalformedMessage(e.to_string()))?;
        // RFC 9250 §4.2.1: the message identifier on the wire must be zero.
        wire::patch_id(&mut wire_query, 0);

        let conn = self.get_or_connect().await?;
        let response = match self.exchange_on(&conn, &wire_query).await {
            Ok(r) => r,
            Err(e) => {
                debug!(server = %self.display, error = %e, "pooled DoQ connection stale, reconnecting");
                QUIC_POOL.remove(&(self.server_addr, self.server_name.clone()));
                let fresh = self.connect_new().await?;
                QUIC_POOL.insert(
                    (self.server_addr, self.server_name.clone()),
                    fresh.clone(),
                );
                self.exchange_on(&fresh, &wire_query).await?
            }
        };

        // Restore the caller's identifier before parsing.
        let mut response = response;
        wire::patch_id(&mut response, query.id());
        Reply::from_wire(response)
    }

    fn address(&self) -> &str {
        &self.display
    }
}
