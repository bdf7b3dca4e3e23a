use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use dashmap::DashMap;
use hickory_proto::op::Message;
use tracing::debug;

use conduit_dns_domain::{DnsError, UpstreamAddr};

use super::tls::insecure_verifier;
use super::{Reply, Upstream};

const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

type H3SendRequest = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;

static H3_ENDPOINT: LazyLock<quinn::Endpoint> = LazyLock::new(|| {
    quinn::Endpoint::client("0.0.0.0:0".parse().expect("static addr"))
        .expect("H3 client endpoint")
});

static H3_POOL: LazyLock<DashMap<String, H3SendRequest>> = LazyLock::new(DashMap::new);

/// DNS over HTTP/3 (RFC 8484 over RFC 9114), POST framing.
pub struct H3Upstream {
    server_addr: SocketAddr,
    server_name: String,
    url: String,
    display: String,
    pool_key: String,
    client_config: quinn::ClientConfig,
}

impl H3Upstream {
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
        tls_config.alpn_protocols = vec![b"h3".to_vec()];

        let quic_config = quinn::crypto::rustls::QuicClientConfig::try_from(Arc::new(tls_config))
            .map_err(|e| DnsError::Tls {
                server: parsed.display_addr(),
                detail: format!("H3 TLS config: {}", e),
            })?;

        Ok(Self {
            server_addr,
            server_name: parsed.host.clone(),
            url: format!("https://{}:{}{}", parsed.host, parsed.port, parsed.path),
            display: parsed.display_addr(),
            pool_key: format!("{}|{}", server_addr, parsed.host),
            client_config: quinn::ClientConfig::new(Arc::new(quic_config)),
        })
    }

    async fn connect_new(&self) -> Result<H3SendRequest, DnsError> {
        let connecting = H3_ENDPOINT
            .connect_with(
                self.client_config.clone(),
                self.server_addr,
                &self.server_name,
            )
            .map_err(|e| DnsError::Io(format!("initiate H3 to {}: {}", self.display, e)))?;

        let quinn_conn = tokio::time::timeout(EXCHANGE_TIMEOUT, connecting)
            .await
            .map_err(|_| DnsError::TransportTimeout {
                server: self.display.clone(),
            })?
            .map_err(|_| DnsError::TransportConnectionRefused {
                server: self.display.clone(),
            })?;

        let h3_conn = h3_quinn::Connection::new(quinn_conn);
        let (mut driver, send_request) = h3::client::new(h3_conn)
            .await
            .map_err(|e| DnsError::Io(format!("create H3 client for {}: {}", self.display, e)))?;

        tokio::spawn(async move {
            let _ = std::future::poll_fn(|cx| driver.poll_close(cx)).await;
        });

        Ok(send_request)
    }

    async fn get_or_connect(&self) -> Result<H3SendRequest, DnsError> {
        if let Some(sr) = H3_POOL.get(&self.pool_key) {
            return Ok(sr.clone());
        }
        let sr = self.connect_new().await?;
        H3_POOL.insert(self.pool_key.clone(), sr.clone());
        Ok(sr)
    }

    async fn execute(
        &self,
        send_request: &mut H3SendRequest,
        wire_query: &[u8],
    ) -> Result<Vec<u8>, DnsError> {
        let timeout_err = || DnsError::TransportTimeout {
            server: self.display.clone(),
        };

        let request = http::Request::builder()
            .method("POST")
            .uri(&self.url)
            .header("content-type", DNS_MESSAGE_CONTENT_TYPE)
            .header("accept", DNS_MESSAGE_CONTENT_TYPE)
            .body(())
            .map_err(|e| DnsError::Io(format!("build H3 request: {}", e)))?;

        let mut stream = tokio::time::timeout(EXCHANGE_TIMEOUT, send_request.send_request(request))
            .await
            .map_err(|_| timeout_err())?
            .map_err(|e| DnsError::Io(format!("send H3 request to {}: {}", self.url, e)))?;

        tokio::time::timeout(
            EXCHANGE_TIMEOUT,
            stream.send_data(Bytes::copy_from_slice(wire_query)),
        )
        .await
        .map_err(|_| timeout_err())?
        .map_err(|e| DnsError::Io(format!("send H3 body to {}: {}", self.url, e)))?;

        tokio::time::timeout(EXCHANGE_TIMEOUT, stream.finish())
            .await
            .map_err(|_| timeout_err())?
            .map_err(|e| DnsError::Io(format!("finish H3 stream to {}: {}", self.url, e)))?;

        let response = tokio::time::timeout(EXCHANGE_TIMEOUT, stream.recv_response())
            .await
            .map_err(|_| timeout_err())?
            .map_err(|e| DnsError::Io(format!("receive H3 response from {}: {}", self.url, e)))?;

        if !response.status().is_success() {
            return Err(DnsError::Io(format!(
                "H3 server {} returned HTTP {}",
                self.url,
                response.status().as_u16()
            )));
        }

        let mut body = BytesMut::new();
        while let Some(mut chunk) = tokio::time::timeout(EXCHANGE_TIMEOUT, stream.recv_data())
            .await
            .map_err(|_| timeout_err())?
            .map_err(|e| DnsError::Io(format!("read H3 body from {}: {}", self.url, e)))?
        {
            body.extend_from_slice(chunk.chunk());
            chunk.advance(chunk.remaining());
        }

        Ok(body.to_vec())
    }
}

#[async_trait]
impl Upstream for H3Upstream {
    async fn exchange(&self, query: &Message) -> Result<Reply, DnsError> {
        let wire_query = query
            .to_vec()
            .map_err(|e| DnsError::MalformedMessage(e.to_string()))?;

        let mut send_request = self.get_or_connect().await?;
        match self.execute(&mut send_request, &wire_query).await {
            Ok(response) => return Reply::from_wire(response),
            Err(e) => {
                debug!(server = %self.display, error = %e, "pooled H3 connection stale, reconnecting");
                H3_POOL.remove(&self.pool_key);
            }
        }

        let mut fresh = self.connect_new().await?;
        H3_POOL.insert(self.pool_key.clone(), fresh.clone());
        let response = self.execute(&mut fresh, &wire_query).await?;
        Reply::from_wire(response)
    }

    fn address(&self) -> &str {
        &self.display
    }
}
