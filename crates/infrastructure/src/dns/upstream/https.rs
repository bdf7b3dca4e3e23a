use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tracing::debug;

use conduit_dns_domain::{DnsError, UpstreamAddr};

use super::{Reply, Upstream};

const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// DNS over HTTPS (RFC 8484), POST framing, HTTP/2 via ALPN.
///
/// The endpoint hostname was resolved through the bootstrap resolver at
/// build time and pinned on the client, so queries for the DoH server's own
/// name never loop back through us.
pub struct HttpsUpstream {
    url: String,
    display: String,
    client: reqwest::Client,
}

impl HttpsUpstream {
    pub fn new(
        server_addr: SocketAddr,
        parsed: &UpstreamAddr,
        insecure: bool,
    ) -> Result<Self, DnsError> {
        let url = format!("https://{}:{}{}", parsed.host, parsed.port, parsed.path);

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(EXCHANGE_TIMEOUT)
            .pool_max_idle_per_host(4)
            .resolve(&parsed.host, server_addr);
        if insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| DnsError::Config(format!("build DoH client: {}", e)))?;

        Ok(Self {
            url,
            display: parsed.display_addr(),
            client,
        })
    }
}

#[async_trait]
impl Upstream for HttpsUpstream {
    async fn exchange(&self, query: &Message) -> Result<Reply, DnsError> {
        let wire = query
            .to_vec()
            .map_err(|e| DnsError::MalformedMessage(e.to_string()))?;

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", DNS_MESSAGE_CONTENT_TYPE)
            .header("Accept", DNS_MESSAGE_CONTENT_TYPE)
            .body(wire)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DnsError::TransportTimeout {
                        server: self.display.clone(),
                    }
                } else {
                    DnsError::Io(format!("DoH request to {}: {}", self.url, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DnsError::Io(format!(
                "DoH server {} returned HTTP {}",
                self.url,
                status.as_u16()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DnsError::Io(format!("read DoH body from {}: {}", self.url, e)))?;

        debug!(server = %self.display, response_len = body.len(), "DoH response received");
        Reply::from_wire(body.to_vec())
    }

    fn address(&self) -> &str {
        &self.display
    }
}
