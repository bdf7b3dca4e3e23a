use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_proto::op::Message;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use conduit_dns_domain::{DnsError, UpstreamAddr};

use super::tcp::{read_framed, write_framed};
use super::{Reply, Upstream};

const MAX_IDLE_PER_HOST: usize = 2;
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

static ROOT_STORE: LazyLock<rustls::RootCertStore> = LazyLock::new(|| {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    roots
});

type PoolKey = (SocketAddr, String);
static TLS_POOL: LazyLock<DashMap<PoolKey, Vec<TlsStream<TcpStream>>>> =
    LazyLock::new(DashMap::new);

/// DNS over TLS (RFC 7858), ALPN `dot`, with a small idle-connection pool.
pub struct TlsUpstream {
    server_addr: SocketAddr,
    server_name: String,
    display: String,
    connector: TlsConnector,
}

impl TlsUpstream {
    pub fn new(
        server_addr: SocketAddr,
        parsed: &UpstreamAddr,
        insecure: bool,
    ) -> Result<Self, DnsError> {
        let mut config = if insecure {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(insecure_verifier())
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .with_root_certificates(ROOT_STORE.clone())
                .with_no_client_auth()
        };
        config.alpn_protocols = vec![b"dot".to_vec()];

        Ok(Self {
            server_addr,
            server_name: parsed.host.clone(),
            display: parsed.display_addr(),
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    fn take_pooled(&self) -> Option<TlsStream<TcpStream>> {
        let key = (self.server_addr, self.server_name.clone());
        TLS_POOL.get_mut(&key)?.pop()
    }

    fn return_to_pool(&self, stream: TlsStream<TcpStream>) {
        let key = (self.server_addr, self.server_name.clone());
        let mut idle = TLS_POOL.entry(key).or_default();
        if idle.len() < MAX_IDLE_PER_HOST {
            idle.push(stream);
        }
    }

    async fn connect_new(&self) -> Result<TlsStream<TcpStream>, DnsError> {
        let server_name = ServerName::try_from(self.server_name.clone()).map_err(|e| {
            DnsError::Tls {
                server: self.display.clone(),
                detail: format!("invalid server name: {}", e),
            }
        })?;

        let tcp = tokio::time::timeout(EXCHANGE_TIMEOUT, TcpStream::connect(self.server_addr))
            .await
            .map_err(|_| DnsError::TransportTimeout {
                server: self.display.clone(),
            })?
            .map_err(|_| DnsError::TransportConnectionRefused {
                server: self.display.clone(),
            })?;

        tokio::time::timeout(EXCHANGE_TIMEOUT, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| DnsError::TransportTimeout {
                server: self.display.clone(),
            })?
            .map_err(|e| DnsError::Tls {
                server: self.display.clone(),
                detail: e.to_string(),
            })
    }

    async fn exchange_on(
        &self,
        stream: &mut TlsStream<TcpStream>,
        wire: &[u8],
    ) -> Result<Vec<u8>, DnsError> {
        tokio::time::timeout(EXCHANGE_TIMEOUT, write_framed(stream, wire))
            .await
            .map_err(|_| DnsError::TransportTimeout {
                server: self.display.clone(),
            })??;
        tokio::time::timeout(EXCHANGE_TIMEOUT, read_framed(stream))
            .await
            .map_err(|_| DnsError::TransportTimeout {
                server: self.display.clone(),
            })?
    }
}

#[async_trait]
impl Upstream for TlsUpstream {
    async fn exchange(&self, query: &Message) -> Result<Reply, DnsError> {
        let wire = query
            .to_vec()
            .map_err(|e| DnsError::MalformedMessage(e.to_string()))?;

        // A pooled connection may have been closed by the server; fall back
        // to a fresh one instead of surfacing the error.
        if let Some(mut pooled) = self.take_pooled() {
            match self.exchange_on(&mut pooled, &wire).await {
                Ok(response) => {
                    self.return_to_pool(pooled);
                    return Reply::from_wire(response);
                }
                Err(e) => {
                    debug!(server = %self.display, error = %e, "pooled DoT connection stale");
                }
            }
        }

        let mut fresh = self.connect_new().await?;
        let response = self.exchange_on(&mut fresh, &wire).await?;
        self.return_to_pool(fresh);
        Reply::from_wire(response)
    }

    fn address(&self) -> &str {
        &self.display
    }
}

/// Accepts any certificate. Only reachable through the `insecure` upstream
/// flag.
pub(crate) fn insecure_verifier() -> Arc<dyn rustls::client::danger::ServerCertVerifier> {
    #[derive(Debug)]
    struct NoVerify(rustls::crypto::CryptoProvider);

    impl rustls::client::danger::ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &rustls::pki_types::CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &rustls::pki_types::CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    Arc::new(NoVerify(rustls::crypto::aws_lc_rs::default_provider()))
}
