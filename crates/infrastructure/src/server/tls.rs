use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use conduit_dns_domain::DnsError;

/// rustls server config for a listener: cert chain, private key, ALPN.
pub fn build_server_config(
    cert_path: &str,
    key_path: &str,
    alpn: &[&[u8]],
) -> Result<rustls::ServerConfig, DnsError> {
    if cert_path.is_empty() || key_path.is_empty() {
        return Err(DnsError::Config(
            "listener requires cert and key".to_string(),
        ));
    }

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DnsError::Tls {
            server: cert_path.to_string(),
            detail: e.to_string(),
        })?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

pub fn build_acceptor(
    cert_path: &str,
    key_path: &str,
    alpn: &[&[u8]],
) -> Result<TlsAcceptor, DnsError> {
    let config = build_server_config(cert_path, key_path, alpn)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, DnsError> {
    let file = File::open(path).map_err(|e| DnsError::Io(format!("open {}: {}", path, e)))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| DnsError::Io(format!("parse certs in {}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(DnsError::Config(format!("no certificate found in {}", path)));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, DnsError> {
    let file = File::open(path).map_err(|e| DnsError::Io(format!("open {}: {}", path, e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| DnsError::Io(format!("parse key in {}: {}", path, e)))?
        .ok_or_else(|| DnsError::Config(format!("no private key found in {}", path)))
}
