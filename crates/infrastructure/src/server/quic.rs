use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, warn};

use conduit_dns_application::meta::{RequestMeta, TransportProtocol};
use conduit_dns_domain::DnsError;

use crate::keys::ProcessKeys;

use super::tls::build_server_config;
use super::Server;

const MAX_QUERY_SIZE: usize = 65535;

/// DoQ application error code for protocol violations (RFC 9250 §8.4).
const DOQ_PROTOCOL_ERROR: u32 = 2;

pub struct QuicServerOpts {
    pub bind: SocketAddr,
    pub cert: String,
    pub key: String,
    pub zero_rtt: bool,
}

/// DNS over QUIC listener (RFC 9250): ALPN `doq`, one query per
/// bidirectional stream, no length prefix, message identifier zero.
/// Connection idle is handled by the QUIC transport itself.
pub async fn serve_quic(
    server: Arc<Server>,
    opts: QuicServerOpts,
    keys: &ProcessKeys,
) -> Result<(), DnsError> {
    let mut tls = build_server_config(&opts.cert, &opts.key, &[b"doq"])?;
    tls.max_early_data_size = if opts.zero_rtt { u32::MAX } else { 0 };

    let quic_tls = QuicServerConfig::try_from(Arc::new(tls)).map_err(|e| DnsError::Tls {
        server: opts.bind.to_string(),
        detail: format!("QUIC server config: {}", e),
    })?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_tls));

    let mut transport = quinn::TransportConfig::default();
    transport
        .max_idle_timeout(Some(
            quinn::IdleTimeout::try_from(server.idle_timeout().max(Duration::from_secs(1)))
                .map_err(|_| DnsError::Config("quic idle_timeout out of range".to_string()))?,
        ))
        .max_concurrent_uni_streams(0u8.into());
    server_config.transport_config(Arc::new(transport));

    // Stateless-reset key persisted across restarts so resets stay valid
    // for clients that outlive us.
    let reset_key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, &keys.stateless_reset);
    let endpoint_config = quinn::EndpointConfig::new(Arc::new(reset_key));

    let socket = std::net::UdpSocket::bind(opts.bind)
        .map_err(|e| DnsError::Io(format!("bind quic socket {}: {}", opts.bind, e)))?;
    let runtime = quinn::default_runtime()
        .ok_or_else(|| DnsError::Config("no async runtime for QUIC".to_string()))?;
    let endpoint = quinn::Endpoint::new(endpoint_config, Some(server_config), socket, runtime)
        .map_err(|e| DnsError::Io(format!("create quic endpoint: {}", e)))?;

    loop {
        let incoming = tokio::select! {
            _ = server.cancelled().cancelled() => {
                endpoint.close(0u32.into(), b"server closed");
                return Err(DnsError::ServerClosed);
            }
            inc = endpoint.accept() => match inc {
                Some(inc) => inc,
                None => return Err(DnsError::ServerClosed),
            },
        };

        let server2 = Arc::clone(&server);
        let zero_rtt = opts.zero_rtt;
        server.tracker().spawn(async move {
            let connection = match accept_connection(incoming, zero_rtt).await {
                Ok(c) => c,
                Err(e) => {
                    debug!(error = %e, "QUIC handshake failed");
                    return;
                }
            };
            handle_connection(server2, connection).await;
        });
    }
}

/// Completes the handshake; with 0-RTT enabled, early data is accepted
/// without waiting for it to finish.
async fn accept_connection(
    incoming: quinn::Incoming,
    zero_rtt: bool,
) -> Result<quinn::Connection, quinn::ConnectionError> {
    let connecting = incoming.accept()?;
    if zero_rtt {
        match connecting.into_0rtt() {
            Ok((connection, _accepted)) => return Ok(connection),
            Err(connecting) => return connecting.await,
        }
    }
    connecting.await
}

async fn handle_connection(server: Arc<Server>, connection: quinn::Connection) {
    let peer = connection.remote_address();
    let server_name = connection
        .handshake_data()
        .and_then(|data| {
            data.downcast::<quinn::crypto::rustls::HandshakeData>()
                .ok()
        })
        .and_then(|data| data.server_name)
        .unwrap_or_default();

    loop {
        let (send, recv) = tokio::select! {
            _ = server.cancelled().cancelled() => {
                connection.close(0u32.into(), b"server closed");
                return;
            }
            res = connection.accept_bi() => match res {
                Ok(s) => s,
                // Transport idle timeout or peer close; nothing to do.
                Err(_) => return,
            },
        };

        let server2 = Arc::clone(&server);
        let connection = connection.clone();
        let server_name = server_name.clone();
        server.tracker().spawn(async move {
            handle_stream(server2, connection, send, recv, peer, server_name).await;
        });
    }
}

async fn handle_stream(
    server: Arc<Server>,
    connection: quinn::Connection,
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    peer: SocketAddr,
    server_name: String,
) {
    let wire = match recv.read_to_end(MAX_QUERY_SIZE).await {
        Ok(w) => w,
        Err(e) => {
            debug!(client = %peer, error = %e, "failed to read DoQ stream");
            return;
        }
    };

    let query = match Message::from_vec(&wire) {
        Ok(q) => q,
        Err(e) => {
            warn!(client = %peer, error = %e, "invalid DoQ message");
            connection.close(DOQ_PROTOCOL_ERROR.into(), b"malformed message");
            return;
        }
    };

    // RFC 9250 §4.2.1: a client query must carry identifier zero; anything
    // else is a connection-level protocol error.
    if query.id() != 0 {
        warn!(client = %peer, id = query.id(), "DoQ query with nonzero id");
        connection.close(DOQ_PROTOCOL_ERROR.into(), b"nonzero message id");
        return;
    }

    let meta = RequestMeta::new(peer.ip(), TransportProtocol::Quic).with_server_name(server_name);
    let mut qctx = server.handler().handle(query, meta).await;

    let result = if let Some(raw) = qctx.take_raw_response() {
        let res = send.write_all(raw.bytes()).await;
        raw.release();
        res
    } else if let Some(r) = qctx.response() {
        match r.to_vec() {
            Ok(packed) => send.write_all(&packed).await,
            Err(e) => {
                warn!(error = %e, "failed to pack DoQ response");
                return;
            }
        }
    } else {
        return;
    };

    if let Err(e) = result {
        debug!(client = %peer, error = %e, "failed to write DoQ response");
        return;
    }
    let _ = send.finish();
}
