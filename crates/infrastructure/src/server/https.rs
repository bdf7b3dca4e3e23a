use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use quinn::crypto::rustls::QuicServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use conduit_dns_application::meta::TransportProtocol;
use conduit_dns_domain::DnsError;

use crate::keys::ProcessKeys;

use super::http_handler::{DohHandler, DohRequest, MAX_REQUEST_BODY};
use super::tls::build_server_config;
use super::Server;

/// Concurrent-request caps, sized per transport.
const H1_H2_CONCURRENCY: usize = 4096;
const H3_CONCURRENCY: usize = 2048;

/// DoH over TCP, plain or TLS (HTTP/1.1 and HTTP/2).
pub async fn serve_doh(
    server: Arc<Server>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    doh: Arc<DohHandler>,
) -> Result<(), DnsError> {
    let limiter = Arc::new(Semaphore::new(H1_H2_CONCURRENCY));

    loop {
        let (stream, peer) = tokio::select! {
            _ = server.cancelled().cancelled() => return Err(DnsError::ServerClosed),
            res = listener.accept() => match res {
                Ok(x) => x,
                Err(e) => {
                    if server.closed() {
                        return Err(DnsError::ServerClosed);
                    }
                    debug!(error = %e, "doh accept error");
                    continue;
                }
            },
        };

        let server2 = Arc::clone(&server);
        let doh = Arc::clone(&doh);
        let tls = tls.clone();
        let limiter = Arc::clone(&limiter);
        server.tracker().spawn(async move {
            serve_http_connection(server2, stream, peer, tls, doh, limiter).await;
        });
    }
}

async fn serve_http_connection(
    server: Arc<Server>,
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    doh: Arc<DohHandler>,
    limiter: Arc<Semaphore>,
) {
    let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());

    match tls {
        Some(acceptor) => {
            let handshake_timeout = server.idle_timeout().max(Duration::from_secs(1));
            let accepted =
                match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => {
                        debug!(client = %peer, error = %e, "DoH TLS handshake failed");
                        return;
                    }
                    Err(_) => return,
                };

            let (protocol, server_name) = {
                let session = accepted.get_ref().1;
                let protocol = match session.alpn_protocol() {
                    Some(alpn) if alpn == b"h2" => TransportProtocol::H2,
                    _ => TransportProtocol::Https,
                };
                (
                    protocol,
                    session.server_name().unwrap_or_default().to_string(),
                )
            };

            let service = service_fn(move |req| {
                handle_http_request(
                    Arc::clone(&doh),
                    Arc::clone(&limiter),
                    req,
                    peer,
                    protocol,
                    server_name.clone(),
                )
            });
            if let Err(e) = builder
                .serve_connection(TokioIo::new(accepted), service)
                .await
            {
                debug!(client = %peer, error = %e, "DoH connection ended with error");
            }
        }
        None => {
            let service = service_fn(move |req| {
                handle_http_request(
                    Arc::clone(&doh),
                    Arc::clone(&limiter),
                    req,
                    peer,
                    TransportProtocol::Http,
                    String::new(),
                )
            });
            if let Err(e) = builder
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(client = %peer, error = %e, "DoH connection ended with error");
            }
        }
    }
}

async fn handle_http_request(
    doh: Arc<DohHandler>,
    limiter: Arc<Semaphore>,
    req: http::Request<Incoming>,
    peer: SocketAddr,
    protocol: TransportProtocol,
    server_name: String,
) -> Result<http::Response<Full<Bytes>>, std::convert::Infallible> {
    let Ok(_permit) = limiter.acquire().await else {
        return Ok(status_response(http::StatusCode::SERVICE_UNAVAILABLE));
    };

    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, MAX_REQUEST_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            return Ok(status_response(http::StatusCode::PAYLOAD_TOO_LARGE));
        }
    };

    let response = doh
        .handle(DohRequest {
            method: parts.method,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers,
            body,
            peer: peer.ip(),
            server_name,
            protocol,
        })
        .await;

    Ok(response.map(Full::new))
}

fn status_response(status: http::StatusCode) -> http::Response<Full<Bytes>> {
    let mut response = http::Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

pub struct Doh3ServerOpts {
    pub bind: SocketAddr,
    pub cert: String,
    pub key: String,
}

/// DoH over HTTP/3: a quinn endpoint with ALPN `h3`, one request stream per
/// query, sharing the HTTP handler with the TCP listeners.
pub async fn serve_doh3(
    server: Arc<Server>,
    opts: Doh3ServerOpts,
    keys: &ProcessKeys,
    doh: Arc<DohHandler>,
) -> Result<(), DnsError> {
    let tls = build_server_config(&opts.cert, &opts.key, &[b"h3"])?;
    let quic_tls = QuicServerConfig::try_from(Arc::new(tls)).map_err(|e| DnsError::Tls {
        server: opts.bind.to_string(),
        detail: format!("H3 server config: {}", e),
    })?;
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_tls));

    let reset_key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, &keys.stateless_reset);
    let endpoint_config = quinn::EndpointConfig::new(Arc::new(reset_key));

    let socket = std::net::UdpSocket::bind(opts.bind)
        .map_err(|e| DnsError::Io(format!("bind h3 socket {}: {}", opts.bind, e)))?;
    let runtime = quinn::default_runtime()
        .ok_or_else(|| DnsError::Config("no async runtime for H3".to_string()))?;
    let endpoint = quinn::Endpoint::new(endpoint_config, Some(server_config), socket, runtime)
        .map_err(|e| DnsError::Io(format!("create h3 endpoint: {}", e)))?;

    let limiter = Arc::new(Semaphore::new(H3_CONCURRENCY));

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
        let doh = Arc::clone(&doh);
        let limiter = Arc::clone(&limiter);
        server.tracker().spawn(async move {
            let connection = match incoming.await {
                Ok(c) => c,
                Err(e) => {
                    debug!(error = %e, "H3 handshake failed");
                    return;
                }
            };
            serve_h3_connection(server2, connection, doh, limiter).await;
        });
    }
}

async fn serve_h3_connection(
    server: Arc<Server>,
    connection: quinn::Connection,
    doh: Arc<DohHandler>,
    limiter: Arc<Semaphore>,
) {
    let peer = connection.remote_address();
    let server_name = connection
        .handshake_data()
        .and_then(|data| {
            data.downcast::<quinn::crypto::rustls::HandshakeData>()
                .ok()
        })
        .and_then(|data| data.server_name)
        .unwrap_or_default();

    let mut h3_conn: h3::server::Connection<h3_quinn::Connection, Bytes> =
        match h3::server::Connection::new(h3_quinn::Connection::new(connection)).await {
            Ok(c) => c,
            Err(e) => {
                debug!(client = %peer, error = %e, "H3 connection setup failed");
                return;
            }
        };

    loop {
        let resolver = tokio::select! {
            _ = server.cancelled().cancelled() => return,
            res = h3_conn.accept() => match res {
                Ok(Some(r)) => r,
                Ok(None) => return,
                Err(e) => {
                    debug!(client = %peer, error = %e, "H3 accept error");
                    return;
                }
            },
        };
        let (req, mut stream) = match resolver.resolve_request().await {
            Ok(r) => r,
            Err(e) => {
                debug!(client = %peer, error = %e, "H3 request resolve error");
                continue;
            }
        };

        let doh = Arc::clone(&doh);
        let limiter = Arc::clone(&limiter);
        let server_name = server_name.clone();
        server.tracker().spawn(async move {
            let Ok(_permit) = limiter.acquire().await else {
                return;
            };

            let mut body = Vec::new();
            loop {
                match stream.recv_data().await {
                    Ok(Some(chunk)) => {
                        use bytes::Buf;
                        let mut chunk = chunk;
                        while chunk.has_remaining() {
                            let piece = chunk.chunk();
                            body.extend_from_slice(piece);
                            let advance = piece.len();
                            chunk.advance(advance);
                        }
                        if body.len() > MAX_REQUEST_BODY {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(client = %peer, error = %e, "H3 body read error");
                        return;
                    }
                }
            }

            let (parts, _) = req.into_parts();
            let response = doh
                .handle(DohRequest {
                    method: parts.method,
                    path: parts.uri.path().to_string(),
                    query: parts.uri.query().map(str::to_string),
                    headers: parts.headers,
                    body: Bytes::from(body),
                    peer: peer.ip(),
                    server_name,
                    protocol: TransportProtocol::H3,
                })
                .await;

            let (response_parts, body) = response.into_parts();
            let head = http::Response::from_parts(response_parts, ());
            if let Err(e) = stream.send_response(head).await {
                debug!(client = %peer, error = %e, "H3 send response failed");
                return;
            }
            if !body.is_empty() {
                if let Err(e) = stream.send_data(body).await {
                    debug!(client = %peer, error = %e, "H3 send body failed");
                    return;
                }
            }
            if let Err(e) = stream.finish().await {
                warn!(client = %peer, error = %e, "H3 finish failed");
            }
        });
    }
}
