use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use conduit_dns_application::context::QueryContext;
use conduit_dns_application::meta::{RequestMeta, TransportProtocol};
use conduit_dns_domain::DnsError;

use crate::dns::upstream::tcp::{read_framed, write_framed};

use super::Server;

/// Cap on the first read of a connection: clients that connect and send
/// nothing get dropped quickly instead of holding a slot for the full idle
/// timeout.
const FIRST_READ_TIMEOUT: Duration = Duration::from_millis(500);

const ACCEPT_BACKLOG: i32 = 1024;

/// Binds the listening socket with address reuse for rolling restarts.
pub fn bind_tcp(addr: std::net::SocketAddr) -> Result<TcpListener, DnsError> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
        .map_err(|e| DnsError::Io(format!("create tcp socket: {}", e)))?;

    let setup = || -> std::io::Result<()> {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&addr.into())?;
        socket.listen(ACCEPT_BACKLOG)?;
        socket.set_nonblocking(true)
    };
    setup().map_err(|e| DnsError::Io(format!("bind tcp {}: {}", addr, e)))?;

    TcpListener::from_std(socket.into()).map_err(|e| DnsError::Io(format!("tcp socket: {}", e)))
}

pub struct TcpServerOpts {
    /// Present on DoT listeners.
    pub tls: Option<TlsAcceptor>,
    /// When set, connections whose SNI differs are dropped after handshake.
    pub allowed_sni: String,
}

/// Accept loop for TCP and DoT listeners.
pub async fn serve_tcp(
    server: Arc<Server>,
    listener: TcpListener,
    opts: TcpServerOpts,
) -> Result<(), DnsError> {
    let opts = Arc::new(opts);
    loop {
        let (stream, peer) = tokio::select! {
            _ = server.cancelled().cancelled() => return Err(DnsError::ServerClosed),
            res = listener.accept() => match res {
                Ok(x) => x,
                Err(e) => {
                    if server.closed() {
                        return Err(DnsError::ServerClosed);
                    }
                    debug!(error = %e, "tcp accept error");
                    continue;
                }
            },
        };

        let server2 = Arc::clone(&server);
        let opts = Arc::clone(&opts);
        server.tracker().spawn(async move {
            handle_connection(server2, stream, peer.ip(), opts).await;
        });
    }
}

async fn handle_connection(
    server: Arc<Server>,
    stream: TcpStream,
    peer_ip: std::net::IpAddr,
    opts: Arc<TcpServerOpts>,
) {
    let idle = server.idle_timeout();

    match &opts.tls {
        Some(acceptor) => {
            // The handshake shares the idle timeout as its bound.
            let accepted =
                match tokio::time::timeout(idle, acceptor.accept(stream)).await {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => {
                        debug!(client = %peer_ip, error = %e, "TLS handshake failed");
                        return;
                    }
                    Err(_) => {
                        debug!(client = %peer_ip, "TLS handshake timed out");
                        return;
                    }
                };

            let sni = accepted
                .get_ref()
                .1
                .server_name()
                .unwrap_or_default()
                .to_string();
            if !opts.allowed_sni.is_empty() && sni != opts.allowed_sni {
                debug!(client = %peer_ip, sni = %sni, "closing connection with unexpected SNI");
                return;
            }

            let meta = RequestMeta::new(peer_ip, TransportProtocol::Tls).with_server_name(sni);
            serve_stream(server, accepted, meta, idle).await;
        }
        None => {
            let meta = RequestMeta::new(peer_ip, TransportProtocol::Tcp);
            serve_stream(server, stream, meta, idle).await;
        }
    }
}

/// Length-prefixed request loop over any byte stream. Queries on one
/// connection are handled concurrently; the write half is serialized by a
/// per-connection lock.
async fn serve_stream<S>(server: Arc<Server>, stream: S, meta: RequestMeta, idle: Duration)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, write_half) = tokio::io::split(stream);
    let write_half = Arc::new(Mutex::new(write_half));

    let mut read_timeout = idle.min(FIRST_READ_TIMEOUT);
    loop {
        let wire = tokio::select! {
            _ = server.cancelled().cancelled() => return,
            res = tokio::time::timeout(read_timeout, read_framed(&mut read_half)) => match res {
                Ok(Ok(w)) => w,
                // Idle expiry or peer close both end the connection quietly.
                _ => return,
            },
        };
        read_timeout = idle;

        let query = match Message::from_vec(&wire) {
            Ok(q) => q,
            Err(e) => {
                debug!(error = %e, "invalid DNS message on stream, closing");
                return;
            }
        };

        let server2 = Arc::clone(&server);
        let write_half = Arc::clone(&write_half);
        let meta = meta.clone();
        server.tracker().spawn(async move {
            let mut qctx = server2.handler().handle(query, meta).await;
            if let Err(e) = write_reply(&write_half, &mut qctx).await {
                debug!(error = %e, "failed to write stream response");
            }
        });
    }
}

async fn write_reply<W>(
    write_half: &Arc<Mutex<WriteHalf<W>>>,
    qctx: &mut QueryContext,
) -> Result<(), DnsError>
where
    W: AsyncWrite + Send,
{
    if let Some(raw) = qctx.take_raw_response() {
        let mut guard = write_half.lock().await;
        let result = write_framed(&mut *guard, raw.bytes()).await;
        drop(guard);
        raw.release();
        return result;
    }

    if let Some(r) = qctx.response() {
        let packed = r
            .to_vec()
            .map_err(|e| DnsError::MalformedMessage(e.to_string()))?;
        let mut guard = write_half.lock().await;
        return write_framed(&mut *guard, &packed).await;
    }

    warn!("stream query finished with no response");
    Ok(())
}
