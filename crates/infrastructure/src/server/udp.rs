use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use conduit_dns_application::context::QueryContext;
use conduit_dns_application::meta::{RequestMeta, TransportProtocol};
use conduit_dns_domain::DnsError;

use crate::dns::wire;

use super::Server;

const READ_BUF_SIZE: usize = 64 * 1024;

const RECV_BUFFER_SIZE: usize = 8 * 1024 * 1024;
const SEND_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Binds the listening socket with enlarged kernel buffers and address
/// reuse, so multiple processes can share the port during rolling restarts.
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, DnsError> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
        .map_err(|e| DnsError::Io(format!("create udp socket: {}", e)))?;

    let setup = || -> std::io::Result<()> {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
        socket.set_send_buffer_size(SEND_BUFFER_SIZE)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)
    };
    setup().map_err(|e| DnsError::Io(format!("bind udp {}: {}", addr, e)))?;

    UdpSocket::from_std(socket.into()).map_err(|e| DnsError::Io(format!("udp socket: {}", e)))
}

/// Read loop of a UDP listener. Every packet becomes its own task; replies
/// reuse the zero-unpack bytes when the graph produced them, otherwise the
/// parsed response is packed and truncated to the client's declared size.
pub async fn serve_udp(server: Arc<Server>, socket: UdpSocket) -> Result<(), DnsError> {
    let conn = Arc::new(PacketConn::new(socket)?);
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let (n, from, reply_to) = tokio::select! {
            _ = server.cancelled().cancelled() => return Err(DnsError::ServerClosed),
            res = conn.recv(&mut buf) => match res {
                Ok(x) => x,
                Err(e) => {
                    if server.closed() {
                        return Err(DnsError::ServerClosed);
                    }
                    return Err(DnsError::Io(format!("udp read: {}", e)));
                }
            },
        };

        let query = match Message::from_vec(&buf[..n]) {
            Ok(q) => q,
            Err(e) => {
                warn!(from = %from, error = %e, "invalid DNS message");
                continue;
            }
        };

        let server2 = Arc::clone(&server);
        let conn = Arc::clone(&conn);
        server.tracker().spawn(async move {
            let meta = RequestMeta::new(from.ip(), TransportProtocol::Udp);
            let mut qctx = server2.handler().handle(query, meta).await;
            if let Err(e) = write_reply(&conn, &mut qctx, from, reply_to).await {
                debug!(client = %from, error = %e, "failed to write UDP response");
            }
        });
    }
}

async fn write_reply(
    conn: &PacketConn,
    qctx: &mut QueryContext,
    to: SocketAddr,
    reply_to: ReplyInfo,
) -> io::Result<()> {
    // Zero-unpack fast path: the plugin already patched id and TTLs.
    if let Some(raw) = qctx.take_raw_response() {
        let result = conn.send(raw.bytes(), to, reply_to).await;
        raw.release();
        return result.map(|_| ());
    }

    if let Some(r) = qctx.response() {
        let limit = wire::declared_udp_size(qctx.query());
        let packed = pack_with_truncation(r, limit);
        conn.send(&packed, to, reply_to).await?;
    }
    Ok(())
}

/// Packs `r`, dropping every record section and setting TC when the full
/// message exceeds `limit`.
fn pack_with_truncation(r: &Message, limit: usize) -> Vec<u8> {
    match r.to_vec() {
        Ok(packed) if packed.len() <= limit => packed,
        Ok(_) => {
            let mut truncated = r.clone();
            truncated.take_answers();
            truncated.take_name_servers();
            truncated.take_additionals();
            truncated.set_truncated(true);
            truncated.to_vec().unwrap_or_default()
        }
        Err(e) => {
            warn!(error = %e, "failed to pack response");
            Vec::new()
        }
    }
}

#[cfg(unix)]
type ReplyInfo = Option<super::pktinfo::PktInfo>;
#[cfg(not(unix))]
type ReplyInfo = Option<()>;

/// A UDP socket that, when bound to an unspecified address, reads and writes
/// per-packet control messages so replies leave from the address and
/// interface the query arrived on.
struct PacketConn {
    socket: UdpSocket,
    use_pktinfo: bool,
}

impl PacketConn {
    fn new(socket: UdpSocket) -> Result<Self, DnsError> {
        let local = socket
            .local_addr()
            .map_err(|e| DnsError::Io(format!("udp local addr: {}", e)))?;
        let mut use_pktinfo = false;

        #[cfg(unix)]
        if local.ip().is_unspecified() {
            use std::os::unix::io::AsRawFd;
            super::pktinfo::enable_pktinfo(socket.as_raw_fd(), local.is_ipv6())
                .map_err(|e| DnsError::Io(format!("enable pktinfo: {}", e)))?;
            use_pktinfo = true;
        }

        Ok(Self {
            socket,
            use_pktinfo,
        })
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, ReplyInfo)> {
        #[cfg(unix)]
        if self.use_pktinfo {
            use std::os::unix::io::AsRawFd;
            let fd = self.socket.as_raw_fd();
            loop {
                self.socket.readable().await?;
                match self
                    .socket
                    .try_io(tokio::io::Interest::READABLE, || {
                        super::pktinfo::recv_with_pktinfo(fd, buf)
                    }) {
                    Ok((n, from, info)) => return Ok((n, from, Some(info))),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        let (n, from) = self.socket.recv_from(buf).await?;
        Ok((n, from, None))
    }

    async fn send(&self, buf: &[u8], to: SocketAddr, reply_to: ReplyInfo) -> io::Result<usize> {
        #[cfg(unix)]
        if self.use_pktinfo {
            if let Some(info) = reply_to {
                use std::os::unix::io::AsRawFd;
                let fd = self.socket.as_raw_fd();
                loop {
                    self.socket.writable().await?;
                    match self
                        .socket
                        .try_io(tokio::io::Interest::WRITABLE, || {
                            super::pktinfo::send_with_pktinfo(fd, buf, to, &info)
                        }) {
                        Ok(n) => return Ok(n),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        let _ = reply_to;
        self.socket.send_to(buf, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Query, ResponseCode};
    use hickory_proto::rr::rdata::TXT;
    use hickory_proto::rr::{Name, RData, Record, RecordType};

    #[test]
    fn oversized_reply_truncates_with_tc() {
        let name = Name::from_ascii("example.com.").unwrap();
        let mut r = Message::new();
        r.set_response_code(ResponseCode::NoError);
        r.add_query(Query::query(name.clone(), RecordType::TXT));
        for _ in 0..40 {
            r.add_answer(Record::from_rdata(
                name.clone(),
                300,
                RData::TXT(TXT::new(vec!["x".repeat(64)])),
            ));
        }

        let packed = pack_with_truncation(&r, 512);
        assert!(packed.len() <= 512);
        assert_eq!(packed[2] & 0x02, 0x02, "TC bit must be set");

        let fits = pack_with_truncation(&r, 65535);
        assert_eq!(fits[2] & 0x02, 0, "no TC when it fits");
    }
}
