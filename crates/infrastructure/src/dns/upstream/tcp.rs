use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use conduit_dns_domain::{DnsError, UpstreamAddr};

use super::{Reply, Upstream};

pub(crate) const MAX_FRAMED_MESSAGE_SIZE: usize = 65535;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// DNS over TCP (RFC 1035 §4.2.2): two-byte big-endian length, then the
/// message.
pub struct TcpUpstream {
    server_addr: SocketAddr,
    display: String,
}

impl TcpUpstream {
    pub fn new(server_addr: SocketAddr, parsed: &UpstreamAddr) -> Self {
        Self {
            server_addr,
            display: parsed.display_addr(),
        }
    }
}

#[async_trait]
impl Upstream for TcpUpstream {
    async fn exchange(&self, query: &Message) -> Result<Reply, DnsError> {
        let wire = query
            .to_vec()
            .map_err(|e| DnsError::MalformedMessage(e.to_string()))?;

        let mut stream =
            tokio::time::timeout(EXCHANGE_TIMEOUT, TcpStream::connect(self.server_addr))
                .await
                .map_err(|_| DnsError::TransportTimeout {
                    server: self.display.clone(),
                })?
                .map_err(|_| DnsError::TransportConnectionRefused {
                    server: self.display.clone(),
                })?;

        tokio::time::timeout(EXCHANGE_TIMEOUT, write_framed(&mut stream, &wire))
            .await
            .map_err(|_| DnsError::TransportTimeout {
                server: self.display.clone(),
            })??;

        let response = tokio::time::timeout(EXCHANGE_TIMEOUT, read_framed(&mut stream))
            .await
            .map_err(|_| DnsError::TransportTimeout {
                server: self.display.clone(),
            })??;

        Reply::from_wire(response)
    }

    fn address(&self) -> &str {
        &self.display
    }
}

/// Writes one length-prefixed DNS message. Shared by the TCP and TLS
/// upstreams and by the stream-oriented listeners.
pub(crate) async fn write_framed<S>(stream: &mut S, wire: &[u8]) -> Result<(), DnsError>
where
    S: AsyncWriteExt + Unpin,
{
    if wire.len() > MAX_FRAMED_MESSAGE_SIZE {
        return Err(DnsError::MalformedMessage(format!(
            "message too large for framing: {} bytes",
            wire.len()
        )));
    }
    let len = (wire.len() as u16).to_be_bytes();
    stream
        .write_all(&len)
        .await
        .map_err(|e| DnsError::Io(format!("write length prefix: {}", e)))?;
    stream
        .write_all(wire)
        .await
        .map_err(|e| DnsError::Io(format!("write message: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| DnsError::Io(format!("flush: {}", e)))?;
    Ok(())
}

/// Reads one length-prefixed DNS message.
pub(crate) async fn read_framed<S>(stream: &mut S) -> Result<Vec<u8>, DnsError>
where
    S: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| DnsError::Io(format!("read length prefix: {}", e)))?;

    let len = u16::from_be_bytes(len_buf) as usize;
    let mut wire = vec![0u8; len];
    stream
        .read_exact(&mut wire)
        .await
        .map_err(|e| DnsError::Io(format!("read message body: {}", e)))?;
    Ok(wire)
}
