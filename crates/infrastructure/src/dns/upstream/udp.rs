use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tracing::debug;

use conduit_dns_domain::{DnsError, UpstreamAddr};

use super::{Reply, Upstream};

/// Large enough for any EDNS(0) reply we ask for.
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Plain UDP upstream. With `require_edns` (the `udpme://` scheme) replies
/// without an OPT record are dropped and the read continues, a cheap
/// defense against off-path spoofing, which rarely preserves EDNS0.
pub struct UdpUpstream {
    server_addr: SocketAddr,
    display: String,
    require_edns: bool,
}

impl UdpUpstream {
    pub fn new(server_addr: SocketAddr, parsed: &UpstreamAddr, require_edns: bool) -> Self {
        Self {
            server_addr,
            display: parsed.display_addr(),
            require_edns,
        }
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn exchange(&self, query: &Message) -> Result<Reply, DnsError> {
        let wire = query
            .to_vec()
            .map_err(|e| DnsError::MalformedMessage(e.to_string()))?;

        let bind_addr: SocketAddr = if self.server_addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("static addr")
        } else {
            "[::]:0".parse().expect("static addr")
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DnsError::Io(format!("bind udp socket: {}", e)))?;
        socket
            .connect(self.server_addr)
            .await
            .map_err(|e| DnsError::Io(format!("connect {}: {}", self.server_addr, e)))?;

        tokio::time::timeout(EXCHANGE_TIMEOUT, socket.send(&wire))
            .await
            .map_err(|_| DnsError::TransportTimeout {
                server: self.display.clone(),
            })?
            .map_err(|e| DnsError::Io(format!("send to {}: {}", self.server_addr, e)))?;

        let mut recv_buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
        loop {
            let n = tokio::time::timeout(EXCHANGE_TIMEOUT, socket.recv(&mut recv_buf))
                .await
                .map_err(|_| DnsError::TransportTimeout {
                    server: self.display.clone(),
                })?
                .map_err(|e| DnsError::Io(format!("recv from {}: {}", self.server_addr, e)))?;

            let reply = match Reply::from_wire(recv_buf[..n].to_vec()) {
                Ok(r) => r,
                Err(e) => {
                    debug!(server = %self.display, error = %e, "dropping unparseable reply");
                    continue;
                }
            };

            if reply.msg.id() != query.id() {
                debug!(server = %self.display, "dropping reply with mismatched id");
                continue;
            }
            if self.require_edns && reply.msg.extensions().is_none() {
                debug!(server = %self.display, "dropping reply without EDNS0");
                continue;
            }

            return Ok(reply);
        }
    }

    fn address(&self) -> &str {
        &self.display
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_address_keeps_scheme() {
        let parsed = UpstreamAddr::parse("udpme://9.9.9.9").unwrap();
        let u = UdpUpstream::new("9.9.9.9:53".parse().unwrap(), &parsed, true);
        assert_eq!(u.address(), "udpme://9.9.9.9:53");
    }
}
