use std::fmt;
use std::net::IpAddr;
#[cfg(test)]
use std::net::Ipv4Addr;

/// Transport the query arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
    Quic,
    Http,
    Https,
    H2,
    H3,
}

impl TransportProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Tls => "tls",
            Self::Quic => "quic",
            Self::Http => "http",
            Self::Https => "https",
            Self::H2 => "h2",
            Self::H3 => "h3",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only metadata about an accepted request.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    client_addr: Option<IpAddr>,
    protocol: TransportProtocol,
    server_name: String,
}

impl RequestMeta {
    pub fn new(client_addr: IpAddr, protocol: TransportProtocol) -> Self {
        Self {
            client_addr: Some(unmap(client_addr)),
            protocol,
            server_name: String::new(),
        }
    }

    pub fn unknown_client(protocol: TransportProtocol) -> Self {
        Self {
            client_addr: None,
            protocol,
            server_name: String::new(),
        }
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn set_client_addr(&mut self, addr: IpAddr) {
        self.client_addr = Some(unmap(addr));
    }

    pub fn client_addr(&self) -> Option<IpAddr> {
        self.client_addr
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

/// IPv4-mapped IPv6 addresses compare and log as plain IPv4.
fn unmap(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmaps_v4_in_v6() {
        let meta = RequestMeta::new("::ffff:192.0.2.1".parse().unwrap(), TransportProtocol::Udp);
        assert_eq!(
            meta.client_addr(),
            Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))
        );
    }

    #[test]
    fn plain_v6_untouched() {
        let meta = RequestMeta::new("2001:db8::1".parse().unwrap(), TransportProtocol::Tcp);
        assert_eq!(meta.client_addr(), Some("2001:db8::1".parse().unwrap()));
    }
}
