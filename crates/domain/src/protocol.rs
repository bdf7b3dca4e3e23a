use crate::errors::DnsError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol a server listener speaks. Config accepts the aliases listed on
/// each variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenProtocol {
    /// `udp`
    Udp,
    /// `tcp`
    Tcp,
    /// `tls`, `dot`
    #[serde(alias = "dot")]
    Tls,
    /// `quic`, `doq`
    #[serde(alias = "doq")]
    Quic,
    /// `https`, `doh`, `http`
    #[serde(alias = "doh", alias = "http")]
    Https,
    /// `h3`, `doh3`
    #[serde(alias = "doh3")]
    H3,
}

impl ListenProtocol {
    pub fn requires_tls(self) -> bool {
        matches!(self, Self::Tls | Self::Quic | Self::H3)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Tls => "tls",
            Self::Quic => "quic",
            Self::Https => "https",
            Self::H3 => "h3",
        }
    }
}

impl fmt::Display for ListenProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport scheme of an upstream resolver address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    Udp,
    /// UDP that accepts only replies bearing an EDNS0 OPT record.
    UdpMe,
    Tcp,
    Tls,
    Https,
    Quic,
    H3,
}

impl UpstreamScheme {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Udp | Self::UdpMe | Self::Tcp => 53,
            Self::Tls | Self::Quic => 853,
            Self::Https | Self::H3 => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::UdpMe => "udpme",
            Self::Tcp => "tcp",
            Self::Tls => "tls",
            Self::Https => "https",
            Self::Quic => "quic",
            Self::H3 => "h3",
        }
    }
}

impl fmt::Display for UpstreamScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed upstream address: `scheme://host[:port][/path]`.
///
/// `host` may be an IP literal or a hostname; hostnames for encrypted
/// transports are resolved through the configured bootstrap resolver before
/// dialing. `path` is only meaningful for `https://` and `h3://`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAddr {
    pub scheme: UpstreamScheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl UpstreamAddr {
    pub fn parse(addr: &str) -> Result<Self, DnsError> {
        let (scheme, rest) = match addr.split_once("://") {
            Some(("udp", r)) => (UpstreamScheme::Udp, r),
            Some(("udpme", r)) => (UpstreamScheme::UdpMe, r),
            Some(("tcp", r)) => (UpstreamScheme::Tcp, r),
            Some(("tls", r)) => (UpstreamScheme::Tls, r),
            Some(("https", r)) => (UpstreamScheme::Https, r),
            Some(("quic", r)) => (UpstreamScheme::Quic, r),
            Some(("h3", r)) => (UpstreamScheme::H3, r),
            Some((s, _)) => {
                return Err(DnsError::InvalidUpstreamAddr(format!(
                    "unknown scheme '{}' in '{}'",
                    s, addr
                )))
            }
            // A bare address defaults to plain UDP.
            None => (UpstreamScheme::Udp, addr),
        };

        if rest.is_empty() {
            return Err(DnsError::InvalidUpstreamAddr(format!(
                "missing host in '{}'",
                addr
            )));
        }

        let (host_port, path) = match rest.find('/') {
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (rest, String::new()),
        };

        let (host, port) = split_host_port(host_port, scheme.default_port())
            .ok_or_else(|| DnsError::InvalidUpstreamAddr(format!("bad host in '{}'", addr)))?;

        let path = if path.is_empty()
            && matches!(scheme, UpstreamScheme::Https | UpstreamScheme::H3)
        {
            "/dns-query".to_string()
        } else {
            path
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path,
        })
    }

    /// True when `host` is an IP literal and no bootstrap lookup is needed.
    pub fn host_is_ip(&self) -> bool {
        self.host.parse::<std::net::IpAddr>().is_ok()
    }

    /// The logical address used in logs, e.g. `tls://dns.example:853`.
    pub fn display_addr(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

fn split_host_port(s: &str, default_port: u16) -> Option<(&str, u16)> {
    if let Some(rest) = s.strip_prefix('[') {
        // [v6]:port or [v6]
        let (host, tail) = rest.split_once(']')?;
        match tail.strip_prefix(':') {
            Some(p) => Some((host, p.parse().ok()?)),
            None if tail.is_empty() => Some((host, default_port)),
            None => None,
        }
    } else if s.matches(':').count() > 1 {
        // Bare IPv6 literal without brackets.
        Some((s, default_port))
    } else {
        match s.split_once(':') {
            Some((host, p)) => Some((host, p.parse().ok()?)),
            None => Some((s, default_port)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_udp() {
        let a = UpstreamAddr::parse("8.8.8.8").unwrap();
        assert_eq!(a.scheme, UpstreamScheme::Udp);
        assert_eq!(a.host, "8.8.8.8");
        assert_eq!(a.port, 53);
    }

    #[test]
    fn parse_tls_with_port() {
        let a = UpstreamAddr::parse("tls://dns.google:8853").unwrap();
        assert_eq!(a.scheme, UpstreamScheme::Tls);
        assert_eq!(a.host, "dns.google");
        assert_eq!(a.port, 8853);
        assert!(!a.host_is_ip());
    }

    #[test]
    fn parse_https_default_path() {
        let a = UpstreamAddr::parse("https://cloudflare-dns.com").unwrap();
        assert_eq!(a.port, 443);
        assert_eq!(a.path, "/dns-query");
    }

    #[test]
    fn parse_h3_custom_path() {
        let a = UpstreamAddr::parse("h3://dns.example/resolve").unwrap();
        assert_eq!(a.scheme, UpstreamScheme::H3);
        assert_eq!(a.path, "/resolve");
    }

    #[test]
    fn parse_udpme() {
        let a = UpstreamAddr::parse("udpme://1.1.1.1").unwrap();
        assert_eq!(a.scheme, UpstreamScheme::UdpMe);
        assert_eq!(a.port, 53);
    }

    #[test]
    fn parse_ipv6_bracketed() {
        let a = UpstreamAddr::parse("udp://[2001:4860:4860::8888]:53").unwrap();
        assert_eq!(a.host, "2001:4860:4860::8888");
    }

    #[test]
    fn reject_unknown_scheme() {
        assert!(UpstreamAddr::parse("ftp://1.1.1.1").is_err());
    }
}
