use serde::{Deserialize, Serialize};

use crate::protocol::ListenProtocol;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub protocol: ListenProtocol,

    /// Bind `host:port`.
    pub addr: String,

    /// Connection-idle cap in seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,

    /// If set, the TLS handshake fails when the client SNI differs.
    #[serde(default)]
    pub allowed_sni: String,

    #[serde(default)]
    pub block_aaaa: bool,
    #[serde(default)]
    pub block_ptr: bool,
    #[serde(default)]
    pub block_https: bool,
    #[serde(default)]
    pub block_no_dot: bool,

    /// Remove EDNS0 from incoming queries before they reach the graph.
    #[serde(default)]
    pub strip_edns0: bool,

    /// DoH request path.
    #[serde(default = "default_doh_path")]
    pub path: String,

    /// Header checked for the client IP before the proxy-header chain.
    #[serde(default)]
    pub src_ip_header: String,

    /// Where non-DNS requests on a DoH listener are sent (302). Empty = 404.
    #[serde(default)]
    pub redirect_url: String,

    /// Accept QUIC 0-RTT data.
    #[serde(default)]
    pub zero_rtt: bool,
}

fn default_idle_timeout() -> u64 {
    10
}

fn default_doh_path() -> String {
    "/dns-query".to_string()
}
