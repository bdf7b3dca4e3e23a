use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// `udp://`, `tcp://`, `tls://`, `https://`, `quic://`, `h3://` or
    /// `udpme://` address. A bare address means plain UDP.
    pub addr: String,

    /// Dial this `host:port` instead of resolving `addr`'s hostname.
    #[serde(default)]
    pub dial_addr: String,

    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure: bool,

    /// Plain resolver used to look up hostnames in `addr` at startup.
    #[serde(default)]
    pub bootstrap: String,

    /// Deprecated. Parsed for config compatibility and ignored: upstream
    /// selection is purely by response priority.
    #[serde(default)]
    pub trusted: bool,
}
