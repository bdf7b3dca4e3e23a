use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DnsError {
    #[error("Malformed DNS message: {0}")]
    MalformedMessage(String),

    #[error("Invalid upstream address: {0}")]
    InvalidUpstreamAddr(String),

    #[error("Transport timeout connecting to {server}")]
    TransportTimeout { server: String },

    #[error("Transport connection refused by {server}")]
    TransportConnectionRefused { server: String },

    #[error("Transport connection reset by {server}")]
    TransportConnectionReset { server: String },

    #[error("TLS error with {server}: {detail}")]
    Tls { server: String, detail: String },

    #[error("All upstreams failed: {0}")]
    AllUpstreamsFailed(String),

    #[error("Query timeout")]
    QueryTimeout,

    #[error("Exchange canceled")]
    Canceled,

    #[error("Plugin error in {plugin}: {detail}")]
    Plugin { plugin: String, detail: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Server closed")]
    ServerClosed,
}

impl DnsError {
    pub fn io(err: &std::io::Error) -> Self {
        DnsError::Io(err.to_string())
    }

    /// True for errors that mean "the race was lost", not "the upstream is broken".
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DnsError::Canceled | DnsError::QueryTimeout)
    }
}
