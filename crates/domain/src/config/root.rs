use serde::{Deserialize, Serialize};

use super::{
    CacheConfig, EcsConfig, LoggingConfig, MatcherMap, PipelineStep, ServerConfig, TtlConfig,
    UpstreamConfig,
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub cache: CacheConfig,

    pub upstreams: Vec<UpstreamConfig>,

    /// Plugin chain executed per query. Empty means `cache` then `forward`,
    /// with `ecs` / `ttl` prepended when configured.
    #[serde(default)]
    pub pipeline: Vec<PipelineStep>,

    /// Named matchers referenced by `if:` expressions in the pipeline.
    #[serde(default)]
    pub matchers: MatcherMap,

    #[serde(default)]
    pub ecs: Option<EcsConfig>,

    #[serde(default)]
    pub ttl: Option<TtlConfig>,

    /// Per-query deadline in seconds.
    #[serde(default = "default_query_timeout")]
    pub query_timeout: u64,

    /// Set the RA bit on every reply.
    #[serde(default = "default_true")]
    pub recursion_available: bool,

    /// Directory holding the persisted TLS session-ticket and QUIC
    /// stateless-reset keys.
    #[serde(default = "default_key_dir")]
    pub key_dir: String,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_query_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_key_dir() -> String {
    "./keys".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineStep;
    use crate::protocol::ListenProtocol;

    #[test]
    fn parses_full_config() {
        let yaml = r#"
servers:
  - protocol: udp
    addr: "0.0.0.0:53"
  - protocol: dot
    addr: "0.0.0.0:853"
    cert: /etc/conduit/cert.pem
    key: /etc/conduit/key.pem
    allowed_sni: dns.example.com
    idle_timeout: 30
  - protocol: doh
    addr: "0.0.0.0:443"
    block_aaaa: true
    strip_edns0: true
cache:
  size: 10240
  lazy_cache_ttl: 86400
  lazy_cache_reply_ttl: 5
  cleaner_interval: 60
  compress_resp: true
upstreams:
  - addr: "tls://8.8.8.8"
  - addr: "https://dns.example.com/dns-query"
    bootstrap: "udp://223.5.5.5"
    insecure: false
    trusted: true
matchers:
  aaaa:
    qtype: [28]
pipeline:
  - if: "aaaa"
    exec: [forward]
    else_exec: [cache, forward]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.servers.len(), 3);
        assert_eq!(config.servers[0].protocol, ListenProtocol::Udp);
        assert_eq!(config.servers[1].protocol, ListenProtocol::Tls);
        assert_eq!(config.servers[1].idle_timeout, 30);
        assert_eq!(config.servers[2].protocol, ListenProtocol::Https);
        assert!(config.servers[2].block_aaaa);
        assert!(config.servers[2].strip_edns0);

        assert_eq!(config.cache.size, 10240);
        assert_eq!(config.cache.lazy_cache_ttl, 86400);
        assert!(config.cache.compress_resp);

        assert_eq!(config.upstreams.len(), 2);
        assert_eq!(config.upstreams[1].bootstrap, "udp://223.5.5.5");
        assert!(config.upstreams[1].trusted, "deprecated flag still parses");

        assert_eq!(config.query_timeout, 5, "default applies");
        assert!(config.recursion_available);

        assert_eq!(config.pipeline.len(), 1);
        match &config.pipeline[0] {
            PipelineStep::Conditional { cond, exec, else_exec } => {
                assert_eq!(cond, "aaaa");
                assert_eq!(exec.len(), 1);
                assert_eq!(else_exec.len(), 2);
            }
            other => panic!("expected conditional, got {:?}", other),
        }
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let yaml = r#"
servers:
  - protocol: udp
    addr: "127.0.0.1:5353"
upstreams:
  - addr: "8.8.8.8"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cache.size, 1024);
        assert_eq!(config.cache.lazy_cache_reply_ttl, 5);
        assert_eq!(config.servers[0].idle_timeout, 10);
        assert_eq!(config.servers[0].path, "/dns-query");
        assert!(config.pipeline.is_empty());
        assert!(config.ecs.is_none());
    }
}
