pub mod config;
pub mod errors;
pub mod protocol;

pub use config::{
    CacheConfig, Config, EcsConfig, LoggingConfig, MatcherConfig, MatcherMap, PipelineStep,
    ServerConfig, TtlConfig, UpstreamConfig,
};
pub use errors::DnsError;
pub use protocol::{ListenProtocol, UpstreamAddr, UpstreamScheme};
