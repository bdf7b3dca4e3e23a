mod cache;
mod logging;
mod pipeline;
mod root;
mod server;
mod upstream;

pub use cache::CacheConfig;
pub use logging::LoggingConfig;
pub use pipeline::{EcsConfig, MatcherConfig, MatcherMap, PipelineStep, TtlConfig};
pub use root::Config;
pub use server::ServerConfig;
pub use upstream::UpstreamConfig;
