use std::fs;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use conduit_dns_domain::Config;

pub fn load_config(path: &str) -> anyhow::Result<Config> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config file {}", path))?;
    let config: Config =
        serde_yaml::from_str(&raw).with_context(|| format!("parse config file {}", path))?;

    if config.servers.is_empty() {
        anyhow::bail!("config has no server listener");
    }
    if !config.cache.redis.is_empty() {
        anyhow::bail!(
            "redis cache backend is not built in; remove `cache.redis` to use the memory cache"
        );
    }
    Ok(config)
}

pub fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
