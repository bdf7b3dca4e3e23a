use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio_util::task::TaskTracker;

use conduit_dns_application::condition::{ConditionNode, ExprMatcher};
use conduit_dns_application::executable::{AndMatcherGroup, ChainNode, Executable, Matcher};
use conduit_dns_domain::{Config, MatcherConfig, PipelineStep};
use conduit_dns_infrastructure::dns::cache::plugin::{CachePlugin, CachePluginOpts};
use conduit_dns_infrastructure::dns::cache::MemCache;
use conduit_dns_infrastructure::dns::plugins::{
    EcsPlugin, QNameSuffixMatcher, QTypeMatcher, RcodeMatcher, TtlPlugin,
};
use conduit_dns_infrastructure::dns::upstream::build_upstreams;
use conduit_dns_infrastructure::dns::ForwardPlugin;

/// Assembles the executable chain from config: named plugins, conditional
/// blocks, and the cache's optional `when_hit` subchain. `tracker` is the
/// process-wide task set that server shutdown drains; the forward plugin
/// spawns its racing tasks onto it.
pub async fn build_entry(
    config: &Config,
    tracker: &TaskTracker,
) -> anyhow::Result<Arc<ChainNode>> {
    let upstreams = build_upstreams(&config.upstreams)
        .await
        .context("build upstreams")?;

    let mut plugins: HashMap<String, Arc<dyn Executable>> = HashMap::new();
    plugins.insert(
        "forward".to_string(),
        Arc::new(
            ForwardPlugin::new(upstreams, tracker.clone()).context("build forward plugin")?,
        ),
    );

    if let Some(ecs) = &config.ecs {
        let preset = if ecs.preset.is_empty() {
            None
        } else {
            let (addr, prefix) = ecs
                .preset
                .split_once('/')
                .with_context(|| format!("ecs preset '{}' is not addr/prefix", ecs.preset))?;
            Some((
                addr.parse()
                    .with_context(|| format!("bad ecs preset address '{}'", addr))?,
                prefix
                    .parse()
                    .with_context(|| format!("bad ecs preset length '{}'", prefix))?,
            ))
        };
        plugins.insert(
            "ecs".to_string(),
            Arc::new(
                EcsPlugin::new(preset, ecs.mask_v4, ecs.mask_v6, ecs.force_override)
                    .context("build ecs plugin")?,
            ),
        );
    }

    if let Some(ttl) = &config.ttl {
        plugins.insert(
            "ttl".to_string(),
            Arc::new(TtlPlugin::new(ttl.minimal, ttl.maximum).context("build ttl plugin")?),
        );
    }

    if config.cache.size > 0 {
        let backend = MemCache::new(
            config.cache.size,
            Duration::from_secs(config.cache.cleaner_interval),
        );

        let when_hit = if config.cache.when_hit.is_empty() {
            None
        } else {
            let tag = plugins
                .get(&config.cache.when_hit)
                .with_context(|| format!("when_hit names unknown plugin '{}'", config.cache.when_hit))?;
            ChainNode::link(&[Arc::clone(tag)], None)
        };

        plugins.insert(
            "cache".to_string(),
            Arc::new(CachePlugin::new(CachePluginOpts {
                backend,
                lazy_window: config.cache.lazy_cache_ttl,
                lazy_reply_ttl: config.cache.lazy_cache_reply_ttl,
                compress: config.cache.compress_resp,
                when_hit,
            })),
        );
    }

    let matchers = build_matchers(&config.matchers)?;

    let steps: Vec<PipelineStep> = if config.pipeline.is_empty() {
        ["ecs", "ttl", "cache", "forward"]
            .iter()
            .filter(|name| plugins.contains_key(**name))
            .map(|name| PipelineStep::Named(name.to_string()))
            .collect()
    } else {
        config.pipeline.clone()
    };

    let entry = build_chain(&steps, None, &plugins, &matchers)?
        .context("pipeline is empty")?;
    Ok(entry)
}

fn build_matchers(
    configs: &conduit_dns_domain::MatcherMap,
) -> anyhow::Result<HashMap<String, Arc<dyn Matcher>>> {
    let mut out: HashMap<String, Arc<dyn Matcher>> = HashMap::new();
    for (name, cfg) in configs {
        out.insert(name.clone(), build_matcher(name, cfg)?);
    }
    Ok(out)
}

fn build_matcher(name: &str, cfg: &MatcherConfig) -> anyhow::Result<Arc<dyn Matcher>> {
    let mut parts: Vec<Arc<dyn Matcher>> = Vec::new();
    if !cfg.qtype.is_empty() {
        parts.push(Arc::new(QTypeMatcher::new(cfg.qtype.clone())));
    }
    if !cfg.qname_suffix.is_empty() {
        parts.push(Arc::new(
            QNameSuffixMatcher::new(&cfg.qname_suffix)
                .with_context(|| format!("matcher '{}'", name))?,
        ));
    }
    if !cfg.rcode.is_empty() {
        parts.push(Arc::new(RcodeMatcher::new(cfg.rcode.clone())));
    }
    if parts.is_empty() {
        bail!("matcher '{}' tests nothing", name);
    }
    if parts.len() == 1 {
        return Ok(parts.pop().expect("checked length"));
    }
    Ok(Arc::new(AndMatcherGroup::new(parts)))
}

/// Builds a chain tail-first so conditional branch terminators link to the
/// step that follows the conditional.
fn build_chain(
    steps: &[PipelineStep],
    tail: Option<Arc<ChainNode>>,
    plugins: &HashMap<String, Arc<dyn Executable>>,
    matchers: &HashMap<String, Arc<dyn Matcher>>,
) -> anyhow::Result<Option<Arc<ChainNode>>> {
    let mut next = tail;
    for step in steps.iter().rev() {
        let plugin: Arc<dyn Executable> = match step {
            PipelineStep::Named(name) => Arc::clone(
                plugins
                    .get(name)
                    .with_context(|| format!("pipeline names unknown plugin '{}'", name))?,
            ),
            PipelineStep::Conditional {
                cond,
                exec,
                else_exec,
            } => {
                let matcher: Arc<dyn Matcher> = Arc::new(
                    ExprMatcher::compile(cond, matchers)
                        .with_context(|| format!("compile condition '{}'", cond))?,
                );
                let then_chain = build_chain(exec, next.clone(), plugins, matchers)?;
                let else_chain = build_chain(else_exec, next.clone(), plugins, matchers)?;
                Arc::new(ConditionNode::new(Some(matcher), then_chain, else_chain))
            }
        };
        next = Some(ChainNode::new(plugin, next));
    }
    Ok(next)
}
