use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A named matcher referenced from `if:` expressions. Exactly which fields
/// are set decides what it tests; multiple fields AND together.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MatcherConfig {
    /// Question types, numeric (28 = AAAA).
    #[serde(default)]
    pub qtype: Vec<u16>,

    /// Question-name suffixes, trailing-dot form.
    #[serde(default)]
    pub qname_suffix: Vec<String>,

    /// Response codes of the current response.
    #[serde(default)]
    pub rcode: Vec<u16>,
}

/// One node of the configured plugin chain: either a plugin by name
/// (`ecs`, `ttl`, `cache`, `forward`) or a conditional block.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PipelineStep {
    Named(String),
    Conditional {
        #[serde(rename = "if")]
        cond: String,
        #[serde(default)]
        exec: Vec<PipelineStep>,
        #[serde(default)]
        else_exec: Vec<PipelineStep>,
    },
}

pub type MatcherMap = HashMap<String, MatcherConfig>;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EcsConfig {
    /// Fixed subnet in `addr/prefix` form; empty derives from the client.
    #[serde(default)]
    pub preset: String,

    #[serde(default = "default_mask_v4")]
    pub mask_v4: u8,

    #[serde(default = "default_mask_v6")]
    pub mask_v6: u8,

    /// Replace an ECS option the client already sent.
    #[serde(default)]
    pub force_override: bool,
}

fn default_mask_v4() -> u8 {
    24
}

fn default_mask_v6() -> u8 {
    48
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TtlConfig {
    #[serde(default)]
    pub minimal: u32,
    #[serde(default)]
    pub maximum: u32,
}
