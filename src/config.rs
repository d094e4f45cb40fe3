//! Configuration structs.
//!
//! Two layers, matching the teacher's `config::types::Config` shape
//! (a plain `serde`-deserializable struct with per-field defaults): a
//! crate-level `RuntimeConfig` for the two environment signals named in
//! spec §6, and a per-scope `ObservationConfig` for the tunables in §3.

use serde::{Deserialize, Serialize};
use std::env;

/// Scope an `ObservationalMemory` record (and a `WorkingMemory` blob) is
/// keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Thread,
    Resource,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Thread => "thread",
            Scope::Resource => "resource",
        }
    }
}

/// Per-(thread|resource) observational memory tunables. Defaults as in
/// spec §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationConfig {
    #[serde(default = "default_observation_threshold")]
    pub observation_threshold: u32,

    #[serde(default = "default_reflection_threshold")]
    pub reflection_threshold: u32,

    #[serde(default = "default_buffer_tokens")]
    pub buffer_tokens: u32,

    #[serde(default = "default_buffer_activation")]
    pub buffer_activation: f32,

    /// Defined but unimplemented — no code path reads it (spec §9 open
    /// question). Kept so the config column's shape matches the spec's
    /// data model and a future product decision has somewhere to land.
    #[serde(default = "default_block_after")]
    pub block_after: u32,

    pub scope: Scope,

    #[serde(default = "default_last_messages")]
    pub last_messages: u32,

    #[serde(default = "default_max_recent_observations")]
    pub max_recent_observations: u32,
}

fn default_observation_threshold() -> u32 {
    30_000
}
fn default_reflection_threshold() -> u32 {
    40_000
}
fn default_buffer_tokens() -> u32 {
    6_000
}
fn default_buffer_activation() -> f32 {
    0.8
}
fn default_block_after() -> u32 {
    7_200
}
fn default_last_messages() -> u32 {
    10
}
fn default_max_recent_observations() -> u32 {
    50
}

impl ObservationConfig {
    pub fn new(scope: Scope) -> Self {
        Self {
            observation_threshold: default_observation_threshold(),
            reflection_threshold: default_reflection_threshold(),
            buffer_tokens: default_buffer_tokens(),
            buffer_activation: default_buffer_activation(),
            block_after: default_block_after(),
            scope,
            last_messages: default_last_messages(),
            max_recent_observations: default_max_recent_observations(),
        }
    }

    pub fn activation_tokens(&self) -> u32 {
        (self.buffer_activation * self.observation_threshold as f32) as u32
    }
}

/// Crate-level runtime configuration: the two environment signals named in
/// spec §6, plus where the SQLite file lives and how big its connection
/// pool is. Loaded with `RuntimeConfig::from_env`, matching the teacher's
/// `Config::load` convention of env-overridable, serde-default struct
/// fields rather than a free-form map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// `INSTANCE_ID` — lease owner id. Defaults to `"default-instance"`.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// `DISABLE_ASYNC_OBSERVATION=true` — disables the async buffered path
    /// entirely; only the synchronous path runs.
    #[serde(default)]
    pub disable_async_observation: bool,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
}

fn default_instance_id() -> String {
    "default-instance".to_string()
}
fn default_db_path() -> String {
    "convoy-memory.db".to_string()
}
fn default_pool_size() -> usize {
    8
}
fn default_lease_ms() -> u64 {
    30_000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            disable_async_observation: false,
            db_path: default_db_path(),
            pool_size: default_pool_size(),
            lease_ms: default_lease_ms(),
        }
    }
}

impl RuntimeConfig {
    /// Reads `INSTANCE_ID` and `DISABLE_ASYNC_OBSERVATION` from the process
    /// environment, leaving everything else at its default. Never panics —
    /// malformed env values are treated as absent.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(id) = env::var("INSTANCE_ID") {
            if !id.is_empty() {
                cfg.instance_id = id;
            }
        }
        if let Ok(flag) = env::var("DISABLE_ASYNC_OBSERVATION") {
            cfg.disable_async_observation = flag.eq_ignore_ascii_case("true") || flag == "1";
        }
        cfg
    }
}
