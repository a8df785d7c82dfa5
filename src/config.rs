//! Tracker configuration
//!
//! Settings are layered, later sources overriding earlier ones:
//!
//! 1. Built-in defaults (the `Default` impls below)
//! 2. An optional TOML file (`tracker.toml` unless a path is given)
//! 3. Environment variables prefixed with `TRACKER_`, using `__` between
//!    nested keys, e.g. `TRACKER_RATE_LIMITS__START_EXECUTION__LIMIT=10`
//!
//! The binary also loads a `.env` file before reading the environment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::engine::registry::DEFAULT_HISTORY_LIMIT;
use crate::models::ParameterSchema;
use crate::Result;

/// Default location of the optional configuration file
pub const DEFAULT_CONFIG_FILE: &str = "tracker.toml";

/// Rate-guard key for starting executions
pub const START_EXECUTION_KEY: &str = "start-execution";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// HTTP base URL of the workflow server
    pub server_url: String,

    /// Path of the event stream, relative to `server_url`
    pub stream_path: String,

    pub request_timeout_ms: u64,
    pub registry: RegistryConfig,
    pub rate_limits: RateLimitsConfig,
    pub hitl: HitlConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".to_string(),
            stream_path: "/ws/executions".to_string(),
            request_timeout_ms: 30_000,
            registry: RegistryConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            hitl: HitlConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum number of history entries kept, newest first
    pub history_limit: usize,

    /// Keep a completed execution selected as current
    pub keep_current_on_complete: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            keep_current_on_complete: true,
        }
    }
}

/// `limit` actions per `window_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub start_execution: RateLimitRule,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            start_execution: RateLimitRule {
                limit: 5,
                window_ms: 60_000,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HitlConfig {
    /// Required text field holding the operator's (possibly edited) input
    pub primary_field: String,

    /// Enumerated fields and their accepted values
    pub choices: BTreeMap<String, Vec<String>>,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            primary_field: "user_input".to_string(),
            choices: BTreeMap::new(),
        }
    }
}

impl TrackerConfig {
    /// Load defaults, then the config file (if it exists), then `TRACKER_*`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

        let config = ::config::Config::builder()
            .add_source(::config::File::from(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("TRACKER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Field rules for HITL parameters
    pub fn parameter_schema(&self) -> ParameterSchema {
        self.hitl
            .choices
            .iter()
            .fold(ParameterSchema::new(&self.hitl.primary_field), |schema, (name, accepted)| {
                schema.with_choice(name.clone(), accepted.iter().cloned())
            })
    }
}
