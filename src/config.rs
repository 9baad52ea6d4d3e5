//! Configuration management for the extrinsic orchestrator
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::WatchPolicy;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub node: NodeConfig,
    #[serde(default)]
    pub extrinsic: ExtrinsicConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl NodeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtrinsicConfig {
    #[serde(default)]
    pub watch_policy: WatchPolicy,
    #[serde(default = "default_watch_timeout_secs")]
    pub watch_timeout_secs: u64,
    #[serde(default)]
    pub batch_errors: BatchErrorMode,
}

impl ExtrinsicConfig {
    pub fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.watch_timeout_secs)
    }
}

impl Default for ExtrinsicConfig {
    fn default() -> Self {
        Self {
            watch_policy: WatchPolicy::default(),
            watch_timeout_secs: default_watch_timeout_secs(),
            batch_errors: BatchErrorMode::default(),
        }
    }
}

/// How failures inside an indexed batch are reported.
///
/// Submissions that reached the node always report per slot, so a rejected
/// item never hides the hashes of broadcast ones.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchErrorMode {
    /// Fee queries: any failing item fails the whole batch. Submissions:
    /// every item is signed before the first broadcast, and a signing
    /// failure fails the batch with nothing sent.
    #[default]
    FailFast,
    /// Each slot carries its own item's outcome.
    PerItem,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent_graphs")]
    pub max_concurrent_graphs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_graphs: default_max_concurrent_graphs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_watch_timeout_secs() -> u64 {
    120
}

fn default_max_concurrent_graphs() -> usize {
    64
}

fn default_log_filter() -> String {
    "info,extrinsic_orchestrator=debug".to_string()
}

impl Settings {
    /// Load settings from the file named by `EXTRINSIC_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("EXTRINSIC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse settings from TOML text, substituting `${VAR}` references first
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if !(self.node.url.starts_with("ws://") || self.node.url.starts_with("wss://")) {
            anyhow::bail!("Node url must be a ws:// or wss:// endpoint, got {}", self.node.url);
        }
        if self.node.request_timeout_ms == 0 {
            anyhow::bail!("node.request_timeout_ms must be greater than zero");
        }
        if self.extrinsic.watch_timeout_secs == 0 {
            anyhow::bail!("extrinsic.watch_timeout_secs must be greater than zero");
        }
        if self.scheduler.max_concurrent_graphs == 0 {
            anyhow::bail!("scheduler.max_concurrent_graphs must be greater than zero");
        }
        if self.extrinsic.watch_timeout_secs > 3600 {
            tracing::warn!(
                "Watch timeout of {}s leaves subscriptions open for a long time",
                self.extrinsic.watch_timeout_secs
            );
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
