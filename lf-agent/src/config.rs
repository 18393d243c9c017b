use crate::engine::{EngineConfig, DEFAULT_BUFFER_SIZE, DEFAULT_CHANNEL_CAPACITY};
use crate::plugin::PluginOptions;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_ENV: &str = "LF_AGENT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub inputs: Vec<PluginSpec>,
    #[serde(default)]
    pub parsers: Vec<PluginSpec>,
    #[serde(default)]
    pub filters: Vec<PluginSpec>,
    #[serde(default)]
    pub outputs: Vec<PluginSpec>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AgentConfig {
    /// Overrides the host name stamped on every event.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Serves Prometheus metrics on this address when set.
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineSection {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// One `[[inputs]]`, `[[parsers]]`, `[[filters]]` or `[[outputs]]` table.
#[derive(Debug, Deserialize, Clone)]
pub struct PluginSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: PluginOptions,
}

const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl EngineSection {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            buffer_size: self.buffer_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            channel_capacity: self.channel_capacity,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        if config.inputs.is_empty() {
            anyhow::bail!("at least one [[inputs]] table is required");
        }
        if config.outputs.is_empty() {
            anyhow::bail!("at least one [[outputs]] table is required");
        }
        if config.engine.buffer_size == 0 {
            anyhow::bail!("engine.buffer_size must be positive");
        }
        if config.engine.flush_interval_ms == 0 {
            anyhow::bail!("engine.flush_interval_ms must be positive");
        }
        if config.engine.channel_capacity == 0 {
            anyhow::bail!("engine.channel_capacity must be positive");
        }
        Ok(config)
    }

    /// Picks the config file: `LF_AGENT_CONFIG`, then the first CLI argument, then `config.toml`.
    pub fn resolve_path(env_value: Option<String>, mut args: impl Iterator<Item = String>) -> String {
        env_value
            .filter(|value| !value.trim().is_empty())
            .or_else(|| args.next())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    pub fn hostname(&self) -> String {
        self.agent
            .hostname
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }
}
