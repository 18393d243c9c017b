use super::{default_match, matching};
use crate::error::ConfigError;
use crate::event::Event;
use crate::plugin::{decode_options, Output, Plugin, PluginOptions};
use crate::tag::TagMatcher;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

const PLUGIN: &str = "stdout";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineFormat {
    /// The whole event as one JSON object.
    #[default]
    Json,
    /// Only the original line.
    Raw,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StdoutConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_match", rename = "match")]
    match_pattern: String,
    #[serde(default)]
    format: LineFormat,
}

fn default_name() -> String {
    PLUGIN.to_string()
}

pub struct StdoutOutput {
    name: String,
    matcher: TagMatcher,
    format: LineFormat,
    /// Shared by writes and flushes so a flush reaches the bytes written before it.
    stdout: Mutex<Stdout>,
}

impl Default for StdoutOutput {
    fn default() -> Self {
        Self {
            name: PLUGIN.to_string(),
            matcher: TagMatcher::default(),
            format: LineFormat::Json,
            stdout: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl StdoutOutput {
    fn render(&self, events: &[Event]) -> Result<String> {
        let mut out = String::new();
        for event in matching(&self.matcher, events) {
            match self.format {
                LineFormat::Json => {
                    let line = serde_json::to_string(event).context("failed to encode event")?;
                    out.push_str(&line);
                }
                LineFormat::Raw => out.push_str(&event.raw_data),
            }
            out.push('\n');
        }
        Ok(out)
    }
}

#[async_trait]
impl Plugin for StdoutOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, options: &PluginOptions) -> Result<(), ConfigError> {
        let config: StdoutConfig = decode_options(PLUGIN, options)?;
        self.matcher = TagMatcher::new(config.match_pattern);
        self.format = config.format;
        self.name = config.name;
        Ok(())
    }

    async fn exit(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Output for StdoutOutput {
    async fn write(&self, events: &[Event]) -> Result<()> {
        let rendered = self.render(events)?;
        if rendered.is_empty() {
            return Ok(());
        }
        self.stdout
            .lock()
            .await
            .write_all(rendered.as_bytes())
            .await
            .context("failed to write to stdout")?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.stdout
            .lock()
            .await
            .flush()
            .await
            .context("failed to flush stdout")
    }
}
