use super::{default_match, matching};
use crate::error::ConfigError;
use crate::event::Event;
use crate::plugin::{decode_options, Output, Plugin, PluginOptions};
use crate::tag::TagMatcher;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

const PLUGIN: &str = "counter";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CounterConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_match", rename = "match")]
    match_pattern: String,
}

fn default_name() -> String {
    PLUGIN.to_string()
}

/// Counts delivered events per tag and reports the totals on every flush.
pub struct CounterOutput {
    name: String,
    matcher: TagMatcher,
    counts: Mutex<BTreeMap<String, u64>>,
}

impl Default for CounterOutput {
    fn default() -> Self {
        Self {
            name: PLUGIN.to_string(),
            matcher: TagMatcher::default(),
            counts: Mutex::new(BTreeMap::new()),
        }
    }
}

impl CounterOutput {
    pub fn counts(&self) -> BTreeMap<String, u64> {
        self.lock().clone()
    }

    pub fn total(&self) -> u64 {
        self.lock().values().sum()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, u64>> {
        self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Plugin for CounterOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, options: &PluginOptions) -> Result<(), ConfigError> {
        let config: CounterConfig = decode_options(PLUGIN, options)?;
        self.matcher = TagMatcher::new(config.match_pattern);
        self.name = config.name;
        Ok(())
    }

    async fn exit(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Output for CounterOutput {
    async fn write(&self, events: &[Event]) -> Result<()> {
        let mut counts = self.lock();
        for event in matching(&self.matcher, events) {
            *counts.entry(event.metadata.tag.clone()).or_default() += 1;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let counts = self.counts();
        for (tag, count) in &counts {
            info!(output = %self.name, tag = %tag, count, "event count");
        }
        info!(output = %self.name, total = counts.values().sum::<u64>(), "event totals");
        Ok(())
    }
}
