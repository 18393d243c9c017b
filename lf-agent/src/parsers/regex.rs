use super::TimeExtractor;
use crate::error::ConfigError;
use crate::event::{Event, ParsedData};
use crate::plugin::{decode_options, Parser, Plugin, PluginOptions};
use ::regex::Regex;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

const PLUGIN: &str = "regex";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegexParserConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    time_key: Option<String>,
    #[serde(default)]
    time_format: Option<String>,
}

fn default_name() -> String {
    PLUGIN.to_string()
}

/// Extracts named capture groups as string fields.
///
/// Groups that did not participate in the match are left out of `parsed_data`.
pub struct RegexParser {
    name: String,
    pattern: Option<Regex>,
    fields: Vec<String>,
    time: Option<TimeExtractor>,
}

impl Default for RegexParser {
    fn default() -> Self {
        Self {
            name: PLUGIN.to_string(),
            pattern: None,
            fields: Vec::new(),
            time: None,
        }
    }
}

#[async_trait]
impl Plugin for RegexParser {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, options: &PluginOptions) -> Result<(), ConfigError> {
        let config: RegexParserConfig = decode_options(PLUGIN, options)?;
        let plugin = config.name.as_str();

        let raw = config
            .pattern
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ConfigError::missing(plugin, "pattern"))?;
        let pattern =
            Regex::new(raw).map_err(|err| ConfigError::invalid(plugin, "pattern", err.to_string()))?;
        let fields: Vec<String> = pattern.capture_names().flatten().map(str::to_string).collect();
        if fields.is_empty() {
            return Err(ConfigError::invalid(
                plugin,
                "pattern",
                "needs at least one named group, e.g. (?P<level>\\w+)",
            ));
        }

        self.time = TimeExtractor::from_options(
            plugin,
            config.time_key.as_deref(),
            config.time_format.as_deref(),
        )?;
        self.pattern = Some(pattern);
        self.fields = fields;
        self.name = config.name;
        Ok(())
    }

    async fn exit(&self) -> Result<()> {
        Ok(())
    }
}

impl Parser for RegexParser {
    fn process(&self, event: &mut Event) -> bool {
        let Some(pattern) = &self.pattern else {
            return false;
        };
        let Some(captures) = pattern.captures(&event.raw_data) else {
            return false;
        };

        let mut fields = ParsedData::new();
        for name in &self.fields {
            if let Some(value) = captures.name(name) {
                fields.insert(name.clone(), Value::String(value.as_str().to_string()));
            }
        }

        if let Some(ts) = self.time.as_ref().and_then(|time| time.extract(&fields)) {
            event.timestamp = ts;
        }
        event.parsed_data = Some(fields);
        true
    }
}
