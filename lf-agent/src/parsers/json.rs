use super::TimeExtractor;
use crate::error::ConfigError;
use crate::event::Event;
use crate::plugin::{decode_options, Parser, Plugin, PluginOptions};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::trace;

const PLUGIN: &str = "json";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JsonParserConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default)]
    time_key: Option<String>,
    #[serde(default)]
    time_format: Option<String>,
}

fn default_name() -> String {
    PLUGIN.to_string()
}

/// Decodes each line as a JSON object.
pub struct JsonParser {
    name: String,
    time: Option<TimeExtractor>,
}

impl Default for JsonParser {
    fn default() -> Self {
        Self {
            name: PLUGIN.to_string(),
            time: None,
        }
    }
}

#[async_trait]
impl Plugin for JsonParser {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, options: &PluginOptions) -> Result<(), ConfigError> {
        let config: JsonParserConfig = decode_options(PLUGIN, options)?;
        self.time = TimeExtractor::from_options(
            &config.name,
            config.time_key.as_deref(),
            config.time_format.as_deref(),
        )?;
        self.name = config.name;
        Ok(())
    }

    async fn exit(&self) -> Result<()> {
        Ok(())
    }
}

impl Parser for JsonParser {
    fn process(&self, event: &mut Event) -> bool {
        let fields = match serde_json::from_str::<Value>(&event.raw_data) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) => {
                trace!(parser = %self.name, source = %event.metadata.source, "line is not a JSON object");
                return false;
            }
            Err(err) => {
                trace!(parser = %self.name, source = %event.metadata.source, error = %err, "invalid JSON");
                return false;
            }
        };

        if let Some(ts) = self.time.as_ref().and_then(|time| time.extract(&fields)) {
            event.timestamp = ts;
        }
        event.parsed_data = Some(fields);
        true
    }
}
