//! `grep` filter: keeps or drops events by regex rules on the raw line or a parsed field.
//!
//! Rule semantics:
//! - `mode = "and"`: every `include` rule must match.
//! - `mode = "or"`: at least one `include` rule must match.
//! - Any matching `exclude` rule drops the event, whatever the mode.
//! - No `include` rules means every event passes the include stage.
//!
//! A rule whose `key` is absent from `parsed_data` does not match.

use crate::error::ConfigError;
use crate::event::Event;
use crate::plugin::{decode_options, Filter, Plugin, PluginOptions};
use crate::tag::TagMatcher;
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

const PLUGIN: &str = "grep";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    And,
    Or,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleConfig {
    #[serde(default)]
    key: Option<String>,
    pattern: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GrepConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_tag")]
    tag: String,
    #[serde(default)]
    mode: MatchMode,
    #[serde(default)]
    include: Vec<RuleConfig>,
    #[serde(default)]
    exclude: Vec<RuleConfig>,
}

fn default_name() -> String {
    PLUGIN.to_string()
}

fn default_tag() -> String {
    "*".to_string()
}

#[derive(Debug)]
struct Rule {
    key: Option<String>,
    pattern: Regex,
}

impl Rule {
    fn compile(plugin: &str, field: &'static str, config: RuleConfig) -> Result<Self, ConfigError> {
        let pattern = Regex::new(&config.pattern).map_err(|err| {
            ConfigError::invalid(plugin, field, format!("`{}`: {err}", config.pattern))
        })?;
        Ok(Self {
            key: config.key.filter(|k| !k.is_empty()),
            pattern,
        })
    }

    fn matches(&self, event: &Event) -> bool {
        match &self.key {
            None => self.pattern.is_match(&event.raw_data),
            Some(key) => event
                .field_as_string(key)
                .is_some_and(|value| self.pattern.is_match(&value)),
        }
    }
}

pub struct GrepFilter {
    name: String,
    tag: TagMatcher,
    mode: MatchMode,
    include: Vec<Rule>,
    exclude: Vec<Rule>,
}

impl Default for GrepFilter {
    fn default() -> Self {
        Self {
            name: PLUGIN.to_string(),
            tag: TagMatcher::default(),
            mode: MatchMode::And,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl GrepFilter {
    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    fn keep(&self, event: &Event) -> bool {
        if self.exclude.iter().any(|rule| rule.matches(event)) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        match self.mode {
            MatchMode::And => self.include.iter().all(|rule| rule.matches(event)),
            MatchMode::Or => self.include.iter().any(|rule| rule.matches(event)),
        }
    }
}

#[async_trait]
impl Plugin for GrepFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, options: &PluginOptions) -> Result<(), ConfigError> {
        let config: GrepConfig = decode_options(PLUGIN, options)?;
        let plugin = config.name.as_str();
        if config.tag.is_empty() {
            return Err(ConfigError::invalid(plugin, "tag", "must not be empty"));
        }

        let include = config
            .include
            .into_iter()
            .map(|rule| Rule::compile(plugin, "include", rule))
            .collect::<Result<Vec<_>, _>>()?;
        let exclude = config
            .exclude
            .into_iter()
            .map(|rule| Rule::compile(plugin, "exclude", rule))
            .collect::<Result<Vec<_>, _>>()?;

        self.tag = TagMatcher::new(config.tag);
        self.mode = config.mode;
        self.include = include;
        self.exclude = exclude;
        self.name = config.name;
        Ok(())
    }

    async fn exit(&self) -> Result<()> {
        Ok(())
    }
}

impl Filter for GrepFilter {
    fn process(&self, event: Event) -> Result<Option<Event>> {
        Ok(self.keep(&event).then_some(event))
    }

    fn match_tag(&self, tag: &str) -> bool {
        self.tag.matches(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Metadata;
    use serde_json::json;

    fn filter(raw: &str) -> GrepFilter {
        let options: PluginOptions = toml::from_str(raw).unwrap();
        let mut filter = GrepFilter::default();
        filter.init(&options).unwrap();
        filter
    }

    fn event(raw: &str, fields: serde_json::Value) -> Event {
        let mut event = Event::new(raw, Metadata::default());
        event.parsed_data = fields.as_object().cloned();
        event
    }

    fn kept(filter: &GrepFilter, event: Event) -> bool {
        filter.process(event).unwrap().is_some()
    }

    #[test]
    fn and_mode_needs_every_include() {
        let filter = filter(
            r#"
include = [{ pattern = "ERROR" }, { key = "service", pattern = "^api$" }]
"#,
        );
        assert_eq!(filter.mode(), MatchMode::And);
        assert!(kept(&filter, event("ERROR boom", json!({"service": "api"}))));
        assert!(!kept(&filter, event("ERROR boom", json!({"service": "web"}))));
        assert!(!kept(&filter, event("INFO ok", json!({"service": "api"}))));
    }

    #[test]
    fn or_mode_needs_any_include() {
        let filter = filter(
            r#"
mode = "or"
include = [{ pattern = "ERROR" }, { pattern = "WARN" }]
"#,
        );
        assert!(kept(&filter, event("WARN disk", json!({}))));
        assert!(kept(&filter, event("ERROR disk", json!({}))));
        assert!(!kept(&filter, event("INFO disk", json!({}))));
    }

    #[test]
    fn exclude_always_drops() {
        for mode in ["and", "or"] {
            let filter = filter(&format!(
                r#"
mode = "{mode}"
include = [{{ pattern = "ERROR" }}]
exclude = [{{ pattern = "healthcheck" }}]
"#
            ));
            assert!(kept(&filter, event("ERROR db down", json!({}))), "{mode}");
            assert!(!kept(&filter, event("ERROR healthcheck", json!({}))), "{mode}");
        }
    }

    #[test]
    fn excludes_alone_pass_everything_else() {
        let filter = filter(r#"exclude = [{ key = "level", pattern = "debug" }]"#);
        assert!(kept(&filter, event("x", json!({"level": "info"}))));
        assert!(kept(&filter, event("x", json!({}))));
        assert!(!kept(&filter, event("x", json!({"level": "debug"}))));
    }

    #[test]
    fn missing_field_fails_include() {
        let filter = filter(r#"include = [{ key = "status", pattern = "^5" }]"#);
        assert!(!kept(&filter, event("500", json!({}))));
        assert!(kept(&filter, event("", json!({"status": 503}))));
    }

    #[test]
    fn tag_pattern_selects_events() {
        let filter = filter(r#"tag = "app.*""#);
        assert!(filter.match_tag("app.web"));
        assert!(!filter.match_tag("sys.kernel"));
        assert!(GrepFilter::default().match_tag("anything"));
    }

    #[test]
    fn invalid_rules_fail_init() {
        let options: PluginOptions = toml::from_str(r#"include = [{ pattern = "(" }]"#).unwrap();
        let err = GrepFilter::default().init(&options).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { field: "include", .. }));

        let options: PluginOptions = toml::from_str(r#"mode = "xor""#).unwrap();
        assert!(matches!(
            GrepFilter::default().init(&options),
            Err(ConfigError::Deserialize { .. })
        ));
    }
}
