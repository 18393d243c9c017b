//! Builds an [`Engine`] from configuration.
//!
//! Plugins are resolved by their `type` key through plain `match` tables below, initialised
//! in file order, and registered with the engine in that same order.

use crate::config::{Config, PluginSpec};
use crate::engine::Engine;
use crate::error::ConfigError;
use crate::filters::GrepFilter;
use crate::inputs::TailInput;
use crate::outputs::{CounterOutput, FileOutput, StdoutOutput};
use crate::parsers::{JsonParser, RegexParser};
use crate::plugin::{Filter, Input, Output, Parser, Plugin};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

pub fn build_engine(config: &Config) -> Result<Engine> {
    let host = config.hostname();
    let mut engine = Engine::new(config.engine.to_engine_config());

    for (idx, spec) in config.inputs.iter().enumerate() {
        let input = build_input(spec, &host).with_context(|| format!("inputs[{idx}]"))?;
        info!(kind = %spec.kind, name = input.name(), "registered input");
        engine.add_input(input);
    }
    for (idx, spec) in config.parsers.iter().enumerate() {
        let parser = build_parser(spec).with_context(|| format!("parsers[{idx}]"))?;
        info!(kind = %spec.kind, name = parser.name(), "registered parser");
        engine.add_parser(parser);
    }
    for (idx, spec) in config.filters.iter().enumerate() {
        let filter = build_filter(spec).with_context(|| format!("filters[{idx}]"))?;
        info!(kind = %spec.kind, name = filter.name(), "registered filter");
        engine.add_filter(filter);
    }
    for (idx, spec) in config.outputs.iter().enumerate() {
        let output = build_output(spec).with_context(|| format!("outputs[{idx}]"))?;
        info!(kind = %spec.kind, name = output.name(), "registered output");
        engine.add_output(output);
    }

    Ok(engine)
}

pub fn build_input(spec: &PluginSpec, host: &str) -> Result<Arc<dyn Input>, ConfigError> {
    match spec.kind.as_str() {
        "tail" => {
            let mut input = TailInput::new(host);
            input.init(&spec.options)?;
            Ok(Arc::new(input))
        }
        other => Err(unknown("input", other)),
    }
}

pub fn build_parser(spec: &PluginSpec) -> Result<Arc<dyn Parser>, ConfigError> {
    match spec.kind.as_str() {
        "json" => {
            let mut parser = JsonParser::default();
            parser.init(&spec.options)?;
            Ok(Arc::new(parser))
        }
        "regex" => {
            let mut parser = RegexParser::default();
            parser.init(&spec.options)?;
            Ok(Arc::new(parser))
        }
        other => Err(unknown("parser", other)),
    }
}

pub fn build_filter(spec: &PluginSpec) -> Result<Arc<dyn Filter>, ConfigError> {
    match spec.kind.as_str() {
        "grep" => {
            let mut filter = GrepFilter::default();
            filter.init(&spec.options)?;
            Ok(Arc::new(filter))
        }
        other => Err(unknown("filter", other)),
    }
}

pub fn build_output(spec: &PluginSpec) -> Result<Arc<dyn Output>, ConfigError> {
    match spec.kind.as_str() {
        "stdout" => {
            let mut output = StdoutOutput::default();
            output.init(&spec.options)?;
            Ok(Arc::new(output))
        }
        "counter" => {
            let mut output = CounterOutput::default();
            output.init(&spec.options)?;
            Ok(Arc::new(output))
        }
        "file" => {
            let mut output = FileOutput::default();
            output.init(&spec.options)?;
            Ok(Arc::new(output))
        }
        other => Err(unknown("output", other)),
    }
}

fn unknown(kind: &'static str, name: &str) -> ConfigError {
    ConfigError::UnknownPlugin {
        kind,
        name: name.to_string(),
    }
}
