//! Capability contracts between the engine and its plugins.
//!
//! The engine only ever talks to these traits. Concrete plugins are built by
//! [`crate::registry`] from configuration, initialised once, and then shared with the engine's
//! tasks behind `Arc`s, which is why every runtime method takes `&self`.

use crate::error::ConfigError;
use crate::event::Event;
use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Raw options of one `[[inputs]]`/`[[parsers]]`/... table, minus its `type` key.
pub type PluginOptions = toml::Table;

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Decodes and validates `options`. Fails on the first invalid field.
    fn init(&mut self, options: &PluginOptions) -> Result<(), ConfigError>;

    /// Releases resources. Calling it more than once is harmless.
    async fn exit(&self) -> Result<()>;
}

/// Produces events.
#[async_trait]
pub trait Input: Plugin {
    fn tag(&self) -> &str;

    /// Pushes events into `output` until `cancel_token` fires.
    ///
    /// Returns only after every task the input spawned has finished. The input must never
    /// close `output`; the engine owns the channel.
    async fn start(&self, cancel_token: CancellationToken, output: mpsc::Sender<Event>)
        -> Result<()>;
}

/// Fills `parsed_data` (and possibly `timestamp`) from `raw_data`.
pub trait Parser: Plugin {
    /// Returns whether parsing succeeded. Malformed input is a `false`, never a panic.
    fn process(&self, event: &mut Event) -> bool;
}

/// Decides whether an event continues down the pipeline.
pub trait Filter: Plugin {
    /// `Ok(None)` drops the event, `Ok(Some(_))` passes it on, `Err` is a malfunction.
    fn process(&self, event: Event) -> Result<Option<Event>>;

    fn match_tag(&self, tag: &str) -> bool;
}

/// Receives flushed batches. Never called re-entrantly.
#[async_trait]
pub trait Output: Plugin {
    async fn write(&self, events: &[Event]) -> Result<()>;

    async fn flush(&self) -> Result<()>;
}

/// Decodes plugin options into the plugin's typed configuration.
pub fn decode_options<T: DeserializeOwned>(
    plugin: &str,
    options: &PluginOptions,
) -> Result<T, ConfigError> {
    toml::Value::Table(options.clone())
        .try_into()
        .map_err(|source| ConfigError::Deserialize {
            plugin: plugin.to_string(),
            source,
        })
}
