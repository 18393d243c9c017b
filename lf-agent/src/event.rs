use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Fields extracted from a record by a parser.
pub type ParsedData = Map<String, Value>;

/// A single record flowing through the pipeline.
///
/// Inputs create events, parsers and filters mutate them in place, outputs only read them.
/// Each pipeline stage owns the event exclusively while working on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub raw_data: String,
    pub parsed_data: Option<ParsedData>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metadata {
    /// File path or remote address the record came from.
    pub source: String,
    pub host: String,
    /// Routing tag copied from the owning input.
    pub tag: String,
    /// 1-based, monotonically increasing per source.
    pub line_num: u64,
    /// Name of the input plugin that produced the record.
    pub input_source: String,
}

impl Event {
    pub fn new(raw_data: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            timestamp: Utc::now(),
            raw_data: raw_data.into(),
            parsed_data: None,
            metadata,
        }
    }

    /// Looks up a parsed field and renders it as text, for matching.
    pub fn field_as_string(&self, key: &str) -> Option<String> {
        let value = self.parsed_data.as_ref()?.get(key)?;
        Some(match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    }
}
