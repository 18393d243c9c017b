//! Parser plugins and the record-time handling they share.

use crate::error::ConfigError;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

pub mod json;
pub mod regex;

pub use self::json::JsonParser;
pub use self::regex::RegexParser;

const RFC3339: &str = "rfc3339";
const UNIX: &str = "unix";
const UNIX_MS: &str = "unix_ms";

/// How a parser turns the value of its `time_key` field into an event timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeFormat {
    Rfc3339,
    /// Seconds since the epoch, integer or fractional.
    Unix,
    UnixMillis,
    /// A chrono strftime format. Formats without an offset are read as UTC.
    Strftime(String),
}

impl TimeFormat {
    pub fn from_option(plugin: &str, raw: &str) -> Result<Self, ConfigError> {
        match raw {
            RFC3339 => Ok(TimeFormat::Rfc3339),
            UNIX => Ok(TimeFormat::Unix),
            UNIX_MS => Ok(TimeFormat::UnixMillis),
            "" => Err(ConfigError::invalid(plugin, "time_format", "must not be empty")),
            custom => {
                if StrftimeItems::new(custom).any(|item| matches!(item, Item::Error)) {
                    return Err(ConfigError::invalid(
                        plugin,
                        "time_format",
                        format!("`{custom}` is not a valid strftime format"),
                    ));
                }
                Ok(TimeFormat::Strftime(custom.to_string()))
            }
        }
    }

    pub fn parse(&self, value: &Value) -> Option<DateTime<Utc>> {
        match self {
            TimeFormat::Rfc3339 => DateTime::parse_from_rfc3339(value.as_str()?)
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            TimeFormat::Unix => {
                let secs = number_or_numeric_string(value)?;
                let millis = (secs * 1_000.0).round() as i64;
                Utc.timestamp_millis_opt(millis).single()
            }
            TimeFormat::UnixMillis => {
                let millis = number_or_numeric_string(value)? as i64;
                Utc.timestamp_millis_opt(millis).single()
            }
            TimeFormat::Strftime(format) => {
                let raw = value.as_str()?;
                DateTime::parse_from_str(raw, format)
                    .map(|ts| ts.with_timezone(&Utc))
                    .or_else(|_| NaiveDateTime::parse_from_str(raw, format).map(|ts| ts.and_utc()))
                    .ok()
            }
        }
    }
}

fn number_or_numeric_string(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Optional `time_key`/`time_format` pair shared by the parsers.
#[derive(Debug, Clone)]
pub(crate) struct TimeExtractor {
    key: String,
    format: TimeFormat,
}

impl TimeExtractor {
    pub(crate) fn from_options(
        plugin: &str,
        time_key: Option<&str>,
        time_format: Option<&str>,
    ) -> Result<Option<Self>, ConfigError> {
        let format = time_format
            .map(|raw| TimeFormat::from_option(plugin, raw))
            .transpose()?;
        match time_key.map(str::trim) {
            None | Some("") => {
                if format.is_some() {
                    return Err(ConfigError::missing(plugin, "time_key"));
                }
                Ok(None)
            }
            Some(key) => Ok(Some(Self {
                key: key.to_string(),
                format: format.unwrap_or(TimeFormat::Rfc3339),
            })),
        }
    }

    /// Reads the record time from `fields`. A missing or unparseable value yields `None`.
    pub(crate) fn extract(&self, fields: &serde_json::Map<String, Value>) -> Option<DateTime<Utc>> {
        self.format.parse(fields.get(&self.key)?)
    }
}
