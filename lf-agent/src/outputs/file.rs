use super::matching;
use crate::error::ConfigError;
use crate::event::Event;
use crate::plugin::{decode_options, Output, Plugin, PluginOptions};
use crate::tag::TagMatcher;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

const PLUGIN: &str = "file";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileOutputConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "super::default_match", rename = "match")]
    match_pattern: String,
    #[serde(default)]
    output_dir: Option<String>,
}

fn default_name() -> String {
    PLUGIN.to_string()
}

/// Writes every batch to its own JSON-lines file under `output_dir`.
///
/// Files appear atomically: content goes to a uniquely named temp file first and is renamed
/// into place, so readers never observe a partial batch.
pub struct FileOutput {
    name: String,
    matcher: TagMatcher,
    output_dir: PathBuf,
    sequence: AtomicU64,
}

impl Default for FileOutput {
    fn default() -> Self {
        Self {
            name: PLUGIN.to_string(),
            matcher: TagMatcher::default(),
            output_dir: PathBuf::new(),
            sequence: AtomicU64::new(0),
        }
    }
}

impl FileOutput {
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn encode(&self, events: &[Event]) -> Result<(Vec<u8>, usize)> {
        let mut buf = Vec::new();
        let mut count = 0;
        for event in matching(&self.matcher, events) {
            serde_json::to_writer(&mut buf, event).context("failed to encode event for file output")?;
            buf.push(b'\n');
            count += 1;
        }
        Ok((buf, count))
    }
}

#[async_trait]
impl Plugin for FileOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, options: &PluginOptions) -> Result<(), ConfigError> {
        let config: FileOutputConfig = decode_options(PLUGIN, options)?;
        let output_dir = config
            .output_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .ok_or_else(|| ConfigError::missing(&config.name, "output_dir"))?;
        self.output_dir = PathBuf::from(shellexpand::tilde(output_dir).as_ref());
        self.matcher = TagMatcher::new(config.match_pattern);
        self.name = config.name;
        Ok(())
    }

    async fn exit(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Output for FileOutput {
    async fn write(&self, events: &[Event]) -> Result<()> {
        let (payload, count) = self.encode(events)?;
        if count == 0 {
            return Ok(());
        }

        fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("failed to create directory {}", self.output_dir.display()))?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let filename = format!("{}_{sequence:06}.jsonl", Utc::now().timestamp_millis());
        let final_path = self.output_dir.join(&filename);
        let temp_path = self
            .output_dir
            .join(format!(".{filename}.{}.tmp", Uuid::new_v4()));

        fs::write(&temp_path, &payload)
            .await
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        fs::rename(&temp_path, &final_path).await.with_context(|| {
            format!(
                "failed to rename {} to {}",
                temp_path.display(),
                final_path.display()
            )
        })?;

        debug!(output = %self.name, events = count, path = %final_path.display(), "wrote batch file");
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Metadata;
    use serde_json::Value;
    use tempfile::TempDir;

    fn output(dir: &TempDir, extra: &str) -> FileOutput {
        let raw = format!("output_dir = \"{}\"\n{extra}", dir.path().join("out").display());
        let options: PluginOptions = toml::from_str(&raw).unwrap();
        let mut output = FileOutput::default();
        output.init(&options).unwrap();
        output
    }

    fn tagged(raw: &str, tag: &str) -> Event {
        Event::new(
            raw,
            Metadata {
                tag: tag.to_string(),
                ..Metadata::default()
            },
        )
    }

    fn written_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        files.sort();
        files
    }

    #[tokio::test]
    async fn each_write_becomes_one_file() {
        let dir = TempDir::new().unwrap();
        let output = output(&dir, "");
        output.write(&[tagged("a", "t"), tagged("b", "t")]).await.unwrap();
        output.write(&[tagged("c", "t")]).await.unwrap();

        let files = written_files(output.output_dir());
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.extension().unwrap() == "jsonl"));

        let first = std::fs::read_to_string(&files[0]).unwrap();
        let lines: Vec<Value> = first
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["raw_data"], "a");
        assert_eq!(lines[1]["raw_data"], "b");
    }

    #[tokio::test]
    async fn nothing_matching_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let output = output(&dir, "match = \"keep\"");
        output.write(&[tagged("x", "drop")]).await.unwrap();
        assert!(!output.output_dir().exists());
    }

    #[test]
    fn output_dir_is_required() {
        let options: PluginOptions = toml::from_str("name = \"archive\"").unwrap();
        let err = FileOutput::default().init(&options).unwrap_err();
        assert!(matches!(err, ConfigError::MissingOption { field: "output_dir", .. }));
    }
}
