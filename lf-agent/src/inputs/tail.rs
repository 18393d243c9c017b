//! The `tail` input: follows every file matching a glob.
//!
//! Wiring per running input:
//! - one [`StatWatcher`] task polling the glob,
//! - a [`Debouncer`] turning bursts of file events into read passes,
//! - one tracked task per in-flight read pass,
//! - one [`StatePersister`] task when the state database is enabled.

use crate::checkpoint::{FileStateStore, StateCache};
use crate::error::ConfigError;
use crate::event::Event;
use crate::plugin::{decode_options, Input, Plugin, PluginOptions};
use crate::tailer::{Debouncer, ReaderContext, StatePersister, TailReader};
use crate::watcher::{StatWatcher, WATCHER_CHANNEL_CAPACITY};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const DEFAULT_NAME: &str = "tail";
const DEFAULT_DB_FILE: &str = "~/.lf-agent/tail.db";
const DEFAULT_CLEAN_UP_THRESHOLD_DAYS: u32 = 3;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_DEBOUNCE_MS: u64 = 1_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TailConfig {
    #[serde(default)]
    pub glob: Option<String>,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default = "default_enable_db")]
    pub enable_db: bool,
    #[serde(default = "default_db_file")]
    pub db_file: String,
    /// Days after which untouched rows are removed from the state database.
    #[serde(default = "default_clean_up_threshold")]
    pub clean_up_threshold: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_enable_db() -> bool {
    true
}

fn default_db_file() -> String {
    DEFAULT_DB_FILE.to_string()
}

fn default_clean_up_threshold() -> u32 {
    DEFAULT_CLEAN_UP_THRESHOLD_DAYS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

impl TailConfig {
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_file).as_ref())
    }
}

pub struct TailInput {
    name: String,
    tag: String,
    glob: String,
    host: String,
    clean_up_threshold: u32,
    poll_interval: Duration,
    debounce: Duration,
    store: Option<FileStateStore>,
    states: StateCache,
    read_passes: Arc<AtomicU64>,
    exited: AtomicBool,
}

impl TailInput {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            tag: String::new(),
            glob: String::new(),
            host: host.into(),
            clean_up_threshold: DEFAULT_CLEAN_UP_THRESHOLD_DAYS,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            store: None,
            states: StateCache::default(),
            read_passes: Arc::new(AtomicU64::new(0)),
            exited: AtomicBool::new(false),
        }
    }

    pub fn glob(&self) -> &str {
        &self.glob
    }

    pub fn store(&self) -> Option<&FileStateStore> {
        self.store.as_ref()
    }

    /// Read passes started since construction, one per debounced burst of changes.
    pub fn read_passes(&self) -> u64 {
        self.read_passes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Plugin for TailInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, options: &PluginOptions) -> Result<(), ConfigError> {
        let config: TailConfig = decode_options(DEFAULT_NAME, options)?;
        let plugin = config.name.as_str();

        let glob = config
            .glob
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .ok_or_else(|| ConfigError::missing(plugin, "glob"))?;
        let glob = shellexpand::tilde(glob).into_owned();
        glob::Pattern::new(&glob).map_err(|err| ConfigError::invalid(plugin, "glob", err.to_string()))?;

        if config.poll_interval_ms == 0 {
            return Err(ConfigError::invalid(plugin, "poll_interval_ms", "must be positive"));
        }

        let store = if config.enable_db {
            let db_path = config.db_path();
            let store = FileStateStore::open(&db_path)
                .map_err(|err| ConfigError::invalid(plugin, "db_file", err.to_string()))?;
            debug!(input = plugin, db = %db_path.display(), "opened tail state database");
            Some(store)
        } else {
            None
        };

        self.name = config.name.clone();
        self.tag = config.tag.clone();
        self.glob = glob;
        self.clean_up_threshold = config.clean_up_threshold;
        self.poll_interval = Duration::from_millis(config.poll_interval_ms);
        self.debounce = Duration::from_millis(config.debounce_ms);
        self.store = store;
        Ok(())
    }

    /// Garbage-collects stale state rows and closes the database.
    async fn exit(&self) -> Result<()> {
        if self.exited.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(store) = &self.store {
            match store.cleanup_old_entries(self.clean_up_threshold).await {
                Ok(deleted) => info!(
                    input = %self.name,
                    deleted,
                    threshold_days = self.clean_up_threshold,
                    "cleaned up old tail state"
                ),
                Err(err) => warn!(input = %self.name, error = %err, "failed to clean up old tail state"),
            }
            store.close().context("failed to close tail state database")?;
        }
        Ok(())
    }
}

#[async_trait]
impl Input for TailInput {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn start(&self, cancel_token: CancellationToken, output: mpsc::Sender<Event>) -> Result<()> {
        let (file_tx, mut file_rx) = mpsc::channel(WATCHER_CHANNEL_CAPACITY);
        let mut watcher = StatWatcher::new(self.glob.clone(), self.states.clone(), file_tx)?;
        let tracker = TaskTracker::new();

        let mut reader = TailReader::new(
            ReaderContext {
                input_name: self.name.clone(),
                tag: self.tag.clone(),
                host: self.host.clone(),
            },
            self.states.clone(),
            output,
            cancel_token.clone(),
        );
        // The watcher and the reader hold the only senders; the persister drains once both are gone.
        let persister = match &self.store {
            Some(store) => {
                let (persist_tx, persist_rx) = mpsc::unbounded_channel();
                watcher = watcher.with_persistence(persist_tx.clone());
                reader = reader.with_persistence(store.clone(), persist_tx);
                Some(tokio::spawn(StatePersister::new(store.clone()).run(persist_rx)))
            }
            None => None,
        };
        let reader = Arc::new(reader);

        tracker.spawn(watcher.run(self.poll_interval, cancel_token.clone()));

        let debouncer = Debouncer::new(self.debounce, {
            let reader = reader.clone();
            let tracker = tracker.clone();
            let read_passes = self.read_passes.clone();
            move |path| {
                let reader = reader.clone();
                read_passes.fetch_add(1, Ordering::Relaxed);
                tracker.spawn(async move { reader.read_pass(path).await });
            }
        });

        info!(
            input = %self.name,
            glob = %self.glob,
            tag = %self.tag,
            persistent = self.store.is_some(),
            "tail input started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                maybe_event = file_rx.recv() => match maybe_event {
                    Some(event) => debouncer.trigger(event.into_path()),
                    None => {
                        warn!(input = %self.name, "watcher channel closed");
                        break;
                    }
                },
            }
        }

        debouncer.stop_all();
        drop(debouncer);
        tracker.close();
        tracker.wait().await;

        // The watcher task has ended, so the reader holds the last persistence sender.
        drop(reader);
        if let Some(handle) = persister {
            if let Err(err) = handle.await {
                error!(input = %self.name, error = %err, "state persister task failed");
            }
        }

        info!(input = %self.name, "tail input stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};

    fn options(dir: &TempDir, extra: &str) -> PluginOptions {
        options_with_debounce(dir, 50, extra)
    }

    fn options_with_debounce(dir: &TempDir, debounce_ms: u64, extra: &str) -> PluginOptions {
        let raw = format!(
            "glob = \"{}/*.log\"\nname = \"app\"\ntag = \"app.logs\"\ndb_file = \"{}\"\npoll_interval_ms = 10\ndebounce_ms = {debounce_ms}\n{extra}",
            dir.path().display(),
            dir.path().join("state").join("tail.db").display(),
        );
        toml::from_str(&raw).unwrap()
    }

    fn tail_input(options: &PluginOptions) -> TailInput {
        let mut input = TailInput::new("test-host");
        input.init(options).unwrap();
        input
    }

    async fn recv_lines(rx: &mut mpsc::Receiver<Event>, count: usize) -> Vec<Event> {
        let mut events = Vec::new();
        timeout(Duration::from_secs(5), async {
            while events.len() < count {
                match rx.recv().await {
                    Some(event) => events.push(event),
                    None => break,
                }
            }
        })
        .await
        .expect("expected lines were not tailed in time");
        events
    }

    async fn run_until_cancelled(
        input: Arc<TailInput>,
        cancel: CancellationToken,
        tx: mpsc::Sender<Event>,
    ) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { input.start(cancel, tx).await })
    }

    #[test]
    fn glob_is_required() {
        let options: PluginOptions = toml::from_str("name = \"x\"\nenable_db = false").unwrap();
        let mut input = TailInput::new("h");
        let err = input.init(&options).unwrap_err();
        assert!(matches!(err, ConfigError::MissingOption { field: "glob", .. }));
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let options: PluginOptions = toml::from_str("glob = \"[oops\"\nenable_db = false").unwrap();
        let mut input = TailInput::new("h");
        assert!(matches!(
            input.init(&options),
            Err(ConfigError::InvalidOption { field: "glob", .. })
        ));
    }

    #[test]
    fn defaults_apply_without_database() {
        let options: PluginOptions =
            toml::from_str("glob = \"/var/log/*.log\"\nenable_db = false").unwrap();
        let input = tail_input(&options);
        assert_eq!(input.name(), "tail");
        assert_eq!(input.tag(), "");
        assert_eq!(input.clean_up_threshold, 3);
        assert_eq!(input.debounce, Duration::from_secs(1));
        assert_eq!(input.poll_interval, Duration::from_millis(100));
        assert!(input.store().is_none());
    }

    #[tokio::test]
    async fn tails_existing_and_appended_lines() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("test.log");
        std::fs::write(&log, "line1\nline2\n").unwrap();

        let input = Arc::new(tail_input(&options(&dir, "")));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(64);
        let handle = run_until_cancelled(input.clone(), cancel.clone(), tx).await;

        let first = recv_lines(&mut rx, 2).await;
        assert_eq!(first[0].raw_data, "line1");
        assert_eq!(first[1].raw_data, "line2");
        assert_eq!(first[1].metadata.line_num, 2);
        assert_eq!(first[0].metadata.tag, "app.logs");
        assert_eq!(first[0].metadata.input_source, "app");
        assert_eq!(first[0].metadata.host, "test-host");

        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(file, "line3").unwrap();
        let next = recv_lines(&mut rx, 1).await;
        assert_eq!(next[0].raw_data, "line3");
        assert_eq!(next[0].metadata.line_num, 3);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        input.exit().await.unwrap();
    }

    #[tokio::test]
    async fn burst_of_writes_is_read_in_one_pass() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("burst.log");
        std::fs::write(&log, "").unwrap();

        // The quiet window is far longer than the gaps between writes.
        let input = Arc::new(tail_input(&options_with_debounce(&dir, 400, "")));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(64);
        let handle = run_until_cancelled(input.clone(), cancel.clone(), tx).await;

        // The empty file's discovery costs one pass of its own.
        sleep(Duration::from_millis(800)).await;
        assert_eq!(input.read_passes(), 1);

        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        for i in 0..10 {
            writeln!(file, "burst-{i}").unwrap();
            sleep(Duration::from_millis(5)).await;
        }

        let events = recv_lines(&mut rx, 10).await;
        let raw: Vec<_> = events.iter().map(|e| e.raw_data.clone()).collect();
        let expected: Vec<_> = (0..10).map(|i| format!("burst-{i}")).collect();
        assert_eq!(raw, expected);
        sleep(Duration::from_millis(600)).await;
        assert_eq!(input.read_passes(), 2);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn restart_resumes_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("resume.log");
        std::fs::write(&log, "a\nb\n").unwrap();

        {
            let input = Arc::new(tail_input(&options(&dir, "")));
            let cancel = CancellationToken::new();
            let (tx, mut rx) = mpsc::channel(64);
            let handle = run_until_cancelled(input.clone(), cancel.clone(), tx).await;
            assert_eq!(recv_lines(&mut rx, 2).await.len(), 2);
            cancel.cancel();
            handle.await.unwrap().unwrap();
            input.exit().await.unwrap();
        }

        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(file, "c").unwrap();

        let input = Arc::new(tail_input(&options(&dir, "")));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(64);
        let handle = run_until_cancelled(input.clone(), cancel.clone(), tx).await;

        let events = recv_lines(&mut rx, 1).await;
        assert_eq!(events[0].raw_data, "c");
        assert_eq!(events[0].metadata.line_num, 3);
        sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        handle.await.unwrap().unwrap();
        input.exit().await.unwrap();
    }

    #[tokio::test]
    async fn exit_is_idempotent_and_closes_store() {
        let dir = TempDir::new().unwrap();
        let input = tail_input(&options(&dir, ""));
        input.exit().await.unwrap();
        input.exit().await.unwrap();

        let store = input.store().unwrap();
        assert!(store.get_file_state("/x.log", 1).await.is_err());
    }
}
