use crate::checkpoint::{PersistOp, StateCache};
use crate::metrics::WATCHER_EVENTS_DROPPED_TOTAL;
use anyhow::{Context, Result};
use glob::glob;
use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const WATCHER_CHANNEL_CAPACITY: usize = 1000;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created(PathBuf),
    Modified(PathBuf),
    /// New inode at the same path, or the file shrank in place.
    Rotated(PathBuf),
}

impl FileEvent {
    pub fn path(&self) -> &Path {
        match self {
            FileEvent::Created(path) | FileEvent::Modified(path) | FileEvent::Rotated(path) => path,
        }
    }

    pub fn into_path(self) -> PathBuf {
        match self {
            FileEvent::Created(path) | FileEvent::Modified(path) | FileEvent::Rotated(path) => path,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            FileEvent::Created(_) => "created",
            FileEvent::Modified(_) => "modified",
            FileEvent::Rotated(_) => "rotated",
        }
    }
}

/// Polling fingerprint of a file; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub mod_time: SystemTime,
    pub size: u64,
    pub inode: u64,
}

impl FileInfo {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            mod_time: metadata.modified().unwrap_or(UNIX_EPOCH),
            size: metadata.len(),
            inode: inode_of(metadata),
        }
    }
}

#[cfg(unix)]
pub fn inode_of(metadata: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
pub fn inode_of(_metadata: &Metadata) -> u64 {
    0
}

/// Compares two fingerprints of the same path and decides which event, if any, to emit.
pub fn detect_change(path: &Path, previous: &FileInfo, current: &FileInfo) -> Option<FileEvent> {
    let replaced = previous.inode != current.inode;
    let truncated = previous.mod_time != current.mod_time && current.size < previous.size;

    if replaced || truncated {
        Some(FileEvent::Rotated(path.to_path_buf()))
    } else if current.size > previous.size {
        Some(FileEvent::Modified(path.to_path_buf()))
    } else {
        None
    }
}

/// Expands a glob on every tick and reports new, grown and rotated files.
///
/// A rotated or vanished file loses its cached and persisted progress here, so whatever
/// later appears at that path is read from the start even if it reuses the inode.
pub struct StatWatcher {
    pattern: String,
    file_stats: HashMap<PathBuf, FileInfo>,
    states: StateCache,
    event_tx: mpsc::Sender<FileEvent>,
    persist_tx: Option<mpsc::UnboundedSender<PersistOp>>,
}

impl StatWatcher {
    pub fn new(
        pattern: impl Into<String>,
        states: StateCache,
        event_tx: mpsc::Sender<FileEvent>,
    ) -> Result<Self> {
        let pattern = pattern.into();
        glob::Pattern::new(&pattern).with_context(|| format!("invalid glob pattern {pattern}"))?;
        Ok(Self {
            pattern,
            file_stats: HashMap::new(),
            states,
            event_tx,
            persist_tx: None,
        })
    }

    /// Deletes persisted rows of rotated and vanished files through the persistence worker.
    pub fn with_persistence(mut self, persist_tx: mpsc::UnboundedSender<PersistOp>) -> Self {
        self.persist_tx = Some(persist_tx);
        self
    }

    pub async fn run(mut self, poll_interval: Duration, cancel_token: CancellationToken) {
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(pattern = %self.pattern, "stat watcher started");

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll();
                }
            }
        }

        debug!(pattern = %self.pattern, tracked = self.file_stats.len(), "stat watcher stopped");
    }

    /// Runs one scan and returns the number of events emitted.
    pub fn poll(&mut self) -> usize {
        let entries = match glob(&self.pattern) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(pattern = %self.pattern, error = %err, "glob expansion failed");
                return 0;
            }
        };

        let mut seen = HashSet::with_capacity(self.file_stats.len());
        let mut emitted = 0usize;

        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(err) => {
                    debug!(path = %err.path().display(), error = %err.error(), "skipping unreadable glob entry");
                    continue;
                }
            };

            let path = match std::path::absolute(&path) {
                Ok(path) => path,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to resolve absolute path");
                    continue;
                }
            };

            let metadata = match std::fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to stat file; skipping this tick");
                    continue;
                }
            };
            if metadata.is_dir() {
                continue;
            }

            let current = FileInfo::from_metadata(&metadata);
            seen.insert(path.clone());

            let previous = self.file_stats.insert(path.clone(), current);
            let event = match previous {
                None => Some(FileEvent::Created(path)),
                Some(previous) => detect_change(&path, &previous, &current),
            };

            if let Some(event) = event {
                if let (FileEvent::Rotated(path), Some(previous)) = (&event, previous) {
                    debug!(path = %path.display(), "file rotated or truncated; dropping its state");
                    self.forget(path, previous.inode);
                }
                self.send_event(event);
                emitted += 1;
            }
        }

        // A re-created path is reported as new and read from the start.
        let vanished: Vec<(PathBuf, u64)> = self
            .file_stats
            .iter()
            .filter(|(path, _)| !seen.contains(*path))
            .map(|(path, info)| (path.clone(), info.inode))
            .collect();
        for (path, inode) in vanished {
            debug!(path = %path.display(), "file vanished; dropping its state");
            self.file_stats.remove(&path);
            self.forget(&path, inode);
        }

        emitted
    }

    fn forget(&self, path: &Path, inode: u64) {
        let key = path.to_string_lossy().into_owned();
        self.states.remove(&key);
        if let Some(tx) = &self.persist_tx {
            let _ = tx.send(PersistOp::Delete { path: key, inode });
        }
    }

    fn send_event(&self, event: FileEvent) {
        let kind = event.kind();
        match self.event_tx.try_send(event) {
            Ok(_) => {}
            Err(TrySendError::Full(event)) => {
                WATCHER_EVENTS_DROPPED_TOTAL.inc();
                warn!(
                    kind,
                    path = %event.path().display(),
                    "watcher channel full; dropping file event"
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!(kind, "watcher channel closed; dropping file event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::FileState;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::TempDir;

    fn fingerprint(secs: u64, size: u64, inode: u64) -> FileInfo {
        FileInfo {
            mod_time: UNIX_EPOCH + Duration::from_secs(secs),
            size,
            inode,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<FileEvent>) -> Vec<FileEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn growth_is_modified() {
        let path = Path::new("/a.log");
        assert_eq!(
            detect_change(path, &fingerprint(1, 10, 5), &fingerprint(2, 20, 5)),
            Some(FileEvent::Modified(path.to_path_buf()))
        );
    }

    #[test]
    fn new_inode_is_rotation_regardless_of_size() {
        let path = Path::new("/a.log");
        assert_eq!(
            detect_change(path, &fingerprint(1, 10, 5), &fingerprint(1, 30, 6)),
            Some(FileEvent::Rotated(path.to_path_buf()))
        );
    }

    #[test]
    fn shrink_with_new_mtime_is_truncation() {
        let path = Path::new("/a.log");
        assert_eq!(
            detect_change(path, &fingerprint(1, 100, 5), &fingerprint(2, 3, 5)),
            Some(FileEvent::Rotated(path.to_path_buf()))
        );
    }

    #[test]
    fn unchanged_fingerprint_emits_nothing() {
        let path = Path::new("/a.log");
        assert_eq!(detect_change(path, &fingerprint(1, 10, 5), &fingerprint(1, 10, 5)), None);
        // touched without growing
        assert_eq!(detect_change(path, &fingerprint(1, 10, 5), &fingerprint(2, 10, 5)), None);
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(StatWatcher::new("[", StateCache::default(), tx).is_err());
    }

    #[test]
    fn poll_reports_new_then_growth_then_nothing() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        fs::write(&log, "one\n").unwrap();
        fs::create_dir(dir.path().join("dir.log")).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let pattern = format!("{}/*.log", dir.path().display());
        let mut watcher = StatWatcher::new(pattern, StateCache::default(), tx).unwrap();

        assert_eq!(watcher.poll(), 1);
        assert!(matches!(drain(&mut rx).as_slice(), [FileEvent::Created(p)] if p.ends_with("app.log")));

        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(file, "two").unwrap();
        watcher.poll();
        assert!(matches!(drain(&mut rx).as_slice(), [FileEvent::Modified(_)]));

        watcher.poll();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn rotation_evicts_cached_state() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        fs::write(&log, "one\ntwo\n").unwrap();

        let states = StateCache::default();
        let (tx, mut rx) = mpsc::channel(16);
        let pattern = format!("{}/*.log", dir.path().display());
        let mut watcher = StatWatcher::new(pattern, states.clone(), tx).unwrap();
        watcher.poll();
        drain(&mut rx);

        let key = std::path::absolute(&log).unwrap().to_string_lossy().into_owned();
        states.insert(FileState::new(key.clone(), 1));

        // Keep the old inode alive so the new file cannot reuse it.
        let archived = dir.path().join("app.log.1");
        fs::rename(&log, &archived).unwrap();
        fs::write(&log, "x\n").unwrap();

        watcher.poll();
        assert!(matches!(drain(&mut rx).as_slice(), [FileEvent::Rotated(_)]));
        assert!(states.get(&key).is_none());
    }

    #[test]
    fn full_channel_drops_events_without_failing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.log"), "a\n").unwrap();
        fs::write(dir.path().join("b.log"), "b\n").unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let pattern = format!("{}/*.log", dir.path().display());
        let mut watcher = StatWatcher::new(pattern, StateCache::default(), tx).unwrap();

        watcher.poll();
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn vanished_file_loses_cached_and_persisted_state() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app-2026-10-16.log");
        fs::write(&log, "one\n").unwrap();

        let states = StateCache::default();
        let (tx, mut rx) = mpsc::channel(16);
        let (persist_tx, mut persist_rx) = mpsc::unbounded_channel();
        let pattern = format!("{}/*.log", dir.path().display());
        let mut watcher = StatWatcher::new(pattern, states.clone(), tx)
            .unwrap()
            .with_persistence(persist_tx);
        watcher.poll();
        drain(&mut rx);

        let key = std::path::absolute(&log).unwrap().to_string_lossy().into_owned();
        let inode = inode_of(&fs::metadata(&log).unwrap());
        states.insert(FileState::new(key.clone(), inode));

        fs::remove_file(&log).unwrap();
        watcher.poll();

        assert!(states.is_empty());
        assert!(watcher.file_stats.is_empty());
        match persist_rx.try_recv() {
            Ok(PersistOp::Delete { path, inode: deleted }) => {
                assert_eq!(path, key);
                assert_eq!(deleted, inode);
            }
            other => panic!("expected a delete, got {other:?}"),
        }
    }

    #[test]
    fn deleted_then_recreated_file_is_new_again() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        fs::write(&log, "one\n").unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let pattern = format!("{}/*.log", dir.path().display());
        let mut watcher = StatWatcher::new(pattern, StateCache::default(), tx).unwrap();
        watcher.poll();
        drain(&mut rx);

        fs::remove_file(&log).unwrap();
        watcher.poll();
        assert!(drain(&mut rx).is_empty());

        fs::write(&log, "again\n").unwrap();
        watcher.poll();
        assert!(matches!(drain(&mut rx).as_slice(), [FileEvent::Created(_)]));
    }
}
