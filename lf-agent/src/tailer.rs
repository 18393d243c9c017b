//! Debounced, offset-tracking reads of tailed files.
//!
//! The watcher reports that a file changed; the [`Debouncer`] waits for the burst of
//! notifications to go quiet and then the [`TailReader`] performs a single read pass from the
//! last recorded offset. Progress is kept in the shared [`StateCache`] and handed to the
//! [`StatePersister`], the only task that writes to the repository.

use crate::checkpoint::{FileState, FileStateStore, PersistOp, StateCache};
use crate::event::{Event, Metadata};
use crate::metrics::{LINES_READ_TOTAL, READ_PASSES_TOTAL, STATE_PERSIST_ERRORS_TOTAL};
use crate::watcher::inode_of;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);
const PERSIST_BATCH_SIZE: usize = 100;
const PERSIST_INTERVAL: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct PendingTimer {
    id: u64,
    handle: AbortHandle,
}

/// Coalesces bursts of change notifications per path.
///
/// Every [`trigger`](Debouncer::trigger) re-arms the path's timer; the callback only runs once
/// no trigger arrived for the whole delay.
pub struct Debouncer {
    delay: Duration,
    timers: Arc<Mutex<HashMap<PathBuf, PendingTimer>>>,
    next_id: AtomicU64,
    on_fire: Arc<dyn Fn(PathBuf) + Send + Sync>,
}

impl Debouncer {
    pub fn new<F>(delay: Duration, on_fire: F) -> Self
    where
        F: Fn(PathBuf) + Send + Sync + 'static,
    {
        Self {
            delay,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            on_fire: Arc::new(on_fire),
        }
    }

    pub fn trigger(&self, path: PathBuf) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timers = self.timers.clone();
        let on_fire = self.on_fire.clone();
        let delay = self.delay;
        let key = path.clone();

        // Hold the map while spawning so the timer cannot look itself up before it is stored.
        let mut pending = lock(&self.timers);
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let current = {
                let mut timers = lock(&timers);
                match timers.get(&path) {
                    Some(timer) if timer.id == id => {
                        timers.remove(&path);
                        true
                    }
                    _ => false,
                }
            };
            if current {
                on_fire(path);
            }
        });

        if let Some(previous) = pending.insert(
            key,
            PendingTimer {
                id,
                handle: handle.abort_handle(),
            },
        ) {
            previous.handle.abort();
        }
    }

    pub fn pending(&self) -> usize {
        lock(&self.timers).len()
    }

    /// Cancels every armed timer without running its callback.
    pub fn stop_all(&self) {
        for (_, timer) in lock(&self.timers).drain() {
            timer.handle.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Identity stamped onto every event a reader produces.
#[derive(Debug, Clone, Default)]
pub struct ReaderContext {
    pub input_name: String,
    pub tag: String,
    pub host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Lines delivered to the pipeline during this pass.
    pub lines: u64,
    /// Offset recorded at the end of the pass.
    pub offset: u64,
    /// The pass stopped early because of shutdown.
    pub interrupted: bool,
}

pub struct TailReader {
    context: ReaderContext,
    states: StateCache,
    store: Option<FileStateStore>,
    persist_tx: Option<mpsc::UnboundedSender<PersistOp>>,
    event_tx: mpsc::Sender<Event>,
    cancel_token: CancellationToken,
    read_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl TailReader {
    pub fn new(
        context: ReaderContext,
        states: StateCache,
        event_tx: mpsc::Sender<Event>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            context,
            states,
            store: None,
            persist_tx: None,
            event_tx,
            cancel_token,
            read_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Enables recovery from `store` and durable progress through `persist_tx`.
    pub fn with_persistence(
        mut self,
        store: FileStateStore,
        persist_tx: mpsc::UnboundedSender<PersistOp>,
    ) -> Self {
        self.store = Some(store);
        self.persist_tx = Some(persist_tx);
        self
    }

    /// Reads every complete line appended since the recorded offset.
    ///
    /// Passes over the same path never overlap, which keeps lines of one file in order. On
    /// error nothing is recorded, so the next pass starts from the previous offset again.
    pub async fn read_file(&self, path: &Path) -> Result<ReadOutcome> {
        let path_lock = self.read_lock(path);
        let outcome = {
            let _guard = path_lock.lock().await;
            self.read_locked(path).await
        };
        self.release_read_lock(path, &path_lock);
        outcome
    }

    async fn read_locked(&self, path: &Path) -> Result<ReadOutcome> {
        let key = path.to_string_lossy().into_owned();
        let file = fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let metadata = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let file_size = metadata.len();

        let mut state = self.resolve_state(&key, inode_of(&metadata)).await?;

        if state.offset > file_size {
            warn!(
                path = %path.display(),
                previous_offset = state.offset,
                current_size = file_size,
                "file truncated; restarting from the beginning"
            );
            self.persist(PersistOp::Delete {
                path: key.clone(),
                inode: state.inode,
            });
            state.reset();
        }

        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(state.offset))
            .await
            .with_context(|| format!("failed to seek {} to offset {}", path.display(), state.offset))?;

        let mut offset = state.offset;
        let mut lines = 0u64;
        let mut interrupted = false;
        let mut buffer = Vec::with_capacity(512);

        loop {
            if self.cancel_token.is_cancelled() {
                interrupted = true;
                break;
            }

            buffer.clear();
            let bytes_read = reader
                .read_until(b'\n', &mut buffer)
                .await
                .with_context(|| format!("failed to read from {}", path.display()))?;
            if bytes_read == 0 {
                break;
            }
            if buffer.last() != Some(&b'\n') {
                // The writer is mid-line; pick it up once the newline lands.
                break;
            }

            let next_offset = offset + bytes_read as u64;
            let text = String::from_utf8_lossy(&buffer);
            let line = text.trim_end();
            if line.is_empty() {
                offset = next_offset;
                continue;
            }

            let event = Event::new(
                line,
                Metadata {
                    source: key.clone(),
                    host: self.context.host.clone(),
                    tag: self.context.tag.clone(),
                    line_num: state.last_read_line + 1,
                    input_source: self.context.input_name.clone(),
                },
            );

            let delivered = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => false,
                sent = self.event_tx.send(event) => sent.is_ok(),
            };
            if !delivered {
                interrupted = true;
                break;
            }

            state.last_read_line += 1;
            offset = next_offset;
            lines += 1;
        }

        state.offset = offset;
        state.updated_at = chrono::Utc::now();
        if self.still_same_file(path, state.inode).await {
            self.states.insert(state.clone());
            self.persist(PersistOp::Upsert(state));
        } else {
            // The watcher already dropped this file's state; recording it would resurrect it.
            debug!(path = %path.display(), inode = state.inode, "file replaced during read pass; progress not recorded");
        }

        LINES_READ_TOTAL
            .with_label_values(&[&self.context.input_name])
            .inc_by(lines);

        debug!(
            path = %path.display(),
            lines,
            offset,
            interrupted,
            "read pass finished"
        );

        Ok(ReadOutcome {
            lines,
            offset,
            interrupted,
        })
    }

    /// Runs [`read_file`](Self::read_file) and logs instead of returning errors.
    pub async fn read_pass(&self, path: PathBuf) {
        match self.read_file(&path).await {
            Ok(_) => READ_PASSES_TOTAL.with_label_values(&["ok"]).inc(),
            Err(err) => {
                READ_PASSES_TOTAL.with_label_values(&["error"]).inc();
                warn!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "read pass aborted; will retry on next change"
                );
            }
        }
    }

    async fn resolve_state(&self, key: &str, inode: u64) -> Result<FileState> {
        if let Some(state) = self.states.get(key) {
            if state.inode == inode {
                return Ok(state);
            }
            debug!(path = key, old_inode = state.inode, inode, "inode changed since last pass");
            self.states.remove(key);
        }

        let Some(store) = &self.store else {
            return Ok(FileState::new(key, inode));
        };

        // Deletes queued by the watcher for a vanished or rotated file must land before the
        // lookup, or a reused inode would pick up the old file's offset.
        self.wait_for_persisted().await?;

        match store.get_file_state(key, inode).await {
            Ok(state) => {
                info!(
                    path = key,
                    offset = state.offset,
                    last_read_line = state.last_read_line,
                    "resuming from persisted state"
                );
                Ok(state)
            }
            Err(err) if err.is_not_found() => Ok(FileState::new(key, inode)),
            Err(err) => Err(err).with_context(|| format!("failed to load state for {key}")),
        }
    }

    fn persist(&self, op: PersistOp) {
        if let Some(tx) = &self.persist_tx {
            if tx.send(op).is_err() {
                debug!("state persister stopped; keeping progress in memory only");
            }
        }
    }

    async fn wait_for_persisted(&self) -> Result<()> {
        let Some(tx) = &self.persist_tx else {
            return Ok(());
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(PersistOp::Barrier(ack_tx)).is_err() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => bail!("cancelled while waiting for state persistence"),
            // A dropped ack means the persister is gone; nothing more will land.
            _ = ack_rx => Ok(()),
        }
    }

    async fn still_same_file(&self, path: &Path, inode: u64) -> bool {
        match fs::metadata(path).await {
            Ok(metadata) => inode_of(&metadata) == inode,
            Err(_) => false,
        }
    }

    fn read_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.read_locks)
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    /// Drops the path's lock once no other pass holds or waits on it.
    fn release_read_lock(&self, path: &Path, path_lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = lock(&self.read_locks);
        // One reference in the map, one held by the caller.
        if Arc::strong_count(path_lock) == 2 {
            locks.remove(path);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        lock(&self.read_locks).len()
    }
}

/// Single consumer of [`PersistOp`]s; batches upserts into repository transactions.
pub struct StatePersister {
    store: FileStateStore,
    pending: HashMap<(String, u64), FileState>,
}

impl StatePersister {
    pub fn new(store: FileStateStore) -> Self {
        Self {
            store,
            pending: HashMap::new(),
        }
    }

    /// Consumes operations until every sender is dropped, then writes what is left.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PersistOp>) {
        let mut ticker = interval(PERSIST_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                op = rx.recv() => match op {
                    Some(PersistOp::Upsert(state)) => {
                        self.pending.insert((state.path.clone(), state.inode), state);
                        if self.pending.len() >= PERSIST_BATCH_SIZE {
                            self.flush().await;
                        }
                    }
                    Some(PersistOp::Delete { path, inode }) => {
                        self.pending.remove(&(path.clone(), inode));
                        self.flush().await;
                        if let Err(err) = self.store.delete_file_state(&path, inode).await {
                            STATE_PERSIST_ERRORS_TOTAL.with_label_values(&["delete"]).inc();
                            error!(path = %path, inode, error = %err, "failed to delete stale file state");
                        }
                    }
                    Some(PersistOp::Barrier(ack)) => {
                        self.flush().await;
                        let _ = ack.send(());
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }

        self.flush().await;
        debug!("state persister stopped");
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let batch: Vec<FileState> = self.pending.values().cloned().collect();
        let count = batch.len();
        match self.store.batch_upsert_file_states(batch).await {
            Ok(()) => {
                self.pending.clear();
                debug!(count, "persisted file states");
            }
            Err(err) => {
                // Keep the batch; newer progress for the same file replaces it before the retry.
                STATE_PERSIST_ERRORS_TOTAL.with_label_values(&["upsert"]).inc();
                error!(count, error = %err, "failed to persist file states");
            }
        }
    }
}
