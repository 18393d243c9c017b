//! Durable per-file tailing progress.
//!
//! Rows are keyed by `(path, inodenumber)`: a rotated file at the same path has a new inode
//! and therefore its own row. Each call opens its own WAL-mode connection on the blocking
//! pool, so readers never wait on the writer; writes are funnelled through a single
//! persistence worker by the tail input.

use crate::error::StoreError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Progress for one physical file instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub path: String,
    /// Byte offset of the next unread byte.
    pub offset: u64,
    /// Number of lines delivered so far.
    pub last_read_line: u64,
    pub inode: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileState {
    pub fn new(path: impl Into<String>, inode: u64) -> Self {
        let now = now_millis();
        Self {
            path: path.into(),
            offset: 0,
            last_read_line: 0,
            inode,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rewinds to the start of the file, keeping identity and creation time.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.last_read_line = 0;
        self.updated_at = now_millis();
    }
}

/// Work for the persistence worker, applied in send order.
#[derive(Debug)]
pub enum PersistOp {
    Upsert(FileState),
    Delete { path: String, inode: u64 },
    /// Acknowledged once everything queued before it has reached the repository.
    Barrier(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: Arc<PathBuf>,
    closed: Arc<AtomicBool>,
}

impl FileStateStore {
    /// Opens (creating if needed) the database at `path` and ensures the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = open_connection(&path)?;
        initialize_schema(&conn)?;

        Ok(Self {
            path: Arc::new(path),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.path
    }

    /// Idempotent schema creation.
    pub async fn create_tables(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| initialize_schema(conn)).await
    }

    pub async fn get_file_state(&self, path: &str, inode: u64) -> Result<FileState, StoreError> {
        let key = path.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "
                SELECT path, offset, lastReadLine, inodenumber, created_at, updated_at
                FROM tail_files
                WHERE path = ?1 AND inodenumber = ?2
                ",
            )?;

            let state = stmt
                .query_row(params![key, inode as i64], |row| {
                    Ok(FileState {
                        path: row.get(0)?,
                        offset: row.get::<_, i64>(1)? as u64,
                        last_read_line: row.get::<_, i64>(2)? as u64,
                        inode: row.get::<_, i64>(3)? as u64,
                        created_at: from_millis(row.get(4)?),
                        updated_at: from_millis(row.get(5)?),
                    })
                })
                .optional()?;

            state.ok_or(StoreError::NotFound { path: key, inode })
        })
        .await
    }

    /// Writes all states in one transaction; either every row lands or none does.
    pub async fn batch_upsert_file_states(&self, states: Vec<FileState>) -> Result<(), StoreError> {
        if states.is_empty() {
            return Ok(());
        }

        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "
                    INSERT INTO tail_files (
                        path,
                        offset,
                        lastReadLine,
                        inodenumber,
                        created_at,
                        updated_at
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT(path, inodenumber) DO UPDATE SET
                        offset = excluded.offset,
                        lastReadLine = excluded.lastReadLine,
                        updated_at = excluded.updated_at
                    ",
                )?;
                for state in &states {
                    stmt.execute(params![
                        state.path,
                        state.offset as i64,
                        state.last_read_line as i64,
                        state.inode as i64,
                        state.created_at.timestamp_millis(),
                        state.updated_at.timestamp_millis(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn delete_file_state(&self, path: &str, inode: u64) -> Result<(), StoreError> {
        let key = path.to_string();
        self.with_connection(move |conn| {
            conn.execute(
                "DELETE FROM tail_files WHERE path = ?1 AND inodenumber = ?2",
                params![key, inode as i64],
            )?;
            Ok(())
        })
        .await
    }

    /// Removes rows not updated within `threshold_days`; returns how many were deleted.
    pub async fn cleanup_old_entries(&self, threshold_days: u32) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(threshold_days));
        self.with_connection(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM tail_files WHERE updated_at < ?1",
                params![cutoff.timestamp_millis()],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    /// Marks the store closed; later calls fail with [`StoreError::Closed`].
    pub fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn with_connection<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let db_path = self.path.clone();
        task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            op(&mut conn)
        })
        .await?
    }
}

/// In-memory view of the active [`FileState`] per path.
///
/// Readers update it after every pass; the watcher evicts an entry when it sees the path
/// rotated or truncated, which makes the next read pass consult the repository again.
#[derive(Debug, Clone, Default)]
pub struct StateCache {
    inner: Arc<Mutex<HashMap<String, FileState>>>,
}

impl StateCache {
    pub fn get(&self, path: &str) -> Option<FileState> {
        self.lock().get(path).cloned()
    }

    pub fn insert(&self, state: FileState) {
        self.lock().insert(state.path.clone(), state);
    }

    pub fn remove(&self, path: &str) -> Option<FileState> {
        self.lock().remove(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, FileState>> {
        // A panic while holding the lock cannot leave a half-written FileState behind.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tail_files (
            path TEXT NOT NULL,
            offset INTEGER NOT NULL,
            lastReadLine INTEGER NOT NULL,
            inodenumber INTEGER NOT NULL,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL,
            PRIMARY KEY (path, inodenumber)
        );
        ",
    )?;
    Ok(())
}

// Timestamps are stored as unix milliseconds; truncate in memory too so a row reads back equal.
fn now_millis() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
