//! Reusable SQLite handles for a single database file.
//!
//! Handles are checked out with [`ConnectionPool::acquire`] and go back to the
//! idle set when the [`PooledConnection`] guard is dropped. The pool also owns
//! the write lock that serializes every durable mutation across all handles.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::error::{Result, StoreError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ConnectionPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    write_lock: Mutex<()>,
}

impl ConnectionPool {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            idle: Mutex::new(Vec::new()),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check out a handle, opening a new one if none are idle.
    ///
    /// Never fails: if the open call fails the guard is still returned and
    /// every use of it reports [`StoreError::Connection`].
    pub fn acquire(self: &Arc<Self>) -> PooledConnection {
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let (conn, open_error) = match reused {
            Some(conn) => (Some(conn), None),
            None => match open_connection(&self.path) {
                Ok(conn) => {
                    tracing::debug!(path = %self.path.display(), "Opened new pooled connection");
                    (Some(conn), None)
                }
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "Couldn't open database");
                    (None, Some(e.to_string()))
                }
            },
        };

        PooledConnection {
            pool: Arc::clone(self),
            conn,
            open_error,
        }
    }

    /// Open a handle that is owned outright rather than pooled (used by the
    /// write worker, which keeps its connection for its whole lifetime).
    pub fn open_dedicated(&self) -> Result<Connection> {
        open_connection(&self.path).map_err(|e| StoreError::Connection(e.to_string()))
    }

    /// The single lock serializing writers across all handles.
    pub fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn idle_count(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn release(&self, conn: Connection) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn);
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

/// Scoped handle checked out from a [`ConnectionPool`].
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    conn: Option<Connection>,
    open_error: Option<String>,
}

impl PooledConnection {
    pub fn get(&self) -> Result<&Connection> {
        match &self.conn {
            Some(conn) => Ok(conn),
            None => Err(self.connection_error()),
        }
    }

    pub fn get_mut(&mut self) -> Result<&mut Connection> {
        if self.conn.is_none() {
            return Err(self.connection_error());
        }
        self.conn.as_mut().ok_or_else(|| StoreError::Connection("no handle".into()))
    }

    fn connection_error(&self) -> StoreError {
        StoreError::Connection(
            self.open_error
                .clone()
                .unwrap_or_else(|| "handle was never opened".to_string()),
        )
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
