//! Connection management for the backing `SQLite` database.
//!
//! Exactly one writer connection serializes durable changes; a pool of
//! read-only connections serves all non-mutating queries. The writer is
//! opened with WAL journaling, foreign-key enforcement and a 5 s busy
//! timeout; readers get a 1 s busy timeout. Connections are long-lived and
//! shared behind mutexes, and all access happens from blocking closures on
//! the tokio blocking pool.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use crate::error::{Result, StateError};
use crate::fsatomic;

/// Maximum number of idle pooled reader connections.
const MAX_READERS: usize = 10;

/// Busy timeout for the single writer connection.
const WRITER_BUSY_TIMEOUT_MS: i64 = 5_000;

/// Busy timeout for pooled reader connections.
const READER_BUSY_TIMEOUT_MS: i64 = 1_000;

/// Owner of the writer connection and the reader pool.
pub struct ConnectionManager {
    db_path: PathBuf,
    writer: Mutex<Option<Connection>>,
    readers: Mutex<Vec<Connection>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("db_path", &self.db_path)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("pooled_readers", &self.readers.lock().len())
            .finish()
    }
}

impl ConnectionManager {
    /// Open the writer connection and prepare the reader pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or configured; a
    /// partially configured handle is closed before returning.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fsatomic::create_dir_restricted(parent)?;
        }
        let writer = open_writer(db_path)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
            writer: Mutex::new(Some(writer)),
            readers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Path of the backing database file.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run `f` against the single writer connection.
    ///
    /// Callers must already be on the blocking pool; the writer mutex is
    /// held for the duration of `f`, which is what serializes durable
    /// changes within the process.
    pub fn with_writer<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.writer.lock();
        let conn = guard.as_mut().ok_or(StateError::Closed)?;
        f(conn)
    }

    /// Run `f` against a pooled read-only connection.
    ///
    /// A connection is checked out of the pool (or opened on demand) and
    /// returned afterwards; at most [`MAX_READERS`] idle readers are kept.
    pub fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StateError::Closed);
        }
        let conn = match self.readers.lock().pop() {
            Some(conn) => conn,
            None => open_reader(&self.db_path)?,
        };
        let result = f(&conn);
        let mut pool = self.readers.lock();
        if pool.len() < MAX_READERS && !self.closed.load(Ordering::SeqCst) {
            pool.push(conn);
        }
        result
    }

    /// Release reader connections, then the writer.
    ///
    /// Errors from both phases are collected; the first one is returned
    /// after every connection has been closed.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let mut first_error = None;

        for conn in self.readers.lock().drain(..) {
            if let Err((_, err)) = conn.close() {
                first_error.get_or_insert(StateError::Sql(err));
            }
        }
        if let Some(conn) = self.writer.lock().take() {
            if let Err((_, err)) = conn.close() {
                first_error.get_or_insert(StateError::Sql(err));
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Re-open the writer after a [`close`](Self::close), with the original
    /// pragmas. Used by restore after the database file has been swapped.
    pub fn reopen(&self) -> Result<()> {
        let writer = open_writer(&self.db_path)?;
        *self.writer.lock() = Some(writer);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn open_writer(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    if let Err(err) = configure(&conn, WRITER_BUSY_TIMEOUT_MS, true) {
        let _ = conn.close();
        return Err(err);
    }
    Ok(conn)
}

fn open_reader(db_path: &Path) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(db_path, flags)?;
    if let Err(err) = configure(&conn, READER_BUSY_TIMEOUT_MS, false) {
        let _ = conn.close();
        return Err(err);
    }
    Ok(conn)
}

fn configure(conn: &Connection, busy_timeout_ms: i64, writer: bool) -> Result<()> {
    if writer {
        // WAL survives in the database file; setting it once on the writer
        // is enough, and read-only handles cannot change the journal mode.
        conn.pragma_update(None, "journal_mode", "WAL")?;
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", busy_timeout_ms)?;
    Ok(())
}
