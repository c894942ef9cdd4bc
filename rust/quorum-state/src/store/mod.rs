//! The state store facade.
//!
//! [`StateStore`] owns the connection manager, the in-process operation
//! lock and the retry policy, and exposes every public operation of the
//! engine. Construction opens the database, applies migrations and runs a
//! startup consistency repair; everything else happens through the
//! operation methods defined in the submodules.

mod active;
mod archive;
mod atomic_ctx;
mod backup;
mod kanban;
mod locks;
mod prompts;
mod running;
mod save;

pub use atomic_ctx::AtomicContext;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::RwLock;
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionManager;
use crate::error::{Result, StateError};
use crate::filelock;
use crate::fsatomic;
use crate::migrations;
use crate::options::StoreOptions;
use crate::retry::RetryPolicy;

/// Persistent workflow state store.
///
/// One instance owns a single local data directory: the database file, its
/// backup and lock sidecars, and the archive subdirectory. The store is
/// safe to share across tasks; writes are totally ordered by an internal
/// read-write lock and reads run concurrently against a reader pool.
pub struct StateStore {
    state_dir: PathBuf,
    db_path: PathBuf,
    backup_path: PathBuf,
    lock_path: PathBuf,
    lock_ttl: std::time::Duration,
    conns: Arc<ConnectionManager>,
    op_lock: RwLock<()>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("db_path", &self.db_path)
            .field("state_dir", &self.state_dir)
            .finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open a store with default options for the given database path.
    pub async fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_options(StoreOptions::new(db_path)).await
    }

    /// Open a store with explicit options.
    ///
    /// Creates the state directory if needed, opens the writer connection,
    /// applies pending migrations and repairs a dangling active-workflow
    /// pointer. Repair failures are logged, not fatal.
    pub async fn with_options(options: StoreOptions) -> Result<Self> {
        let (state_dir, db_path) = resolve_db_path(&options.db_path)?;
        let backup_path = options.backup_path_for(&db_path);
        let lock_path = options.lock_path_for(&db_path);
        let retry = RetryPolicy {
            max_retries: options.max_retries,
            base_wait: options.base_retry_wait,
        };

        let conns = {
            let db_path = db_path.clone();
            task::spawn_blocking(move || -> Result<Arc<ConnectionManager>> {
                let conns = Arc::new(ConnectionManager::open(&db_path)?);
                conns.with_writer(|conn| {
                    migrations::run_migrations(conn)?;
                    // Startup consistency repair: a dangling or terminal
                    // active pointer is cleared before the store is used.
                    if let Err(err) = active::validate_and_repair_active(conn) {
                        tracing::warn!(error = %err, "startup active-workflow repair failed");
                    }
                    Ok(())
                })?;
                Ok(conns)
            })
            .await
            .map_err(|e| StateError::Other(anyhow::anyhow!("store open panicked: {e}")))??
        };

        tracing::debug!(db_path = %db_path.display(), "state store opened");

        Ok(Self {
            state_dir,
            db_path,
            backup_path,
            lock_path,
            lock_ttl: options.lock_ttl,
            conns,
            op_lock: RwLock::new(()),
            retry,
        })
    }

    /// The directory owning all durable state.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Path of the backing database file.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Close reader and writer connections.
    ///
    /// Errors from both phases are collected; the first is returned.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.op_lock.write().await;
        let conns = Arc::clone(&self.conns);
        task::spawn_blocking(move || conns.close())
            .await
            .map_err(|e| StateError::Other(anyhow::anyhow!("store close panicked: {e}")))?
    }

    /// Acquire the global advisory lock for this state directory.
    ///
    /// Fails with [`StateError::LockAcquireFailed`] when another live
    /// process holds it within the TTL; otherwise the stale lock is broken.
    pub async fn acquire_lock(&self) -> Result<()> {
        let state_dir = self.state_dir.clone();
        let lock_path = self.lock_path.clone();
        let ttl = self.lock_ttl;
        task::spawn_blocking(move || filelock::acquire(&state_dir, &lock_path, ttl))
            .await
            .map_err(|e| StateError::Other(anyhow::anyhow!("lock acquire panicked: {e}")))?
    }

    /// Release the global advisory lock. Idempotent when not held.
    pub async fn release_lock(&self) -> Result<()> {
        let state_dir = self.state_dir.clone();
        let lock_path = self.lock_path.clone();
        task::spawn_blocking(move || filelock::release(&state_dir, &lock_path))
            .await
            .map_err(|e| StateError::Other(anyhow::anyhow!("lock release panicked: {e}")))?
    }

    /// Run a read-only closure against the reader pool, holding the read
    /// side of the operation lock.
    pub(crate) async fn run_read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _guard = self.op_lock.read().await;
        self.read_unlocked(f).await
    }

    /// Reader access without the operation lock, for callers that already
    /// hold the write side.
    pub(crate) async fn read_unlocked<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conns = Arc::clone(&self.conns);
        task::spawn_blocking(move || conns.with_reader(f))
            .await
            .map_err(|e| StateError::Other(anyhow::anyhow!("blocking read panicked: {e}")))?
    }

    /// Run a mutating closure under the write lock and the busy-retry
    /// executor.
    pub(crate) async fn run_write<T, F>(
        &self,
        op: &'static str,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T>
    where
        F: Fn(&mut Connection) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let _guard = self.op_lock.write().await;
        self.write_unlocked(op, cancel, f).await
    }

    /// Writer access without taking the operation lock, for callers that
    /// already hold the write side.
    pub(crate) async fn write_unlocked<T, F>(
        &self,
        op: &'static str,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T>
    where
        F: Fn(&mut Connection) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let conns = Arc::clone(&self.conns);
        self.retry
            .run_write(op, cancel, move || conns.with_writer(|conn| f(conn)))
            .await
    }

    pub(crate) fn conns(&self) -> &Arc<ConnectionManager> {
        &self.conns
    }

    pub(crate) fn op_lock(&self) -> &RwLock<()> {
        &self.op_lock
    }

    pub(crate) fn lock_ttl(&self) -> std::time::Duration {
        self.lock_ttl
    }

    pub(crate) fn backup_path(&self) -> &Path {
        &self.backup_path
    }
}

/// Resolve the database path to an absolute location and create its state
/// directory.
fn resolve_db_path(db_path: &Path) -> Result<(PathBuf, PathBuf)> {
    let parent = match db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fsatomic::create_dir_restricted(&parent)?;
    let state_dir = parent.canonicalize()?;
    let file_name = db_path
        .file_name()
        .ok_or_else(|| StateError::Other(anyhow::anyhow!("database path has no file name")))?;
    Ok((state_dir.clone(), state_dir.join(file_name)))
}
