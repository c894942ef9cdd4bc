//! Construction options for the state store.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Options accepted by [`StateStore::with_options`](crate::StateStore::with_options).
///
/// Only the database path is required; the backup and lock paths default to
/// sidecars next to the database.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Path of the backing database file.
    pub db_path: PathBuf,
    /// Backup artifact location; defaults to `<db_path>.bak`.
    pub backup_path: Option<PathBuf>,
    /// Global lock file location; defaults to `<db_path>.lock`.
    pub lock_path: Option<PathBuf>,
    /// TTL after which a global or per-workflow lock is considered stale.
    pub lock_ttl: Duration,
    /// Busy retries after the initial write attempt.
    pub max_retries: u32,
    /// First busy backoff sleep; doubles per retry.
    pub base_retry_wait: Duration,
}

impl StoreOptions {
    /// Options with defaults for the given database path.
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            backup_path: None,
            lock_path: None,
            lock_ttl: Duration::from_secs(3600),
            max_retries: 5,
            base_retry_wait: Duration::from_millis(100),
        }
    }

    /// Override the backup artifact location.
    #[must_use]
    pub fn with_backup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_path = Some(path.into());
        self
    }

    /// Override the global lock file location.
    #[must_use]
    pub fn with_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = Some(path.into());
        self
    }

    /// Override the lock staleness TTL.
    #[must_use]
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Override the busy retry count.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Override the base busy backoff wait.
    #[must_use]
    pub fn with_base_retry_wait(mut self, wait: Duration) -> Self {
        self.base_retry_wait = wait;
        self
    }

    pub(crate) fn backup_path_for(&self, db_path: &Path) -> PathBuf {
        self.backup_path
            .clone()
            .unwrap_or_else(|| sidecar(db_path, ".bak"))
    }

    pub(crate) fn lock_path_for(&self, db_path: &Path) -> PathBuf {
        self.lock_path
            .clone()
            .unwrap_or_else(|| sidecar(db_path, ".lock"))
    }
}

/// `path` with `suffix` appended to the full file name.
pub(crate) fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Per-save behavior switches for [`StateStore::save_with`](crate::StateStore::save_with).
#[derive(Debug, Clone, Copy)]
pub struct SaveOptions {
    /// Keep the supplied `updated_at` instead of stamping now.
    pub preserve_updated_at: bool,
    /// Skip the automatic completed-to-`to_verify` board transition.
    pub disable_auto_kanban: bool,
    /// Point the active-workflow singleton at this workflow.
    pub set_as_active: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            preserve_updated_at: false,
            disable_auto_kanban: false,
            set_as_active: true,
        }
    }
}
