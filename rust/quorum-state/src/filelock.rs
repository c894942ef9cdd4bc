//! Global file lock for cross-process coordination.
//!
//! The lock is a JSON sidecar file next to the database recording
//! `{pid, hostname, acquired_at}`. It is advisory: cooperating processes
//! acquire it before exclusive maintenance work, and a stale lock (holder
//! dead, or past its TTL) is broken before a fresh acquire. Durability of
//! saves never depends on holding this lock.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};
use crate::fsatomic::within_state_dir;
use crate::process;

/// On-disk contents of the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFile {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

/// Acquire the global lock, breaking a stale one if present.
///
/// # Errors
///
/// Returns [`StateError::LockAcquireFailed`] when the lock is held by a
/// live process within its TTL, or when the file appears concurrently
/// between the staleness check and the exclusive create.
pub fn acquire(state_dir: &Path, lock_path: &Path, ttl: Duration) -> Result<()> {
    let lock_path = within_state_dir(state_dir, lock_path)?;

    match fs::read(&lock_path) {
        Ok(bytes) => {
            if let Some(holder) = parse_holder(&bytes, &lock_path) {
                if holder_is_live(&holder, ttl) {
                    return Err(StateError::LockAcquireFailed(format!(
                        "held by pid {} on {} since {}",
                        holder.pid, holder.hostname, holder.acquired_at
                    )));
                }
                tracing::warn!(
                    pid = holder.pid,
                    hostname = %holder.hostname,
                    "breaking stale state lock"
                );
            }
            fs::remove_file(&lock_path)?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let payload = serde_json::to_vec_pretty(&LockFile {
        pid: process::current_pid(),
        hostname: process::hostname(),
        acquired_at: Utc::now(),
    })?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    match options.open(&lock_path) {
        Ok(mut file) => {
            file.write_all(&payload)?;
            file.sync_all()?;
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(
            StateError::LockAcquireFailed("lock file appeared concurrently".to_string()),
        ),
        Err(err) => Err(err.into()),
    }
}

/// Release the global lock.
///
/// Releasing a lock that does not exist succeeds; releasing one held by a
/// different pid fails with [`StateError::LockReleaseFailed`].
pub fn release(state_dir: &Path, lock_path: &Path) -> Result<()> {
    let lock_path = within_state_dir(state_dir, lock_path)?;

    let bytes = match fs::read(&lock_path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    let holder: LockFile = serde_json::from_slice(&bytes).map_err(|err| {
        StateError::LockReleaseFailed(format!("unreadable lock file: {err}"))
    })?;
    if holder.pid != process::current_pid() {
        return Err(StateError::LockReleaseFailed(format!(
            "lock held by pid {}, not this process",
            holder.pid
        )));
    }

    fs::remove_file(&lock_path)?;
    Ok(())
}

fn parse_holder(bytes: &[u8], lock_path: &Path) -> Option<LockFile> {
    match serde_json::from_slice(bytes) {
        Ok(holder) => Some(holder),
        Err(err) => {
            tracing::warn!(
                path = %lock_path.display(),
                error = %err,
                "discarding unparseable lock file"
            );
            None
        }
    }
}

fn holder_is_live(holder: &LockFile, ttl: Duration) -> bool {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    let within_ttl = Utc::now() - holder.acquired_at < ttl;
    if !within_ttl {
        return false;
    }
    // Pid liveness is only probeable on the local host; a foreign holder
    // inside its TTL is assumed live.
    if holder.hostname == process::hostname() {
        process::pid_alive(holder.pid)
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(3600);

    fn lock_path(dir: &Path) -> std::path::PathBuf {
        dir.join("state.db.lock")
    }

    fn write_lock(dir: &Path, holder: &LockFile) {
        fs::write(lock_path(dir), serde_json::to_vec(holder).unwrap()).unwrap();
    }

    #[test]
    fn acquire_release_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        acquire(dir.path(), &lock_path(dir.path()), TTL).unwrap();
        assert!(lock_path(dir.path()).exists());
        release(dir.path(), &lock_path(dir.path())).unwrap();
        assert!(!lock_path(dir.path()).exists());
    }

    #[test]
    fn acquire_fails_when_held_by_live_process() {
        let dir = tempfile::tempdir().unwrap();
        write_lock(
            dir.path(),
            &LockFile {
                pid: process::current_pid(),
                hostname: process::hostname(),
                acquired_at: Utc::now(),
            },
        );

        let err = acquire(dir.path(), &lock_path(dir.path()), TTL).unwrap_err();
        assert!(matches!(err, StateError::LockAcquireFailed(_)));
    }

    #[test]
    fn acquire_breaks_expired_lock() {
        let dir = tempfile::tempdir().unwrap();
        write_lock(
            dir.path(),
            &LockFile {
                pid: process::current_pid(),
                hostname: process::hostname(),
                acquired_at: Utc::now() - chrono::Duration::hours(2),
            },
        );

        acquire(dir.path(), &lock_path(dir.path()), TTL).unwrap();
        release(dir.path(), &lock_path(dir.path())).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn acquire_breaks_lock_of_dead_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        write_lock(
            dir.path(),
            &LockFile {
                pid: dead_pid,
                hostname: process::hostname(),
                acquired_at: Utc::now(),
            },
        );

        acquire(dir.path(), &lock_path(dir.path()), TTL).unwrap();
    }

    #[test]
    fn release_by_non_owner_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_lock(
            dir.path(),
            &LockFile {
                pid: process::current_pid().wrapping_add(1),
                hostname: process::hostname(),
                acquired_at: Utc::now(),
            },
        );

        let err = release(dir.path(), &lock_path(dir.path())).unwrap_err();
        assert!(matches!(err, StateError::LockReleaseFailed(_)));
    }

    #[test]
    fn release_without_lock_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        release(dir.path(), &lock_path(dir.path())).unwrap();
    }

    #[test]
    fn lock_path_outside_state_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = acquire(dir.path(), Path::new("/tmp/elsewhere.lock"), TTL).unwrap_err();
        assert!(matches!(err, StateError::PathOutsideStateDir(_)));
    }
}
