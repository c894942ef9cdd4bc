//! Backup and restore of the backing database.
//!
//! Backup uses `VACUUM INTO` for a consistent single-file copy. Restore
//! closes both connection pools, copies the backup over the live database,
//! reopens with the original pragmas and returns the active workflow.

use std::fs;

use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StateError};
use crate::fsatomic;
use crate::model::WorkflowState;
use crate::options::sidecar;
use crate::store::save::read_aggregate;
use crate::store::{active, StateStore};

impl StateStore {
    /// Write a consistent copy of the database to the backup path.
    ///
    /// Returns the backup location. The destination must resolve inside
    /// the state directory.
    pub async fn backup(&self, cancel: &CancellationToken) -> Result<std::path::PathBuf> {
        let _guard = self.op_lock().write().await;
        let backup_path = fsatomic::within_state_dir(self.state_dir(), self.backup_path())?;

        let target = backup_path.clone();
        self.write_unlocked("backup", cancel, move |conn| {
            // VACUUM INTO refuses to overwrite; clear the previous artifact.
            match fs::remove_file(&target) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            conn.execute(
                "VACUUM INTO ?1",
                rusqlite::params![target.to_string_lossy().into_owned()],
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(path = %backup_path.display(), "database backup written");
        Ok(backup_path)
    }

    /// Replace the live database with the backup and reopen connections.
    ///
    /// Returns the active workflow of the restored state, or `None`.
    ///
    /// # Errors
    ///
    /// Fails when no backup artifact exists or the backup path escapes the
    /// state directory.
    pub async fn restore(&self, cancel: &CancellationToken) -> Result<Option<WorkflowState>> {
        let _guard = self.op_lock().write().await;
        if cancel.is_cancelled() {
            return Err(StateError::Cancelled {
                op: "restore".to_string(),
                last_error: "cancelled before execution".to_string(),
            });
        }

        let backup_path = fsatomic::within_state_dir(self.state_dir(), self.backup_path())?;
        let conns = std::sync::Arc::clone(self.conns());
        let db_path = self.db_path().to_path_buf();

        task::spawn_blocking(move || -> Result<Option<WorkflowState>> {
            if !backup_path.is_file() {
                return Err(StateError::not_found(
                    "backup",
                    backup_path.display().to_string(),
                ));
            }

            conns.close()?;
            // Stale WAL sidecars would shadow the restored file.
            for suffix in ["-wal", "-shm"] {
                match fs::remove_file(sidecar(&db_path, suffix)) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            fs::copy(&backup_path, &db_path)?;
            conns.reopen()?;

            conns.with_writer(|conn| {
                match active::validate_and_repair_active(conn)? {
                    Some(id) => read_aggregate(conn, &id),
                    None => Ok(None),
                }
            })
        })
        .await
        .map_err(|e| StateError::Other(anyhow::anyhow!("restore panicked: {e}")))?
    }
}
