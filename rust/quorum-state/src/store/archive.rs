//! Archive export and the report-directory reaper.
//!
//! Archiving exports every terminal workflow (except the active one) to a
//! checksummed envelope file, and only after every export has landed does
//! one transaction delete the archived rows. A crash between export and
//! delete is safe to re-run: envelope files are written atomically and
//! overwritten.

use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, TransactionBehavior};
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::envelope::StateEnvelope;
use crate::error::{Result, StateError};
use crate::fsatomic;
use crate::store::active::read_active;
use crate::store::save::read_aggregate;
use crate::store::StateStore;

/// Fixed prefix under which report directories are honored and reaped.
const REPORT_ROOT: &str = ".quorum";

impl StateStore {
    /// Export completed and failed workflows to `archive/<id>.json`, then
    /// delete them from the live store in one transaction.
    ///
    /// The active workflow is never archived. Returns the number of
    /// archived workflows; on any export error nothing is deleted.
    pub async fn archive_workflows(&self, cancel: &CancellationToken) -> Result<u64> {
        let _guard = self.op_lock().write().await;

        // Collect candidates and export envelopes before touching rows.
        let conns = std::sync::Arc::clone(self.conns());
        let archive_dir = fsatomic::within_state_dir(self.state_dir(), Path::new("archive"))?;
        let state_dir = self.state_dir().to_path_buf();
        let archived: Vec<String> = task::spawn_blocking(move || -> Result<Vec<String>> {
            conns.with_reader(|conn| {
                let active = read_active(conn)?.unwrap_or_default();
                let mut stmt = conn.prepare_cached(
                    "SELECT id FROM workflows \
                     WHERE status IN ('completed', 'failed') AND id <> ?1 \
                     ORDER BY updated_at",
                )?;
                let ids = stmt
                    .query_map(params![active], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let mut exported = Vec::with_capacity(ids.len());
                for id in ids {
                    let Some(state) = read_aggregate(conn, &id)? else {
                        continue;
                    };
                    let envelope = StateEnvelope::seal(state, Utc::now())?;
                    let target =
                        fsatomic::within_state_dir(&state_dir, &archive_dir.join(format!("{id}.json")))?;
                    fsatomic::atomic_write(&target, &envelope.to_pretty_json()?, 0o640)?;
                    exported.push(id);
                }
                Ok(exported)
            })
        })
        .await
        .map_err(|e| StateError::Other(anyhow::anyhow!("archive export panicked: {e}")))??;

        if archived.is_empty() {
            return Ok(0);
        }

        let count = u64::try_from(archived.len()).unwrap_or(u64::MAX);
        let ids = archived;
        self.write_unlocked("archive_workflows", cancel, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for id in &ids {
                tx.execute("DELETE FROM checkpoints WHERE workflow_id = ?1", params![id])?;
                tx.execute("DELETE FROM tasks WHERE workflow_id = ?1", params![id])?;
                tx.execute("DELETE FROM workflows WHERE id = ?1", params![id])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        tracing::debug!(count, "archived terminal workflows");
        Ok(count)
    }
}

/// Best-effort removal of a workflow's report directory.
///
/// The stored `report_path` is honored only when it is relative, rooted at
/// `.quorum` and free of `..` components; anything else falls back to
/// `.quorum/runs/<basename(workflow_id)>`. Never errors.
pub(crate) fn reap_report_dir(state_dir: &Path, workflow_id: &str, report_path: &str) {
    let target = resolve_report_dir(state_dir, workflow_id, report_path);
    match std::fs::remove_dir_all(&target) {
        Ok(()) => {
            tracing::debug!(path = %target.display(), "removed report directory");
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(
                path = %target.display(),
                error = %err,
                "failed to remove report directory"
            );
        }
    }
}

fn resolve_report_dir(state_dir: &Path, workflow_id: &str, report_path: &str) -> PathBuf {
    let candidate = Path::new(report_path);
    let honored = !report_path.is_empty()
        && candidate.is_relative()
        && candidate.components().next() == Some(Component::Normal(REPORT_ROOT.as_ref()))
        && !candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir));
    if honored {
        state_dir.join(candidate)
    } else {
        let base = Path::new(workflow_id)
            .file_name()
            .map_or_else(|| workflow_id.to_string(), |n| n.to_string_lossy().into_owned());
        state_dir.join(REPORT_ROOT).join("runs").join(base)
    }
}
