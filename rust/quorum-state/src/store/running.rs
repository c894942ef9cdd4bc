//! Running-workflow registry, heartbeats and zombie detection.
//!
//! Each in-flight workflow owns one registry row stamped with the holder's
//! pid and host. Heartbeats advance `heartbeat_at`; a row whose heartbeat
//! is missing or older than the caller's threshold marks a zombie, and
//! duplicate registration is rejected outright.

use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StateError};
use crate::model::{fmt_ts, parse_ts, parse_ts_opt, RunningWorkflow, WorkflowState};
use crate::process;
use crate::store::save::read_aggregate;
use crate::store::StateStore;

impl StateStore {
    /// Register a workflow as running.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::WorkflowAlreadyRunning`] when a registry row
    /// already exists for the workflow.
    pub async fn set_workflow_running(
        &self,
        workflow_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = workflow_id.to_string();
        self.run_write("set_workflow_running", cancel, move |conn| {
            insert_running(conn, &id)
        })
        .await
    }

    /// Remove a workflow from the running registry. Idempotent.
    pub async fn clear_workflow_running(
        &self,
        workflow_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = workflow_id.to_string();
        self.run_write("clear_workflow_running", cancel, move |conn| {
            delete_running(conn, &id)
        })
        .await
    }

    /// Whether the workflow has a registry row.
    pub async fn is_workflow_running(&self, workflow_id: &str) -> Result<bool> {
        let id = workflow_id.to_string();
        self.run_read(move |conn| running_exists(conn, &id)).await
    }

    /// Advance the heartbeat of a running workflow to now.
    ///
    /// # Errors
    ///
    /// Returns the not-found error when the workflow is not registered as
    /// running; a heartbeat never resurrects an unregistered workflow.
    pub async fn update_workflow_heartbeat(
        &self,
        workflow_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = workflow_id.to_string();
        self.run_write("update_heartbeat", cancel, move |conn| {
            let updated = conn.execute(
                "UPDATE running_workflows SET heartbeat_at = ?1 WHERE workflow_id = ?2",
                params![fmt_ts(Utc::now()), id],
            )?;
            if updated == 0 {
                return Err(StateError::not_found("running workflow", id.clone()));
            }
            // Mirror onto the workflow row for observability; the registry
            // row is authoritative for zombie detection.
            conn.execute(
                "UPDATE workflows SET heartbeat_at = ?1 WHERE id = ?2",
                params![fmt_ts(Utc::now()), id],
            )?;
            Ok(())
        })
        .await
    }

    /// Ids of running workflows ordered by start time.
    pub async fn list_running_workflows(&self) -> Result<Vec<String>> {
        self.run_read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT workflow_id FROM running_workflows ORDER BY started_at",
            )?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
        .await
    }

    /// Full registry record for a workflow, or `None`.
    pub async fn running_workflow_record(
        &self,
        workflow_id: &str,
    ) -> Result<Option<RunningWorkflow>> {
        let id = workflow_id.to_string();
        self.run_read(move |conn| read_running(conn, &id)).await
    }

    /// Workflows whose registry row has a missing or stale heartbeat.
    ///
    /// Returns the full aggregates; registry rows whose workflow fails to
    /// load are skipped.
    pub async fn find_zombie_workflows(
        &self,
        threshold: Duration,
    ) -> Result<Vec<WorkflowState>> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| StateError::Other(anyhow::anyhow!("invalid zombie threshold: {e}")))?;
        self.run_read(move |conn| {
            let cutoff = fmt_ts(Utc::now() - threshold);
            let mut stmt = conn.prepare_cached(
                "SELECT workflow_id FROM running_workflows \
                 WHERE heartbeat_at IS NULL OR heartbeat_at < ?1 \
                 ORDER BY started_at",
            )?;
            let ids = stmt
                .query_map(params![cutoff], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut zombies = Vec::new();
            for id in ids {
                match read_aggregate(conn, &id) {
                    Ok(Some(state)) => zombies.push(state),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(
                            workflow_id = %id,
                            error = %err,
                            "skipping zombie candidate that failed to load"
                        );
                    }
                }
            }
            Ok(zombies)
        })
        .await
    }
}

pub(crate) fn insert_running(conn: &Connection, workflow_id: &str) -> Result<()> {
    let now = fmt_ts(Utc::now());
    let inserted = conn.execute(
        "INSERT INTO running_workflows \
         (workflow_id, started_at, lock_holder_pid, lock_holder_host, heartbeat_at) \
         VALUES (?1, ?2, ?3, ?4, ?2)",
        params![workflow_id, now, process::current_pid(), process::hostname()],
    );
    match inserted {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => Err(StateError::WorkflowAlreadyRunning(
            workflow_id.to_string(),
        )),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn delete_running(conn: &Connection, workflow_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM running_workflows WHERE workflow_id = ?1",
        params![workflow_id],
    )?;
    Ok(())
}

pub(crate) fn running_exists(conn: &Connection, workflow_id: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM running_workflows WHERE workflow_id = ?1)",
        params![workflow_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn read_running(conn: &Connection, workflow_id: &str) -> Result<Option<RunningWorkflow>> {
    let row = conn
        .query_row(
            "SELECT workflow_id, started_at, lock_holder_pid, lock_holder_host, heartbeat_at \
             FROM running_workflows WHERE workflow_id = ?1",
            params![workflow_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?;
    let Some((workflow_id, started_at, holder_pid, holder_host, heartbeat_at)) = row else {
        return Ok(None);
    };
    Ok(Some(RunningWorkflow {
        workflow_id,
        started_at: parse_ts(&started_at)?,
        holder_pid,
        holder_host,
        heartbeat_at: parse_ts_opt(heartbeat_at)?,
    }))
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    ) && err.to_string().contains("UNIQUE constraint")
}
