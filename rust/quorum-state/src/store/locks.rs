//! Per-workflow row locks.
//!
//! One row per workflow defines lock ownership: holding the row is holding
//! the lock. Acquire follows the same break-stale-then-insert discipline
//! as the global file lock, with staleness decided by expiry and holder
//! liveness. Refresh and release only act on rows owned by this process.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StateError};
use crate::model::{fmt_ts, parse_ts, WorkflowLock};
use crate::process;
use crate::store::running::is_unique_violation;
use crate::store::StateStore;

impl StateStore {
    /// Acquire the lock for a workflow, breaking a stale holder first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::WorkflowLockHeld`] when a live holder owns
    /// the row within its TTL, or when the row is inserted concurrently.
    pub async fn acquire_workflow_lock(
        &self,
        workflow_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = workflow_id.to_string();
        let ttl = chrono::Duration::from_std(self.lock_ttl())
            .map_err(|e| StateError::Other(anyhow::anyhow!("invalid lock ttl: {e}")))?;
        self.run_write("acquire_workflow_lock", cancel, move |conn| {
            acquire_lock_row(conn, &id, ttl)
        })
        .await
    }

    /// Extend the expiry of a lock held by this process.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockNotHeld`] when no row is owned by this
    /// process for the workflow.
    pub async fn refresh_workflow_lock(
        &self,
        workflow_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = workflow_id.to_string();
        let ttl = chrono::Duration::from_std(self.lock_ttl())
            .map_err(|e| StateError::Other(anyhow::anyhow!("invalid lock ttl: {e}")))?;
        self.run_write("refresh_workflow_lock", cancel, move |conn| {
            let updated = conn.execute(
                "UPDATE workflow_locks SET expires_at = ?1 \
                 WHERE workflow_id = ?2 AND holder_pid = ?3",
                params![fmt_ts(Utc::now() + ttl), id, process::current_pid()],
            )?;
            if updated == 0 {
                return Err(StateError::LockNotHeld(id.clone()));
            }
            Ok(())
        })
        .await
    }

    /// Release a lock held by this process.
    ///
    /// Rows owned by other processes are left alone; releasing a lock that
    /// is not held succeeds.
    pub async fn release_workflow_lock(
        &self,
        workflow_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = workflow_id.to_string();
        self.run_write("release_workflow_lock", cancel, move |conn| {
            conn.execute(
                "DELETE FROM workflow_locks WHERE workflow_id = ?1 AND holder_pid = ?2",
                params![id, process::current_pid()],
            )?;
            Ok(())
        })
        .await
    }

    /// Current lock row for a workflow, or `None`.
    pub async fn workflow_lock_record(&self, workflow_id: &str) -> Result<Option<WorkflowLock>> {
        let id = workflow_id.to_string();
        self.run_read(move |conn| read_lock_row(conn, &id)).await
    }
}

fn acquire_lock_row(conn: &Connection, workflow_id: &str, ttl: chrono::Duration) -> Result<()> {
    let now = Utc::now();
    if let Some(existing) = read_lock_row(conn, workflow_id)? {
        if !is_stale(&existing, now) {
            return Err(StateError::WorkflowLockHeld(workflow_id.to_string()));
        }
        tracing::warn!(
            workflow_id,
            holder_pid = existing.holder_pid,
            holder_host = %existing.holder_host,
            "breaking stale workflow lock"
        );
        conn.execute(
            "DELETE FROM workflow_locks WHERE workflow_id = ?1",
            params![workflow_id],
        )?;
    }

    let inserted = conn.execute(
        "INSERT INTO workflow_locks \
         (workflow_id, holder_pid, holder_host, acquired_at, expires_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            workflow_id,
            process::current_pid(),
            process::hostname(),
            fmt_ts(now),
            fmt_ts(now + ttl),
        ],
    );
    match inserted {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => {
            Err(StateError::WorkflowLockHeld(workflow_id.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

fn is_stale(lock: &WorkflowLock, now: DateTime<Utc>) -> bool {
    if lock.expires_at <= now {
        return true;
    }
    // Liveness is only probeable for local holders; a foreign holder
    // within its expiry window is assumed live.
    lock.holder_host == process::hostname() && !process::pid_alive(lock.holder_pid)
}

fn read_lock_row(conn: &Connection, workflow_id: &str) -> Result<Option<WorkflowLock>> {
    let row = conn
        .query_row(
            "SELECT workflow_id, holder_pid, holder_host, acquired_at, expires_at \
             FROM workflow_locks WHERE workflow_id = ?1",
            params![workflow_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;
    let Some((workflow_id, holder_pid, holder_host, acquired_at, expires_at)) = row else {
        return Ok(None);
    };
    Ok(Some(WorkflowLock {
        workflow_id,
        holder_pid,
        holder_host,
        acquired_at: parse_ts(&acquired_at)?,
        expires_at: parse_ts(&expires_at)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::open_store;

    #[tokio::test]
    async fn second_acquire_within_ttl_fails() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        store.acquire_workflow_lock("wf-1", &cancel).await.unwrap();
        let err = store
            .acquire_workflow_lock("wf-1", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::WorkflowLockHeld(id) if id == "wf-1"));

        store.release_workflow_lock("wf-1", &cancel).await.unwrap();
        store.acquire_workflow_lock("wf-1", &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn locks_are_scoped_per_workflow() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        store.acquire_workflow_lock("wf-1", &cancel).await.unwrap();
        store.acquire_workflow_lock("wf-2", &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn refresh_extends_only_owned_locks() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        let err = store
            .refresh_workflow_lock("wf-1", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::LockNotHeld(_)));

        store.acquire_workflow_lock("wf-1", &cancel).await.unwrap();
        let before = store
            .workflow_lock_record("wf-1")
            .await
            .unwrap()
            .unwrap()
            .expires_at;
        store.refresh_workflow_lock("wf-1", &cancel).await.unwrap();
        let after = store
            .workflow_lock_record("wf-1")
            .await
            .unwrap()
            .unwrap()
            .expires_at;
        assert!(after >= before);
    }

    #[tokio::test]
    async fn refresh_fails_for_foreign_holder() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        store.acquire_workflow_lock("wf-1", &cancel).await.unwrap();
        // Reassign the row to a different pid, as another process would.
        store
            .run_write("test_reassign_lock", &cancel, |conn| {
                conn.execute(
                    "UPDATE workflow_locks SET holder_pid = holder_pid + 1 \
                     WHERE workflow_id = 'wf-1'",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let err = store
            .refresh_workflow_lock("wf-1", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::LockNotHeld(_)));

        // Release only deletes rows this process owns.
        store.release_workflow_lock("wf-1", &cancel).await.unwrap();
        assert!(store
            .workflow_lock_record("wf-1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn expired_lock_is_broken_on_acquire() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        store.acquire_workflow_lock("wf-1", &cancel).await.unwrap();
        store
            .run_write("test_expire_lock", &cancel, |conn| {
                conn.execute(
                    "UPDATE workflow_locks SET expires_at = ?1 WHERE workflow_id = 'wf-1'",
                    params![fmt_ts(Utc::now() - chrono::Duration::hours(1))],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        store.acquire_workflow_lock("wf-1", &cancel).await.unwrap();
        let lock = store.workflow_lock_record("wf-1").await.unwrap().unwrap();
        assert!(lock.expires_at > Utc::now());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dead_holder_lock_is_broken_on_acquire() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        store.acquire_workflow_lock("wf-1", &cancel).await.unwrap();
        store
            .run_write("test_dead_holder", &cancel, move |conn| {
                conn.execute(
                    "UPDATE workflow_locks SET holder_pid = ?1 WHERE workflow_id = 'wf-1'",
                    params![dead_pid],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        store.acquire_workflow_lock("wf-1", &cancel).await.unwrap();
    }
}
