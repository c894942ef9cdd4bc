//! Active-workflow coordinator.
//!
//! A singleton row points at the workflow the orchestrator considers
//! current. The pointer must reference a non-terminal workflow; reads that
//! observe a dangling or terminal reference repair the row before
//! returning. Transient lookup failures do not repair: the stored id is
//! returned as-is rather than spuriously cleared.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StateError};
use crate::model::{fmt_ts, WorkflowStatus};
use crate::store::StateStore;

/// Outcome of validating the stored active pointer.
enum ActiveCheck {
    /// No active row.
    Empty,
    /// Pointer references a live, non-terminal workflow.
    Valid(String),
    /// Pointer dangles or references a terminal workflow.
    Invalid(String),
    /// The status lookup failed; carries the lookup error text.
    Unverifiable(String, String),
}

impl StateStore {
    /// Id of the active workflow, or `None` when unset.
    ///
    /// A pointer at a missing or terminal workflow is cleared before
    /// returning (`None` in that case).
    pub async fn active_workflow_id(&self) -> Result<Option<String>> {
        let check = self.run_read(check_active).await?;
        match check {
            ActiveCheck::Empty => Ok(None),
            ActiveCheck::Valid(id) => Ok(Some(id)),
            ActiveCheck::Unverifiable(id, error) => {
                tracing::warn!(
                    workflow_id = %id,
                    error = %error,
                    "active workflow validation failed, returning stored id"
                );
                Ok(Some(id))
            }
            ActiveCheck::Invalid(id) => {
                let _guard = self.op_lock().write().await;
                let conns = std::sync::Arc::clone(self.conns());
                let stale = id.clone();
                let cleared = task::spawn_blocking(move || {
                    conns.with_writer(|conn| clear_active_if(conn, &stale))
                })
                .await
                .map_err(|e| StateError::Other(anyhow::anyhow!("active repair panicked: {e}")))?;
                if let Err(err) = cleared {
                    tracing::warn!(workflow_id = %id, error = %err, "active workflow repair failed");
                }
                Ok(None)
            }
        }
    }

    /// Point the active singleton at the given workflow, unconditionally.
    pub async fn set_active_workflow_id(
        &self,
        workflow_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = workflow_id.to_string();
        self.run_write("set_active_workflow", cancel, move |conn| {
            conn.execute(
                "INSERT INTO active_workflow (id, workflow_id, updated_at) VALUES (1, ?1, ?2) \
                 ON CONFLICT(id) DO UPDATE SET workflow_id = excluded.workflow_id, \
                 updated_at = excluded.updated_at",
                params![id, fmt_ts(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    /// Clear the active singleton. Idempotent.
    pub async fn deactivate_workflow(&self, cancel: &CancellationToken) -> Result<()> {
        self.run_write("deactivate_workflow", cancel, |conn| {
            conn.execute("DELETE FROM active_workflow", [])?;
            Ok(())
        })
        .await
    }
}

fn check_active(conn: &Connection) -> Result<ActiveCheck> {
    let Some(id) = read_active(conn)? else {
        return Ok(ActiveCheck::Empty);
    };

    let status: std::result::Result<Option<String>, rusqlite::Error> = conn
        .query_row(
            "SELECT status FROM workflows WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional();

    match status {
        Err(err) => Ok(ActiveCheck::Unverifiable(id, err.to_string())),
        Ok(None) => Ok(ActiveCheck::Invalid(id)),
        Ok(Some(raw)) => match WorkflowStatus::parse(&raw) {
            Ok(status) if status.is_terminal() => Ok(ActiveCheck::Invalid(id)),
            Ok(_) => Ok(ActiveCheck::Valid(id)),
            // An unknown status string is a corrupt row, not a transient
            // failure; treat the pointer as invalid.
            Err(_) => Ok(ActiveCheck::Invalid(id)),
        },
    }
}

pub(crate) fn read_active(conn: &Connection) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT workflow_id FROM active_workflow WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

fn clear_active_if(conn: &Connection, workflow_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM active_workflow WHERE workflow_id = ?1",
        params![workflow_id],
    )?;
    Ok(())
}

/// Clear the active pointer when it dangles or references a terminal
/// workflow. Runs against the writer at startup and after restore.
pub(crate) fn validate_and_repair_active(conn: &Connection) -> Result<Option<String>> {
    match check_active(conn)? {
        ActiveCheck::Empty => Ok(None),
        ActiveCheck::Valid(id) => Ok(Some(id)),
        ActiveCheck::Unverifiable(id, error) => {
            tracing::warn!(
                workflow_id = %id,
                error = %error,
                "active workflow validation failed during repair"
            );
            Ok(Some(id))
        }
        ActiveCheck::Invalid(id) => {
            tracing::warn!(workflow_id = %id, "clearing dangling active workflow reference");
            clear_active_if(conn, &id)?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{open_store, sample_workflow};

    #[tokio::test]
    async fn save_sets_the_active_pointer() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        store.save(&sample_workflow("wf-1"), &cancel).await.unwrap();
        store.save(&sample_workflow("wf-2"), &cancel).await.unwrap();
        assert_eq!(
            store.active_workflow_id().await.unwrap(),
            Some("wf-2".to_string())
        );
    }

    #[tokio::test]
    async fn terminal_active_workflow_is_cleared_on_read() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        let mut state = sample_workflow("wf-1");
        store.save(&state, &cancel).await.unwrap();
        assert_eq!(
            store.active_workflow_id().await.unwrap(),
            Some("wf-1".to_string())
        );

        // The workflow fails while still referenced by the pointer.
        state.status = WorkflowStatus::Failed;
        store.save(&state, &cancel).await.unwrap();

        assert_eq!(store.active_workflow_id().await.unwrap(), None);
        // The row is gone, not just masked.
        assert_eq!(store.active_workflow_id().await.unwrap(), None);
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dangling_active_reference_is_cleared_on_read() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        store
            .set_active_workflow_id("wf-ghost", &cancel)
            .await
            .unwrap();
        assert_eq!(store.active_workflow_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn deactivate_clears_the_pointer() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        store.save(&sample_workflow("wf-1"), &cancel).await.unwrap();
        store.deactivate_workflow(&cancel).await.unwrap();
        assert_eq!(store.active_workflow_id().await.unwrap(), None);

        // Idempotent.
        store.deactivate_workflow(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn save_without_set_as_active_leaves_the_pointer() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        store.save(&sample_workflow("wf-1"), &cancel).await.unwrap();
        let opts = crate::options::SaveOptions {
            set_as_active: false,
            ..crate::options::SaveOptions::default()
        };
        store
            .save_with(&sample_workflow("wf-2"), opts, &cancel)
            .await
            .unwrap();

        assert_eq!(
            store.active_workflow_id().await.unwrap(),
            Some("wf-1".to_string())
        );
    }
}
