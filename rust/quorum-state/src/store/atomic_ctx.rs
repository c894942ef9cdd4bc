//! Atomic multi-step transactions.
//!
//! `execute_atomically` runs a caller-supplied closure inside one write
//! transaction. The closure sees a transaction-consistent view through
//! [`AtomicContext`]; returning an error rolls everything back, and
//! nothing outside the transaction observes partial effects. Nested
//! atomic calls are not supported; the in-process write lock is held for
//! the duration.

use chrono::Utc;
use rusqlite::TransactionBehavior;
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StateError};
use crate::model::WorkflowState;
use crate::options::SaveOptions;
use crate::store::save::{prepare_snapshot, read_aggregate, write_aggregate};
use crate::store::{running, StateStore};

/// Repository operations scoped to one open write transaction.
pub struct AtomicContext<'tx> {
    tx: &'tx rusqlite::Transaction<'tx>,
}

impl std::fmt::Debug for AtomicContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicContext").finish_non_exhaustive()
    }
}

impl AtomicContext<'_> {
    /// Load a workflow aggregate through the transaction.
    pub fn load_by_id(&self, workflow_id: &str) -> Result<Option<WorkflowState>> {
        read_aggregate(self.tx, workflow_id)
    }

    /// Save a workflow aggregate with default options.
    pub fn save(&self, state: &WorkflowState) -> Result<()> {
        self.save_with(state, SaveOptions::default())
    }

    /// Save a workflow aggregate with explicit options.
    pub fn save_with(&self, state: &WorkflowState, opts: SaveOptions) -> Result<()> {
        let snapshot = prepare_snapshot(state, opts, Utc::now())?;
        write_aggregate(self.tx, &snapshot, opts.set_as_active)
    }

    /// Register a workflow as running within the transaction.
    pub fn set_workflow_running(&self, workflow_id: &str) -> Result<()> {
        running::insert_running(self.tx, workflow_id)
    }

    /// Remove a workflow from the running registry. Idempotent.
    pub fn clear_workflow_running(&self, workflow_id: &str) -> Result<()> {
        running::delete_running(self.tx, workflow_id)
    }

    /// Whether the workflow has a registry row, as seen by this
    /// transaction.
    pub fn is_workflow_running(&self, workflow_id: &str) -> Result<bool> {
        running::running_exists(self.tx, workflow_id)
    }
}

impl StateStore {
    /// Run `f` inside a single write transaction.
    ///
    /// The transaction commits only when `f` returns `Ok`; any error rolls
    /// back every operation performed through the context and is returned
    /// to the caller.
    pub async fn execute_atomically<F>(&self, cancel: &CancellationToken, f: F) -> Result<()>
    where
        F: FnOnce(&AtomicContext<'_>) -> Result<()> + Send + 'static,
    {
        let _guard = self.op_lock().write().await;
        if cancel.is_cancelled() {
            return Err(StateError::Cancelled {
                op: "execute_atomically".to_string(),
                last_error: "cancelled before execution".to_string(),
            });
        }

        let conns = std::sync::Arc::clone(self.conns());
        task::spawn_blocking(move || {
            conns.with_writer(|conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let result = {
                    let ctx = AtomicContext { tx: &tx };
                    f(&ctx)
                };
                match result {
                    Ok(()) => {
                        tx.commit()?;
                        Ok(())
                    }
                    Err(err) => {
                        // Dropping the transaction rolls it back.
                        drop(tx);
                        Err(err)
                    }
                }
            })
        })
        .await
        .map_err(|e| StateError::Other(anyhow::anyhow!("atomic transaction panicked: {e}")))?
    }
}
