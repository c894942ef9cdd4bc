//! Quorum State - Persistent workflow state store
//!
//! This crate is the durable storage engine of the Quorum multi-agent
//! orchestration platform. It keeps long-running workflows (tasks,
//! checkpoints, Kanban board position) in an embedded `SQLite` database
//! and provides the coordination primitives an orchestrator needs to run
//! them safely across process restarts and concurrent callers:
//!
//! - **Workflow repository**: transactional save/load/list/delete of whole
//!   workflow aggregates with canonical SHA-256 checksums
//! - **Active-workflow coordinator**: validated singleton pointer with
//!   automatic repair of dangling or terminal references
//! - **Running registry**: heartbeat tracking, duplicate-start rejection
//!   and zombie detection
//! - **Locks**: a TTL-bounded global file lock plus per-workflow row locks
//!   with liveness-based stale breaking
//! - **Kanban projection**: board columns and positions on workflow rows
//!   plus the board-engine singleton
//! - **Atomic transactions**: multi-step callbacks inside one write
//!   transaction
//! - **Backup, restore and archive**: consistent database copies and
//!   checksummed JSON envelopes for retired workflows
//!
//! # Architecture
//!
//! One writer connection serializes all durable changes; a pool of
//! read-only connections serves queries. Writes run on the tokio blocking
//! pool under an in-process read-write lock and a busy-retry executor with
//! capped exponential backoff. Every mutating operation accepts a
//! [`CancellationToken`](tokio_util::sync::CancellationToken) that
//! interrupts pending retries.
//!
//! # Example
//!
//! ```rust,ignore
//! use quorum_state::{StateStore, WorkflowState};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> quorum_state::Result<()> {
//!     let store = StateStore::open("./data/quorum.db").await?;
//!     let cancel = CancellationToken::new();
//!
//!     let mut workflow = WorkflowState::new("wf-1");
//!     workflow.prompt = "ship the feature".to_string();
//!     store.save(&workflow, &cancel).await?;
//!
//!     let active = store.load().await?;
//!     assert_eq!(active.unwrap().workflow_id, "wf-1");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod filelock;
pub mod fsatomic;
pub mod migrations;
pub mod model;
pub mod options;
pub mod process;
pub mod retry;
pub mod store;

// Re-exports
pub use error::{Result, StateError};
pub use model::{
    Checkpoint, KanbanBoard, KanbanColumn, KanbanEngineState, PromptMatch, RunningWorkflow,
    TaskState, WorkflowLock, WorkflowState, WorkflowStatus, WorkflowSummary,
};
pub use options::{SaveOptions, StoreOptions};
pub use store::{AtomicContext, StateStore};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{Result, StateError};
    pub use crate::model::{
        KanbanColumn, TaskState, WorkflowState, WorkflowStatus, WorkflowSummary,
    };
    pub use crate::options::{SaveOptions, StoreOptions};
    pub use crate::store::StateStore;
}

#[cfg(test)]
pub(crate) mod testutil {
    use tempfile::TempDir;

    use crate::model::{WorkflowState, WorkflowStatus};
    use crate::store::StateStore;

    /// Open a store on a scratch state directory.
    pub(crate) async fn open_store() -> (StateStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.db")).await.unwrap();
        (store, dir)
    }

    /// A small non-terminal workflow aggregate.
    pub(crate) fn sample_workflow(workflow_id: &str) -> WorkflowState {
        let mut state = WorkflowState::new(workflow_id);
        state.title = format!("workflow {workflow_id}");
        state.prompt = format!("prompt for {workflow_id}");
        state.status = WorkflowStatus::Running;
        state.current_phase = "plan".to_string();
        state
    }
}
