//! Domain model for the workflow state store.
//!
//! The central type is [`WorkflowState`]: the aggregate of a workflow row,
//! its tasks and its checkpoints, treated as one unit for save and load.
//! The remaining types are row-shaped records for the coordination tables
//! (running registry, per-workflow locks, Kanban engine state) and the
//! lightweight projections returned by listing queries.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};

/// Workflow status enum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Workflow has been created but not started.
    #[default]
    Pending,
    /// Workflow is currently executing.
    Running,
    /// Workflow completed successfully.
    Completed,
    /// Workflow failed with an error.
    Failed,
}

impl WorkflowStatus {
    /// Convert status to string for database storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse status from a database string.
    ///
    /// # Errors
    ///
    /// Returns an error if the status string is unknown.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(StateError::Other(anyhow::anyhow!(
                "invalid workflow status: {s}"
            ))),
        }
    }

    /// Whether the workflow can never run again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Kanban board column.
///
/// `position` on the workflow row is an integer sort key within a column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KanbanColumn {
    /// Prompt still being refined; not schedulable.
    #[default]
    Refinement,
    /// Ready to be picked up by the board engine.
    Todo,
    /// Currently executing.
    InProgress,
    /// Finished, awaiting verification.
    ToVerify,
    /// Verified and closed out.
    Done,
}

impl KanbanColumn {
    /// All columns in board order.
    pub const ALL: [Self; 5] = [
        Self::Refinement,
        Self::Todo,
        Self::InProgress,
        Self::ToVerify,
        Self::Done,
    ];

    /// Convert column to string for database storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refinement => "refinement",
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::ToVerify => "to_verify",
            Self::Done => "done",
        }
    }

    /// Parse column from a database string.
    ///
    /// # Errors
    ///
    /// Returns an error if the column string is unknown.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "refinement" => Ok(Self::Refinement),
            "todo" => Ok(Self::Todo),
            "in_progress" => Ok(Self::InProgress),
            "to_verify" => Ok(Self::ToVerify),
            "done" => Ok(Self::Done),
            _ => Err(StateError::Other(anyhow::anyhow!(
                "invalid kanban column: {s}"
            ))),
        }
    }
}

/// State of a single task inside a workflow.
///
/// Tasks are owned by exactly one workflow and are rewritten as a set on
/// every save. `dependencies` holds ids of tasks in the same workflow; the
/// store preserves the list without dereferencing it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskState {
    /// Task identifier, unique within its workflow.
    pub task_id: String,
    /// Phase this task belongs to.
    pub phase: String,
    pub name: String,
    pub description: String,
    /// Orchestrator-owned status string; opaque to the store.
    pub status: String,
    /// CLI driver used to run the task.
    pub cli: String,
    pub model: String,
    /// Ids of tasks that must complete before this one.
    pub dependencies: Vec<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub retries: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: String,
    pub output: String,
    pub output_file: String,
    pub model_used: String,
    pub finish_reason: String,
    /// Opaque tool-call log recorded by the executor.
    pub tool_calls: serde_json::Value,
    pub last_commit: String,
    pub files_modified: Vec<String>,
    pub branch: String,
    pub worktree_path: String,
    /// Whether the task can be resumed after an interruption.
    pub resumable: bool,
    pub resume_hint: String,
    /// Set when the task branch still needs to be merged.
    pub merge_pending: bool,
    pub merge_commit: String,
}

/// A checkpoint recorded during workflow execution.
///
/// Checkpoints are append-only from the orchestrator's point of view but
/// are rewritten en bloc on every aggregate save.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    /// Checkpoint kind (phase boundary, task completion, ...).
    #[serde(rename = "type")]
    pub checkpoint_type: String,
    pub phase: String,
    /// Task this checkpoint refers to, when task-scoped.
    pub task_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
    /// Opaque payload attached by the orchestrator.
    pub data: serde_json::Value,
}

/// The workflow aggregate: one workflow row plus its tasks and checkpoints.
///
/// Tasks live in a `BTreeMap` keyed by task id so the canonical
/// serialization used for checksums has a stable key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowState {
    /// Caller-supplied unique workflow identifier.
    pub workflow_id: String,
    /// Schema generation of the aggregate.
    pub version: i64,
    pub title: String,
    /// Original prompt; indexed by SHA-256 for duplicate detection.
    pub prompt: String,
    pub optimized_prompt: String,
    pub status: WorkflowStatus,
    pub current_phase: String,
    /// Ordered sequence of task ids.
    pub task_order: Vec<String>,
    /// Tasks keyed by task id.
    pub tasks: BTreeMap<String, TaskState>,
    /// Checkpoints in insertion order.
    pub checkpoints: Vec<Checkpoint>,
    /// Opaque nested configuration blob.
    pub blueprint: serde_json::Value,
    /// Opaque metrics blob.
    pub metrics: serde_json::Value,
    /// Opaque ordered agent-event blob.
    pub agent_events: serde_json::Value,
    /// SHA-256 over the canonical snapshot with this field cleared.
    pub checksum: String,
    /// `None` means "not yet stamped"; resolved on save.
    pub created_at: Option<DateTime<Utc>>,
    /// Advanced on every save unless explicitly preserved.
    pub updated_at: Option<DateTime<Utc>>,
    /// Caller-managed report directory for this workflow.
    pub report_path: String,
    pub workflow_branch: String,
    pub kanban_column: KanbanColumn,
    pub kanban_position: i64,
    pub pr_url: String,
    pub pr_number: i64,
    pub kanban_started_at: Option<DateTime<Utc>>,
    pub kanban_completed_at: Option<DateTime<Utc>>,
    pub kanban_execution_count: i64,
    pub kanban_last_error: String,
    /// Liveness stamp mirrored from the running registry.
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    /// Create an empty aggregate with the given id.
    #[must_use]
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            ..Self::default()
        }
    }
}

/// Listing projection returned by `list_workflows`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub title: String,
    pub status: WorkflowStatus,
    pub current_phase: String,
    /// Prompt truncated to 100 characters plus `"..."`.
    pub prompt_excerpt: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Whether this workflow is the active one.
    pub is_active: bool,
}

/// Match returned by duplicate-prompt detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMatch {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub title: String,
}

/// Row in the running-workflow registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningWorkflow {
    pub workflow_id: String,
    pub started_at: DateTime<Utc>,
    pub holder_pid: u32,
    pub holder_host: String,
    /// `None` for rows written before heartbeats existed; treated as stale.
    pub heartbeat_at: Option<DateTime<Utc>>,
}

/// Row in the per-workflow lock table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowLock {
    pub workflow_id: String,
    pub holder_pid: u32,
    pub holder_host: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Singleton state of the Kanban board engine.
///
/// `current_workflow_id` is a real foreign key; the referenced workflow
/// must be saved before this state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KanbanEngineState {
    pub enabled: bool,
    pub current_workflow_id: Option<String>,
    pub consecutive_failures: i64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub circuit_breaker_open: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Board projection: every column mapped to its ordered workflows.
pub type KanbanBoard = BTreeMap<KanbanColumn, Vec<WorkflowState>>;

/// Format a timestamp for storage.
///
/// Fixed-width RFC 3339 with nanosecond precision: lossless, and stored
/// values compare lexicographically in the same order as chronologically.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn fmt_ts_opt(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(fmt_ts)
}

/// Parse a stored timestamp back into UTC.
pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StateError::Other(anyhow::anyhow!("invalid stored timestamp {s:?}: {e}")))
}

pub(crate) fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_ts(&v)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
        ] {
            assert_eq!(WorkflowStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(WorkflowStatus::parse("paused").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Pending.is_terminal());
    }

    #[test]
    fn column_round_trip() {
        for column in KanbanColumn::ALL {
            assert_eq!(KanbanColumn::parse(column.as_str()).unwrap(), column);
        }
        assert!(KanbanColumn::parse("blocked").is_err());
    }

    #[test]
    fn timestamp_format_is_sortable() {
        let early = DateTime::from_timestamp_micros(1_700_000_000_123_456).unwrap();
        let late = early + chrono::Duration::milliseconds(1500);
        assert!(fmt_ts(early) < fmt_ts(late));
        assert_eq!(parse_ts(&fmt_ts(early)).unwrap(), early);
    }

    #[test]
    fn checkpoint_type_serializes_as_type() {
        let checkpoint = Checkpoint {
            checkpoint_id: "cp-1".to_string(),
            checkpoint_type: "phase".to_string(),
            ..Checkpoint::default()
        };
        let json = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(json["type"], "phase");
    }
}
