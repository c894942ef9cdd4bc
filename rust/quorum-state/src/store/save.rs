//! Workflow repository: save, load, list, delete and purge.
//!
//! `save` is a full upsert of the aggregate: the workflow row is upserted,
//! the task and checkpoint sets are rewritten, and (by default) the
//! active-workflow singleton is pointed at the saved workflow, all inside
//! one write transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::checksum::{aggregate_checksum, prompt_hash};
use crate::error::{Result, StateError};
use crate::model::{
    fmt_ts_opt, parse_ts_opt, Checkpoint, KanbanColumn, TaskState, WorkflowState, WorkflowStatus,
    WorkflowSummary,
};
use crate::options::SaveOptions;
use crate::store::{archive, StateStore};

/// Longest prompt prefix carried by a listing summary.
const PROMPT_EXCERPT_CHARS: usize = 100;

const WORKFLOW_COLUMNS: &str = "id, version, title, status, current_phase, prompt, \
     optimized_prompt, task_order, blueprint, metrics, agent_events, checksum, created_at, \
     updated_at, report_path, workflow_branch, kanban_column, kanban_position, pr_url, \
     pr_number, kanban_started_at, kanban_completed_at, kanban_execution_count, \
     kanban_last_error, heartbeat_at";

const TASK_COLUMNS: &str = "id, phase, name, description, status, cli, model, dependencies, \
     tokens_in, tokens_out, retries, error, worktree_path, started_at, completed_at, output, \
     output_file, model_used, finish_reason, tool_calls, last_commit, files_modified, branch, \
     resumable, resume_hint, merge_pending, merge_commit";

impl StateStore {
    /// Save a workflow aggregate with default options.
    pub async fn save(&self, state: &WorkflowState, cancel: &CancellationToken) -> Result<()> {
        self.save_with(state, SaveOptions::default(), cancel).await
    }

    /// Save a workflow aggregate.
    ///
    /// Resolves `updated_at`, applies the automatic Kanban transition for
    /// completed workflows, recomputes the canonical checksum and writes
    /// the whole aggregate in one transaction. With `set_as_active` the
    /// active-workflow singleton is pointed at this workflow.
    pub async fn save_with(
        &self,
        state: &WorkflowState,
        opts: SaveOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let snapshot = prepare_snapshot(state, opts, Utc::now())?;
        self.run_write("save_workflow", cancel, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            write_aggregate(&tx, &snapshot, opts.set_as_active)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Load the active workflow, or `None` when no valid one is set.
    ///
    /// The active pointer is validated (and repaired) exactly as in
    /// [`active_workflow_id`](Self::active_workflow_id).
    pub async fn load(&self) -> Result<Option<WorkflowState>> {
        match self.active_workflow_id().await? {
            Some(id) => self.load_by_id(&id).await,
            None => Ok(None),
        }
    }

    /// Load a workflow aggregate by id, or `None` when absent.
    pub async fn load_by_id(&self, workflow_id: &str) -> Result<Option<WorkflowState>> {
        let id = workflow_id.to_string();
        self.run_read(move |conn| read_aggregate(conn, &id)).await
    }

    /// List workflow summaries ordered by `updated_at` descending.
    pub async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        self.run_read(list_summaries).await
    }

    /// Delete a workflow, its tasks and checkpoints.
    ///
    /// Clears the active pointer when it referenced the deleted workflow
    /// and best-effort removes the workflow's report directory after the
    /// transaction commits.
    pub async fn delete_workflow(
        &self,
        workflow_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = workflow_id.to_string();
        let report_path = self
            .run_write("delete_workflow", cancel, move |conn| {
                delete_aggregate(conn, &id)
            })
            .await?;

        let state_dir = self.state_dir().to_path_buf();
        let id = workflow_id.to_string();
        let _ = task::spawn_blocking(move || {
            archive::reap_report_dir(&state_dir, &id, &report_path);
        })
        .await;
        Ok(())
    }

    /// Delete every workflow. Returns the pre-delete workflow count.
    pub async fn purge_all_workflows(&self, cancel: &CancellationToken) -> Result<u64> {
        self.run_write("purge_workflows", cancel, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let count: i64 = tx.query_row("SELECT COUNT(*) FROM workflows", [], |row| row.get(0))?;
            tx.execute("DELETE FROM checkpoints", [])?;
            tx.execute("DELETE FROM tasks", [])?;
            tx.execute("DELETE FROM workflows", [])?;
            tx.execute("DELETE FROM active_workflow", [])?;
            tx.commit()?;
            #[allow(clippy::cast_sign_loss, reason = "row counts are non-negative")]
            let count = count as u64;
            Ok(count)
        })
        .await
    }
}

/// Resolve timestamps, the auto-Kanban transition and the checksum for a
/// snapshot about to be written.
pub(crate) fn prepare_snapshot(
    state: &WorkflowState,
    opts: SaveOptions,
    now: DateTime<Utc>,
) -> Result<WorkflowState> {
    let mut snap = state.clone();

    if snap.created_at.is_none() {
        snap.created_at = Some(now);
    }
    if opts.preserve_updated_at {
        // A zero timestamp under preservation is still replaced by now.
        if snap.updated_at.is_none() {
            snap.updated_at = Some(now);
        }
    } else {
        snap.updated_at = Some(now);
    }

    if !opts.disable_auto_kanban
        && snap.status == WorkflowStatus::Completed
        && !matches!(
            snap.kanban_column,
            KanbanColumn::ToVerify | KanbanColumn::Done
        )
    {
        snap.kanban_column = KanbanColumn::ToVerify;
        snap.kanban_completed_at = Some(now);
    }

    snap.checksum = String::new();
    snap.checksum = aggregate_checksum(&snap)?;
    Ok(snap)
}

/// Write a prepared snapshot inside the caller's transaction.
///
/// Upserts the workflow row (all columns but `created_at` update on
/// conflict) and rewrites the task and checkpoint sets.
pub(crate) fn write_aggregate(
    conn: &Connection,
    snap: &WorkflowState,
    set_as_active: bool,
) -> Result<()> {
    let hash = if snap.prompt.is_empty() {
        String::new()
    } else {
        prompt_hash(&snap.prompt)
    };

    conn.execute(
        "INSERT INTO workflows (id, version, title, status, current_phase, prompt, \
         optimized_prompt, task_order, blueprint, metrics, agent_events, checksum, created_at, \
         updated_at, report_path, workflow_branch, kanban_column, kanban_position, pr_url, \
         pr_number, kanban_started_at, kanban_completed_at, kanban_execution_count, \
         kanban_last_error, heartbeat_at, prompt_hash) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
         ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26) \
         ON CONFLICT(id) DO UPDATE SET \
         version = excluded.version, title = excluded.title, status = excluded.status, \
         current_phase = excluded.current_phase, prompt = excluded.prompt, \
         optimized_prompt = excluded.optimized_prompt, task_order = excluded.task_order, \
         blueprint = excluded.blueprint, metrics = excluded.metrics, \
         agent_events = excluded.agent_events, checksum = excluded.checksum, \
         updated_at = excluded.updated_at, report_path = excluded.report_path, \
         workflow_branch = excluded.workflow_branch, kanban_column = excluded.kanban_column, \
         kanban_position = excluded.kanban_position, pr_url = excluded.pr_url, \
         pr_number = excluded.pr_number, kanban_started_at = excluded.kanban_started_at, \
         kanban_completed_at = excluded.kanban_completed_at, \
         kanban_execution_count = excluded.kanban_execution_count, \
         kanban_last_error = excluded.kanban_last_error, heartbeat_at = excluded.heartbeat_at, \
         prompt_hash = excluded.prompt_hash",
        params![
            snap.workflow_id,
            snap.version,
            snap.title,
            snap.status.as_str(),
            snap.current_phase,
            snap.prompt,
            snap.optimized_prompt,
            serde_json::to_string(&snap.task_order)?,
            serde_json::to_string(&snap.blueprint)?,
            serde_json::to_string(&snap.metrics)?,
            serde_json::to_string(&snap.agent_events)?,
            snap.checksum,
            fmt_ts_opt(snap.created_at),
            fmt_ts_opt(snap.updated_at),
            snap.report_path,
            snap.workflow_branch,
            snap.kanban_column.as_str(),
            snap.kanban_position,
            snap.pr_url,
            snap.pr_number,
            fmt_ts_opt(snap.kanban_started_at),
            fmt_ts_opt(snap.kanban_completed_at),
            snap.kanban_execution_count,
            snap.kanban_last_error,
            fmt_ts_opt(snap.heartbeat_at),
            hash,
        ],
    )?;

    // Task and checkpoint sets are rewritten wholesale.
    conn.execute(
        "DELETE FROM tasks WHERE workflow_id = ?1",
        params![snap.workflow_id],
    )?;
    {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO tasks (workflow_id, id, phase, name, description, status, cli, model, \
             dependencies, tokens_in, tokens_out, retries, error, worktree_path, started_at, \
             completed_at, output, output_file, model_used, finish_reason, tool_calls, \
             last_commit, files_modified, branch, resumable, resume_hint, merge_pending, \
             merge_commit) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
             ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)",
        )?;
        for task in snap.tasks.values() {
            stmt.execute(params![
                snap.workflow_id,
                task.task_id,
                task.phase,
                task.name,
                task.description,
                task.status,
                task.cli,
                task.model,
                serde_json::to_string(&task.dependencies)?,
                task.tokens_in,
                task.tokens_out,
                task.retries,
                task.error,
                task.worktree_path,
                fmt_ts_opt(task.started_at),
                fmt_ts_opt(task.completed_at),
                task.output,
                task.output_file,
                task.model_used,
                task.finish_reason,
                serde_json::to_string(&task.tool_calls)?,
                task.last_commit,
                serde_json::to_string(&task.files_modified)?,
                task.branch,
                task.resumable,
                task.resume_hint,
                task.merge_pending,
                task.merge_commit,
            ])?;
        }
    }

    conn.execute(
        "DELETE FROM checkpoints WHERE workflow_id = ?1",
        params![snap.workflow_id],
    )?;
    {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO checkpoints (workflow_id, id, type, phase, task_id, timestamp, \
             message, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for checkpoint in &snap.checkpoints {
            stmt.execute(params![
                snap.workflow_id,
                checkpoint.checkpoint_id,
                checkpoint.checkpoint_type,
                checkpoint.phase,
                checkpoint.task_id,
                fmt_ts_opt(checkpoint.timestamp),
                checkpoint.message,
                serde_json::to_vec(&checkpoint.data)?,
            ])?;
        }
    }

    if set_as_active {
        conn.execute(
            "INSERT INTO active_workflow (id, workflow_id, updated_at) VALUES (1, ?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET workflow_id = excluded.workflow_id, \
             updated_at = excluded.updated_at",
            params![snap.workflow_id, fmt_ts_opt(snap.updated_at)],
        )?;
    }

    Ok(())
}

/// Raw workflow row as stored; converted to [`WorkflowState`] after the
/// rusqlite row mapping so JSON and timestamp parsing stays out of the
/// driver callback.
struct RawWorkflow {
    id: String,
    version: i64,
    title: String,
    status: String,
    current_phase: String,
    prompt: String,
    optimized_prompt: String,
    task_order: String,
    blueprint: String,
    metrics: String,
    agent_events: String,
    checksum: String,
    created_at: Option<String>,
    updated_at: Option<String>,
    report_path: String,
    workflow_branch: String,
    kanban_column: String,
    kanban_position: i64,
    pr_url: String,
    pr_number: i64,
    kanban_started_at: Option<String>,
    kanban_completed_at: Option<String>,
    kanban_execution_count: i64,
    kanban_last_error: String,
    heartbeat_at: Option<String>,
}

fn map_workflow_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawWorkflow> {
    Ok(RawWorkflow {
        id: row.get(0)?,
        version: row.get(1)?,
        title: row.get(2)?,
        status: row.get(3)?,
        current_phase: row.get(4)?,
        prompt: row.get(5)?,
        optimized_prompt: row.get(6)?,
        task_order: row.get(7)?,
        blueprint: row.get(8)?,
        metrics: row.get(9)?,
        agent_events: row.get(10)?,
        checksum: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        report_path: row.get(14)?,
        workflow_branch: row.get(15)?,
        kanban_column: row.get(16)?,
        kanban_position: row.get(17)?,
        pr_url: row.get(18)?,
        pr_number: row.get(19)?,
        kanban_started_at: row.get(20)?,
        kanban_completed_at: row.get(21)?,
        kanban_execution_count: row.get(22)?,
        kanban_last_error: row.get(23)?,
        heartbeat_at: row.get(24)?,
    })
}

impl RawWorkflow {
    fn into_state(self) -> Result<WorkflowState> {
        Ok(WorkflowState {
            workflow_id: self.id,
            version: self.version,
            title: self.title,
            status: WorkflowStatus::parse(&self.status)?,
            current_phase: self.current_phase,
            prompt: self.prompt,
            optimized_prompt: self.optimized_prompt,
            task_order: serde_json::from_str(&self.task_order)?,
            tasks: std::collections::BTreeMap::new(),
            checkpoints: Vec::new(),
            blueprint: serde_json::from_str(&self.blueprint)?,
            metrics: serde_json::from_str(&self.metrics)?,
            agent_events: serde_json::from_str(&self.agent_events)?,
            checksum: self.checksum,
            created_at: parse_ts_opt(self.created_at)?,
            updated_at: parse_ts_opt(self.updated_at)?,
            report_path: self.report_path,
            workflow_branch: self.workflow_branch,
            kanban_column: KanbanColumn::parse(&self.kanban_column)?,
            kanban_position: self.kanban_position,
            pr_url: self.pr_url,
            pr_number: self.pr_number,
            kanban_started_at: parse_ts_opt(self.kanban_started_at)?,
            kanban_completed_at: parse_ts_opt(self.kanban_completed_at)?,
            kanban_execution_count: self.kanban_execution_count,
            kanban_last_error: self.kanban_last_error,
            heartbeat_at: parse_ts_opt(self.heartbeat_at)?,
        })
    }
}

/// Assemble a full aggregate: workflow row, task map, checkpoints in
/// insertion order.
pub(crate) fn read_aggregate(conn: &Connection, workflow_id: &str) -> Result<Option<WorkflowState>> {
    let raw = conn
        .query_row(
            &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?1"),
            params![workflow_id],
            map_workflow_row,
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    let mut state = raw.into_state()?;

    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE workflow_id = ?1"
    ))?;
    let raw_tasks = stmt
        .query_map(params![workflow_id], map_task_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for raw in raw_tasks {
        let task = raw.into_task()?;
        state.tasks.insert(task.task_id.clone(), task);
    }

    let mut stmt = conn.prepare_cached(
        "SELECT id, type, phase, task_id, timestamp, message, data FROM checkpoints \
         WHERE workflow_id = ?1 ORDER BY rowid",
    )?;
    let raw_checkpoints = stmt
        .query_map(params![workflow_id], map_checkpoint_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for raw in raw_checkpoints {
        state.checkpoints.push(raw.into_checkpoint()?);
    }

    Ok(Some(state))
}

struct RawTask {
    id: String,
    phase: String,
    name: String,
    description: String,
    status: String,
    cli: String,
    model: String,
    dependencies: String,
    tokens_in: i64,
    tokens_out: i64,
    retries: i64,
    error: String,
    worktree_path: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    output: String,
    output_file: String,
    model_used: String,
    finish_reason: String,
    tool_calls: String,
    last_commit: String,
    files_modified: String,
    branch: String,
    resumable: bool,
    resume_hint: String,
    merge_pending: bool,
    merge_commit: String,
}

fn map_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        id: row.get(0)?,
        phase: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        cli: row.get(5)?,
        model: row.get(6)?,
        dependencies: row.get(7)?,
        tokens_in: row.get(8)?,
        tokens_out: row.get(9)?,
        retries: row.get(10)?,
        error: row.get(11)?,
        worktree_path: row.get(12)?,
        started_at: row.get(13)?,
        completed_at: row.get(14)?,
        output: row.get(15)?,
        output_file: row.get(16)?,
        model_used: row.get(17)?,
        finish_reason: row.get(18)?,
        tool_calls: row.get(19)?,
        last_commit: row.get(20)?,
        files_modified: row.get(21)?,
        branch: row.get(22)?,
        resumable: row.get(23)?,
        resume_hint: row.get(24)?,
        merge_pending: row.get(25)?,
        merge_commit: row.get(26)?,
    })
}

impl RawTask {
    fn into_task(self) -> Result<TaskState> {
        Ok(TaskState {
            task_id: self.id,
            phase: self.phase,
            name: self.name,
            description: self.description,
            status: self.status,
            cli: self.cli,
            model: self.model,
            dependencies: serde_json::from_str(&self.dependencies)?,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            retries: self.retries,
            started_at: parse_ts_opt(self.started_at)?,
            completed_at: parse_ts_opt(self.completed_at)?,
            error: self.error,
            output: self.output,
            output_file: self.output_file,
            model_used: self.model_used,
            finish_reason: self.finish_reason,
            tool_calls: serde_json::from_str(&self.tool_calls)?,
            last_commit: self.last_commit,
            files_modified: serde_json::from_str(&self.files_modified)?,
            branch: self.branch,
            worktree_path: self.worktree_path,
            resumable: self.resumable,
            resume_hint: self.resume_hint,
            merge_pending: self.merge_pending,
            merge_commit: self.merge_commit,
        })
    }
}

struct RawCheckpoint {
    id: String,
    checkpoint_type: String,
    phase: String,
    task_id: Option<String>,
    timestamp: Option<String>,
    message: String,
    data: Option<Vec<u8>>,
}

fn map_checkpoint_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCheckpoint> {
    Ok(RawCheckpoint {
        id: row.get(0)?,
        checkpoint_type: row.get(1)?,
        phase: row.get(2)?,
        task_id: row.get(3)?,
        timestamp: row.get(4)?,
        message: row.get(5)?,
        data: row.get(6)?,
    })
}

impl RawCheckpoint {
    fn into_checkpoint(self) -> Result<Checkpoint> {
        let data = match self.data {
            Some(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            _ => serde_json::Value::Null,
        };
        Ok(Checkpoint {
            checkpoint_id: self.id,
            checkpoint_type: self.checkpoint_type,
            phase: self.phase,
            task_id: self.task_id,
            timestamp: parse_ts_opt(self.timestamp)?,
            message: self.message,
            data,
        })
    }
}

fn list_summaries(conn: &Connection) -> Result<Vec<WorkflowSummary>> {
    let mut stmt = conn.prepare_cached(
        "SELECT w.id, w.title, w.status, w.current_phase, w.prompt, w.created_at, w.updated_at, \
         EXISTS(SELECT 1 FROM active_workflow a WHERE a.workflow_id = w.id) \
         FROM workflows w ORDER BY w.updated_at DESC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, bool>(7)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut summaries = Vec::with_capacity(rows.len());
    for (id, title, status, phase, prompt, created_at, updated_at, is_active) in rows {
        summaries.push(WorkflowSummary {
            workflow_id: id,
            title,
            status: WorkflowStatus::parse(&status)?,
            current_phase: phase,
            prompt_excerpt: excerpt(&prompt),
            created_at: parse_ts_opt(created_at)?,
            updated_at: parse_ts_opt(updated_at)?,
            is_active,
        });
    }
    Ok(summaries)
}

fn excerpt(prompt: &str) -> String {
    if prompt.chars().count() > PROMPT_EXCERPT_CHARS {
        let mut cut: String = prompt.chars().take(PROMPT_EXCERPT_CHARS).collect();
        cut.push_str("...");
        cut
    } else {
        prompt.to_string()
    }
}

fn delete_aggregate(conn: &mut Connection, workflow_id: &str) -> Result<String> {
    let report_path: Option<String> = conn
        .query_row(
            "SELECT report_path FROM workflows WHERE id = ?1",
            params![workflow_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(report_path) = report_path else {
        return Err(StateError::not_found("workflow", workflow_id));
    };

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "DELETE FROM checkpoints WHERE workflow_id = ?1",
        params![workflow_id],
    )?;
    tx.execute(
        "DELETE FROM tasks WHERE workflow_id = ?1",
        params![workflow_id],
    )?;
    tx.execute("DELETE FROM workflows WHERE id = ?1", params![workflow_id])?;
    tx.execute(
        "DELETE FROM active_workflow WHERE workflow_id = ?1",
        params![workflow_id],
    )?;
    tx.commit()?;
    Ok(report_path)
}
