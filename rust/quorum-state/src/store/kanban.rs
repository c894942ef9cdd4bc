//! Kanban board projection over workflow rows.
//!
//! Column and position live on the workflow row itself; the board is a
//! query, not a separate table. The singleton `kanban_engine_state` row
//! tracks the board engine (enabled flag, current workflow, failure
//! counters, circuit breaker).

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StateError};
use crate::model::{
    fmt_ts, fmt_ts_opt, parse_ts_opt, KanbanBoard, KanbanColumn, KanbanEngineState, WorkflowState,
};
use crate::store::save::read_aggregate;
use crate::store::StateStore;

impl StateStore {
    /// The next schedulable workflow: lowest position in `todo`, ties
    /// broken by creation time.
    pub async fn next_kanban_workflow(&self) -> Result<Option<WorkflowState>> {
        self.run_read(|conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT id FROM workflows WHERE kanban_column = 'todo' \
                     ORDER BY kanban_position ASC, created_at ASC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            match id {
                Some(id) => read_aggregate(conn, &id),
                None => Ok(None),
            }
        })
        .await
    }

    /// Move a workflow to a column at an explicit position.
    pub async fn move_workflow(
        &self,
        workflow_id: &str,
        column: KanbanColumn,
        position: i64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = workflow_id.to_string();
        self.run_write("move_workflow", cancel, move |conn| {
            let updated = conn.execute(
                "UPDATE workflows SET kanban_column = ?1, kanban_position = ?2, \
                 updated_at = ?3 WHERE id = ?4",
                params![column.as_str(), position, fmt_ts(Utc::now()), id],
            )?;
            if updated == 0 {
                return Err(StateError::not_found("workflow", id.clone()));
            }
            Ok(())
        })
        .await
    }

    /// Update a workflow's board status after an engine step.
    ///
    /// PR fields overlay only when meaningful (`pr_url` non-empty,
    /// `pr_number` positive). Moving into `to_verify` or `done` stamps
    /// `kanban_completed_at`; moving into `to_verify` or `refinement`
    /// counts as another execution.
    pub async fn update_kanban_status(
        &self,
        workflow_id: &str,
        column: KanbanColumn,
        pr_url: &str,
        pr_number: i64,
        last_error: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = workflow_id.to_string();
        let pr_url = pr_url.to_string();
        let last_error = last_error.to_string();
        self.run_write("update_kanban_status", cancel, move |conn| {
            let now = Utc::now();
            let completed_at = matches!(column, KanbanColumn::ToVerify | KanbanColumn::Done)
                .then(|| fmt_ts(now));
            let execution_increment =
                i64::from(matches!(column, KanbanColumn::ToVerify | KanbanColumn::Refinement));

            let updated = conn.execute(
                "UPDATE workflows SET \
                 kanban_column = ?1, \
                 updated_at = ?2, \
                 pr_url = CASE WHEN ?3 <> '' THEN ?3 ELSE pr_url END, \
                 pr_number = CASE WHEN ?4 > 0 THEN ?4 ELSE pr_number END, \
                 kanban_last_error = ?5, \
                 kanban_completed_at = COALESCE(?6, kanban_completed_at), \
                 kanban_execution_count = kanban_execution_count + ?7 \
                 WHERE id = ?8",
                params![
                    column.as_str(),
                    fmt_ts(now),
                    pr_url,
                    pr_number,
                    last_error,
                    completed_at,
                    execution_increment,
                    id,
                ],
            )?;
            if updated == 0 {
                return Err(StateError::not_found("workflow", id.clone()));
            }
            Ok(())
        })
        .await
    }

    /// Workflows in a column ordered by `(position, created_at)`.
    pub async fn list_workflows_by_kanban_column(
        &self,
        column: KanbanColumn,
    ) -> Result<Vec<WorkflowState>> {
        self.run_read(move |conn| column_workflows(conn, column)).await
    }

    /// The full board: every column mapped to its ordered workflows.
    pub async fn kanban_board(&self) -> Result<KanbanBoard> {
        self.run_read(|conn| {
            let mut board = KanbanBoard::new();
            for column in KanbanColumn::ALL {
                board.insert(column, column_workflows(conn, column)?);
            }
            Ok(board)
        })
        .await
    }

    /// Current engine-state singleton, or `None` when never saved.
    pub async fn kanban_engine_state(&self) -> Result<Option<KanbanEngineState>> {
        self.run_read(|conn| {
            let row = conn
                .query_row(
                    "SELECT enabled, current_workflow_id, consecutive_failures, \
                     last_failure_at, circuit_breaker_open, updated_at \
                     FROM kanban_engine_state WHERE id = 1",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, bool>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, bool>(4)?,
                            row.get::<_, Option<String>>(5)?,
                        ))
                    },
                )
                .optional()?;
            let Some((enabled, current, failures, last_failure, breaker, updated)) = row else {
                return Ok(None);
            };
            Ok(Some(KanbanEngineState {
                enabled,
                current_workflow_id: current,
                consecutive_failures: failures,
                last_failure_at: parse_ts_opt(last_failure)?,
                circuit_breaker_open: breaker,
                updated_at: parse_ts_opt(updated)?,
            }))
        })
        .await
    }

    /// Upsert the engine-state singleton.
    ///
    /// `current_workflow_id` is a foreign key into `workflows`; the
    /// referenced workflow must already be saved.
    pub async fn save_kanban_engine_state(
        &self,
        state: &KanbanEngineState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let state = state.clone();
        self.run_write("save_kanban_engine_state", cancel, move |conn| {
            conn.execute(
                "INSERT INTO kanban_engine_state \
                 (id, enabled, current_workflow_id, consecutive_failures, last_failure_at, \
                 circuit_breaker_open, updated_at) \
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(id) DO UPDATE SET \
                 enabled = excluded.enabled, \
                 current_workflow_id = excluded.current_workflow_id, \
                 consecutive_failures = excluded.consecutive_failures, \
                 last_failure_at = excluded.last_failure_at, \
                 circuit_breaker_open = excluded.circuit_breaker_open, \
                 updated_at = excluded.updated_at",
                params![
                    state.enabled,
                    state.current_workflow_id,
                    state.consecutive_failures,
                    fmt_ts_opt(state.last_failure_at),
                    state.circuit_breaker_open,
                    fmt_ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
        .await
    }
}

fn column_workflows(conn: &Connection, column: KanbanColumn) -> Result<Vec<WorkflowState>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id FROM workflows WHERE kanban_column = ?1 \
         ORDER BY kanban_position ASC, created_at ASC",
    )?;
    let ids = stmt
        .query_map(params![column.as_str()], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut workflows = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(state) = read_aggregate(conn, &id)? {
            workflows.push(state);
        }
    }
    Ok(workflows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{open_store, sample_workflow};

    #[tokio::test]
    async fn move_workflow_updates_column_and_position() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        let mut state = sample_workflow("wf-1");
        state.kanban_column = KanbanColumn::Todo;
        store.save(&state, &cancel).await.unwrap();

        store
            .move_workflow("wf-1", KanbanColumn::InProgress, 5, &cancel)
            .await
            .unwrap();

        let loaded = store.load_by_id("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.kanban_column, KanbanColumn::InProgress);
        assert_eq!(loaded.kanban_position, 5);

        let err = store
            .move_workflow("wf-missing", KanbanColumn::Todo, 0, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound { .. }));
    }

    #[tokio::test]
    async fn next_workflow_is_lowest_position_then_oldest() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        for (id, position) in [("wf-b", 2), ("wf-a", 1), ("wf-c", 1)] {
            let mut state = sample_workflow(id);
            state.kanban_column = KanbanColumn::Todo;
            state.kanban_position = position;
            store.save(&state, &cancel).await.unwrap();
        }

        // wf-a and wf-c share position 1; wf-a was created first.
        let next = store.next_kanban_workflow().await.unwrap().unwrap();
        assert_eq!(next.workflow_id, "wf-a");
    }

    #[tokio::test]
    async fn next_workflow_is_none_for_an_empty_todo_column() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();
        store.save(&sample_workflow("wf-1"), &cancel).await.unwrap();
        assert!(store.next_kanban_workflow().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_update_overlays_pr_fields_conditionally() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        let mut state = sample_workflow("wf-1");
        state.kanban_column = KanbanColumn::InProgress;
        store.save(&state, &cancel).await.unwrap();

        store
            .update_kanban_status(
                "wf-1",
                KanbanColumn::ToVerify,
                "https://example.com/pr/7",
                7,
                "",
                &cancel,
            )
            .await
            .unwrap();

        let loaded = store.load_by_id("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.kanban_column, KanbanColumn::ToVerify);
        assert_eq!(loaded.pr_url, "https://example.com/pr/7");
        assert_eq!(loaded.pr_number, 7);
        assert!(loaded.kanban_completed_at.is_some());
        assert_eq!(loaded.kanban_execution_count, 1);

        // Empty URL and zero number leave the stored PR fields alone.
        store
            .update_kanban_status("wf-1", KanbanColumn::Done, "", 0, "", &cancel)
            .await
            .unwrap();
        let loaded = store.load_by_id("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.pr_url, "https://example.com/pr/7");
        assert_eq!(loaded.pr_number, 7);
        // Done does not count as another execution.
        assert_eq!(loaded.kanban_execution_count, 1);
    }

    #[tokio::test]
    async fn status_update_records_errors_on_refinement() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        let mut state = sample_workflow("wf-1");
        state.kanban_column = KanbanColumn::InProgress;
        store.save(&state, &cancel).await.unwrap();

        store
            .update_kanban_status(
                "wf-1",
                KanbanColumn::Refinement,
                "",
                0,
                "verification failed",
                &cancel,
            )
            .await
            .unwrap();

        let loaded = store.load_by_id("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.kanban_column, KanbanColumn::Refinement);
        assert_eq!(loaded.kanban_last_error, "verification failed");
        assert_eq!(loaded.kanban_execution_count, 1);
        assert!(loaded.kanban_completed_at.is_none());
    }

    #[tokio::test]
    async fn board_contains_all_five_columns() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        let mut todo = sample_workflow("wf-todo");
        todo.kanban_column = KanbanColumn::Todo;
        store.save(&todo, &cancel).await.unwrap();

        let board = store.kanban_board().await.unwrap();
        assert_eq!(board.len(), 5);
        assert_eq!(board[&KanbanColumn::Todo].len(), 1);
        assert!(board[&KanbanColumn::Done].is_empty());

        let column = store
            .list_workflows_by_kanban_column(KanbanColumn::Todo)
            .await
            .unwrap();
        assert_eq!(column.len(), 1);
        assert_eq!(column[0].workflow_id, "wf-todo");
    }

    #[tokio::test]
    async fn engine_state_round_trips() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        assert!(store.kanban_engine_state().await.unwrap().is_none());

        store.save(&sample_workflow("wf-1"), &cancel).await.unwrap();
        let state = KanbanEngineState {
            enabled: true,
            current_workflow_id: Some("wf-1".to_string()),
            consecutive_failures: 2,
            last_failure_at: Some(Utc::now()),
            circuit_breaker_open: false,
            updated_at: None,
        };
        store
            .save_kanban_engine_state(&state, &cancel)
            .await
            .unwrap();

        let loaded = store.kanban_engine_state().await.unwrap().unwrap();
        assert!(loaded.enabled);
        assert_eq!(loaded.current_workflow_id, Some("wf-1".to_string()));
        assert_eq!(loaded.consecutive_failures, 2);
        assert!(loaded.updated_at.is_some());
    }

    #[tokio::test]
    async fn engine_state_requires_the_referenced_workflow() {
        let (store, _dir) = open_store().await;
        let cancel = CancellationToken::new();

        let state = KanbanEngineState {
            enabled: true,
            current_workflow_id: Some("wf-missing".to_string()),
            ..KanbanEngineState::default()
        };
        let err = store
            .save_kanban_engine_state(&state, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Sql(_)));
    }
}
