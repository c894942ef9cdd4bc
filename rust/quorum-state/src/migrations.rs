//! Embedded schema migrations.
//!
//! Migrations are ordered and idempotent: `schema_migrations` records every
//! applied version, and a step runs only when its version is strictly
//! greater than the recorded maximum. Steps from version 3 on tolerate
//! "duplicate column" / "already exists" errors so hand-edited databases
//! that already carry a column are adopted instead of rejected.

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::model::fmt_ts;

struct Migration {
    version: i64,
    description: &'static str,
    sql: &'static str,
}

/// Version from which already-applied schema errors are tolerated.
const TOLERANT_FROM_VERSION: i64 = 3;

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "core workflow tables",
        sql: r"
        CREATE TABLE IF NOT EXISTS workflows (
            id TEXT PRIMARY KEY,
            version INTEGER NOT NULL DEFAULT 0,
            title TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'pending',
            current_phase TEXT NOT NULL DEFAULT '',
            prompt TEXT NOT NULL DEFAULT '',
            optimized_prompt TEXT NOT NULL DEFAULT '',
            task_order TEXT NOT NULL DEFAULT '[]',
            blueprint TEXT NOT NULL DEFAULT 'null',
            metrics TEXT NOT NULL DEFAULT 'null',
            agent_events TEXT NOT NULL DEFAULT 'null',
            checksum TEXT NOT NULL DEFAULT '',
            created_at TEXT,
            updated_at TEXT,
            report_path TEXT NOT NULL DEFAULT '',
            workflow_branch TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status);
        CREATE INDEX IF NOT EXISTS idx_workflows_updated ON workflows(updated_at);

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT NOT NULL,
            workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
            phase TEXT NOT NULL DEFAULT '',
            name TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT '',
            cli TEXT NOT NULL DEFAULT '',
            model TEXT NOT NULL DEFAULT '',
            dependencies TEXT NOT NULL DEFAULT '[]',
            tokens_in INTEGER NOT NULL DEFAULT 0,
            tokens_out INTEGER NOT NULL DEFAULT 0,
            retries INTEGER NOT NULL DEFAULT 0,
            error TEXT NOT NULL DEFAULT '',
            worktree_path TEXT NOT NULL DEFAULT '',
            started_at TEXT,
            completed_at TEXT,
            output TEXT NOT NULL DEFAULT '',
            output_file TEXT NOT NULL DEFAULT '',
            model_used TEXT NOT NULL DEFAULT '',
            finish_reason TEXT NOT NULL DEFAULT '',
            tool_calls TEXT NOT NULL DEFAULT 'null',
            last_commit TEXT NOT NULL DEFAULT '',
            files_modified TEXT NOT NULL DEFAULT '[]',
            branch TEXT NOT NULL DEFAULT '',
            resumable INTEGER NOT NULL DEFAULT 0,
            resume_hint TEXT NOT NULL DEFAULT '',
            merge_pending INTEGER NOT NULL DEFAULT 0,
            merge_commit TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (workflow_id, id)
        );

        CREATE TABLE IF NOT EXISTS checkpoints (
            id TEXT NOT NULL,
            workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
            type TEXT NOT NULL DEFAULT '',
            phase TEXT NOT NULL DEFAULT '',
            task_id TEXT,
            timestamp TEXT,
            message TEXT NOT NULL DEFAULT '',
            data BLOB
        );
        CREATE INDEX IF NOT EXISTS idx_checkpoints_workflow ON checkpoints(workflow_id);

        -- No REFERENCES clause: the pointer may legitimately dangle after a
        -- crash or hand edit, and reads repair it (see the active-workflow
        -- coordinator).
        CREATE TABLE IF NOT EXISTS active_workflow (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            workflow_id TEXT NOT NULL,
            updated_at TEXT
        );
        ",
    },
    Migration {
        version: 2,
        description: "running registry and workflow locks",
        sql: r"
        CREATE TABLE IF NOT EXISTS running_workflows (
            workflow_id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            lock_holder_pid INTEGER NOT NULL,
            lock_holder_host TEXT NOT NULL,
            heartbeat_at TEXT
        );

        CREATE TABLE IF NOT EXISTS workflow_locks (
            workflow_id TEXT PRIMARY KEY,
            holder_pid INTEGER NOT NULL,
            holder_host TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );
        ",
    },
    Migration {
        version: 3,
        description: "kanban board columns",
        sql: r"
        ALTER TABLE workflows ADD COLUMN kanban_column TEXT NOT NULL DEFAULT 'refinement';
        ALTER TABLE workflows ADD COLUMN kanban_position INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE workflows ADD COLUMN pr_url TEXT NOT NULL DEFAULT '';
        ALTER TABLE workflows ADD COLUMN pr_number INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE workflows ADD COLUMN kanban_started_at TEXT;
        ALTER TABLE workflows ADD COLUMN kanban_completed_at TEXT;
        ALTER TABLE workflows ADD COLUMN kanban_execution_count INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE workflows ADD COLUMN kanban_last_error TEXT NOT NULL DEFAULT '';
        CREATE INDEX IF NOT EXISTS idx_workflows_kanban ON workflows(kanban_column, kanban_position);
        ",
    },
    Migration {
        version: 4,
        description: "kanban engine state singleton",
        sql: r"
        CREATE TABLE IF NOT EXISTS kanban_engine_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            enabled INTEGER NOT NULL DEFAULT 0,
            current_workflow_id TEXT REFERENCES workflows(id) ON DELETE SET NULL,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            last_failure_at TEXT,
            circuit_breaker_open INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT
        );
        ",
    },
    Migration {
        version: 5,
        description: "prompt hash index for duplicate detection",
        sql: r"
        ALTER TABLE workflows ADD COLUMN prompt_hash TEXT NOT NULL DEFAULT '';
        CREATE INDEX IF NOT EXISTS idx_workflows_prompt_hash ON workflows(prompt_hash);
        ",
    },
    Migration {
        version: 6,
        description: "workflow heartbeat mirror",
        sql: r"
        ALTER TABLE workflows ADD COLUMN heartbeat_at TEXT;
        ",
    },
];

/// Highest schema version this build knows about.
#[must_use]
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Apply all pending migrations.
///
/// Runs once on open, before any other operation.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );
        ",
    )?;

    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        match conn.execute_batch(migration.sql) {
            Ok(()) => {}
            Err(err)
                if migration.version >= TOLERANT_FROM_VERSION && is_already_applied(&err) =>
            {
                tracing::debug!(
                    version = migration.version,
                    error = %err,
                    "schema step already present, recording as applied"
                );
            }
            Err(err) => return Err(err.into()),
        }
        conn.execute(
            "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.description, fmt_ts(Utc::now())],
        )?;
        tracing::debug!(
            version = migration.version,
            description = migration.description,
            "applied schema migration"
        );
    }

    Ok(())
}

fn is_already_applied(err: &rusqlite::Error) -> bool {
    let message = err.to_string();
    message.contains("duplicate column") || message.contains("already exists")
}
