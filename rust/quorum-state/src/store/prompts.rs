//! Duplicate-prompt detection.
//!
//! Every save stores the SHA-256 of the workflow prompt alongside the row;
//! lookups are exact-hash matches against that index.

use rusqlite::params;

use crate::checksum::prompt_hash;
use crate::error::Result;
use crate::model::{parse_ts_opt, PromptMatch, WorkflowStatus};
use crate::store::StateStore;

impl StateStore {
    /// Workflows whose prompt matches `prompt` exactly, newest first.
    ///
    /// Empty input returns an empty list without querying.
    pub async fn find_workflows_by_prompt(&self, prompt: &str) -> Result<Vec<PromptMatch>> {
        if prompt.is_empty() {
            return Ok(Vec::new());
        }
        let hash = prompt_hash(prompt);
        self.run_read(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, status, created_at, title FROM workflows \
                 WHERE prompt_hash = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map(params![hash], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut matches = Vec::with_capacity(rows.len());
            for (workflow_id, status, created_at, title) in rows {
                matches.push(PromptMatch {
                    workflow_id,
                    status: WorkflowStatus::parse(&status)?,
                    created_at: parse_ts_opt(created_at)?,
                    title,
                });
            }
            Ok(matches)
        })
        .await
    }
}
