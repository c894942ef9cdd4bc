//! Canonical serialization and checksums for workflow snapshots.
//!
//! The stored checksum of an aggregate is the SHA-256 of its canonical
//! serialization with the `checksum` field cleared. Canonical means the
//! serializer emits struct fields in declaration order and the task map in
//! key order, so the same snapshot always hashes to the same digest.

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::model::WorkflowState;

/// Compute the canonical checksum for a workflow snapshot.
///
/// The snapshot's own `checksum` field is ignored; callers may pass a
/// snapshot with the field already populated.
pub fn aggregate_checksum(state: &WorkflowState) -> Result<String> {
    let mut canonical = state.clone();
    canonical.checksum = String::new();
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Verify a snapshot against its stored checksum.
#[must_use]
pub fn verify_aggregate(state: &WorkflowState) -> bool {
    aggregate_checksum(state).is_ok_and(|sum| sum == state.checksum)
}

/// SHA-256 of a workflow prompt, used by the duplicate-detection index.
///
/// Empty prompts are not indexed; callers skip hashing for them.
#[must_use]
pub fn prompt_hash(prompt: &str) -> String {
    hex::encode(Sha256::digest(prompt.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskState;

    fn sample_state() -> WorkflowState {
        let mut state = WorkflowState::new("wf-1");
        state.title = "sample".to_string();
        state.prompt = "build the thing".to_string();
        state.task_order = vec!["t1".to_string(), "t2".to_string()];
        for id in ["t1", "t2"] {
            state.tasks.insert(
                id.to_string(),
                TaskState {
                    task_id: id.to_string(),
                    name: format!("task {id}"),
                    ..TaskState::default()
                },
            );
        }
        state
    }

    #[test]
    fn checksum_is_deterministic() {
        let state = sample_state();
        assert_eq!(
            aggregate_checksum(&state).unwrap(),
            aggregate_checksum(&state).unwrap()
        );
    }

    #[test]
    fn checksum_ignores_stored_checksum() {
        let mut state = sample_state();
        let clean = aggregate_checksum(&state).unwrap();
        state.checksum = clean.clone();
        assert_eq!(aggregate_checksum(&state).unwrap(), clean);
        assert!(verify_aggregate(&state));
    }

    #[test]
    fn checksum_changes_with_content() {
        let mut state = sample_state();
        let before = aggregate_checksum(&state).unwrap();
        state.current_phase = "execute".to_string();
        assert_ne!(aggregate_checksum(&state).unwrap(), before);
    }

    #[test]
    fn prompt_hash_is_exact_match_keyed() {
        assert_eq!(prompt_hash("same"), prompt_hash("same"));
        assert_ne!(prompt_hash("same"), prompt_hash("Same"));
        // Well-known SHA-256 of the empty string; hashing is still defined
        // even though empty prompts are never indexed.
        assert_eq!(
            prompt_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
