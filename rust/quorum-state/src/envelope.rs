//! Versioned, checksummed envelope for archived workflow snapshots.
//!
//! Archive files are pretty-printed JSON of the form
//! `{version, checksum, updated_at, state}`. The checksum covers the
//! canonical serialization of the embedded state with its own `checksum`
//! field emptied, so an envelope can be verified without trusting the
//! snapshot it wraps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::aggregate_checksum;
use crate::error::{Result, StateError};
use crate::model::WorkflowState;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Archive wrapper around a workflow snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEnvelope {
    /// Envelope format version.
    pub version: u32,
    /// Hex SHA-256 over the canonical snapshot.
    pub checksum: String,
    /// When the envelope was sealed.
    pub updated_at: DateTime<Utc>,
    /// The archived aggregate.
    pub state: WorkflowState,
}

impl StateEnvelope {
    /// Seal a snapshot into an envelope with a freshly computed checksum.
    pub fn seal(state: WorkflowState, sealed_at: DateTime<Utc>) -> Result<Self> {
        let checksum = aggregate_checksum(&state)?;
        Ok(Self {
            version: ENVELOPE_VERSION,
            checksum,
            updated_at: sealed_at,
            state,
        })
    }

    /// Serialize to the on-disk archive representation.
    pub fn to_pretty_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse an envelope and verify its checksum.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::StateCorrupted`] when the embedded snapshot
    /// does not hash to the recorded checksum.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        let computed = aggregate_checksum(&envelope.state)?;
        if computed != envelope.checksum {
            return Err(StateError::StateCorrupted(format!(
                "envelope checksum mismatch for workflow {}: stored {}, computed {computed}",
                envelope.state.workflow_id, envelope.checksum
            )));
        }
        Ok(envelope)
    }
}
