//! Restore-object wire format.
//!
//! A restore object carries the checkpoint text as a JSON string, together
//! with the id of the job that produced it and an ordering index.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Checkpoint;
use crate::utils::errors::{DriverError, Result};

/// Encode checkpoint text as a restore-object payload
pub fn to_restore_object(checkpoint: &Checkpoint) -> Vec<u8> {
    // Serializing a &str into JSON cannot fail.
    serde_json::to_vec(checkpoint.raw()).unwrap_or_default()
}

/// Decode a restore-object payload back into checkpoint text
pub fn from_restore_object(payload: &[u8]) -> Result<Checkpoint> {
    let raw: String = serde_json::from_slice(payload)?;
    Ok(Checkpoint::new(raw))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreObject {
    /// Job that produced the object
    pub job_id: u32,
    pub object_name: String,
    pub object: Vec<u8>,
    pub object_len: usize,
    /// Ordering index (Unix seconds at creation)
    pub index: u64,
}

impl RestoreObject {
    /// Package a checkpoint read from disk
    pub fn for_checkpoint(job_id: u32, object_name: impl Into<String>, checkpoint: &Checkpoint) -> Self {
        Self::from_payload(job_id, object_name, to_restore_object(checkpoint))
    }

    /// Wrap an already encoded payload without touching its bytes
    pub fn from_payload(job_id: u32, object_name: impl Into<String>, object: Vec<u8>) -> Self {
        let object_len = object.len();
        Self {
            job_id,
            object_name: object_name.into(),
            object,
            object_len,
            index: chrono::Utc::now().timestamp().max(0) as u64,
        }
    }

    pub fn checkpoint(&self) -> Result<Checkpoint> {
        if self.object_len != self.object.len() {
            return Err(DriverError::Precondition(format!(
                "restore object '{}' of job {} declares {} bytes but carries {}",
                self.object_name,
                self.job_id,
                self.object_len,
                self.object.len()
            )));
        }
        from_restore_object(&self.object)
    }
}

/// Checkpoints received from earlier jobs, keyed by originating job id
#[derive(Debug, Default)]
pub struct RestoreObjectTable {
    entries: BTreeMap<u32, Checkpoint>,
    latest_payload: Option<Vec<u8>>,
}

impl RestoreObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and record a restore object; returns the decoded checkpoint
    pub fn insert(&mut self, object: &RestoreObject) -> Result<Checkpoint> {
        let checkpoint = object.checkpoint()?;
        self.entries.insert(object.job_id, checkpoint.clone());
        self.latest_payload = Some(object.object.clone());
        Ok(checkpoint)
    }

    /// Entry for `job_id`, or a fatal error if none was delivered
    pub fn require(&self, job_id: u32) -> Result<&Checkpoint> {
        self.entries
            .get(&job_id)
            .ok_or(DriverError::MissingRestoreObject { job_id })
    }

    /// Raw payload of the most recently received object
    pub fn latest_payload(&self) -> Option<&[u8]> {
        self.latest_payload.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
