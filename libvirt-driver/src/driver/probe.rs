//! Strict-incremental decision.

use crate::job::Job;
use crate::utils::errors::Result;

/// Reports the checkpoint position the next incremental would back up to
pub trait CheckpointProbe: Send {
    fn observed_lsn(&self, job: &Job, previous_lsn: u64) -> Result<u64>;
}

/// Assumes the dump tool always creates a new checkpoint, one past the previous one
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeProgress;

impl CheckpointProbe for AssumeProgress {
    fn observed_lsn(&self, _job: &Job, previous_lsn: u64) -> Result<u64> {
        Ok(previous_lsn.saturating_add(1))
    }
}

/// Fixed value, for hosts that learn the position out of band
#[derive(Debug, Clone, Copy)]
pub struct FixedLsn(pub u64);

impl CheckpointProbe for FixedLsn {
    fn observed_lsn(&self, _job: &Job, _previous_lsn: u64) -> Result<u64> {
        Ok(self.0)
    }
}

/// An incremental is skipped only under strict mode, with a known previous
/// position that the observed one does not exceed.
pub fn should_skip_incremental(strict: bool, previous_lsn: u64, observed_lsn: u64) -> bool {
    strict && previous_lsn > 0 && observed_lsn <= previous_lsn
}
