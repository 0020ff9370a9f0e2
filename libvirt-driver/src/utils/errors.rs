//! Custom error types for the backup driver.

use crate::driver::Outcome;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("No restore object received for job {job_id}")]
    MissingRestoreObject { job_id: u32 },

    #[error("Invalid restore file name: {0}")]
    InvalidRestoreName(String),

    #[error("Checkpoint unavailable: {0}")]
    CheckpointUnavailable(String),

    #[error("Subprocess error: {0}")]
    Subprocess(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Job cancelled")]
    Cancelled,
}

impl DriverError {
    /// Host outcome this error maps to at a lifecycle boundary.
    ///
    /// Every error reaching a lifecycle call aborts the job. Per-call
    /// read/write failures never become a `DriverError`; they travel in
    /// [`IoReply`](crate::driver::IoReply).
    pub fn outcome(&self) -> Outcome {
        Outcome::FatalError
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_mapping() {
        let io = DriverError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"));
        assert_eq!(io.outcome(), Outcome::FatalError);

        assert_eq!(
            DriverError::MissingRestoreObject { job_id: 3 }.outcome(),
            Outcome::FatalError
        );
        assert_eq!(
            DriverError::Precondition("accurate".to_string()).outcome(),
            Outcome::FatalError
        );
    }

    #[test]
    fn test_error_messages() {
        let err = DriverError::MissingRestoreObject { job_id: 42 };
        assert_eq!(err.to_string(), "No restore object received for job 42");
    }
}
