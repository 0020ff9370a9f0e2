//! Job metadata handed to the driver by the host before the first lifecycle call.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::utils::errors::DriverError;

/// Backup level of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Full,
    Incremental,
}

impl Level {
    /// Level token used in synthetic file names and on the dump command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Full => "full",
            Level::Incremental => "inc",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" | "f" => Ok(Level::Full),
            "incremental" | "inc" | "i" => Ok(Level::Incremental),
            other => Err(DriverError::Config(format!("unknown backup level '{}'", other))),
        }
    }
}

/// One backup or restore invocation
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: u32,
    pub level: Level,
    pub vm_name: String,
    /// Per-VM working directory (`<backupdir>/<vmname>`)
    pub work_dir: PathBuf,
}

impl Job {
    pub fn new(job_id: u32, level: Level, vm_name: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            job_id,
            level,
            vm_name: vm_name.into(),
            work_dir: work_dir.into(),
        }
    }

    /// Zero-padded job id suffix used in synthetic file names
    pub fn id_suffix(&self) -> String {
        format_job_id(self.job_id)
    }

    /// Path of the checkpoint file for this job's VM
    pub fn checkpoint_path(&self) -> PathBuf {
        self.work_dir.join(format!("{}.cpt", self.vm_name))
    }
}

pub fn format_job_id(job_id: u32) -> String {
    format!("{:010}", job_id)
}
