//! Optional per-job log file.
//!
//! Receives timestamped stream open/close lines and the standard error of the
//! dump/restore subprocess. Failing to open it only disables it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::debug;

#[derive(Debug)]
pub struct JobLog {
    path: PathBuf,
    file: File,
}

impl JobLog {
    /// Open `path` for appending, `None` if that is not possible
    pub fn open(path: &Path) -> Option<Self> {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(Self {
                path: path.to_path_buf(),
                file,
            }),
            Err(e) => {
                debug!("Could not open log file ({}): {}", path.display(), e);
                None
            }
        }
    }

    /// Append one timestamped line
    pub fn note(&mut self, message: &str) {
        let line = format!("{} {}\n", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f"), message);
        if let Err(e) = self.file.write_all(line.as_bytes()) {
            debug!("Could not write to log file ({}): {}", self.path.display(), e);
        }
    }

    /// Handle for a subprocess's standard error
    pub fn stderr(&self) -> Option<Stdio> {
        self.file.try_clone().ok().map(Stdio::from)
    }
}
