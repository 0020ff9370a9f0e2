//! Checkpoint state carried between backup jobs.
//!
//! The dump tool leaves a `<vm>.cpt` file in the VM's working directory
//! describing its checkpoint chain. The latest line of that file travels to the
//! next job as a restore object; the number derived from it decides whether an
//! incremental job has anything new to send.

pub mod restore_object;

pub use restore_object::{from_restore_object, to_restore_object, RestoreObject, RestoreObjectTable};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::job::Job;
use crate::utils::errors::{DriverError, Result};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Incremental position as reported by the dump tool
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Checkpoint {
    raw: String,
}

impl Checkpoint {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// Build a checkpoint from the contents of a `.cpt` file.
    /// Only the last line is kept, line terminator included.
    pub fn from_file_content(content: &str) -> Self {
        let last = content.split_inclusive('\n').last().unwrap_or("");
        Self::new(last)
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Progress marker derived from the checkpoint text
    pub fn lsn(&self) -> u64 {
        derive_lsn(&self.raw)
    }
}

/// Derive the comparable progress number from checkpoint text.
///
/// The value is the size of the decoded content: element count for a JSON
/// array or object, character count for a JSON string, and the character
/// count of the raw text for anything else. It only has meaning when compared
/// against another value produced by this function.
pub fn derive_lsn(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let len = match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Array(items)) => items.len(),
        Ok(serde_json::Value::Object(map)) => map.len(),
        Ok(serde_json::Value::String(s)) => s.chars().count(),
        _ => text.chars().count(),
    };
    len as u64
}

/// Reads and writes the checkpoint file of one VM
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    vm_name: String,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, vm_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            vm_name: vm_name.into(),
        }
    }

    pub fn for_job(job: &Job) -> Self {
        Self::new(&job.work_dir, &job.vm_name)
    }

    pub fn file_name(&self) -> String {
        format!("{}.cpt", self.vm_name)
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(self.file_name())
    }

    /// Load the checkpoint, `None` if no checkpoint file exists yet
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(Checkpoint::from_file_content(&content)))
    }

    /// Overwrite the checkpoint file (write to temp file, then rename)
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path();
        let tmp = self.dir.join(format!("{}.tmp", self.file_name()));
        fs::write(&tmp, checkpoint.raw())?;
        fs::rename(&tmp, &path)?;
        debug!("Saved checkpoint to {}", path.display());
        Ok(())
    }

    /// Block until the dump tool has written the checkpoint file, then load it
    pub fn wait_for(&self, timeout: Duration) -> Result<Checkpoint> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(checkpoint) = self.load()? {
                return Ok(checkpoint);
            }
            if Instant::now() >= deadline {
                return Err(DriverError::CheckpointUnavailable(format!(
                    "{} not written within {} seconds",
                    self.path().display(),
                    timeout.as_secs()
                )));
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Copy the checkpoint file into `dest_dir`. Returns false if there was none.
    pub fn copy_to(&self, dest_dir: &Path) -> Result<bool> {
        let src = self.path();
        if !src.is_file() {
            return Ok(false);
        }
        let dest = dest_dir.join(self.file_name());
        fs::copy(&src, &dest)?;
        debug!("Copied checkpoint {} to {}", src.display(), dest.display());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_derive_lsn_from_checkpoint_list() {
        assert_eq!(derive_lsn(r#"["virtnbdbackup.0", "virtnbdbackup.1", "virtnbdbackup.2"]"#), 3);
        assert_eq!(derive_lsn("[]"), 0);
        assert_eq!(derive_lsn(r#"{"a": 1, "b": 2}"#), 2);
        assert_eq!(derive_lsn(r#""abc""#), 3);
        assert_eq!(derive_lsn("lsn=12345"), 9);
        assert_eq!(derive_lsn(""), 0);
    }

    #[test]
    fn test_from_file_content_keeps_last_line() {
        let cp = Checkpoint::from_file_content("first=1\nsecond=2\n");
        assert_eq!(cp.raw(), "second=2\n");

        let cp = Checkpoint::from_file_content("only");
        assert_eq!(cp.raw(), "only");

        let cp = Checkpoint::from_file_content("");
        assert!(cp.is_empty());
    }

    #[test]
    fn test_store_save_and_load() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = CheckpointStore::new(temp_dir.path(), "vm1");

        assert!(store.load()?.is_none());

        let cp = Checkpoint::new(r#"["virtnbdbackup.0"]"#);
        store.save(&cp)?;
        assert!(store.path().is_file());
        assert_eq!(store.load()?, Some(cp.clone()));

        // overwritten on the next save
        let newer = Checkpoint::new(r#"["virtnbdbackup.0", "virtnbdbackup.1"]"#);
        store.save(&newer)?;
        assert_eq!(store.load()?.map(|c| c.lsn()), Some(2));

        Ok(())
    }

    #[test]
    fn test_wait_for_missing_checkpoint_times_out() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = CheckpointStore::new(temp_dir.path(), "vm1");

        let result = store.wait_for(Duration::from_millis(150));
        assert!(matches!(result, Err(DriverError::CheckpointUnavailable(_))));
        Ok(())
    }

    #[test]
    fn test_wait_for_existing_checkpoint() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("vm1.cpt"), "[\"virtnbdbackup.0\"]\n")?;
        let store = CheckpointStore::new(temp_dir.path(), "vm1");

        let cp = store.wait_for(Duration::from_secs(1))?;
        assert_eq!(cp.raw(), "[\"virtnbdbackup.0\"]\n");
        Ok(())
    }

    #[test]
    fn test_copy_to() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let dest = TempDir::new()?;
        let store = CheckpointStore::new(temp_dir.path(), "vm1");

        assert!(!store.copy_to(dest.path())?);

        store.save(&Checkpoint::new("[]"))?;
        assert!(store.copy_to(dest.path())?);
        assert_eq!(fs::read_to_string(dest.path().join("vm1.cpt"))?, "[]");
        Ok(())
    }
}
