//! Restore target resolution.
//!
//! The host hands over the name to extract (`<where>/_libvirt/vm1.full.zip.0000000007`).
//! The suffix after the last dot is the id of the job that produced the file;
//! output lands in `<dirname>/<origin job id>/<name without suffix>`.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::checkpoint::{CheckpointStore, RestoreObjectTable};
use crate::stream::CommandSpec;
use crate::utils::errors::{DriverError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTarget {
    pub origin_job_id: u32,
    /// Per-origin-job directory
    pub dir: PathBuf,
    pub file_name: String,
}

impl RestoreTarget {
    /// Split a restore file name into its target directory and file name
    pub fn resolve(ofname: &str) -> Result<Self> {
        let path = Path::new(ofname);
        let base = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DriverError::InvalidRestoreName(ofname.to_string()))?;
        let (file_name, suffix) = base
            .rsplit_once('.')
            .ok_or_else(|| DriverError::InvalidRestoreName(ofname.to_string()))?;
        let origin_job_id = suffix.parse::<u32>().map_err(|_| {
            DriverError::InvalidRestoreName(format!("{} (no job id suffix)", ofname))
        })?;
        if file_name.is_empty() {
            return Err(DriverError::InvalidRestoreName(ofname.to_string()));
        }

        let parent = path.parent().unwrap_or_else(|| Path::new("/"));
        Ok(Self {
            origin_job_id,
            dir: parent.join(origin_job_id.to_string()),
            file_name: file_name.to_string(),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Check the restore-object table, create the target directory, carry the
    /// working checkpoint forward and return the restore command.
    ///
    /// Nothing is touched on disk when the origin job has no table entry.
    pub fn prepare(
        &self,
        table: &RestoreObjectTable,
        checkpoints: &CheckpointStore,
        cat_binary: &str,
    ) -> Result<CommandSpec> {
        let checkpoint = table.require(self.origin_job_id)?;
        debug!("Restore: '{}'", checkpoint.raw());

        if !self.dir.exists() {
            debug!("Directory {} does not exist, creating it now", self.dir.display());
            fs::create_dir_all(&self.dir)?;
        }
        checkpoints.copy_to(&self.dir)?;

        let command = CommandSpec::restore_to(cat_binary, &self.path());
        debug!("Restore using \"{}\"", command);
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, RestoreObject};
    use tempfile::TempDir;

    #[test]
    fn test_resolve() {
        let target = RestoreTarget::resolve("/tmp/bareos-restores/_libvirt/vm1.full.zip.0000000007").unwrap();
        assert_eq!(target.origin_job_id, 7);
        assert_eq!(target.file_name, "vm1.full.zip");
        assert_eq!(target.dir, PathBuf::from("/tmp/bareos-restores/_libvirt/7"));
        assert_eq!(target.path(), PathBuf::from("/tmp/bareos-restores/_libvirt/7/vm1.full.zip"));

        let xml = RestoreTarget::resolve("/r/_libvirt/vm1.vmconfig.virtnbdbackup.0.xml.0000000012").unwrap();
        assert_eq!(xml.origin_job_id, 12);
        assert_eq!(xml.file_name, "vm1.vmconfig.virtnbdbackup.0.xml");
    }

    #[test]
    fn test_resolve_rejects_names_without_job_id() {
        assert!(matches!(
            RestoreTarget::resolve("/r/_libvirt/vm1.cpt"),
            Err(DriverError::InvalidRestoreName(_))
        ));
        assert!(matches!(
            RestoreTarget::resolve("/r/_libvirt/noext"),
            Err(DriverError::InvalidRestoreName(_))
        ));
        assert!(matches!(
            RestoreTarget::resolve("/r/_libvirt/.0000000007"),
            Err(DriverError::InvalidRestoreName(_))
        ));
    }

    #[test]
    fn test_prepare_without_table_entry_touches_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let ofname = temp_dir.path().join("_libvirt/vm1.full.zip.0000000007");
        let target = RestoreTarget::resolve(ofname.to_str().unwrap()).unwrap();

        let table = RestoreObjectTable::new();
        let store = CheckpointStore::new(temp_dir.path().join("work"), "vm1");
        let result = target.prepare(&table, &store, "cat");

        assert!(matches!(result, Err(DriverError::MissingRestoreObject { job_id: 7 })));
        assert!(!target.dir.exists());
    }

    #[test]
    fn test_prepare_creates_dir_and_copies_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let ofname = temp_dir.path().join("_libvirt/vm1.full.zip.0000000007");
        let target = RestoreTarget::resolve(ofname.to_str().unwrap()).unwrap();

        let mut table = RestoreObjectTable::new();
        let checkpoint = Checkpoint::new("[\"virtnbdbackup.0\"]");
        table
            .insert(&RestoreObject::for_checkpoint(7, "/_libvirt/vm1.cpt", &checkpoint))
            .unwrap();
        let store = CheckpointStore::new(temp_dir.path().join("work"), "vm1");
        store.save(&checkpoint).unwrap();

        let command = target.prepare(&table, &store, "cat").unwrap();

        assert!(target.dir.is_dir());
        assert_eq!(
            fs::read_to_string(target.dir.join("vm1.cpt")).unwrap(),
            "[\"virtnbdbackup.0\"]"
        );
        assert_eq!(command.stdout_file, Some(target.path()));
    }
}
