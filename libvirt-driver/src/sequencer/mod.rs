//! Item sequencing: which logical files a job transfers, and in what order.

pub mod restore;

pub use restore::RestoreTarget;

use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info};

use crate::checkpoint::{CheckpointStore, RestoreObject, RestoreObjectTable};
use crate::config::PluginOptions;
use crate::job::Job;
use crate::stream::CommandSpec;
use crate::utils::errors::{DriverError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// Disk image stream produced by the dump tool
    DiskStream,
    /// Domain XML saved by the dump tool
    VmConfig,
    /// Fresh checkpoint packaged as a restore object
    CheckpointRecord,
    /// Previous job's checkpoint re-emitted unchanged
    CheckpointPassthrough,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemKind::DiskStream => "disk-stream",
            ItemKind::VmConfig => "vm-config",
            ItemKind::CheckpointRecord => "checkpoint-record",
            ItemKind::CheckpointPassthrough => "checkpoint-passthrough",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    RestoreObject,
}

/// One logical transfer unit of a job
#[derive(Debug, Clone)]
pub struct Item {
    pub kind: ItemKind,
    /// Name of the item in the backup namespace
    pub fname: String,
    pub file_type: FileType,
    /// Subprocess producing the bytes of a regular item
    pub command: Option<CommandSpec>,
    /// Payload of a restore-object item
    pub restore_object: Option<RestoreObject>,
}

impl Item {
    pub fn is_streamed(&self) -> bool {
        self.file_type == FileType::Regular
    }
}

/// Everything an item needs to be materialized
pub struct SequenceContext<'a> {
    pub job: &'a Job,
    pub options: &'a PluginOptions,
    pub previous_lsn: u64,
    pub table: &'a RestoreObjectTable,
    pub checkpoints: &'a CheckpointStore,
}

/// Ordered queue of the items of one backup job
#[derive(Debug, Clone)]
pub struct ItemSequencer {
    queue: VecDeque<ItemKind>,
}

impl ItemSequencer {
    /// Plan a backup. A skipped incremental only passes the previous checkpoint on.
    pub fn plan(skip_transfer: bool) -> Self {
        let queue = if skip_transfer {
            VecDeque::from([ItemKind::CheckpointPassthrough])
        } else {
            VecDeque::from([
                ItemKind::DiskStream,
                ItemKind::VmConfig,
                ItemKind::CheckpointRecord,
            ])
        };
        Self { queue }
    }

    pub fn has_more(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    /// Pop the next item kind without materializing it
    pub fn next_kind(&mut self) -> Option<ItemKind> {
        self.queue.pop_front()
    }

    /// Pop and materialize the next item, `None` once the job is complete
    pub fn next_item(&mut self, ctx: &SequenceContext<'_>) -> Result<Option<Item>> {
        match self.next_kind() {
            Some(kind) => build_item(kind, ctx).map(Some),
            None => Ok(None),
        }
    }
}

fn build_item(kind: ItemKind, ctx: &SequenceContext<'_>) -> Result<Item> {
    let job = ctx.job;
    let ns = ctx.options.namespace.trim_end_matches('/');

    let item = match kind {
        ItemKind::DiskStream => Item {
            kind,
            fname: format!("{}/{}.{}.zip.{}", ns, job.vm_name, job.level.as_str(), job.id_suffix()),
            file_type: FileType::Regular,
            command: Some(CommandSpec::disk_dump(&ctx.options.dump_binary, job)),
            restore_object: None,
        },
        ItemKind::VmConfig => Item {
            kind,
            fname: format!(
                "{}/{}.vmconfig.virtnbdbackup.{}.xml.{}",
                ns,
                job.vm_name,
                ctx.previous_lsn,
                job.id_suffix()
            ),
            file_type: FileType::Regular,
            command: Some(CommandSpec::vm_config(&ctx.options.cat_binary, job, ctx.previous_lsn)),
            restore_object: None,
        },
        ItemKind::CheckpointRecord => {
            debug!("Waiting for checkpoint file {}", ctx.checkpoints.path().display());
            let checkpoint = ctx.checkpoints.wait_for(ctx.options.checkpoint_wait())?;
            debug!("cpt content is: '{}'", checkpoint.raw());
            let fname = checkpoint_fname(ns, &job.vm_name);
            Item {
                kind,
                restore_object: Some(RestoreObject::for_checkpoint(job.job_id, &fname, &checkpoint)),
                fname,
                file_type: FileType::RestoreObject,
                command: None,
            }
        }
        ItemKind::CheckpointPassthrough => {
            let payload = ctx.table.latest_payload().ok_or_else(|| {
                DriverError::Precondition("no previous checkpoint to pass through".to_string())
            })?;
            let fname = checkpoint_fname(ns, &job.vm_name);
            Item {
                kind,
                restore_object: Some(RestoreObject::from_payload(job.job_id, &fname, payload.to_vec())),
                fname,
                file_type: FileType::RestoreObject,
                command: None,
            }
        }
    };

    info!("Starting backup of {}", item.fname);
    Ok(item)
}

fn checkpoint_fname(ns: &str, vm_name: &str) -> String {
    format!("{}/{}.cpt", ns, vm_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::job::Level;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        job: Job,
        options: PluginOptions,
        table: RestoreObjectTable,
        checkpoints: CheckpointStore,
    }

    fn fixture(level: Level) -> Fixture {
        let dir = TempDir::new().unwrap();
        let job = Job::new(7, level, "vm1", dir.path());
        let mut options = PluginOptions::default();
        options.vm_name = Some("vm1".to_string());
        options.checkpoint_wait_secs = 0;
        let checkpoints = CheckpointStore::for_job(&job);
        Fixture {
            _dir: dir,
            job,
            options,
            table: RestoreObjectTable::new(),
            checkpoints,
        }
    }

    fn ctx(f: &Fixture, previous_lsn: u64) -> SequenceContext<'_> {
        SequenceContext {
            job: &f.job,
            options: &f.options,
            previous_lsn,
            table: &f.table,
            checkpoints: &f.checkpoints,
        }
    }

    #[test]
    fn test_full_backup_order_and_names() {
        let f = fixture(Level::Full);
        f.checkpoints.save(&Checkpoint::new("[\"virtnbdbackup.0\"]\n")).unwrap();

        let mut seq = ItemSequencer::plan(false);
        let ctx = ctx(&f, 0);

        let disk = seq.next_item(&ctx).unwrap().unwrap();
        assert_eq!(disk.kind, ItemKind::DiskStream);
        assert_eq!(disk.fname, "/_libvirt/vm1.full.zip.0000000007");
        assert!(disk.is_streamed());
        assert!(seq.has_more());

        let xml = seq.next_item(&ctx).unwrap().unwrap();
        assert_eq!(xml.kind, ItemKind::VmConfig);
        assert_eq!(xml.fname, "/_libvirt/vm1.vmconfig.virtnbdbackup.0.xml.0000000007");

        let cpt = seq.next_item(&ctx).unwrap().unwrap();
        assert_eq!(cpt.kind, ItemKind::CheckpointRecord);
        assert_eq!(cpt.fname, "/_libvirt/vm1.cpt");
        assert_eq!(cpt.file_type, FileType::RestoreObject);
        assert!(cpt.command.is_none());
        let object = cpt.restore_object.unwrap();
        assert_eq!(object.job_id, 7);
        assert_eq!(object.object_name, "/_libvirt/vm1.cpt");
        assert_eq!(object.checkpoint().unwrap().raw(), "[\"virtnbdbackup.0\"]\n");

        assert!(!seq.has_more());
        assert!(seq.next_item(&ctx).unwrap().is_none());
    }

    #[test]
    fn test_custom_namespace() {
        let mut f = fixture(Level::Full);
        f.options.namespace = "/_x/".to_string();
        let mut seq = ItemSequencer::plan(false);
        let disk = seq.next_item(&ctx(&f, 0)).unwrap().unwrap();
        assert_eq!(disk.fname, "/_x/vm1.full.zip.0000000007");
    }

    #[test]
    fn test_incremental_names_use_previous_lsn() {
        let f = fixture(Level::Incremental);
        let mut seq = ItemSequencer::plan(false);
        let ctx = ctx(&f, 4);

        let disk = seq.next_item(&ctx).unwrap().unwrap();
        assert_eq!(disk.fname, "/_libvirt/vm1.inc.zip.0000000007");
        let xml = seq.next_item(&ctx).unwrap().unwrap();
        assert_eq!(xml.fname, "/_libvirt/vm1.vmconfig.virtnbdbackup.4.xml.0000000007");
    }

    #[test]
    fn test_passthrough_carries_previous_payload() {
        let mut f = fixture(Level::Incremental);
        let previous = RestoreObject::for_checkpoint(6, "/_libvirt/vm1.cpt", &Checkpoint::new("[\"a\",\"b\"]"));
        f.table.insert(&previous).unwrap();

        let mut seq = ItemSequencer::plan(true);
        assert_eq!(seq.remaining(), 1);

        let item = seq.next_item(&ctx(&f, 2)).unwrap().unwrap();
        assert_eq!(item.kind, ItemKind::CheckpointPassthrough);
        assert_eq!(item.restore_object.unwrap().object, previous.object);
        assert!(seq.next_item(&ctx(&f, 2)).unwrap().is_none());
    }

    #[test]
    fn test_passthrough_without_previous_checkpoint() {
        let f = fixture(Level::Incremental);
        let mut seq = ItemSequencer::plan(true);
        assert!(matches!(seq.next_item(&ctx(&f, 0)), Err(DriverError::Precondition(_))));
    }

    #[test]
    fn test_checkpoint_record_waits_for_file() {
        let mut f = fixture(Level::Full);
        f.options.checkpoint_wait_secs = 5;
        let path = f.checkpoints.path();

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            fs::write(path, "[\"virtnbdbackup.0\"]").unwrap();
        });

        let mut seq = ItemSequencer::plan(false);
        seq.next_kind();
        seq.next_kind();
        let item = seq.next_item(&ctx(&f, 0)).unwrap().unwrap();
        writer.join().unwrap();
        assert_eq!(item.kind, ItemKind::CheckpointRecord);
    }

    #[test]
    fn test_checkpoint_record_missing_file() {
        let f = fixture(Level::Full);
        let mut seq = ItemSequencer::plan(false);
        seq.next_kind();
        seq.next_kind();
        assert!(matches!(
            seq.next_item(&ctx(&f, 0)),
            Err(DriverError::CheckpointUnavailable(_))
        ));
    }
}
