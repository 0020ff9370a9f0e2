//! Thin host adapter.
//!
//! Plays the orchestrator's part: issues the lifecycle calls of a
//! [`JobSession`] in order, moves bytes between the session and the
//! [`Catalog`], and stops issuing calls once cancelled.

pub mod catalog;

pub use catalog::{Catalog, JobRecord, JobStatus};

use std::io::{Read, Write};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkpoint::RestoreObject;
use crate::driver::{JobSession, Outcome};
use crate::job::Level;
use crate::stream::Direction;
use crate::utils::errors::{DriverError, Result};

/// Result of one job as seen by the host
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub job_id: u32,
    pub items: Vec<String>,
    pub bytes: u64,
    pub outcome: Outcome,
}

impl JobSummary {
    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Ok
    }
}

pub struct HostRunner<'a> {
    catalog: &'a Catalog,
    chunk_size: usize,
    cancel: CancellationToken,
}

impl<'a> HostRunner<'a> {
    pub fn new(catalog: &'a Catalog, chunk_size: usize) -> Self {
        Self::with_cancel(catalog, chunk_size, CancellationToken::new())
    }

    pub fn with_cancel(catalog: &'a Catalog, chunk_size: usize, cancel: CancellationToken) -> Self {
        Self {
            catalog,
            chunk_size: chunk_size.max(1),
            cancel,
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        Ok(())
    }

    /// Run a complete backup job and record it in the catalog
    pub fn run_backup(&self, mut session: JobSession, accurate: bool) -> Result<JobSummary> {
        let job = session.job().clone();
        info!("Starting {} backup job {} of {}", job.level, job.job_id, job.vm_name);

        let mut progress = BackupProgress::default();
        let driven = self.drive_backup(&mut session, accurate, &mut progress);
        // Tears down any subprocess still attached to the session.
        let outcome = session.end_job();
        driven?;

        let status = if outcome == Outcome::Ok {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        let objects = if status == JobStatus::Completed {
            progress.objects
        } else {
            Vec::new()
        };
        self.catalog.record_job(
            JobRecord {
                job_id: job.job_id,
                level: job.level,
                vm_name: job.vm_name.clone(),
                files: progress.files.clone(),
                bytes: progress.bytes,
                status,
                finished_at: chrono::Utc::now(),
            },
            objects,
        )?;

        info!("Backup job {} finished: {:?}", job.job_id, outcome);
        Ok(JobSummary {
            job_id: job.job_id,
            items: progress.items,
            bytes: progress.bytes,
            outcome,
        })
    }

    fn drive_backup(&self, session: &mut JobSession, accurate: bool, progress: &mut BackupProgress) -> Result<()> {
        let job = session.job().clone();

        if job.level == Level::Incremental {
            let chain = self.catalog.chain(&job.vm_name, None)?;
            for object in self.catalog.restore_objects_for(&chain)? {
                if session.receive_restore_object(&object).is_fatal() {
                    return Ok(());
                }
            }
        }

        if session.start_backup_job(accurate) != Outcome::Ok {
            return Ok(());
        }

        loop {
            self.check_cancelled()?;

            let item = match session.start_backup_item() {
                Ok(item) => item,
                Err(_) => return Ok(()),
            };
            progress.items.push(item.fname.clone());

            if item.is_streamed() {
                if session.open_stream(Direction::Read) != Outcome::Ok {
                    return Ok(());
                }
                let copied = self.copy_out(session, job.job_id, &item.fname);
                session.close_stream();
                progress.bytes += copied?;
                progress.files.push(item.fname.clone());
            } else if let Some(object) = item.restore_object {
                progress.objects.push(object);
            }

            match session.end_backup_item() {
                Outcome::MoreItems => continue,
                _ => return Ok(()),
            }
        }
    }

    fn copy_out(&self, session: &mut JobSession, job_id: u32, fname: &str) -> Result<u64> {
        let mut file = self.catalog.create_item(job_id, fname)?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut total = 0u64;
        loop {
            self.check_cancelled()?;
            let reply = session.read(&mut buf);
            if reply.outcome() == Outcome::RecoverableError {
                warn!("Read of {} failed with errno {}", fname, reply.io_errno);
                break;
            }
            if reply.status == 0 {
                break;
            }
            file.write_all(&buf[..reply.status])?;
            total += reply.status as u64;
        }
        file.flush()?;
        Ok(total)
    }

    /// Restore the chain ending at backup job `backup_job_id` below `where_dir`
    pub fn run_restore(&self, mut session: JobSession, backup_job_id: u32, where_dir: &Path) -> Result<JobSummary> {
        let job_id = session.job().job_id;
        info!("Starting restore job {} of backup job {}", job_id, backup_job_id);

        let mut progress = BackupProgress::default();
        let driven = self.drive_restore(&mut session, backup_job_id, where_dir, &mut progress);
        let outcome = session.end_job();
        driven?;

        info!("Restore job {} finished: {:?}", job_id, outcome);
        Ok(JobSummary {
            job_id,
            items: progress.items,
            bytes: progress.bytes,
            outcome,
        })
    }

    fn drive_restore(
        &self,
        session: &mut JobSession,
        backup_job_id: u32,
        where_dir: &Path,
        progress: &mut BackupProgress,
    ) -> Result<()> {
        let vm_name = session.job().vm_name.clone();
        if self.catalog.job(backup_job_id)?.is_none() {
            return Err(DriverError::Precondition(format!(
                "backup job {} is not in the catalog",
                backup_job_id
            )));
        }
        let chain = self.catalog.chain(&vm_name, Some(backup_job_id))?;
        if chain.is_empty() {
            return Err(DriverError::Precondition(format!(
                "no completed full backup of {} up to job {}",
                vm_name, backup_job_id
            )));
        }

        let objects: Vec<RestoreObject> = self.catalog.restore_objects_for(&chain)?;
        for object in &objects {
            if session.receive_restore_object(object).is_fatal() {
                return Ok(());
            }
        }

        for record in &chain {
            for fname in &record.files {
                self.check_cancelled()?;
                let ofname = where_dir.join(fname.trim_start_matches('/'));
                let ofname = ofname.to_string_lossy();
                progress.items.push(ofname.to_string());

                if session.create_file(&ofname) != Outcome::Ok {
                    return Ok(());
                }
                if session.open_stream(Direction::Write) != Outcome::Ok {
                    return Ok(());
                }
                let copied = self.copy_in(session, record.job_id, fname);
                session.close_stream();
                progress.bytes += copied?;

                if session.end_restore_item() != Outcome::Ok {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn copy_in(&self, session: &mut JobSession, job_id: u32, fname: &str) -> Result<u64> {
        let mut file = self.catalog.open_item(job_id, fname)?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut total = 0u64;
        loop {
            self.check_cancelled()?;
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let reply = session.write(&buf[..n]);
            if reply.outcome() == Outcome::RecoverableError {
                warn!("Write of {} failed with errno {}", fname, reply.io_errno);
                break;
            }
            total += reply.status as u64;
        }
        Ok(total)
    }
}

#[derive(Default)]
struct BackupProgress {
    items: Vec<String>,
    files: Vec<String>,
    objects: Vec<RestoreObject>,
    bytes: u64,
}
