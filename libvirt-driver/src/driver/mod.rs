//! Job lifecycle state machine.
//!
//! The host drives a `JobSession` through an ordered sequence of calls:
//!
//! - backup: `receive_restore_object`* → `start_backup_job` →
//!   (`start_backup_item` → `open_stream` → `read`* → `close_stream` → `end_backup_item`)+ → `end_job`
//! - restore: `receive_restore_object`* →
//!   (`create_file` → `open_stream` → `write`* → `close_stream` → `end_restore_item`)+ → `end_job`
//!
//! Every call answers with an [`Outcome`]. A failing subprocess is only
//! reported at the end of its item; per-call I/O errors travel in [`IoReply`].

pub mod probe;

pub use probe::{should_skip_incremental, AssumeProgress, CheckpointProbe, FixedLsn};

use std::process::Stdio;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointStore, RestoreObject, RestoreObjectTable};
use crate::config::PluginOptions;
use crate::job::{Job, Level};
use crate::sequencer::{Item, ItemKind, ItemSequencer, RestoreTarget, SequenceContext};
use crate::stream::{CommandSpec, Direction, ExitReport, JobLog, StreamBridge};
use crate::utils::errors::{DriverError, Result};

/// Host-facing result of a lifecycle call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    /// Item finished, request the next one
    MoreItems,
    RecoverableError,
    FatalError,
}

impl Outcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Outcome::FatalError)
    }
}

/// Result of a single read or write call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoReply {
    /// Bytes transferred
    pub status: usize,
    /// 0 on success
    pub io_errno: i32,
}

impl IoReply {
    fn ok(status: usize) -> Self {
        Self { status, io_errno: 0 }
    }

    fn failed(err: &std::io::Error) -> Self {
        Self {
            status: 0,
            io_errno: err.raw_os_error().unwrap_or(-1),
        }
    }

    pub fn is_error(&self) -> bool {
        self.io_errno != 0
    }

    /// A failed read or write only fails the call, never the job
    pub fn outcome(&self) -> Outcome {
        if self.is_error() {
            Outcome::RecoverableError
        } else {
            Outcome::Ok
        }
    }
}

/// All state of one backup or restore job
pub struct JobSession {
    job: Job,
    options: PluginOptions,
    probe: Box<dyn CheckpointProbe>,
    table: RestoreObjectTable,
    checkpoints: CheckpointStore,
    /// Highest checkpoint position received from earlier jobs
    previous_lsn: u64,
    sequencer: Option<ItemSequencer>,
    current: Option<Item>,
    restore_command: Option<CommandSpec>,
    bridge: Option<StreamBridge>,
    log: Option<JobLog>,
    last_exit: Option<ExitReport>,
    dumped: bool,
    failed: bool,
}

impl JobSession {
    pub fn new(job: Job, options: PluginOptions) -> Self {
        Self::with_probe(job, options, Box::new(AssumeProgress))
    }

    pub fn with_probe(job: Job, options: PluginOptions, probe: Box<dyn CheckpointProbe>) -> Self {
        let checkpoints = CheckpointStore::for_job(&job);
        Self {
            job,
            options,
            probe,
            table: RestoreObjectTable::new(),
            checkpoints,
            previous_lsn: 0,
            sequencer: None,
            current: None,
            restore_command: None,
            bridge: None,
            log: None,
            last_exit: None,
            dumped: false,
            failed: false,
        }
    }

    /// Build the job from plugin options, creating the VM working directory
    pub fn from_options(job_id: u32, level: Level, options: PluginOptions) -> Result<Self> {
        let vm_name = options.vm_name()?.to_string();
        let work_dir = options.prepare_work_dir()?;
        Ok(Self::new(Job::new(job_id, level, vm_name, work_dir), options))
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn previous_lsn(&self) -> u64 {
        self.previous_lsn
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    fn fail(&mut self, err: &DriverError) -> Outcome {
        error!("Job {}: {}", self.job.job_id, err);
        self.failed = true;
        err.outcome()
    }

    /// Reject job settings the driver cannot honour
    pub fn check_preconditions(&mut self, accurate: bool) -> Outcome {
        if accurate {
            let err = DriverError::Precondition(
                "Accurate backup not allowed please disable in Job".to_string(),
            );
            return self.fail(&err);
        }
        Outcome::Ok
    }

    /// Accept a restore object from an earlier job
    pub fn receive_restore_object(&mut self, object: &RestoreObject) -> Outcome {
        match self.try_receive_restore_object(object) {
            Ok(()) => Outcome::Ok,
            Err(e) => self.fail(&e),
        }
    }

    fn try_receive_restore_object(&mut self, object: &RestoreObject) -> Result<()> {
        let checkpoint = self.table.insert(object)?;
        if checkpoint.is_empty() {
            debug!("Restore object of job {} carries no checkpoint", object.job_id);
            return Ok(());
        }

        let lsn = checkpoint.lsn();
        if lsn >= self.previous_lsn {
            self.checkpoints.save(&checkpoint)?;
            self.previous_lsn = lsn;
        }
        info!(
            "Got to checkpoint {} from restore object of job {}",
            lsn, object.job_id
        );
        Ok(())
    }

    /// Validate the job and plan its items
    pub fn start_backup_job(&mut self, accurate: bool) -> Outcome {
        let outcome = self.check_preconditions(accurate);
        if outcome != Outcome::Ok {
            return outcome;
        }
        debug!("start_backup_job, level: {}", self.job.level);

        match self.plan_backup() {
            Ok(sequencer) => {
                self.sequencer = Some(sequencer);
                Outcome::Ok
            }
            Err(e) => self.fail(&e),
        }
    }

    fn plan_backup(&self) -> Result<ItemSequencer> {
        if self.job.level == Level::Full {
            return Ok(ItemSequencer::plan(false));
        }

        if self.previous_lsn == 0 {
            return Err(DriverError::Precondition(
                "No LSN received to be used with incremental backup".to_string(),
            ));
        }
        let observed = self.probe.observed_lsn(&self.job, self.previous_lsn)?;
        info!("Backup until LSN: {}", observed);

        let skip = should_skip_incremental(self.options.strict_incremental, self.previous_lsn, observed);
        if skip {
            info!(
                "Last LSN {} is not higher than LSN from previous job {}. Skipping this incremental backup",
                observed, self.previous_lsn
            );
        }
        Ok(ItemSequencer::plan(skip))
    }

    /// Select and describe the next item to back up
    pub fn start_backup_item(&mut self) -> Result<Item> {
        match self.next_backup_item() {
            Ok(item) => {
                self.current = Some(item.clone());
                self.last_exit = None;
                Ok(item)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn next_backup_item(&mut self) -> Result<Item> {
        if self.failed {
            return Err(DriverError::Precondition("job has already failed".to_string()));
        }
        let ctx = SequenceContext {
            job: &self.job,
            options: &self.options,
            previous_lsn: self.previous_lsn,
            table: &self.table,
            checkpoints: &self.checkpoints,
        };
        let sequencer = self
            .sequencer
            .as_mut()
            .ok_or_else(|| DriverError::Precondition("backup job was not started".to_string()))?;
        sequencer
            .next_item(&ctx)?
            .ok_or_else(|| DriverError::Precondition("no more items to back up".to_string()))
    }

    /// Prepare the restore of one file named by the host
    pub fn create_file(&mut self, ofname: &str) -> Outcome {
        debug!("create file with {} called", ofname);
        let prepared = if self.failed {
            Err(DriverError::Precondition("job has already failed".to_string()))
        } else {
            RestoreTarget::resolve(ofname).and_then(|target| {
                target.prepare(&self.table, &self.checkpoints, &self.options.cat_binary)
            })
        };

        match prepared {
            Ok(command) => {
                self.restore_command = Some(command);
                self.last_exit = None;
                Outcome::Ok
            }
            Err(e) => self.fail(&e),
        }
    }

    /// Launch the subprocess for the current item
    pub fn open_stream(&mut self, direction: Direction) -> Outcome {
        match self.try_open_stream(direction) {
            Ok(()) => Outcome::Ok,
            Err(e) => self.fail(&e),
        }
    }

    fn try_open_stream(&mut self, direction: Direction) -> Result<()> {
        if self.bridge.is_some() {
            return Err(DriverError::Precondition("a stream is already open".to_string()));
        }
        let command = match direction {
            Direction::Read => self.current.as_ref().and_then(|item| item.command.clone()),
            Direction::Write => self.restore_command.clone(),
        }
        .ok_or_else(|| DriverError::Precondition("no streamed item is selected".to_string()))?;

        self.log = self.options.log_path().and_then(|path| JobLog::open(&path));
        let label = job_label(direction);
        let stderr: Option<Stdio> = match self.log.as_mut() {
            Some(log) => {
                log.note(&format!("{} {} opens stream with \"{}\"", label, self.job.job_id, command));
                log.stderr()
            }
            None => None,
        };

        match StreamBridge::open(&command, direction, stderr) {
            Ok(bridge) => {
                self.bridge = Some(bridge);
                Ok(())
            }
            Err(e) => {
                self.log = None;
                Err(e)
            }
        }
    }

    /// Read the next chunk of the backup stream into `buf`
    pub fn read(&mut self, buf: &mut [u8]) -> IoReply {
        let Some(bridge) = self.bridge.as_mut() else {
            warn!("read called without an open stream");
            return IoReply { status: 0, io_errno: -1 };
        };
        match bridge.read(buf) {
            Ok(n) => IoReply::ok(n),
            Err(e) => {
                warn!("Error reading data: {}", e);
                IoReply::failed(&e)
            }
        }
    }

    /// Send one chunk of a restore stream to the subprocess
    pub fn write(&mut self, buf: &[u8]) -> IoReply {
        let Some(bridge) = self.bridge.as_mut() else {
            warn!("write called without an open stream");
            return IoReply { status: 0, io_errno: -1 };
        };
        match bridge.write(buf) {
            Ok(n) => IoReply::ok(n),
            Err(e) => {
                warn!("Error writing data: {}", e);
                IoReply::failed(&e)
            }
        }
    }

    /// Wait for the subprocess and remember its exit status.
    ///
    /// Always answers `Ok`; the status is judged at the end of the item.
    pub fn close_stream(&mut self) -> Outcome {
        let Some(mut bridge) = self.bridge.take() else {
            return Outcome::Ok;
        };
        let report = bridge.close();
        if let Some(code) = report.code {
            debug!("Subprocess has terminated with returncode: {}", code);
        }
        if let Some(mut log) = self.log.take() {
            log.note(&format!("{} {} closes stream", job_label(bridge.direction()), self.job.job_id));
        }
        self.last_exit = Some(report);
        Outcome::Ok
    }

    /// Judge the finished item and tell the host whether more follow
    pub fn end_backup_item(&mut self) -> Outcome {
        let Some(item) = self.current.take() else {
            return self.fail(&DriverError::Precondition("no backup item in progress".to_string()));
        };

        if item.is_streamed() {
            let command = item.command.as_ref().map(|c| c.to_string()).unwrap_or_default();
            if let Err(e) = self.judge_exit("Dump", &command) {
                return self.fail(&e);
            }
            if item.kind == ItemKind::DiskStream {
                self.dumped = true;
            }
        }

        if self.sequencer.as_ref().is_some_and(|s| s.has_more()) {
            return Outcome::MoreItems;
        }
        if self.dumped {
            self.stop_dump_session();
        }
        Outcome::Ok
    }

    /// Judge the subprocess of the restored file
    pub fn end_restore_item(&mut self) -> Outcome {
        let command = self
            .restore_command
            .take()
            .map(|c| c.to_string())
            .unwrap_or_default();
        match self.judge_exit("Restore", &command) {
            Ok(()) => Outcome::Ok,
            Err(e) => self.fail(&e),
        }
    }

    fn judge_exit(&mut self, what: &str, command: &str) -> Result<()> {
        // A stream left open by the host is finished here.
        if self.bridge.is_some() {
            self.close_stream();
        }
        let report = self.last_exit.take().unwrap_or(ExitReport { code: None });
        match report.code {
            Some(0) => Ok(()),
            Some(code) => {
                let mut msg = vec![
                    format!("{} command returned non-zero value: {}", what, code),
                    format!("command: \"{}\"", command),
                ];
                if let Some(path) = self.options.log_path() {
                    msg.push(format!("log file: \"{}\"", path.display()));
                }
                Err(DriverError::Subprocess(msg.join(", ")))
            }
            None => Err(DriverError::Subprocess(format!(
                "{} command not finished properly for unknown reason (code {})",
                what,
                report.code_or_unknown()
            ))),
        }
    }

    fn stop_dump_session(&self) {
        let command = CommandSpec::stop_session(&self.options.dump_binary, &self.job.vm_name);
        let status = command.to_command().and_then(|mut cmd| {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
        });
        match status {
            Ok(status) if status.success() => debug!("Stopped backup session with \"{}\"", command),
            Ok(status) => warn!("\"{}\" exited with {}", command, status),
            Err(e) => warn!("Failed to run \"{}\": {}", command, e),
        }
    }

    /// Finish the job; the session is discarded
    pub fn end_job(mut self) -> Outcome {
        if let Some(mut bridge) = self.bridge.take() {
            warn!("Job {} ended with an open stream", self.job.job_id);
            bridge.close();
        }
        if self.failed {
            Outcome::FatalError
        } else {
            Outcome::Ok
        }
    }
}

fn job_label(direction: Direction) -> &'static str {
    match direction {
        Direction::Read => "Backup Job",
        Direction::Write => "Restore Job",
    }
}
