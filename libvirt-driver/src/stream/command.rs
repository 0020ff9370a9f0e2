//! External command lines for the dump and restore tools.
//!
//! Commands are kept as an argument vector and never pass through a shell,
//! so VM names and paths reach the tool verbatim.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::job::Job;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// File that receives the command's standard output
    pub stdout_file: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdout_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    /// Full or incremental disk dump written to stdout
    pub fn disk_dump(dump_binary: &str, job: &Job) -> Self {
        CommandSpec::new(dump_binary)
            .arg("-n")
            .arg("-d")
            .arg(&job.vm_name)
            .arg("-l")
            .arg(job.level.as_str())
            .arg("-o")
            .arg("-")
            .arg("-S")
            .arg(job.work_dir.display().to_string())
    }

    /// Emit the domain XML the dump tool saved for checkpoint `lsn`
    pub fn vm_config(cat_binary: &str, job: &Job, lsn: u64) -> Self {
        let xml = job.work_dir.join(vm_config_file_name(lsn));
        CommandSpec::new(cat_binary).arg(xml.display().to_string())
    }

    /// Copy stdin into `target`
    pub fn restore_to(cat_binary: &str, target: &Path) -> Self {
        CommandSpec::new(cat_binary).arg("-").stdout_to(target)
    }

    /// Release the dump tool's backup session for `vm_name`
    pub fn stop_session(dump_binary: &str, vm_name: &str) -> Self {
        CommandSpec::new(dump_binary)
            .arg("-d")
            .arg(vm_name)
            .arg("-o")
            .arg("-")
            .arg("-k")
    }

    /// Build a `Command` with stdout redirected if requested
    pub fn to_command(&self) -> std::io::Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(path) = &self.stdout_file {
            cmd.stdout(Stdio::from(File::create(path)?));
        }
        Ok(cmd)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        if let Some(path) = &self.stdout_file {
            write!(f, " > {}", path.display())?;
        }
        Ok(())
    }
}

pub fn vm_config_file_name(lsn: u64) -> String {
    format!("vmconfig.virtnbdbackup.{}.xml", lsn)
}
