//! Stream bridge between host buffers and the dump/restore subprocess.
//!
//! One bridge owns exactly one child process for the lifetime of one item.
//! Backups read the child's stdout, restores write to its stdin.

pub mod command;
pub mod log;

pub use command::CommandSpec;
pub use log::JobLog;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::utils::errors::{DriverError, Result};

/// Exit code reported when the subprocess status could not be obtained
pub const UNKNOWN_EXIT_CODE: i32 = -99;

const TERMINATE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Backup: bytes flow from the subprocess to the host
    Read,
    /// Restore: bytes flow from the host to the subprocess
    Write,
}

/// Final status of a subprocess
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn code_or_unknown(&self) -> i32 {
        self.code.unwrap_or(UNKNOWN_EXIT_CODE)
    }
}

pub struct StreamBridge {
    command: CommandSpec,
    direction: Direction,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stdin: Option<ChildStdin>,
}

impl StreamBridge {
    /// Launch the subprocess for one item
    pub fn open(command: &CommandSpec, direction: Direction, stderr: Option<Stdio>) -> Result<Self> {
        let mut cmd = command.to_command()?;
        match direction {
            Direction::Read => {
                cmd.stdin(Stdio::null()).stdout(Stdio::piped());
            }
            Direction::Write => {
                cmd.stdin(Stdio::piped());
                if command.stdout_file.is_none() {
                    cmd.stdout(Stdio::null());
                }
            }
        }
        if let Some(stderr) = stderr {
            cmd.stderr(stderr);
        }

        let mut child = cmd.spawn().map_err(|e| {
            DriverError::Subprocess(format!("failed to start \"{}\": {}", command, e))
        })?;
        debug!("Started \"{}\" (pid {})", command, child.id());

        let stdout = child.stdout.take();
        let stdin = child.stdin.take();
        Ok(Self {
            command: command.clone(),
            direction,
            child: Some(child),
            stdout,
            stdin,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Single bounded read into `buf`; 0 means end of stream
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stdout.as_mut() {
            Some(stdout) => stdout.read(buf),
            None => Err(io::Error::new(io::ErrorKind::Unsupported, "stream is not open for reading")),
        }
    }

    /// Write all of `buf` to the subprocess
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => {
                stdin.write_all(buf)?;
                Ok(buf.len())
            }
            None => Err(io::Error::new(io::ErrorKind::Unsupported, "stream is not open for writing")),
        }
    }

    /// Finish the subprocess and collect its exit code.
    ///
    /// Closes stdin, drains any unread stdout and blocks until the child exits.
    pub fn close(&mut self) -> ExitReport {
        let Some(mut child) = self.child.take() else {
            return ExitReport { code: None };
        };
        drop(self.stdin.take());

        let status = match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Subprocess has terminated with status {}", status);
                Ok(status)
            }
            Ok(None) => {
                if let Some(mut stdout) = self.stdout.take() {
                    if let Err(e) = io::copy(&mut stdout, &mut io::sink()) {
                        warn!("Failed to drain output of \"{}\": {}", self.command, e);
                    }
                }
                child.wait()
            }
            Err(e) => Err(e),
        };
        drop(self.stdout.take());

        match status {
            Ok(status) => ExitReport { code: status.code() },
            Err(e) => {
                error!("Dump / restore command not finished properly: {}", e);
                ExitReport { code: None }
            }
        }
    }

    /// Terminate a child that is still running and reap it
    fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        drop(self.stdin.take());
        drop(self.stdout.take());

        if let Ok(None) = child.try_wait() {
            warn!("Terminating unfinished subprocess \"{}\" (pid {})", self.command, child.id());
            if let Err(e) = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
                warn!("Failed to signal pid {}: {}", child.id(), e);
            }
            let deadline = Instant::now() + TERMINATE_GRACE;
            while let Ok(None) = child.try_wait() {
                if Instant::now() >= deadline {
                    if let Err(e) = child.kill() {
                        warn!("Failed to kill pid {}: {}", child.id(), e);
                    }
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
        if let Err(e) = child.wait() {
            warn!("Failed to reap pid {}: {}", child.id(), e);
        }
    }
}

impl Drop for StreamBridge {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn test_read_until_end_of_stream() {
        let mut bridge = StreamBridge::open(&sh("printf 'disk-image-bytes'"), Direction::Read, None).unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = bridge.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            assert!(n <= buf.len());
            out.extend_from_slice(&buf[..n]);
        }

        assert_eq!(out, b"disk-image-bytes");
        assert!(bridge.close().success());
    }

    #[test]
    fn test_close_reports_nonzero_exit() {
        let mut bridge = StreamBridge::open(&sh("printf x; exit 3"), Direction::Read, None).unwrap();
        let report = bridge.close();
        assert_eq!(report.code, Some(3));
        assert!(!report.success());
    }

    #[test]
    fn test_close_drains_unread_output() {
        let mut bridge =
            StreamBridge::open(&sh("head -c 1048576 /dev/zero"), Direction::Read, None).unwrap();
        let mut buf = [0u8; 16];
        bridge.read(&mut buf).unwrap();
        assert!(bridge.close().success());
    }

    #[test]
    fn test_write_materializes_file() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("vm1.full.zip");
        let cmd = CommandSpec::restore_to("cat", &target);

        let mut bridge = StreamBridge::open(&cmd, Direction::Write, None).unwrap();
        assert_eq!(bridge.write(b"chunk-1,").unwrap(), 8);
        assert_eq!(bridge.write(b"chunk-2").unwrap(), 7);
        assert!(bridge.close().success());

        assert_eq!(fs::read(&target).unwrap(), b"chunk-1,chunk-2");
    }

    #[test]
    fn test_write_to_exited_process_fails() {
        let mut bridge = StreamBridge::open(&sh("exit 0"), Direction::Write, None).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let big = vec![0u8; 1024 * 1024];
        assert!(bridge.write(&big).is_err());
        assert!(bridge.close().success());
    }

    #[test]
    fn test_wrong_direction() {
        let mut bridge = StreamBridge::open(&sh("true"), Direction::Read, None).unwrap();
        assert!(bridge.write(b"x").is_err());
        bridge.close();
    }

    #[test]
    fn test_spawn_failure() {
        let result = StreamBridge::open(&CommandSpec::new("/nonexistent/virtnbdbackup"), Direction::Read, None);
        assert!(matches!(result, Err(DriverError::Subprocess(_))));
    }

    #[test]
    fn test_drop_terminates_running_child() {
        let bridge = StreamBridge::open(&sh("sleep 30"), Direction::Read, None).unwrap();
        let started = Instant::now();
        drop(bridge);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_drop_kills_child_ignoring_sigterm() {
        let bridge = StreamBridge::open(&sh("trap '' TERM; sleep 30"), Direction::Read, None).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let started = Instant::now();
        drop(bridge);
        let elapsed = started.elapsed();
        assert!(elapsed >= TERMINATE_GRACE);
        assert!(elapsed < Duration::from_secs(10));
    }

    #[test]
    fn test_close_twice() {
        let mut bridge = StreamBridge::open(&sh("true"), Direction::Read, None).unwrap();
        assert!(bridge.close().success());
        assert_eq!(bridge.close().code, None);
    }
}
