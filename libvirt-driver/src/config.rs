//! Configuration management for the backup driver.
//!
//! Plugin options arrive either as a host plugin definition string
//! (`vmname=vm1:strictIncremental=true`) or as the `[plugin]` table of the
//! TOML file loaded by the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::utils::errors::{DriverError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub plugin: PluginOptions,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub host: HostConfig,
}

/// Options understood by the driver itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginOptions {
    /// Name of the libvirt domain to back up
    #[serde(default, rename = "vmname")]
    pub vm_name: Option<String>,

    /// Root of the per-VM working directories
    #[serde(default = "default_backup_dir", rename = "backupdir")]
    pub backup_dir: PathBuf,

    /// Disk dump program
    #[serde(default = "default_dump_binary", rename = "dumpbinary")]
    pub dump_binary: String,

    /// Program used to emit the VM config and to materialize restored streams
    #[serde(default = "default_cat_binary", rename = "catbinary")]
    pub cat_binary: String,

    /// Skip incremental transfers when the checkpoint has not advanced
    #[serde(default, rename = "strictIncremental")]
    pub strict_incremental: bool,

    /// Optional per-job log file (`false`, absolute path, or name under `log_dir`)
    #[serde(default)]
    pub log: Option<String>,

    #[serde(default = "default_log_dir", rename = "logdir")]
    pub log_dir: PathBuf,

    /// Prefix of the synthetic file names in the backup namespace
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Seconds to wait for the dump tool to leave its checkpoint file behind
    #[serde(default = "default_checkpoint_wait", rename = "checkpointWait")]
    pub checkpoint_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Where the host adapter stores backed-up items and restore objects
    #[serde(default = "default_catalog_dir")]
    pub catalog_dir: PathBuf,

    /// Size of each read/write buffer handed to the driver
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

// Default values
fn default_backup_dir() -> PathBuf {
    PathBuf::from("/local/libvirt/backup")
}

fn default_dump_binary() -> String {
    "virtnbdbackup".to_string()
}

fn default_cat_binary() -> String {
    "cat".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/bareos")
}

fn default_namespace() -> String {
    "/_libvirt".to_string()
}

fn default_checkpoint_wait() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_catalog_dir() -> PathBuf {
    PathBuf::from("/var/lib/libvirt-driver/catalog")
}

fn default_chunk_size() -> usize {
    64 * 1024 // 64KB
}

impl Default for PluginOptions {
    fn default() -> Self {
        PluginOptions {
            vm_name: None,
            backup_dir: default_backup_dir(),
            dump_binary: default_dump_binary(),
            cat_binary: default_cat_binary(),
            strict_incremental: false,
            log: None,
            log_dir: default_log_dir(),
            namespace: default_namespace(),
            checkpoint_wait_secs: default_checkpoint_wait(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            catalog_dir: default_catalog_dir(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl PluginOptions {
    /// Parse a plugin definition string on top of the defaults
    pub fn parse_definition(definition: &str) -> Result<Self> {
        let mut options = PluginOptions::default();
        options.merge_definition(definition)?;
        Ok(options)
    }

    /// Apply the `key=value` pairs of a plugin definition string.
    ///
    /// Entries without `=` (such as the plugin module name) are ignored.
    pub fn merge_definition(&mut self, definition: &str) -> Result<()> {
        for entry in definition.split(':') {
            let entry = entry.trim();
            if let Some((key, value)) = entry.split_once('=') {
                self.set(key.trim(), value.trim())?;
            }
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "vmname" => self.vm_name = Some(value.to_string()),
            "backupdir" => self.backup_dir = PathBuf::from(value),
            "dumpbinary" => self.dump_binary = value.to_string(),
            "catbinary" => self.cat_binary = value.to_string(),
            "strictIncremental" => self.strict_incremental = value == "true",
            "log" => self.log = Some(value.to_string()),
            "logdir" => self.log_dir = PathBuf::from(value),
            "namespace" => self.namespace = value.to_string(),
            "checkpointWait" => {
                self.checkpoint_wait_secs = value.parse().map_err(|_| {
                    DriverError::Config(format!("checkpointWait must be a number of seconds, got '{}'", value))
                })?;
            }
            other => debug!("Ignoring unknown plugin option '{}'", other),
        }
        Ok(())
    }

    pub fn vm_name(&self) -> Result<&str> {
        match self.vm_name.as_deref() {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(DriverError::Config("option 'vmname' is required".to_string())),
        }
    }

    /// Working directory of the configured VM
    pub fn work_dir(&self) -> Result<PathBuf> {
        Ok(self.backup_dir.join(self.vm_name()?))
    }

    /// Resolve the working directory and create it if it does not exist yet
    pub fn prepare_work_dir(&self) -> Result<PathBuf> {
        let dir = self.work_dir()?;
        if !dir.exists() {
            debug!("Creating working directory {}", dir.display());
            std::fs::create_dir_all(&dir)?;
        }
        Ok(dir)
    }

    /// Per-job log file, if one is configured
    pub fn log_path(&self) -> Option<PathBuf> {
        match self.log.as_deref() {
            None | Some("") | Some("false") => None,
            Some(path) if Path::new(path).is_absolute() => Some(PathBuf::from(path)),
            Some(name) => Some(self.log_dir.join(name)),
        }
    }

    pub fn checkpoint_wait(&self) -> Duration {
        Duration::from_secs(self.checkpoint_wait_secs)
    }
}
