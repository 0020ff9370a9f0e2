//! libvirt/QEMU backup driver
//!
//! Streams a VM's disk images and domain configuration through an external
//! dump tool into a backup pipeline, reverses the process on restore, and
//! carries the incremental checkpoint between jobs as a restore object.

pub mod checkpoint;
pub mod config;
pub mod daemon;
pub mod driver;
pub mod host;
pub mod job;
pub mod sequencer;
pub mod stream;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, PluginOptions};
pub use driver::{JobSession, Outcome};
pub use job::{Job, Level};
pub use utils::errors::DriverError;
pub type Result<T> = std::result::Result<T, DriverError>;
