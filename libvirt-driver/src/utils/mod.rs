//! Utility modules for the backup driver.

pub mod errors;
pub mod logger;

pub use errors::{DriverError, Result};
