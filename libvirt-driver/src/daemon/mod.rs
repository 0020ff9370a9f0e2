//! Process-level lifecycle of the driver binary.

pub mod shutdown;
