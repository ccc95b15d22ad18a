//! Userspace side of the CAAT sensor: loads a compiled probe bundle, binds
//! its programs to kernel hooks and streams decoded events out of the
//! bundle's buffer maps until shutdown.

pub mod config;
pub mod errors;
pub mod kernel;
pub mod loader;
pub mod logs;
pub mod probes;
pub mod sink;
pub mod stream;
pub mod supervisor;
