//! Launch external processes and stop them cooperatively.
//!
//! The launch side ([`launch`], [`cooperative`], [`process`]) spawns a child
//! and, for recognized interpreters, injects a wrapper that watches two
//! sentinel files. Deleting the alive file asks the child to stop; deleting
//! the kill file makes it stop now. The child side ([`wrapper`]) is that
//! watcher for Rust-hosted targets.

pub mod config;
pub mod control_files;
pub mod cooperative;
pub mod launch;
pub mod process;
pub mod pump;
pub mod wrapper;

pub use config::LifelineConfig;
pub use control_files::ControlFilePair;
pub use cooperative::CooperativeProcess;
pub use launch::{LaunchBuilder, LaunchError, LaunchSpec};
pub use process::{ManagedProcess, ProcessError, Status, Terminate, TerminationStatus};
