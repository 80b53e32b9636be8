/// Sentinel-file termination policy layered over [`ManagedProcess`].
///
/// `terminate()` deletes the alive file and `kill()` deletes the kill file;
/// the wrapper inside the child notices on its next poll. When no control
/// files were configured, or a deletion fails, both requests degrade to a
/// hard destroy.
use crate::control_files::ControlFilePair;
use crate::process::{ManagedProcess, ProcessError, Status, Terminate, TerminationStatus};
use std::path::Path;
use std::process::ExitStatus;

/// A managed child that may understand sentinel-file stop requests.
#[derive(Debug)]
pub struct CooperativeProcess {
    process: ManagedProcess,
    control: Option<ControlFilePair>,
}

impl CooperativeProcess {
    /// Wrap `process`; `control` is `None` when the child has no wrapper watching.
    pub fn new(process: ManagedProcess, control: Option<ControlFilePair>) -> Self {
        Self { process, control }
    }

    /// The underlying managed process.
    pub fn process(&self) -> &ManagedProcess {
        &self.process
    }

    pub fn alive_file(&self) -> Option<&Path> {
        self.control.as_ref().map(ControlFilePair::alive)
    }

    pub fn kill_file(&self) -> Option<&Path> {
        self.control.as_ref().map(ControlFilePair::kill)
    }

    /// Whether an alive file was configured for this child.
    pub fn has_process_alive_file(&self) -> bool {
        self.control.is_some()
    }

    /// Whether a kill file was configured for this child.
    pub fn has_process_kill_file(&self) -> bool {
        self.control.is_some()
    }

    /// Whether the alive file is configured and still on disk.
    pub fn exist_process_alive_file(&self) -> bool {
        self.control.as_ref().is_some_and(ControlFilePair::alive_exists)
    }

    /// Whether the kill file is configured and still on disk.
    pub fn exist_process_kill_file(&self) -> bool {
        self.control.as_ref().is_some_and(ControlFilePair::kill_exists)
    }

    pub fn pid(&self) -> Result<u32, ProcessError> {
        self.process.pid()
    }

    pub fn status(&self) -> Status {
        self.process.status()
    }

    pub fn is_alive(&self) -> bool {
        self.process.is_alive()
    }

    pub fn exit_value(&self) -> Result<ExitStatus, ProcessError> {
        self.process.exit_value()
    }

    pub fn destroy(&self) {
        self.process.destroy()
    }

    pub async fn wait_for(&self) -> Result<ExitStatus, ProcessError> {
        self.process.wait_for().await
    }

    pub async fn cleanup(&self) -> Result<ExitStatus, ProcessError> {
        self.process.cleanup().await
    }

    pub async fn wait_and_cleanup(&self) -> Result<ExitStatus, ProcessError> {
        self.process.wait_and_cleanup().await
    }

    /// Delete one sentinel file as a stop request, or destroy on failure.
    ///
    /// Requests at or below the current termination status are ignored so
    /// repeating a call never turns into a destroy.
    fn signal(&self, level: TerminationStatus, delete: fn(&ControlFilePair) -> std::io::Result<()>) {
        let Some(control) = self.control.as_ref() else {
            self.process.destroy();
            return;
        };
        if !self.process.is_alive() || self.process.termination_status() >= level {
            return;
        }
        match delete(control) {
            Ok(()) => {
                self.process.escalate(level);
                tracing::info!(
                    pid = ?self.process.pid().ok(),
                    request = ?level,
                    "requested cooperative stop"
                );
            }
            Err(e) => {
                tracing::warn!(
                    pid = ?self.process.pid().ok(),
                    request = ?level,
                    error = %e,
                    "failed to delete control file, destroying child"
                );
                self.process.destroy();
            }
        }
    }
}

impl Terminate for CooperativeProcess {
    fn terminate(&self) {
        self.signal(TerminationStatus::Interrupting, ControlFilePair::delete_alive);
    }

    fn kill(&self) {
        self.signal(TerminationStatus::Killing, ControlFilePair::delete_kill);
    }
}
