/// A spawned child with drained output streams and a derived status.
///
/// The child's stdout and stderr are each drained by a [`StreamPump`] from
/// the moment the process is wrapped. The termination status only ever moves
/// forward (none → interrupting → killing → destroying); the public
/// [`Status`] is recomputed from it and a fresh liveness check on every call.
use crate::pump::{BoxSink, StreamPump};
use serde::Serialize;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};

/// How often `wait_for` re-checks liveness.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors reported by managed-process queries.
#[derive(Debug)]
pub enum ProcessError {
    /// The child has not exited yet, so there is no exit status.
    NotYetExited,
    /// Cleanup was requested while the child is still running.
    StillRunning,
    /// The runtime cannot provide what was asked for.
    Unsupported { operation: &'static str },
    Io { source: std::io::Error },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::NotYetExited => write!(f, "process has not exited yet"),
            ProcessError::StillRunning => write!(f, "process is still running"),
            ProcessError::Unsupported { operation } => {
                write!(f, "operation not supported for this process: {}", operation)
            }
            ProcessError::Io { source } => write!(f, "process I/O error: {}", source),
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Io { source } => Some(source),
            _ => None,
        }
    }
}

/// Which stop request has been issued, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TerminationStatus {
    None = 0,
    Interrupting = 1,
    Killing = 2,
    Destroying = 3,
}

impl TerminationStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => TerminationStatus::Interrupting,
            2 => TerminationStatus::Killing,
            3 => TerminationStatus::Destroying,
            _ => TerminationStatus::None,
        }
    }
}

/// Externally visible state of a managed child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Running,
    Finished,
    Terminating,
    Interrupted,
    Killed,
    Destroyed,
}

impl Status {
    /// Derive the status from liveness and the termination request issued so far.
    pub fn derive(alive: bool, termination: TerminationStatus) -> Self {
        match (alive, termination) {
            (true, TerminationStatus::None) => Status::Running,
            (true, _) => Status::Terminating,
            (false, TerminationStatus::None) => Status::Finished,
            (false, TerminationStatus::Interrupting) => Status::Interrupted,
            (false, TerminationStatus::Killing) => Status::Killed,
            (false, TerminationStatus::Destroying) => Status::Destroyed,
        }
    }

    /// Whether the child has exited.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Running | Status::Terminating)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Running => "running",
            Status::Finished => "finished",
            Status::Terminating => "terminating",
            Status::Interrupted => "interrupted",
            Status::Killed => "killed",
            Status::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Stop requests a managed child understands.
///
/// Plain [`ManagedProcess`] has no cooperative channel, so both requests
/// fall back to [`ManagedProcess::destroy`].
pub trait Terminate {
    /// Ask the child to stop gracefully.
    fn terminate(&self);
    /// Ask the child to stop now.
    fn kill(&self);
}

struct Pumps {
    stdout: Option<StreamPump<ChildStdout, BoxSink>>,
    stderr: Option<StreamPump<ChildStderr, BoxSink>>,
}

/// Exclusive owner of one child process.
pub struct ManagedProcess {
    program: String,
    pid: Option<u32>,
    child: Mutex<Child>,
    exit: OnceLock<ExitStatus>,
    termination: AtomicU8,
    stdin: Mutex<Option<ChildStdin>>,
    // Async lock: cleanup holds it while the pumps drain so concurrent callers wait.
    pumps: tokio::sync::Mutex<Option<Pumps>>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("termination", &self.termination_status())
            .finish()
    }
}

impl ManagedProcess {
    /// Take ownership of `child` and start draining its output.
    ///
    /// Each sink receives the corresponding stream; `None` discards it.
    /// Must be called from within a tokio runtime.
    pub fn new(
        mut child: Child,
        program: impl Into<String>,
        stdout_sink: Option<BoxSink>,
        stderr_sink: Option<BoxSink>,
    ) -> Self {
        let program = program.into();
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .map(|s| StreamPump::spawn("stdout", s, stdout_sink, false, false));
        let stderr = child
            .stderr
            .take()
            .map(|s| StreamPump::spawn("stderr", s, stderr_sink, false, false));
        let stdin = child.stdin.take();

        tracing::debug!(program = %program, pid = ?pid, "managing child process");

        Self {
            program,
            pid,
            child: Mutex::new(child),
            exit: OnceLock::new(),
            termination: AtomicU8::new(TerminationStatus::None as u8),
            stdin: Mutex::new(stdin),
            pumps: tokio::sync::Mutex::new(Some(Pumps { stdout, stderr })),
        }
    }

    /// Program the child was started from.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// OS process id. `Unsupported` once the child has been reaped.
    pub fn pid(&self) -> Result<u32, ProcessError> {
        lock(&self.child)
            .id()
            .ok_or(ProcessError::Unsupported { operation: "pid" })
    }

    /// The child's stdin, if it was piped and not yet taken.
    pub fn take_stdin(&self) -> Option<ChildStdin> {
        lock(&self.stdin).take()
    }

    pub fn termination_status(&self) -> TerminationStatus {
        TerminationStatus::from_u8(self.termination.load(Ordering::SeqCst))
    }

    /// Raise the termination status to `status` unless a stronger one is already set.
    pub(crate) fn escalate(&self, status: TerminationStatus) {
        self.termination.fetch_max(status as u8, Ordering::SeqCst);
    }

    /// Current status. Never blocks on the child and never fails.
    pub fn status(&self) -> Status {
        Status::derive(self.is_alive(), self.termination_status())
    }

    /// Whether the child is still running.
    ///
    /// When the exit status cannot be determined the child counts as alive.
    pub fn is_alive(&self) -> bool {
        match self.poll_exit() {
            Ok(status) => status.is_none(),
            Err(e) => {
                tracing::debug!(pid = ?self.pid, error = %e, "failed to query child status");
                true
            }
        }
    }

    /// Non-blocking exit check; caches the status once seen.
    fn poll_exit(&self) -> Result<Option<ExitStatus>, ProcessError> {
        if let Some(status) = self.exit.get() {
            return Ok(Some(*status));
        }
        let mut child = lock(&self.child);
        match child.try_wait() {
            Ok(Some(status)) => {
                let _ = self.exit.set(status);
                Ok(Some(status))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(ProcessError::Io { source: e }),
        }
    }

    /// Exit status of the child, or `NotYetExited`.
    pub fn exit_value(&self) -> Result<ExitStatus, ProcessError> {
        if self.is_alive() {
            return Err(ProcessError::NotYetExited);
        }
        self.exit.get().copied().ok_or(ProcessError::NotYetExited)
    }

    /// Wait until the child exits.
    pub async fn wait_for(&self) -> Result<ExitStatus, ProcessError> {
        loop {
            if let Some(status) = self.poll_exit()? {
                return Ok(status);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Finish both output pumps and close the child's I/O handles.
    ///
    /// Fails with `StillRunning` while the child is alive. Concurrent callers
    /// all return only after the pumps have finished; calling it again after
    /// a successful cleanup just returns the exit status.
    pub async fn cleanup(&self) -> Result<ExitStatus, ProcessError> {
        if self.is_alive() {
            return Err(ProcessError::StillRunning);
        }

        let mut guard = self.pumps.lock().await;
        if let Some(pumps) = guard.take() {
            if let Some(pump) = pumps.stdout {
                let outcome = pump.finish().await;
                tracing::trace!(pid = ?self.pid, bytes = outcome.bytes, "stdout drained");
            }
            if let Some(pump) = pumps.stderr {
                let outcome = pump.finish().await;
                tracing::trace!(pid = ?self.pid, bytes = outcome.bytes, "stderr drained");
            }
        }
        drop(guard);
        drop(self.take_stdin());

        self.exit_value()
    }

    /// `wait_for` followed by `cleanup`.
    pub async fn wait_and_cleanup(&self) -> Result<ExitStatus, ProcessError> {
        self.wait_for().await?;
        self.cleanup().await
    }

    /// Forcibly stop the child. A child that already exited is left alone.
    pub fn destroy(&self) {
        if !self.is_alive() {
            return;
        }
        self.escalate(TerminationStatus::Destroying);
        let mut child = lock(&self.child);
        match child.start_kill() {
            Ok(()) => tracing::info!(pid = ?self.pid, program = %self.program, "destroyed child process"),
            Err(e) => tracing::warn!(pid = ?self.pid, error = %e, "failed to destroy child process"),
        }
    }
}

impl Terminate for ManagedProcess {
    fn terminate(&self) {
        self.destroy();
    }

    fn kill(&self) {
        self.destroy();
    }
}

/// Map an exit status to a shell-style exit code (128+signal for signalled children).
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_sh(script: &str) -> Child {
        Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_status_derivation_table() {
        use TerminationStatus as T;
        assert_eq!(Status::derive(true, T::None), Status::Running);
        assert_eq!(Status::derive(true, T::Interrupting), Status::Terminating);
        assert_eq!(Status::derive(true, T::Killing), Status::Terminating);
        assert_eq!(Status::derive(true, T::Destroying), Status::Terminating);
        assert_eq!(Status::derive(false, T::None), Status::Finished);
        assert_eq!(Status::derive(false, T::Interrupting), Status::Interrupted);
        assert_eq!(Status::derive(false, T::Killing), Status::Killed);
        assert_eq!(Status::derive(false, T::Destroying), Status::Destroyed);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!Status::Running.is_terminal());
        assert!(!Status::Terminating.is_terminal());
        assert!(Status::Finished.is_terminal());
        assert!(Status::Destroyed.is_terminal());
        assert_eq!(Status::Interrupted.to_string(), "interrupted");
    }

    #[tokio::test]
    async fn test_finished_child_reports_exit_code() {
        let process = ManagedProcess::new(spawn_sh("exit 3"), "sh", None, None);
        let status = process.wait_and_cleanup().await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(process.status(), Status::Finished);
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_exit_value_before_exit_fails() {
        let process = ManagedProcess::new(spawn_sh("sleep 5"), "sh", None, None);
        assert!(matches!(
            process.exit_value(),
            Err(ProcessError::NotYetExited)
        ));
        assert!(matches!(
            process.cleanup().await,
            Err(ProcessError::StillRunning)
        ));
        assert_eq!(process.status(), Status::Running);
        process.destroy();
        process.wait_for().await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_marks_destroyed() {
        let process = ManagedProcess::new(spawn_sh("sleep 30"), "sh", None, None);
        assert!(process.pid().unwrap() > 0);

        process.destroy();
        assert_eq!(process.termination_status(), TerminationStatus::Destroying);
        let status = process.wait_and_cleanup().await.unwrap();
        assert!(!status.success());
        assert_eq!(process.status(), Status::Destroyed);
    }

    #[tokio::test]
    async fn test_base_terminate_and_kill_fall_back_to_destroy() {
        let process = ManagedProcess::new(spawn_sh("sleep 30"), "sh", None, None);
        process.terminate();
        process.kill();
        process.wait_for().await.unwrap();
        assert_eq!(process.status(), Status::Destroyed);
    }

    #[tokio::test]
    async fn test_destroy_after_exit_keeps_finished() {
        let process = ManagedProcess::new(spawn_sh("true"), "sh", None, None);
        process.wait_for().await.unwrap();
        process.destroy();
        assert_eq!(process.status(), Status::Finished);
    }

    #[tokio::test]
    async fn test_escalation_never_moves_backwards() {
        let process = ManagedProcess::new(spawn_sh("sleep 30"), "sh", None, None);
        process.escalate(TerminationStatus::Killing);
        process.escalate(TerminationStatus::Interrupting);
        assert_eq!(process.termination_status(), TerminationStatus::Killing);
        process.destroy();
        process.wait_for().await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_waits_for_output_pumps() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("out.txt");
        let err_path = dir.path().join("err.txt");
        let out = tokio::fs::File::create(&out_path).await.unwrap();
        let err = tokio::fs::File::create(&err_path).await.unwrap();

        let process = ManagedProcess::new(
            spawn_sh("echo to-stdout; echo to-stderr >&2"),
            "sh",
            Some(Box::new(out)),
            Some(Box::new(err)),
        );
        process.wait_and_cleanup().await.unwrap();

        assert_eq!(std::fs::read_to_string(&out_path).unwrap(), "to-stdout\n");
        assert_eq!(std::fs::read_to_string(&err_path).unwrap(), "to-stderr\n");
        // Second cleanup is a no-op that still reports the exit status.
        assert!(process.cleanup().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_pid_unsupported_after_reap() {
        let process = ManagedProcess::new(spawn_sh("true"), "sh", None, None);
        process.wait_for().await.unwrap();
        assert!(matches!(
            process.pid(),
            Err(ProcessError::Unsupported { operation: "pid" })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_cleanups_both_wait_for_pumps() {
        // The background sleep keeps stdout open after the shell exits.
        let process = ManagedProcess::new(spawn_sh("sleep 1 & exit 0"), "sh", None, None);
        process.wait_for().await.unwrap();

        let start = std::time::Instant::now();
        let (first, second) = tokio::join!(
            async {
                process.cleanup().await.unwrap();
                start.elapsed()
            },
            async {
                process.cleanup().await.unwrap();
                start.elapsed()
            }
        );
        assert!(first >= Duration::from_millis(500), "{first:?}");
        assert!(second >= Duration::from_millis(500), "{second:?}");
    }

    #[tokio::test]
    async fn test_take_stdin_feeds_child() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("cat.txt");
        let out = tokio::fs::File::create(&out_path).await.unwrap();
        let process = ManagedProcess::new(spawn_sh("cat"), "sh", Some(Box::new(out)), None);

        let mut stdin = process.take_stdin().unwrap();
        stdin.write_all(b"piped input").await.unwrap();
        drop(stdin);
        assert!(process.take_stdin().is_none());

        process.wait_and_cleanup().await.unwrap();
        assert_eq!(std::fs::read_to_string(&out_path).unwrap(), "piped input");
    }

    #[test]
    fn test_exit_code_mapping() {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(exit_code(ExitStatus::from_raw(7 << 8)), 7);
            assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
        }
    }
}
