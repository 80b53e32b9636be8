//! Polls the sentinel files and turns their removal into interrupts or a halt.
//!
//! Watch phase: wait for the alive file to disappear, then interrupt the
//! main context. Wait phase: give the target `max_wait` to acknowledge the
//! request; halt if it does not. Removing the kill file halts in either phase.
//! A halt is only issued while the watcher is active and the target is still
//! running.

use super::{exit_code, WrapperRuntime};
use crate::config::WatcherConfig;
use std::io::Write;
use std::sync::Arc;
use std::thread;

/// Ends the process abruptly.
pub trait HaltHandler: Send + Sync {
    fn halt(&self, code: i32);
}

/// Flushes stdio then exits without unwinding the target.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessHalt;

impl HaltHandler for ProcessHalt {
    fn halt(&self, code: i32) {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
        std::process::exit(code);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// The kill file was removed.
    KillRequested,
    /// The target did not acknowledge the stop request within `max_wait`.
    GraceExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The exit hook or a normal finish switched the watcher off.
    Deactivated,
    /// A halt was issued.
    Halted(HaltReason),
    /// A halt was due but the target had already returned.
    TargetFinished,
}

pub struct TerminationWatcher {
    runtime: Arc<WrapperRuntime>,
    config: WatcherConfig,
    halt: Arc<dyn HaltHandler>,
}

impl TerminationWatcher {
    pub fn new(
        runtime: Arc<WrapperRuntime>,
        config: WatcherConfig,
        halt: Arc<dyn HaltHandler>,
    ) -> Self {
        Self {
            runtime,
            config,
            halt,
        }
    }

    /// Run the watcher on a dedicated thread.
    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<WatchOutcome>> {
        let runtime = Arc::clone(&self.runtime);
        let handle = thread::Builder::new()
            .name("lifeline-watcher".into())
            .spawn(move || self.run())?;
        runtime.set_watcher_thread(handle.thread().clone());
        Ok(handle)
    }

    /// Watch until deactivated or a halt is due. Blocks the calling thread.
    pub fn run(&self) -> WatchOutcome {
        tracing::debug!(
            poll_ms = self.config.poll_interval_ms,
            max_wait_ms = self.config.max_wait_ms,
            "termination watcher started"
        );
        let control = self.runtime.control_files();

        loop {
            if !self.runtime.is_watcher_active() {
                return WatchOutcome::Deactivated;
            }
            // A kill request halts even before any stop request; see DESIGN.md.
            if !control.kill_exists() {
                return self.escalate(HaltReason::KillRequested);
            }
            if !control.alive_exists() {
                self.runtime.request_termination();
                break;
            }
            self.pause();
        }

        let max_wait = self.config.max_wait();
        loop {
            if !self.runtime.is_watcher_active() {
                return WatchOutcome::Deactivated;
            }
            if !control.kill_exists() {
                return self.escalate(HaltReason::KillRequested);
            }
            let expired = self
                .runtime
                .termination_elapsed()
                .is_some_and(|elapsed| elapsed >= max_wait);
            // Acceptance is read after the deadline check so a late acknowledgement still wins.
            if expired && !self.runtime.is_accepting_termination() {
                return self.escalate(HaltReason::GraceExpired);
            }
            self.pause();
        }
    }

    fn pause(&self) {
        thread::park_timeout(self.config.poll_interval());
    }

    fn escalate(&self, reason: HaltReason) -> WatchOutcome {
        if !self.runtime.is_watcher_active() {
            return WatchOutcome::Deactivated;
        }
        if !self.runtime.main().is_running() {
            return WatchOutcome::TargetFinished;
        }
        tracing::warn!(?reason, "halting target");
        self.halt.halt(exit_code::FORCED_HALT);
        WatchOutcome::Halted(reason)
    }
}
