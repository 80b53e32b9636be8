//! Cleanup run when the wrapped process ends on its own or is asked to by a signal.

use super::watcher::{HaltHandler, ProcessHalt};
use super::WrapperRuntime;
use std::sync::Arc;

/// Switch the watcher off, remove both sentinel files and interrupt the
/// target if it is still running. Safe to run more than once.
pub fn run(runtime: &WrapperRuntime) {
    runtime.deactivate_watcher();
    runtime.control_files().delete_both();
    if runtime.main().is_running() {
        runtime.main().interrupt();
    }
}

/// Runs the exit hook when dropped, including during unwinding.
pub struct ExitHook {
    runtime: Arc<WrapperRuntime>,
}

impl ExitHook {
    pub fn new(runtime: Arc<WrapperRuntime>) -> Self {
        Self { runtime }
    }
}

impl Drop for ExitHook {
    fn drop(&mut self) {
        run(&self.runtime);
    }
}

/// Run the exit hook on SIGTERM, SIGINT or SIGHUP, then exit with `128 + signal`.
///
/// Handlers are registered before this returns; the wait happens on a
/// dedicated thread with its own single-threaded runtime.
#[cfg(unix)]
pub fn spawn_signal_listener(runtime: Arc<WrapperRuntime>) -> std::io::Result<()> {
    use nix::sys::signal::Signal;
    use tokio::signal::unix::{signal, SignalKind};

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (mut term, mut int, mut hup) = rt.block_on(async {
        Ok::<_, std::io::Error>((
            signal(SignalKind::terminate())?,
            signal(SignalKind::interrupt())?,
            signal(SignalKind::hangup())?,
        ))
    })?;

    std::thread::Builder::new()
        .name("lifeline-signals".into())
        .spawn(move || {
            let signo = rt.block_on(async {
                tokio::select! {
                    _ = term.recv() => Signal::SIGTERM,
                    _ = int.recv() => Signal::SIGINT,
                    _ = hup.recv() => Signal::SIGHUP,
                }
            });
            tracing::info!(signal = %signo, "termination signal received");
            run(&runtime);
            ProcessHalt.halt(128 + signo as i32);
        })?;
    Ok(())
}

#[cfg(not(unix))]
pub fn spawn_signal_listener(_runtime: Arc<WrapperRuntime>) -> std::io::Result<()> {
    Ok(())
}
