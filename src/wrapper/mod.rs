//! Child-side wrapper: runs inside the spawned process, ahead of the target.
//!
//! The wrapper entry point validates the sentinel-file arguments, installs a
//! [`WrapperRuntime`], starts the [`TerminationWatcher`] and then runs the
//! target entry point on the calling thread. Target code cooperates through
//! [`WrapperRuntime::is_terminate_requested`] and
//! [`WrapperRuntime::accept_terminate_request`], either on the runtime it is
//! handed or through the process-wide [`is_terminate_requested`] /
//! [`accept_terminate_request`] accessors.

pub mod context;
pub mod exit_hook;
pub mod watcher;

use crate::config::WatcherConfig;
use crate::control_files::{ControlFilePair, SentinelError};
use context::MainContext;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::Thread;
use std::time::{Duration, Instant};
use watcher::{ProcessHalt, TerminationWatcher};

/// Exit statuses produced by the wrapper itself.
pub mod exit_code {
    /// A required argument (alive file, kill file or entry point) is missing.
    pub const MISSING_ARGUMENT: i32 = 90;
    /// A sentinel-file argument does not exist.
    pub const FILE_NOT_FOUND: i32 = 91;
    /// A sentinel-file argument is not a plain file.
    pub const NOT_A_FILE: i32 = 92;
    /// The watcher thread could not be started.
    pub const WATCHER_START: i32 = 93;
    /// The named entry point is not registered.
    pub const UNKNOWN_ENTRY_POINT: i32 = 94;
    /// The target ignored a stop request and was halted.
    pub const FORCED_HALT: i32 = 99;
    /// The target panicked.
    pub const PANICKED: i32 = 1;
}

/// Errors that stop the wrapper before the target runs.
#[derive(Debug)]
pub enum WrapperError {
    MissingArgument { name: &'static str },
    Sentinel(SentinelError),
    WatcherStart { source: std::io::Error },
    UnknownEntryPoint { name: String },
}

impl WrapperError {
    pub fn exit_code(&self) -> i32 {
        match self {
            WrapperError::MissingArgument { .. } => exit_code::MISSING_ARGUMENT,
            WrapperError::Sentinel(SentinelError::NotFound { .. }) => exit_code::FILE_NOT_FOUND,
            WrapperError::Sentinel(SentinelError::NotAFile { .. }) => exit_code::NOT_A_FILE,
            WrapperError::WatcherStart { .. } => exit_code::WATCHER_START,
            WrapperError::UnknownEntryPoint { .. } => exit_code::UNKNOWN_ENTRY_POINT,
        }
    }
}

impl std::fmt::Display for WrapperError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WrapperError::MissingArgument { name } => write!(f, "missing argument: {}", name),
            WrapperError::Sentinel(e) => write!(f, "{}", e),
            WrapperError::WatcherStart { source } => {
                write!(f, "failed to start termination watcher: {}", source)
            }
            WrapperError::UnknownEntryPoint { name } => {
                write!(f, "unknown entry point: {}", name)
            }
        }
    }
}

impl std::error::Error for WrapperError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WrapperError::Sentinel(e) => Some(e),
            WrapperError::WatcherStart { source } => Some(source),
            _ => None,
        }
    }
}

impl From<SentinelError> for WrapperError {
    fn from(e: SentinelError) -> Self {
        WrapperError::Sentinel(e)
    }
}

/// Shared state between the target program, the watcher and the exit hook.
#[derive(Debug)]
pub struct WrapperRuntime {
    main: MainContext,
    control: ControlFilePair,
    terminate_requested: AtomicBool,
    accepting_termination: AtomicBool,
    watcher_active: AtomicBool,
    termination_started: OnceLock<Instant>,
    watcher_thread: OnceLock<Thread>,
}

impl WrapperRuntime {
    pub fn new(control: ControlFilePair) -> Self {
        Self {
            main: MainContext::new(),
            control,
            terminate_requested: AtomicBool::new(false),
            accepting_termination: AtomicBool::new(false),
            watcher_active: AtomicBool::new(true),
            termination_started: OnceLock::new(),
            watcher_thread: OnceLock::new(),
        }
    }

    /// The context running the target program.
    pub fn main(&self) -> &MainContext {
        &self.main
    }

    pub fn control_files(&self) -> &ControlFilePair {
        &self.control
    }

    /// Whether a graceful stop has been requested. Does not touch the interrupt flag.
    pub fn is_terminate_requested(&self) -> bool {
        self.terminate_requested.load(Ordering::SeqCst)
    }

    /// Acknowledge a pending stop request.
    ///
    /// Clears the interrupt flag and stops the watcher from halting the
    /// process on timeout. Returns `false` and does nothing when no request
    /// is pending.
    ///
    /// Only the main context carries an interrupt flag; the watcher never
    /// interrupts any other thread. Calling this from a helper thread the
    /// target started therefore clears the main context's flag.
    pub fn accept_terminate_request(&self) -> bool {
        if !self.is_terminate_requested() {
            return false;
        }
        self.main.clear_interrupt();
        if self
            .accepting_termination
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::info!(
                elapsed_ms = ?self.termination_elapsed().map(|d| d.as_millis()),
                "termination request accepted"
            );
        }
        true
    }

    pub fn is_accepting_termination(&self) -> bool {
        self.accepting_termination.load(Ordering::SeqCst)
    }

    pub fn is_watcher_active(&self) -> bool {
        self.watcher_active.load(Ordering::SeqCst)
    }

    /// Block until a stop is requested or `timeout` elapses.
    pub fn wait_for_terminate_request(&self, timeout: Duration) -> bool {
        self.main.wait_interrupted(timeout);
        self.is_terminate_requested()
    }

    /// Time since the stop request was observed, if there was one.
    pub fn termination_elapsed(&self) -> Option<Duration> {
        self.termination_started.get().map(Instant::elapsed)
    }

    /// Record a stop request and interrupt the main context.
    pub(crate) fn request_termination(&self) {
        let _ = self.termination_started.set(Instant::now());
        self.terminate_requested.store(true, Ordering::SeqCst);
        tracing::info!("alive file removed, interrupting target");
        self.main.interrupt();
    }

    /// The target returned; the watcher must not halt anything from now on.
    pub fn finish_normally(&self) {
        self.main.mark_finished();
        self.deactivate_watcher();
    }

    pub(crate) fn deactivate_watcher(&self) {
        self.watcher_active.store(false, Ordering::SeqCst);
        if let Some(thread) = self.watcher_thread.get() {
            thread.unpark();
        }
    }

    pub(crate) fn set_watcher_thread(&self, thread: Thread) {
        let _ = self.watcher_thread.set(thread);
    }
}

static RUNTIME: OnceLock<Arc<WrapperRuntime>> = OnceLock::new();

/// Make `runtime` reachable through the process-wide accessors.
///
/// Only the first installation wins; later ones get their runtime back.
pub fn install(runtime: Arc<WrapperRuntime>) -> Result<(), Arc<WrapperRuntime>> {
    RUNTIME.set(runtime)
}

/// The installed runtime, if this process was started through the wrapper.
pub fn current() -> Option<&'static Arc<WrapperRuntime>> {
    RUNTIME.get()
}

/// Process-wide form of [`WrapperRuntime::is_terminate_requested`]; `false` without a runtime.
pub fn is_terminate_requested() -> bool {
    current().is_some_and(|rt| rt.is_terminate_requested())
}

/// Process-wide form of [`WrapperRuntime::accept_terminate_request`]; `false` without a runtime.
pub fn accept_terminate_request() -> bool {
    current().is_some_and(|rt| rt.accept_terminate_request())
}

/// A target program: receives the runtime and its own arguments, returns an exit status.
pub type EntryPoint = fn(&WrapperRuntime, &[String]) -> i32;

/// Target programs the wrapper can run, keyed by fully-qualified name.
#[derive(Debug, Default, Clone)]
pub struct EntryPoints {
    entries: BTreeMap<String, EntryPoint>,
}

impl EntryPoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, entry: EntryPoint) -> Self {
        self.entries.insert(name.into(), entry);
        self
    }

    pub fn get(&self, name: &str) -> Option<EntryPoint> {
        self.entries.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Parsed wrapper arguments.
#[derive(Debug)]
pub struct WrapperArgs {
    pub control: ControlFilePair,
    pub entry_point: String,
    pub args: Vec<String>,
}

/// Validate `alive kill entry-point [args...]`.
pub fn parse_args(args: &[String]) -> Result<WrapperArgs, WrapperError> {
    let alive = args
        .first()
        .ok_or(WrapperError::MissingArgument { name: "alive file" })?;
    let kill = args
        .get(1)
        .ok_or(WrapperError::MissingArgument { name: "kill file" })?;
    let entry_point = args
        .get(2)
        .ok_or(WrapperError::MissingArgument { name: "entry point" })?;

    let control = ControlFilePair::adopt(alive, kill)?;
    Ok(WrapperArgs {
        control,
        entry_point: entry_point.clone(),
        args: args[3..].to_vec(),
    })
}

/// Run the wrapper contract for this process and return the exit status.
///
/// `args` excludes the program name. Installs the process-wide runtime and,
/// on unix, a listener that runs the exit hook on SIGTERM/SIGINT/SIGHUP.
pub fn run(entry_points: &EntryPoints, args: &[String]) -> i32 {
    match prepare(entry_points, args) {
        Ok((runtime, entry, target_args)) => run_target(runtime, entry, &target_args),
        Err(e) => {
            tracing::debug!(error = %e, code = e.exit_code(), "wrapper failed to start");
            eprintln!("lifeline-wrapper: {e}");
            e.exit_code()
        }
    }
}

fn prepare(
    entry_points: &EntryPoints,
    args: &[String],
) -> Result<(Arc<WrapperRuntime>, EntryPoint, Vec<String>), WrapperError> {
    let parsed = parse_args(args)?;
    let entry = entry_points
        .get(&parsed.entry_point)
        .ok_or_else(|| WrapperError::UnknownEntryPoint {
            name: parsed.entry_point.clone(),
        })?;

    let runtime = Arc::new(WrapperRuntime::new(parsed.control));
    if install(Arc::clone(&runtime)).is_err() {
        tracing::warn!("wrapper runtime already installed in this process");
    }

    let watcher = TerminationWatcher::new(
        Arc::clone(&runtime),
        WatcherConfig::from_env(),
        Arc::new(ProcessHalt),
    );
    if let Err(e) = watcher.spawn() {
        exit_hook::run(&runtime);
        return Err(WrapperError::WatcherStart { source: e });
    }

    if let Err(e) = exit_hook::spawn_signal_listener(Arc::clone(&runtime)) {
        tracing::warn!(error = %e, "failed to install signal listener");
    }

    tracing::debug!(entry_point = %parsed.entry_point, "starting target");
    Ok((runtime, entry, parsed.args))
}

/// Run `entry` on the calling thread with the exit hook armed.
pub fn run_target(runtime: Arc<WrapperRuntime>, entry: EntryPoint, args: &[String]) -> i32 {
    let hook = exit_hook::ExitHook::new(Arc::clone(&runtime));
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| entry(&runtime, args)));
    runtime.finish_normally();
    drop(hook);

    match outcome {
        Ok(code) => code,
        Err(_) => {
            tracing::error!("target entry point panicked");
            exit_code::PANICKED
        }
    }
}
