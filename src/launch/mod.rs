/// Launch specs: decide whether a command can be wrapped, rewrite it, spawn it.
///
/// Commands for a recognized interpreter get a fresh [`ControlFilePair`] and
/// are rewritten so the wrapper entry point runs ahead of the real one.
/// Anything else is spawned unchanged and can only be stopped by a hard
/// destroy.
pub mod command;
pub mod manifest;

use crate::config::{LaunchConfig, LifelineConfig, WatcherConfig};
use crate::control_files::ControlFilePair;
use crate::cooperative::CooperativeProcess;
use crate::process::ManagedProcess;
use crate::pump::BoxSink;
use command::{Injection, RewriteContext, CLASSPATH_ENV};
use manifest::{ArchiveResolver, ManifestResolver};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Errors that abort a launch before the child is spawned.
#[derive(Debug)]
pub enum LaunchError {
    /// The command was empty.
    EmptyCommand,
    /// No entry point could be located in the command.
    EntryPointNotFound { command: Vec<String> },
    /// The archive named by `-jar` does not exist.
    ArchiveNotFound { path: PathBuf },
    /// The archive's manifest names no main entry point.
    ManifestEntryPointMissing { archive: PathBuf },
    /// The archive or its manifest could not be read.
    Manifest { archive: PathBuf, reason: String },
    /// Sentinel files could not be created.
    ControlFiles { source: std::io::Error },
    /// Spawning the child failed.
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::EmptyCommand => write!(f, "cannot launch an empty command"),
            LaunchError::EntryPointNotFound { command } => {
                write!(f, "no entry point found in command {:?}", command)
            }
            LaunchError::ArchiveNotFound { path } => {
                write!(f, "archive {} not found", path.display())
            }
            LaunchError::ManifestEntryPointMissing { archive } => {
                write!(
                    f,
                    "manifest of {} does not name a main entry point",
                    archive.display()
                )
            }
            LaunchError::Manifest { archive, reason } => {
                write!(f, "failed to read manifest of {}: {}", archive.display(), reason)
            }
            LaunchError::ControlFiles { source } => {
                write!(f, "failed to create control files: {}", source)
            }
            LaunchError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::ControlFiles { source } => Some(source),
            LaunchError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A command ready to spawn.
///
/// Owns the control files (if any); they are removed again if it is
/// dropped without starting.
#[derive(Debug)]
pub struct LaunchSpec {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    forward_output: bool,
    inherit_stdin: bool,
    process_group: bool,
    control: Option<ControlFilePair>,
}

/// Serializable view of a launch spec, for dry runs.
#[derive(Debug, Serialize)]
pub struct LaunchPlan<'a> {
    pub command: &'a [String],
    pub cooperative: bool,
    pub working_dir: Option<&'a Path>,
    pub alive_file: Option<&'a Path>,
    pub kill_file: Option<&'a Path>,
}

impl LaunchSpec {
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Token list that will be spawned; edits before `start` take effect.
    pub fn command_mut(&mut self) -> &mut Vec<String> {
        &mut self.command
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Whether the child will watch sentinel files.
    pub fn is_cooperative(&self) -> bool {
        self.control.is_some()
    }

    pub fn control_files(&self) -> Option<&ControlFilePair> {
        self.control.as_ref()
    }

    pub fn plan(&self) -> LaunchPlan<'_> {
        LaunchPlan {
            command: &self.command,
            cooperative: self.is_cooperative(),
            working_dir: self.working_dir(),
            alive_file: self.control.as_ref().map(ControlFilePair::alive),
            kill_file: self.control.as_ref().map(ControlFilePair::kill),
        }
    }

    /// Spawn the child and hand it to a [`CooperativeProcess`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<CooperativeProcess, LaunchError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(LaunchError::EmptyCommand)?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .envs(&self.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.inherit_stdin {
                Stdio::inherit()
            } else {
                Stdio::piped()
            });
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            if self.process_group {
                cmd.process_group(0);
            }
        }

        tracing::info!(
            program = %program,
            args = ?args,
            cooperative = self.control.is_some(),
            "spawning child process"
        );

        let child = cmd.spawn().map_err(|e| LaunchError::Spawn {
            program: program.clone(),
            source: e,
        })?;
        tracing::info!(pid = ?child.id(), "child process started");

        let (stdout, stderr): (Option<BoxSink>, Option<BoxSink>) = if self.forward_output {
            (
                Some(Box::new(tokio::io::stdout())),
                Some(Box::new(tokio::io::stderr())),
            )
        } else {
            (None, None)
        };

        let process = ManagedProcess::new(child, program.clone(), stdout, stderr);
        Ok(CooperativeProcess::new(process, self.control))
    }
}

/// Builds a [`LaunchSpec`] from a command and launch settings.
pub struct LaunchBuilder {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    inherit_stdin: bool,
    process_group: bool,
    launch: LaunchConfig,
    watcher: WatcherConfig,
    resolver: Box<dyn ArchiveResolver>,
    native_wrapper: Option<String>,
}

impl LaunchBuilder {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: BTreeMap::new(),
            inherit_stdin: false,
            process_group: false,
            launch: LaunchConfig::default(),
            watcher: WatcherConfig::default(),
            resolver: Box::new(ManifestResolver),
            native_wrapper: None,
        }
    }

    /// Launch `entry_point` through a native wrapper executable.
    ///
    /// The wrapper receives the sentinel paths, then `entry_point`, then `args`.
    pub fn native_wrapper<I, S>(wrapper: impl Into<String>, entry_point: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let wrapper = wrapper.into();
        let mut command = vec![wrapper.clone(), entry_point.into()];
        command.extend(args.into_iter().map(Into::into));
        let mut builder = Self::new(command);
        builder.native_wrapper = Some(wrapper);
        builder
    }

    /// Apply launch and watcher settings from a loaded config.
    pub fn config(mut self, config: &LifelineConfig) -> Self {
        self.launch = config.launch.clone();
        self.watcher = config.watcher.clone();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn forward_output(mut self, forward: bool) -> Self {
        self.launch.forward_output = forward;
        self
    }

    pub fn inherit_stdin(mut self, inherit: bool) -> Self {
        self.inherit_stdin = inherit;
        self
    }

    /// Start the child in its own process group so terminal signals reach only the launcher.
    pub fn process_group(mut self, separate: bool) -> Self {
        self.process_group = separate;
        self
    }

    pub fn resolver(mut self, resolver: impl ArchiveResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Decide how to launch and produce the spec.
    ///
    /// On failure any control files created along the way are removed.
    pub fn build(self) -> Result<LaunchSpec, LaunchError> {
        let program = self.command.first().ok_or(LaunchError::EmptyCommand)?;

        if self.native_wrapper.is_none() && !command::is_interpreter(program) {
            tracing::debug!(program = %program, "command not recognized, launching unmodified");
            return Ok(LaunchSpec {
                command: self.command,
                working_dir: self.working_dir,
                env: self.env,
                forward_output: self.launch.forward_output,
                inherit_stdin: self.inherit_stdin,
                process_group: self.process_group,
                control: None,
            });
        }

        let dir = self
            .launch
            .sentinel_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let control = ControlFilePair::create_in(&dir, &self.launch.sentinel_prefix)
            .map_err(|e| LaunchError::ControlFiles { source: e })?;

        let command = if self.native_wrapper.is_some() {
            let mut command = self.command.clone();
            command.splice(
                1..1,
                [
                    control.alive().to_string_lossy().to_string(),
                    control.kill().to_string_lossy().to_string(),
                ],
            );
            command
        } else {
            let inherited = self
                .env
                .get(CLASSPATH_ENV)
                .cloned()
                .or_else(|| std::env::var(CLASSPATH_ENV).ok());
            let injection = Injection {
                wrapper_classpath: &self.launch.wrapper_classpath,
                wrapper_entry_point: &self.launch.wrapper_entry_point,
                alive: control.alive(),
                kill: control.kill(),
            };
            let ctx = RewriteContext {
                inherited_classpath: inherited.as_deref(),
                working_dir: self.working_dir.as_deref(),
                resolver: self.resolver.as_ref(),
            };
            // `control` drops on error, removing both files.
            command::rewrite(&self.command, &injection, &ctx)?.command
        };

        let mut env = self.env;
        for (key, value) in self.watcher.to_env() {
            env.entry(key).or_insert(value);
        }

        tracing::debug!(
            command = ?command,
            alive = %control.alive().display(),
            kill = %control.kill().display(),
            "prepared cooperative launch"
        );

        Ok(LaunchSpec {
            command,
            working_dir: self.working_dir,
            env,
            forward_output: self.launch.forward_output,
            inherit_stdin: self.inherit_stdin,
            process_group: self.process_group,
            control: Some(control),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Status;

    fn builder_in(dir: &Path, command: &[&str]) -> LaunchBuilder {
        let mut config = LifelineConfig::default();
        config.launch.sentinel_dir = Some(dir.to_path_buf());
        config.launch.wrapper_classpath = "/opt/wrapper".to_string();
        LaunchBuilder::new(command.iter().copied())
            .config(&config)
            .forward_output(false)
    }

    fn sentinel_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_empty_command() {
        let err = LaunchBuilder::new(Vec::<String>::new()).build().unwrap_err();
        assert!(matches!(err, LaunchError::EmptyCommand));
    }

    #[test]
    fn test_unrecognized_command_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let spec = builder_in(dir.path(), &["echo", "-cp", "A", "Main"]).build().unwrap();
        assert_eq!(spec.command(), &["echo", "-cp", "A", "Main"]);
        assert!(!spec.is_cooperative());
        assert!(spec.env().is_empty());
        assert_eq!(sentinel_count(dir.path()), 0);
    }

    #[test]
    fn test_recognized_command_gets_control_files() {
        let dir = tempfile::tempdir().unwrap();
        let spec = builder_in(dir.path(), &["/usr/bin/java", "-cp", "A", "com.example.Main", "x"])
            .build()
            .unwrap();

        let control = spec.control_files().unwrap();
        assert!(control.alive_exists());
        assert!(control.kill_exists());
        assert_eq!(spec.command()[3], "lifeline.wrapper.Main");
        assert_eq!(spec.command()[4], control.alive().to_string_lossy());
        assert_eq!(spec.command()[5], control.kill().to_string_lossy());
        assert_eq!(spec.command()[6], "com.example.Main");
        assert_eq!(spec.env().get(crate::config::MAX_WAIT_ENV).unwrap(), "10000");

        drop(spec);
        assert_eq!(sentinel_count(dir.path()), 0);
    }

    #[test]
    fn test_inherited_classpath_from_builder_env() {
        let dir = tempfile::tempdir().unwrap();
        let spec = builder_in(dir.path(), &["java", "Main"])
            .env(CLASSPATH_ENV, "from-env.jar")
            .build()
            .unwrap();
        assert_eq!(
            spec.command()[2],
            format!("/opt/wrapper{}from-env.jar", command::CLASSPATH_SEPARATOR)
        );
    }

    #[test]
    fn test_failed_rewrite_removes_control_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = builder_in(dir.path(), &["java", "-version"]).build().unwrap_err();
        assert!(matches!(err, LaunchError::EntryPointNotFound { .. }));
        assert_eq!(sentinel_count(dir.path()), 0);

        let err = builder_in(dir.path(), &["java", "-jar", "missing.jar"])
            .working_dir(dir.path())
            .build()
            .unwrap_err();
        assert!(matches!(err, LaunchError::ArchiveNotFound { .. }));
        assert_eq!(sentinel_count(dir.path()), 0);
    }

    #[test]
    fn test_native_wrapper_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LifelineConfig::default();
        config.launch.sentinel_dir = Some(dir.path().to_path_buf());
        let spec = LaunchBuilder::native_wrapper("/bin/wrapper", "demo.Target", ["a", "b"])
            .config(&config)
            .build()
            .unwrap();
        let control = spec.control_files().unwrap();
        assert_eq!(spec.command()[0], "/bin/wrapper");
        assert_eq!(spec.command()[1], control.alive().to_string_lossy());
        assert_eq!(spec.command()[2], control.kill().to_string_lossy());
        assert_eq!(&spec.command()[3..], &["demo.Target", "a", "b"]);
    }

    #[test]
    fn test_plan_serializes() {
        let dir = tempfile::tempdir().unwrap();
        let spec = builder_in(dir.path(), &["echo", "hi"]).build().unwrap();
        let json = serde_json::to_value(spec.plan()).unwrap();
        assert_eq!(json["cooperative"], false);
        assert_eq!(json["command"][1], "hi");
        assert!(json["alive_file"].is_null());
    }

    #[tokio::test]
    async fn test_unrecognized_command_runs_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args.txt");
        let script = format!("printf '%s|' \"$@\" > {}", out.display());
        let mut spec = builder_in(dir.path(), &["sh", "-c", &script, "sh", "a b", "-cp"])
            .build()
            .unwrap();
        spec.command_mut().push("tail".to_string());

        let process = spec.start().unwrap();
        assert!(!process.has_process_alive_file());
        process.wait_and_cleanup().await.unwrap();
        assert_eq!(process.status(), Status::Finished);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "a b|-cp|tail|");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let spec = builder_in(dir.path(), &["/nonexistent/lifeline-binary"]).build().unwrap();
        let err = spec.start().unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }
}
