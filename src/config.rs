use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable the wrapper reads to override the watcher poll interval.
pub const POLL_INTERVAL_ENV: &str = "LIFELINE_POLL_INTERVAL_MS";
/// Environment variable the wrapper reads to override the acceptance wait bound.
pub const MAX_WAIT_ENV: &str = "LIFELINE_MAX_WAIT_MS";

/// Top-level configuration loaded from lifeline.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LifelineConfig {
    pub launch: LaunchConfig,
    pub watcher: WatcherConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Class-path entry that makes the wrapper entry point loadable in the child.
    pub wrapper_classpath: String,
    pub wrapper_entry_point: String,
    /// Where sentinel files are created. `None` means the system temp dir.
    pub sentinel_dir: Option<PathBuf>,
    pub sentinel_prefix: String,
    pub forward_output: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
    pub max_wait_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Seconds `lifeline run` waits after a graceful request before escalating to kill.
    pub grace_secs: u64,
    /// Seconds to wait after kill before destroying the child outright.
    pub kill_grace_secs: u64,
}

/// Errors raised while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl LifelineConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parse config from TOML text.
    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Defaults overridden by `LIFELINE_POLL_INTERVAL_MS` / `LIFELINE_MAX_WAIT_MS`.
    ///
    /// Unparseable or zero values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_millis(POLL_INTERVAL_ENV) {
            config.poll_interval_ms = ms;
        }
        if let Some(ms) = env_millis(MAX_WAIT_ENV) {
            config.max_wait_ms = ms;
        }
        config
    }

    /// Environment pairs that carry this config into a wrapped child.
    pub fn to_env(&self) -> [(String, String); 2] {
        [
            (
                POLL_INTERVAL_ENV.to_string(),
                self.poll_interval_ms.to_string(),
            ),
            (MAX_WAIT_ENV.to_string(), self.max_wait_ms.to_string()),
        ]
    }
}

fn env_millis(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(0) => None,
        Ok(ms) => Some(ms),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring invalid duration override");
            None
        }
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

// --- Default implementations ---

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            wrapper_classpath: default_wrapper_classpath(),
            wrapper_entry_point: "lifeline.wrapper.Main".to_string(),
            sentinel_dir: None,
            sentinel_prefix: "lifeline".to_string(),
            forward_output: true,
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            max_wait_ms: 10_000,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_secs: 15,
            kill_grace_secs: 5,
        }
    }
}

/// Directory holding the running executable, or `.` when it cannot be determined.
fn default_wrapper_classpath() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_string_lossy().to_string()))
        .unwrap_or_else(|| ".".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LifelineConfig::default();
        assert_eq!(config.watcher.poll_interval(), Duration::from_millis(200));
        assert_eq!(config.watcher.max_wait(), Duration::from_secs(10));
        assert_eq!(config.launch.wrapper_entry_point, "lifeline.wrapper.Main");
        assert_eq!(config.launch.sentinel_prefix, "lifeline");
        assert!(config.launch.forward_output);
        assert_eq!(config.shutdown.grace(), Duration::from_secs(15));
        assert_eq!(config.shutdown.kill_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_partial_config_keeps_defaults() {
        let config = LifelineConfig::parse(
            r#"
[watcher]
max_wait_ms = 500

[launch]
wrapper_classpath = "/opt/lifeline/wrapper.jar"
"#,
        )
        .unwrap();
        assert_eq!(config.watcher.max_wait_ms, 500);
        assert_eq!(config.watcher.poll_interval_ms, 200);
        assert_eq!(config.launch.wrapper_classpath, "/opt/lifeline/wrapper.jar");
        assert_eq!(config.launch.wrapper_entry_point, "lifeline.wrapper.Main");
        assert_eq!(config.shutdown.grace_secs, 15);
    }

    #[test]
    fn test_parse_invalid_type() {
        let err = LifelineConfig::parse("[watcher]\nmax_wait_ms = \"soon\"\n").unwrap_err();
        assert!(err.to_string().contains("max_wait_ms"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = LifelineConfig::load(&dir.path().join("lifeline.toml")).unwrap();
        assert_eq!(config.watcher.max_wait_ms, 10_000);
    }

    #[test]
    fn test_load_parse_error_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lifeline.toml");
        std::fs::write(&path, "[watcher\n").unwrap();
        let err = LifelineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("lifeline.toml"));
    }

    #[test]
    fn test_to_env_round_trips_through_names() {
        let watcher = WatcherConfig {
            poll_interval_ms: 25,
            max_wait_ms: 750,
        };
        let env = watcher.to_env();
        assert_eq!(env[0], (POLL_INTERVAL_ENV.to_string(), "25".to_string()));
        assert_eq!(env[1], (MAX_WAIT_ENV.to_string(), "750".to_string()));
    }
}
