/// Sentinel files shared between a launcher and one wrapped child.
///
/// Only existence carries meaning: deleting `alive` asks the child to stop
/// gracefully, deleting `kill` asks it to stop now. Both sides treat delete
/// as the only mutation and exists as the only read, so every interaction
/// is safe to race.
use std::path::{Path, PathBuf};
use tempfile::TempPath;

pub const ALIVE_SUFFIX: &str = ".alive";
pub const KILL_SUFFIX: &str = ".kill";
pub const DEFAULT_PREFIX: &str = "lifeline";

/// Why an existing path cannot serve as a sentinel file.
#[derive(Debug)]
pub enum SentinelError {
    /// Path does not exist.
    NotFound { path: PathBuf },
    /// Path exists but is not a plain file.
    NotAFile { path: PathBuf },
}

impl std::fmt::Display for SentinelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SentinelError::NotFound { path } => {
                write!(f, "sentinel file {} does not exist", path.display())
            }
            SentinelError::NotAFile { path } => {
                write!(f, "sentinel path {} is not a plain file", path.display())
            }
        }
    }
}

impl std::error::Error for SentinelError {}

/// The `alive`/`kill` file pair for one child.
///
/// A pair made by [`ControlFilePair::create`] owns its files: whatever is
/// still on disk is removed when the pair is dropped. A pair made by
/// [`ControlFilePair::adopt`] only references files someone else created.
#[derive(Debug)]
pub struct ControlFilePair {
    alive: PathBuf,
    kill: PathBuf,
    // Dropping a TempPath removes the file and ignores a missing one.
    _owned: Option<(TempPath, TempPath)>,
}

impl ControlFilePair {
    /// Create a fresh pair in the system temp directory.
    pub fn create() -> std::io::Result<Self> {
        Self::create_in(&std::env::temp_dir(), DEFAULT_PREFIX)
    }

    /// Create a fresh pair of empty files named `<prefix>XXXX.alive` / `<prefix>XXXX.kill` in `dir`.
    pub fn create_in(dir: &Path, prefix: &str) -> std::io::Result<Self> {
        let dir = std::fs::canonicalize(dir)?;
        let alive = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(ALIVE_SUFFIX)
            .tempfile_in(&dir)?
            .into_temp_path();
        let kill = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(KILL_SUFFIX)
            .tempfile_in(&dir)?
            .into_temp_path();

        tracing::debug!(
            alive = %alive.display(),
            kill = %kill.display(),
            "created control files"
        );

        Ok(Self {
            alive: alive.to_path_buf(),
            kill: kill.to_path_buf(),
            _owned: Some((alive, kill)),
        })
    }

    /// Reference an existing pair, checking both paths are plain files.
    pub fn adopt(alive: impl Into<PathBuf>, kill: impl Into<PathBuf>) -> Result<Self, SentinelError> {
        let alive = alive.into();
        let kill = kill.into();
        check_plain_file(&alive)?;
        check_plain_file(&kill)?;
        Ok(Self {
            alive,
            kill,
            _owned: None,
        })
    }

    pub fn alive(&self) -> &Path {
        &self.alive
    }

    pub fn kill(&self) -> &Path {
        &self.kill
    }

    pub fn alive_exists(&self) -> bool {
        self.alive.exists()
    }

    pub fn kill_exists(&self) -> bool {
        self.kill.exists()
    }

    /// Delete the alive file. Fails if it is already gone.
    pub fn delete_alive(&self) -> std::io::Result<()> {
        std::fs::remove_file(&self.alive)
    }

    /// Delete the kill file. Fails if it is already gone.
    pub fn delete_kill(&self) -> std::io::Result<()> {
        std::fs::remove_file(&self.kill)
    }

    /// Best-effort removal of both files.
    pub fn delete_both(&self) {
        let _ = self.delete_alive();
        let _ = self.delete_kill();
    }
}

fn check_plain_file(path: &Path) -> Result<(), SentinelError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(SentinelError::NotAFile {
            path: path.to_path_buf(),
        }),
        Err(_) => Err(SentinelError::NotFound {
            path: path.to_path_buf(),
        }),
    }
}
