/// Entry-point resolution for archive launches (`-jar app.jar`).
use super::command::CLASSPATH_SEPARATOR;
use super::LaunchError;
use std::io::Read;
use std::path::{Path, PathBuf};

const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

/// Entry point and class-path implied by an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub entry_point: String,
    pub class_path: String,
}

/// Resolves what an archive would run.
pub trait ArchiveResolver: Send + Sync {
    fn resolve(&self, archive: &Path) -> Result<ArchiveEntry, LaunchError>;
}

/// Reads `Main-Class` and `Class-Path` from the archive's manifest.
///
/// The resulting class-path is the archive itself followed by its
/// `Class-Path` entries, resolved against the archive's directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestResolver;

impl ArchiveResolver for ManifestResolver {
    fn resolve(&self, archive: &Path) -> Result<ArchiveEntry, LaunchError> {
        if !archive.is_file() {
            return Err(LaunchError::ArchiveNotFound {
                path: archive.to_path_buf(),
            });
        }

        let manifest = read_manifest(archive)?;
        let attributes = parse_main_attributes(&manifest);

        let entry_point = attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Main-Class"))
            .map(|(_, v)| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| LaunchError::ManifestEntryPointMissing {
                archive: archive.to_path_buf(),
            })?;

        let base = archive.parent().unwrap_or_else(|| Path::new("."));
        let mut entries = vec![archive.to_string_lossy().to_string()];
        if let Some((_, value)) = attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Class-Path"))
        {
            entries.extend(
                value
                    .split_whitespace()
                    .map(|entry| resolve_entry(base, entry).to_string_lossy().to_string()),
            );
        }

        tracing::debug!(
            archive = %archive.display(),
            entry_point = %entry_point,
            "resolved archive entry point"
        );

        Ok(ArchiveEntry {
            entry_point,
            class_path: entries.join(CLASSPATH_SEPARATOR),
        })
    }
}

fn read_manifest(archive: &Path) -> Result<String, LaunchError> {
    let manifest_error = |reason: String| LaunchError::Manifest {
        archive: archive.to_path_buf(),
        reason,
    };

    let file = std::fs::File::open(archive).map_err(|e| manifest_error(e.to_string()))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| manifest_error(e.to_string()))?;
    let mut entry = match zip.by_name(MANIFEST_PATH) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(LaunchError::ManifestEntryPointMissing {
                archive: archive.to_path_buf(),
            })
        }
        Err(e) => return Err(manifest_error(e.to_string())),
    };

    let mut contents = String::new();
    entry
        .read_to_string(&mut contents)
        .map_err(|e| manifest_error(e.to_string()))?;
    Ok(contents)
}

/// Parse the main section of a manifest into (name, value) pairs.
///
/// Lines starting with a single space continue the previous value; the
/// main section ends at the first blank line.
fn parse_main_attributes(manifest: &str) -> Vec<(String, String)> {
    let mut attributes: Vec<(String, String)> = Vec::new();
    for line in manifest.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        if let Some(continuation) = line.strip_prefix(' ') {
            if let Some((_, value)) = attributes.last_mut() {
                value.push_str(continuation);
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            attributes.push((name.trim().to_string(), value.trim_start().to_string()));
        }
    }
    attributes
}

fn resolve_entry(base: &Path, entry: &str) -> PathBuf {
    let entry = entry.strip_prefix("file:").unwrap_or(entry);
    let path = Path::new(entry);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
