/// Interpreter detection and wrapper injection for launch commands.
///
/// A recognized command is rewritten so the wrapper entry point runs first,
/// receiving the two sentinel paths and then the original entry point and
/// its arguments.
use super::manifest::ArchiveResolver;
use super::LaunchError;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Separator between class-path entries on this platform.
pub const CLASSPATH_SEPARATOR: &str = if cfg!(windows) { ";" } else { ":" };

/// Environment variable holding the inherited class-path.
pub const CLASSPATH_ENV: &str = "CLASSPATH";

const ARCHIVE_OPTION: &str = "-jar";
const CLASSPATH_OPTIONS: &[&str] = &["-cp", "-classpath", "--class-path"];
const MODULE_OPTIONS: &[&str] = &["-m", "--module"];

/// Options whose value is the following token.
const VALUE_OPTIONS: &[&str] = &[
    "-cp",
    "-classpath",
    "--class-path",
    "-p",
    "--module-path",
    "--upgrade-module-path",
    "--add-modules",
    "--limit-modules",
    "--add-reads",
    "--add-exports",
    "--add-opens",
    "--patch-module",
    "--enable-native-access",
];

/// Executable names launched through the wrapper.
static INTERPRETER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)^java$").unwrap(),
        Regex::new(r"(?i)^javaw$").unwrap(),
        Regex::new(r"(?i)^java\.exe$").unwrap(),
        Regex::new(r"(?i)^javaw\.exe$").unwrap(),
    ]
});

/// Whether `program` names a recognized interpreter, ignoring any leading directory.
pub fn is_interpreter(program: &str) -> bool {
    let name = program.rsplit(['/', '\\']).next().unwrap_or(program);
    INTERPRETER_PATTERNS.iter().any(|p| p.is_match(name))
}

/// What gets spliced into a recognized command.
#[derive(Debug, Clone, Copy)]
pub struct Injection<'a> {
    pub wrapper_classpath: &'a str,
    pub wrapper_entry_point: &'a str,
    pub alive: &'a Path,
    pub kill: &'a Path,
}

/// Result of rewriting a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    pub command: Vec<String>,
    /// Index of the wrapper entry point in `command`.
    pub entry_index: usize,
}

/// Environment needed while rewriting.
#[derive(Clone, Copy)]
pub struct RewriteContext<'a> {
    /// Inherited class-path, consulted only when the command names none.
    pub inherited_classpath: Option<&'a str>,
    /// Directory relative archive paths are resolved against.
    pub working_dir: Option<&'a Path>,
    pub resolver: &'a dyn ArchiveResolver,
}

/// How the original command selects its entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LaunchForm {
    /// `-jar <archive>` at `option_index`.
    Archive { option_index: usize },
    /// Entry point token at `entry_index`.
    Direct { entry_index: usize },
}

/// Rewrite `command` to run the wrapper ahead of its entry point.
pub fn rewrite(
    command: &[String],
    injection: &Injection<'_>,
    ctx: &RewriteContext<'_>,
) -> Result<Rewritten, LaunchError> {
    match scan(command)? {
        LaunchForm::Archive { option_index } => rewrite_archive(command, option_index, injection, ctx),
        LaunchForm::Direct { entry_index } => Ok(rewrite_direct(command, entry_index, injection, ctx)),
    }
}

fn scan(command: &[String]) -> Result<LaunchForm, LaunchError> {
    let not_found = || LaunchError::EntryPointNotFound {
        command: command.to_vec(),
    };

    let mut i = 1;
    while i < command.len() {
        let token = command[i].as_str();
        if token == ARCHIVE_OPTION {
            if i + 1 >= command.len() {
                return Err(not_found());
            }
            return Ok(LaunchForm::Archive { option_index: i });
        }
        if MODULE_OPTIONS.contains(&token) || token.starts_with("--module=") {
            // Module launches name their entry point inside the module; nothing to splice before.
            return Err(not_found());
        }
        if token.starts_with('-') {
            i += if VALUE_OPTIONS.contains(&token) { 2 } else { 1 };
            continue;
        }
        return Ok(LaunchForm::Direct { entry_index: i });
    }
    Err(not_found())
}

/// Position and value of the first class-path option, if any.
///
/// Returns the index of the token holding the value and whether it uses
/// the `--class-path=VALUE` form.
fn find_classpath(command: &[String], end: usize) -> Option<(usize, bool)> {
    let mut i = 1;
    while i < end {
        let token = command[i].as_str();
        if CLASSPATH_OPTIONS.contains(&token) && i + 1 < end {
            return Some((i + 1, false));
        }
        if token.starts_with("--class-path=") {
            return Some((i, true));
        }
        i += if VALUE_OPTIONS.contains(&token) { 2 } else { 1 };
    }
    None
}

fn inherited_or_current(ctx: &RewriteContext<'_>) -> String {
    match ctx.inherited_classpath {
        Some(cp) if !cp.is_empty() => cp.to_string(),
        _ => ".".to_string(),
    }
}

fn join_classpath(first: &str, rest: &str) -> String {
    if first.is_empty() {
        return rest.to_string();
    }
    format!("{first}{CLASSPATH_SEPARATOR}{rest}")
}

fn wrapper_args(injection: &Injection<'_>) -> [String; 3] {
    [
        injection.wrapper_entry_point.to_string(),
        injection.alive.to_string_lossy().to_string(),
        injection.kill.to_string_lossy().to_string(),
    ]
}

fn rewrite_direct(
    command: &[String],
    entry_index: usize,
    injection: &Injection<'_>,
    ctx: &RewriteContext<'_>,
) -> Rewritten {
    let mut out = command.to_vec();
    let mut entry_index = entry_index;

    match find_classpath(command, entry_index) {
        Some((index, false)) => {
            out[index] = join_classpath(injection.wrapper_classpath, &command[index]);
        }
        Some((index, true)) => {
            let value = &command[index]["--class-path=".len()..];
            out[index] = format!(
                "--class-path={}",
                join_classpath(injection.wrapper_classpath, value)
            );
        }
        None => {
            let cp = join_classpath(injection.wrapper_classpath, &inherited_or_current(ctx));
            out.splice(1..1, ["-cp".to_string(), cp]);
            entry_index += 2;
        }
    }

    out.splice(entry_index..entry_index, wrapper_args(injection));
    Rewritten {
        command: out,
        entry_index,
    }
}

fn rewrite_archive(
    command: &[String],
    option_index: usize,
    injection: &Injection<'_>,
    ctx: &RewriteContext<'_>,
) -> Result<Rewritten, LaunchError> {
    let archive = PathBuf::from(&command[option_index + 1]);
    let archive = match ctx.working_dir {
        Some(dir) if archive.is_relative() => dir.join(archive),
        _ => archive,
    };
    let entry = ctx.resolver.resolve(&archive)?;

    let class_path = if entry.class_path.is_empty() {
        inherited_or_current(ctx)
    } else {
        entry.class_path
    };

    // With -jar any class-path option was ignored; drop it so ours is the only one.
    let mut options: Vec<String> = Vec::with_capacity(command.len());
    let mut i = 1;
    while i < option_index {
        let token = command[i].as_str();
        let width = if VALUE_OPTIONS.contains(&token) { 2 } else { 1 };
        let end = (i + width).min(option_index);
        let is_classpath =
            CLASSPATH_OPTIONS.contains(&token) || token.starts_with("--class-path=");
        if !is_classpath {
            options.extend_from_slice(&command[i..end]);
        }
        i += width;
    }

    let mut out = Vec::with_capacity(command.len() + 6);
    out.push(command[0].clone());
    out.push("-cp".to_string());
    out.push(join_classpath(injection.wrapper_classpath, &class_path));
    out.extend(options);
    let entry_index = out.len();
    out.extend(wrapper_args(injection));
    out.push(entry.entry_point);
    out.extend(command[option_index + 2..].iter().cloned());

    Ok(Rewritten {
        command: out,
        entry_index,
    })
}
