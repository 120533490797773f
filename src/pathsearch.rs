// ABOUTME: Locates a bare executable name on the server process's PATH,
// ABOUTME: the way a shell would, for application paths with no separator

use std::env;
use std::path::{Path, PathBuf};

/// Returns `true` if `application_path` has a path separator in it, in
/// which case it should be used as-is rather than searched for.
pub fn has_path_separator(application_path: &str) -> bool {
    application_path.contains(std::path::MAIN_SEPARATOR) || application_path.contains('/')
}

/// Searches `PATH` for `name`, trying the bare name and then the platform's
/// executable suffix (`.exe` on Windows, empty elsewhere) in each directory,
/// in `PATH` order. Returns the first hit that exists on disk.
pub fn resolve_on_path(name: &str) -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;

    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }

        let suffix = env::consts::EXE_SUFFIX;
        if !suffix.is_empty() {
            let with_suffix = dir.join(format!("{name}{suffix}"));
            if with_suffix.is_file() {
                return Some(with_suffix);
            }
        }
    }

    None
}

/// Resolves `application_path` per §4.2/§6.5: used verbatim if it contains a
/// separator or already exists relative to `working_directory`/the current
/// directory, otherwise searched for on `PATH`.
pub fn resolve_application_path(application_path: &str, working_directory: Option<&str>) -> PathBuf {
    if has_path_separator(application_path) {
        return PathBuf::from(application_path);
    }

    let relative_to_cwd = match working_directory {
        Some(dir) => Path::new(dir).join(application_path),
        None => PathBuf::from(application_path),
    };

    if relative_to_cwd.is_file() {
        return relative_to_cwd;
    }

    resolve_on_path(application_path).unwrap_or_else(|| PathBuf::from(application_path))
}
