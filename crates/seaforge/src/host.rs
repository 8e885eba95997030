//! Host executable selection.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// The binary the output is copied from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSelection {
    pub path: PathBuf,
    /// An override was given but did not exist, so the default was used.
    pub fell_back: bool,
}

/// Pick the host binary, preferring `override_path` when it exists.
///
/// The default is returned even when it does not exist either; copying it
/// will then fail with an I/O error.
pub fn resolve_host(override_path: Option<&Path>, default: &Path) -> HostSelection {
    match override_path {
        Some(path) if is_candidate(path) => HostSelection {
            path: path.to_path_buf(),
            fell_back: false,
        },
        Some(_) => HostSelection {
            path: default.to_path_buf(),
            fell_back: true,
        },
        None => HostSelection {
            path: default.to_path_buf(),
            fell_back: false,
        },
    }
}

fn is_candidate(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.exists()
}

/// Resolve a runtime name against `PATH`.
///
/// Paths with more than one component are taken as-is. A bare name that is
/// not found on `PATH` is returned unchanged so that spawning it reports the
/// real error.
pub fn resolve_runtime(runtime: &Path) -> PathBuf {
    if runtime.components().count() > 1 {
        return runtime.to_path_buf();
    }
    let Some(path_env) = std::env::var_os("PATH") else {
        return runtime.to_path_buf();
    };

    for dir in std::env::split_paths(&path_env) {
        for name in executable_names(runtime) {
            let cand = dir.join(&name);
            if is_executable(&cand) {
                return cand;
            }
        }
    }
    runtime.to_path_buf()
}

fn executable_names(runtime: &Path) -> Vec<OsString> {
    let mut names = vec![runtime.as_os_str().to_os_string()];
    if cfg!(windows) && runtime.extension().is_none() {
        let mut exe = runtime.as_os_str().to_os_string();
        exe.push(".exe");
        names.push(exe);
    }
    names
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        match std::fs::metadata(path) {
            Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}
