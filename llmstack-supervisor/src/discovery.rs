use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::Discovery;

/// Where an executable was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutableSource {
    Override,
    Path,
    WellKnown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedExecutable {
    pub path: PathBuf,
    pub source: ExecutableSource,
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolve an executable: explicit override, then `search_path`, then the
/// well-known install locations. `None` means nothing usable was found.
pub fn resolve_executable(
    discovery: &Discovery,
    search_path: Option<&OsStr>,
) -> Option<ResolvedExecutable> {
    if let Some(path) = &discovery.override_path {
        if is_executable(path) {
            return Some(ResolvedExecutable {
                path: path.clone(),
                source: ExecutableSource::Override,
            });
        }
        warn!(
            "Configured executable {} is not an executable file, searching further",
            path.display()
        );
    }

    if let Some(search_path) = search_path {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        match which::which_in(&discovery.program, Some(search_path), cwd) {
            Ok(path) => {
                return Some(ResolvedExecutable {
                    path,
                    source: ExecutableSource::Path,
                });
            }
            Err(e) => debug!("{} not found on PATH: {}", discovery.program, e),
        }
    }

    discovery
        .well_known
        .iter()
        .find(|candidate| is_executable(candidate))
        .map(|path| ResolvedExecutable {
            path: path.clone(),
            source: ExecutableSource::WellKnown,
        })
}

/// Every location that was considered, for error reporting.
pub fn searched_locations(discovery: &Discovery) -> Vec<String> {
    let mut locations = Vec::new();
    if let Some(path) = &discovery.override_path {
        locations.push(path.display().to_string());
    }
    locations.push(format!("{} on PATH", discovery.program));
    locations.extend(discovery.well_known.iter().map(|p| p.display().to_string()));
    locations
}
