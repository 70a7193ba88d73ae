//! Process-wide search-path registry.
//!
//! Callers register additional directories for a logical name before
//! resolution; the resolver consults them ahead of the platform default
//! search. Registrations append in order and live for the process
//! lifetime. Reads return a snapshot so concurrent registration never
//! tears an in-progress resolution.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;

/// Ordered per-name search directories.
pub struct SearchPaths {
    entries: RwLock<Vec<(String, Vec<PathBuf>)>>,
}

impl SearchPaths {
    /// An empty registry.
    pub const fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Append `dir` to the ordered list for `name`, creating the entry if
    /// absent.
    pub fn add(&self, name: &str, dir: impl AsRef<Path>) {
        let dir = dir.as_ref().to_path_buf();
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, dirs)) => dirs.push(dir),
            None => entries.push((name.to_string(), vec![dir])),
        }
    }

    /// Replace the list for `name` wholesale.
    pub fn set(&self, name: &str, dirs: Vec<PathBuf>) {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = dirs,
            None => entries.push((name.to_string(), dirs)),
        }
    }

    /// Snapshot of the registered directories for `name`, in registration
    /// order. Empty when nothing is registered.
    pub fn paths_for(&self, name: &str) -> Vec<PathBuf> {
        self.entries
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, dirs)| dirs.clone())
            .unwrap_or_default()
    }
}

impl Default for SearchPaths {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: SearchPaths = SearchPaths::new();

/// The process-wide registry consulted by default resolution.
pub fn global() -> &'static SearchPaths {
    &GLOBAL
}

/// Register `dir` as an additional search location for `name`, effective
/// for all subsequent resolutions of that name in this process.
pub fn add_search_path(name: &str, dir: impl AsRef<Path>) {
    GLOBAL.add(name, dir);
}

/// Snapshot of the process-wide search directories for `name`.
pub fn paths_for(name: &str) -> Vec<PathBuf> {
    GLOBAL.paths_for(name)
}
