//! Optional `loadstone.toml` configuration.
//!
//! Embedders can pre-register search paths and redirect the extraction
//! area without code:
//!
//! ```toml
//! [extract]
//! dir = "/var/tmp/loadstone"
//!
//! [paths]
//! testlib-path = ["/opt/native/lib"]
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extract;
use crate::search::SearchPaths;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Root configuration structure matching `loadstone.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Extraction area settings.
    #[serde(default)]
    pub extract: ExtractConfig,

    /// Logical name to ordered search directories.
    #[serde(default)]
    pub paths: HashMap<String, Vec<PathBuf>>,
}

/// Extraction area settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtractConfig {
    /// Directory extracted resources land in; the system temp area when
    /// unset.
    pub dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply to the process-wide registry and extraction area.
    pub fn apply(&self) {
        self.apply_to(crate::search::global());
        extract::set_extraction_root(self.extract.dir.clone());
    }

    /// Register the configured search paths into `registry`.
    pub fn apply_to(&self, registry: &SearchPaths) {
        for (name, dirs) in &self.paths {
            for dir in dirs {
                registry.add(name, dir);
            }
        }
    }
}
