//! Error taxonomy for resolution, loading, extraction, and dispatch.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the resolution, loading, and proxy layers.
#[derive(Debug, Error)]
pub enum LinkError {
    /// No resolution strategy produced a loadable location. Carries the
    /// full ordered list of attempted strategies for diagnosability.
    #[error("library '{name}' not found; attempted: {}", .attempts.join("; "))]
    NotFound {
        /// The logical name or path as given by the caller.
        name: String,
        /// Every candidate tried, in resolution order.
        attempts: Vec<String>,
    },

    /// I/O failure while materializing a resource to disk.
    #[error("failed to extract '{name}' to '{}': {source}", .dest.display())]
    Extraction {
        /// Suggested name of the resource being extracted.
        name: String,
        /// Destination that could not be written.
        dest: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The OS loader rejected an existing, resolved location (architecture
    /// mismatch, missing dependent library, malformed module).
    #[error("failed to load '{location}': {reason}")]
    Load { location: String, reason: String },

    /// The module is loaded but does not export the requested name.
    #[error("symbol '{symbol}' not found in '{library}': {reason}")]
    SymbolNotFound {
        symbol: String,
        library: String,
        reason: String,
    },

    /// A proxy option key no recognized entry matches.
    #[error("unrecognized proxy option '{0}'")]
    UnknownOption(String),

    /// An invoked method the interface descriptor does not declare.
    #[error("method '{0}' is not declared by the interface")]
    UnknownMethod(String),

    /// Argument count does not match the declared signature.
    #[error("method '{method}' expects {expected} argument(s), got {got}")]
    ArgCount {
        method: String,
        expected: usize,
        got: usize,
    },

    /// Malformed input rejected before it reached the native boundary.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The handle was released and its module closed.
    #[error("native library handle is closed")]
    Closed,
}

/// Result type for library operations.
pub type Result<T> = std::result::Result<T, LinkError>;
