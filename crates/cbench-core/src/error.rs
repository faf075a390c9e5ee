//! Error types for configuration parsing and deployment allocation.

use thiserror::Error;

/// Result type alias for configuration parsing.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type alias for deployment allocation.
pub type AllocResult<T> = Result<T, AllocError>;

/// Errors raised while reading a `.cluster` file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config at line {line_no} ({reason}): {line}")]
    Malformed {
        line_no: usize,
        line: String,
        reason: String,
    },

    #[error("missing required key: {0}")]
    MissingKey(&'static str),
}

/// Errors raised while mapping logical slots onto physical nodes.
///
/// Both are fatal: the orchestrator aborts before any remote action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("node pool is empty")]
    EmptyPool,

    #[error("insufficient nodes: {requested} slots requested, {available} distinct nodes available")]
    InsufficientNodes { requested: usize, available: usize },
}
