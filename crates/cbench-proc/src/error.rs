//! Error types for process supervision.

use thiserror::Error;

pub type ProcResult<T> = Result<T, ProcError>;

#[derive(Debug, Error)]
pub enum ProcError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to poll pid {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot spawn after shutdown has begun")]
    ShuttingDown,
}
