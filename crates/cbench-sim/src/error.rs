//! Error types for the simulation driver.

use thiserror::Error;

use cbench_core::{AllocError, ConfigError};
use cbench_proc::ProcError;
use cbench_remote::RemoteError;

pub type SimResult<T> = Result<T, SimError>;

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Proc(#[from] ProcError),

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("failed to parse {path}: {source}")]
    SettingsParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ports from {base} cannot hold {servers} server(s)")]
    PortRange { base: u16, servers: usize },

    #[error("no source checkout (libcore, liboh, libspace) at or above {0}")]
    NoSourceTree(String),

    #[error("unknown build command: {0}")]
    UnknownCommand(String),
}
