//! Error types for the remote layer.
//!
//! Per-node command and copy failures are not errors here: they land in
//! [`BatchReport`](crate::BatchReport) and [`CopyReport`](crate::CopyReport).
//! These variants cover problems detected before anything is launched.

use thiserror::Error;

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("unknown placeholder {{{name}}} in template: {template}")]
    UnknownPlaceholder { name: String, template: String },

    #[error("unbalanced brace in template: {0}")]
    UnbalancedBrace(String),

    #[error("invalid format spec '{spec}' for placeholder {name}")]
    BadFormat { name: String, spec: String },

    #[error("substitution '{name}' has {actual} values for {expected} nodes")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("substitution name '{0}' shadows a built-in placeholder")]
    ReservedName(String),

    #[error("copy needs at least one source and a destination")]
    MissingCopyOperands,
}
