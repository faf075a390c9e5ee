//! cbench-proc — local process supervision.
//!
//! A [`ProcSet`] owns a group of processes started together, either on the
//! operator's machine or as the launch wrapper on a remote node. It shares a
//! single start instant across the group and escalates shutdown in two
//! stages: a graceful signal at the grace deadline (or as soon as every
//! wait-flagged process has exited), then two forceful signals at the kill
//! deadline.
//!
//! # Components
//!
//! - **`backend`** — `ProcessBackend` capability: OS processes (`libc::kill`)
//!   and a scripted in-memory double
//! - **`procset`** — `SupervisedProcess`, `ProcSet` and the supervisory loop
//! - **`error`** — Spawn and signal errors

pub mod backend;
pub mod error;
pub mod procset;

pub use backend::{OsBackend, ProcessBackend, ScriptedBackend, ScriptedProcess, SignalKind};
pub use error::{ProcError, ProcResult};
pub use procset::{ProcSet, SupervisedProcess};
