//! cbench-remote — run commands and copy files across a deployment.
//!
//! Every remote action goes through a [`Transport`], which turns a node and
//! a shell command into a local process. The ssh transport hops through an
//! optional gateway; the local transport runs `sh -c` and backs the tests.
//!
//! # Components
//!
//! - **`template`** — `{host}`/`{index}`/`{name:04}` rendering with per-node vectors
//! - **`transport`** — `Transport` trait, `SshTransport`, `LocalTransport`
//! - **`executor`** — `RemoteExecutor`: one streaming monitor per node, joined
//! - **`copier`** — `RemoteCopier`: `cat | dd` pipelines with `remote:` paths
//! - **`sink`** — Output sinks for per-node prefixed transcripts

pub mod copier;
pub mod error;
pub mod executor;
pub mod sink;
pub mod template;
pub mod transport;

pub use copier::{CopyFailure, CopyReport, Location, RemoteCopier};
pub use error::{RemoteError, RemoteResult};
pub use executor::{BatchReport, NodeExit, RemoteExecutor};
pub use sink::{MemorySink, OutputSink, StdoutSink};
pub use template::{NodeContext, Substitutions};
pub use transport::{LocalTransport, SshTransport, Transport};
