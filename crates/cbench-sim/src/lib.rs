//! cbench-sim — drive benchmark runs across a cluster.
//!
//! # Components
//!
//! - **`settings`** — `sim.toml` simulation settings with reference defaults
//! - **`params`** — `ParameterComposer`: per-role flag sets, constant or per-index
//! - **`address`** — Node-address tables handed to the engine binaries
//! - **`orchestrator`** — Fail-fast run pipeline, `vis` and local cleanup
//! - **`analysis`** — Offline analysis passes under local supervision
//! - **`cluster_build`** — Checkout, build and profiling across the node pool
//! - **`patchset`** — Local commits and changes carried to every node's checkout
//! - **`local`** — Single-machine space cluster

pub mod address;
pub mod analysis;
pub mod cluster_build;
pub mod error;
pub mod local;
pub mod orchestrator;
pub mod params;
pub mod patchset;
pub mod settings;

pub use address::{AddressPlan, AddressTable};
pub use analysis::{AnalysisPass, LocalExit, LocalRunner};
pub use cluster_build::{BuildCommand, BuildReport, BuildType, ClusterBuild};
pub use error::{SimError, SimResult};
pub use local::LocalCluster;
pub use orchestrator::{Failure, Orchestrator, RunOutcome, Step};
pub use params::{Param, ParameterComposer, ParameterSet, RunContext};
pub use patchset::Repository;
pub use settings::{DEFAULT_SETTINGS_FILE, Settings};
