//! cbench-core — shared types for cluster benchmark deployments.
//!
//! # Components
//!
//! - **`config`** — `.cluster` file parser (node pool, gateway, paths, ports)
//! - **`pool`** — Node pool and the tiered round-robin deployment allocator
//! - **`types`** — Roles, process exit classification, duration parsing
//! - **`error`** — Configuration and allocation errors

pub mod config;
pub mod error;
pub mod pool;
pub mod types;

pub use config::{ClusterConfig, DEFAULT_CLUSTER_FILE, Endpoint};
pub use error::{AllocError, AllocResult, ConfigError, ConfigResult};
pub use pool::{Deployment, Node, NodePool, Placement};
pub use types::*;
