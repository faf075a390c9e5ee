pub mod alloc;
pub mod build;
pub mod local;
pub mod remote;
pub mod sim;
pub mod wrap;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use cbench_core::ClusterConfig;
use cbench_remote::{OutputSink, SshTransport, StdoutSink, Transport};

pub(crate) fn load_cluster(path: &Path) -> anyhow::Result<ClusterConfig> {
    ClusterConfig::from_file(path)
        .with_context(|| format!("failed to load cluster file {}", path.display()))
}

pub(crate) fn ssh_transport(cluster: &ClusterConfig) -> Arc<dyn Transport> {
    Arc::new(SshTransport::new(cluster.gateway.clone()))
}

pub(crate) fn stdout_sink() -> Arc<dyn OutputSink> {
    Arc::new(StdoutSink)
}
