use std::path::Path;

use cbench_core::{ClusterConfig, Deployment};
use cbench_remote::{RemoteCopier, RemoteExecutor, Substitutions};
use tracing::warn;

use super::{load_cluster, ssh_transport, stdout_sink};

/// The first `slots` deployment positions, or every pool node once.
fn targets(cluster: &ClusterConfig, slots: Option<usize>) -> anyhow::Result<Deployment> {
    let pool = cluster.pool();
    let deployment = match slots {
        Some(n) => pool.allocate(n, true)?,
        None => Deployment::from_nodes(pool.nodes().to_vec()),
    };
    Ok(deployment)
}

pub async fn exec(cluster_file: &Path, slots: Option<usize>, command: &str) -> anyhow::Result<i32> {
    let cluster = load_cluster(cluster_file)?;
    let deployment = targets(&cluster, slots)?;

    let executor = RemoteExecutor::new(ssh_transport(&cluster), stdout_sink())
        .with_launch_delay(cluster.launch_delay());
    let report = executor
        .run(deployment.nodes(), command, &Substitutions::new())
        .await?;

    for failure in report.failures() {
        warn!(node = %failure.label, exit = %failure.exit, "command failed");
    }
    Ok(report.summary_code())
}

pub async fn copy(cluster_file: &Path, slots: Option<usize>, specs: &[String]) -> anyhow::Result<i32> {
    let cluster = load_cluster(cluster_file)?;
    let deployment = targets(&cluster, slots)?;

    let copier = RemoteCopier::new(ssh_transport(&cluster), stdout_sink());
    let report = copier.copy(deployment.nodes(), specs).await?;

    println!("copied {} file(s), {} failed", report.copied, report.failures.len());
    Ok(report.summary_code())
}
