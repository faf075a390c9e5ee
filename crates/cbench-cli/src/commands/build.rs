use std::path::{Path, PathBuf};

use cbench_sim::{BuildCommand, ClusterBuild};

use super::{load_cluster, ssh_transport, stdout_sink};

pub async fn build(
    cluster_file: &Path,
    args: &[String],
    workdir: PathBuf,
    source_dir: Option<PathBuf>,
) -> anyhow::Result<i32> {
    let commands = BuildCommand::parse_sequence(args)?;
    let cluster = load_cluster(cluster_file)?;

    let transport = ssh_transport(&cluster);
    let mut build = ClusterBuild::new(cluster, transport, stdout_sink()).with_workdir(workdir);
    if let Some(dir) = source_dir {
        build = build.with_source_root(dir);
    }
    let report = build.run_sequence(&commands).await?;

    let done: Vec<String> = report.completed.iter().map(ToString::to_string).collect();
    match &report.failed {
        Some((command, code)) => println!(
            "FAILED: {command} [code {code}] (completed: {})",
            done.join(", ")
        ),
        None => println!("OK: {}", done.join(", ")),
    }
    Ok(report.summary_code())
}
