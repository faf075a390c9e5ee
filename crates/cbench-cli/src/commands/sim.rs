use std::path::{Path, PathBuf};

use anyhow::Context;
use cbench_sim::{AnalysisPass, LocalRunner, Orchestrator, RunOutcome, Settings};
use tracing::info;

use super::{load_cluster, ssh_transport, stdout_sink};

pub struct SimOptions {
    pub binary_dir: PathBuf,
    pub workdir: PathBuf,
    pub message_latency: bool,
}

fn orchestrator(cluster_file: &Path, settings_file: &Path, opts: SimOptions) -> anyhow::Result<Orchestrator> {
    let cluster = load_cluster(cluster_file)?;
    let settings = Settings::load(settings_file)
        .with_context(|| format!("failed to load settings {}", settings_file.display()))?;
    settings.validate()?;

    let mut passes = AnalysisPass::DEFAULT_PIPELINE.to_vec();
    if opts.message_latency {
        passes.push(AnalysisPass::MessageLatency);
    }

    let transport = ssh_transport(&cluster);
    Ok(Orchestrator::new(
        cluster,
        settings,
        transport,
        stdout_sink(),
        LocalRunner::os(opts.binary_dir),
    )
    .with_workdir(opts.workdir)
    .with_passes(passes))
}

fn report(outcome: &RunOutcome) -> i32 {
    for failure in &outcome.copy_failures {
        println!("missing: {} -> {} ({})", failure.source, failure.destination, failure.label);
    }
    println!("{outcome}");
    outcome.summary_code()
}

pub async fn run(cluster_file: &Path, settings_file: &Path, opts: SimOptions) -> anyhow::Result<i32> {
    let orchestrator = orchestrator(cluster_file, settings_file, opts)?;
    let outcome = orchestrator.run().await?;
    Ok(report(&outcome))
}

pub async fn vis(cluster_file: &Path, settings_file: &Path, opts: SimOptions) -> anyhow::Result<i32> {
    let orchestrator = orchestrator(cluster_file, settings_file, opts)?;
    let outcome = orchestrator.vis().await?;
    Ok(report(&outcome))
}

pub fn clean(opts: &SimOptions) -> anyhow::Result<i32> {
    let removed = cbench_sim::orchestrator::clean_local(&opts.workdir)?;
    info!(removed, dir = %opts.workdir.display(), "cleaned local outputs");
    Ok(0)
}
