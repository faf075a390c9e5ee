//! Deployment orchestrator.
//!
//! A cluster run is a fixed sequence of [`Step`]s. Each step either
//! completes or records a [`Failure`] that stops the pipeline; the caller
//! inspects [`RunOutcome`] for the last completed step. Only configuration
//! and template problems surface as `Err`, because they are found before
//! anything runs remotely.
//!
//! Retrieval is the one step that tolerates partial failure: copy failures
//! are kept in the outcome, analysis still runs on whatever arrived, and the
//! overall summary code reports the run as failed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use cbench_core::{
    AllocError, ClusterConfig, Deployment, ExitKind, Node, Placement, ProcessExit, Role, RoleSpec,
    parse_duration, slot_count,
};
use cbench_proc::{OsBackend, ProcessBackend};
use cbench_remote::template::escape;
use cbench_remote::transport::shell_quote;
use cbench_remote::{
    BatchReport, CopyFailure, OutputSink, RemoteCopier, RemoteExecutor, Substitutions, Transport,
};

use crate::address::AddressPlan;
use crate::analysis::{AnalysisPass, LocalExit, LocalRunner};
use crate::error::{SimError, SimResult};
use crate::params::{ParameterComposer, ParameterSet, RunContext, wait_until_now};
use crate::settings::Settings;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Step {
    Allocate,
    CleanLocal,
    CleanRemote,
    AddressTables,
    PackGeneration,
    PushInputs,
    Launch,
    Retrieve,
    Analysis,
    Vis,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Allocate => "allocate",
            Step::CleanLocal => "clean_local",
            Step::CleanRemote => "clean_remote",
            Step::AddressTables => "address_tables",
            Step::PackGeneration => "pack_generation",
            Step::PushInputs => "push_inputs",
            Step::Launch => "launch",
            Step::Retrieve => "retrieve",
            Step::Analysis => "analysis",
            Step::Vis => "vis",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// No deployment could be built; nothing ran remotely.
    Allocation(AllocError),
    /// A step finished with a non-zero summary code.
    Execution { step: Step, code: i32 },
    /// A process in the step had to be forcibly killed.
    Killed { step: Step },
}

impl Failure {
    pub fn step(&self) -> Step {
        match self {
            Failure::Allocation(_) => Step::Allocate,
            Failure::Execution { step, .. } | Failure::Killed { step } => *step,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Allocation(e) => write!(f, "allocation failed: {e}"),
            Failure::Execution { step, code } => write!(f, "{step} failed with code {code}"),
            Failure::Killed { step } => write!(f, "{step} killed after its deadline"),
        }
    }
}

/// What a run got through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub completed: Vec<Step>,
    pub failure: Option<Failure>,
    /// Retrieval failures; the run continued past them.
    pub copy_failures: Vec<CopyFailure>,
}

impl RunOutcome {
    pub fn last_completed(&self) -> Option<Step> {
        self.completed.last().copied()
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none() && self.copy_failures.is_empty()
    }

    /// 0 on full success, -1 otherwise.
    pub fn summary_code(&self) -> i32 {
        if self.succeeded() { 0 } else { -1 }
    }

    fn complete(&mut self, step: Step) {
        info!(step = %step, "step completed");
        self.completed.push(step);
    }

    fn fail(mut self, failure: Failure) -> Self {
        error!(step = %failure.step(), failure = %failure, "run stopped");
        self.failure = Some(failure);
        self
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.failure, self.last_completed()) {
            (Some(failure), Some(last)) => write!(f, "FAILED: {failure} (last completed: {last})")?,
            (Some(failure), None) => write!(f, "FAILED: {failure}")?,
            (None, _) => f.write_str("OK")?,
        }
        if !self.copy_failures.is_empty() {
            write!(f, "; {} file(s) not retrieved", self.copy_failures.len())?;
        }
        write!(f, " [code {}]", self.summary_code())
    }
}

/// Local files left behind by a previous run.
pub fn is_stale_output(name: &str) -> bool {
    const PREFIXES: [&str; 3] = ["trace", "serverip", "loc_latency"];
    const SUFFIXES: [&str; 2] = [".ps", ".dat"];
    const EXACT: [&str; 3] = [
        "analysis.trace",
        "distance_latency_histogram.csv",
        "prox.log",
    ];
    PREFIXES.iter().any(|p| name.starts_with(p))
        || SUFFIXES.iter().any(|s| name.ends_with(s))
        || EXACT.contains(&name)
}

/// Remove stale outputs from `dir`. Returns how many files were removed.
pub fn clean_local(dir: &Path) -> SimResult<usize> {
    let io_err = |source| SimError::Io {
        path: dir.display().to_string(),
        source,
    };
    let mut removed = 0;
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !entry.file_type().map_err(io_err)?.is_file() || !is_stale_output(name) {
            continue;
        }
        std::fs::remove_file(entry.path()).map_err(|source| SimError::Io {
            path: entry.path().display().to_string(),
            source,
        })?;
        removed += 1;
    }
    debug!(dir = %dir.display(), removed, "local outputs cleaned");
    Ok(removed)
}

/// Each node once, in first-appearance order.
fn distinct_nodes(nodes: &[Node]) -> Vec<Node> {
    let mut seen = Vec::new();
    for node in nodes {
        if !seen.contains(node) {
            seen.push(node.clone());
        }
    }
    seen
}

/// Slot layout of a cluster run: space servers, then coordination servers,
/// then index servers, then object hosts.
pub fn cluster_roles(settings: &Settings) -> Vec<RoleSpec> {
    [
        RoleSpec::new(Role::Space, settings.space_server_pool),
        RoleSpec::new(Role::Cseg, settings.num_cseg_servers()),
        RoleSpec::new(Role::Index, settings.num_index_servers),
        RoleSpec::new(Role::ObjectHost, settings.num_oh),
    ]
    .into_iter()
    .filter(|r| r.count > 0)
    .collect()
}

/// Recover a signal death relayed through a remote shell.
fn decode_remote(exit: &ProcessExit) -> ProcessExit {
    match exit {
        ProcessExit::Code(c) => ProcessExit::from_shell_code(*c),
        other => other.clone(),
    }
}

fn batch_failure(step: Step, report: &BatchReport) -> Option<Failure> {
    if !report.any_failed() {
        return None;
    }
    let killed = report
        .failures()
        .any(|f| decode_remote(&f.exit).classify() == ExitKind::Killed);
    Some(if killed {
        Failure::Killed { step }
    } else {
        Failure::Execution {
            step,
            code: report.summary_code(),
        }
    })
}

fn local_failure(step: Step, exit: &LocalExit) -> Option<Failure> {
    if exit.killed {
        Some(Failure::Killed { step })
    } else if !exit.success() {
        Some(Failure::Execution {
            step,
            code: exit.exit.code(),
        })
    } else {
        None
    }
}

fn joined_args(args: &[String]) -> String {
    args.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drives cluster runs.
pub struct Orchestrator<B: ProcessBackend = OsBackend> {
    cluster: ClusterConfig,
    settings: Settings,
    executor: RemoteExecutor,
    copier: RemoteCopier,
    runner: LocalRunner<B>,
    workdir: PathBuf,
    passes: Vec<AnalysisPass>,
}

impl<B: ProcessBackend> Orchestrator<B> {
    pub fn new(
        cluster: ClusterConfig,
        settings: Settings,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn OutputSink>,
        runner: LocalRunner<B>,
    ) -> Self {
        let executor = RemoteExecutor::new(Arc::clone(&transport), Arc::clone(&sink))
            .with_launch_delay(cluster.launch_delay());
        let copier = RemoteCopier::new(transport, sink);
        let analysis_grace = settings.analysis_grace.as_deref().and_then(parse_duration);
        let analysis_kill = settings.analysis_kill.as_deref().and_then(parse_duration);
        Self {
            cluster,
            settings,
            executor,
            copier,
            runner: runner.with_deadlines(analysis_grace, analysis_kill),
            workdir: PathBuf::from("."),
            passes: AnalysisPass::DEFAULT_PIPELINE.to_vec(),
        }
    }

    /// Directory for address tables, retrieved traces and analysis output.
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = dir.into();
        self
    }

    pub fn with_passes(mut self, passes: Vec<AnalysisPass>) -> Self {
        self.passes = passes;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn launch_template(&self, scripts: &str) -> String {
        format!(
            "cd {} ; {} {{binary}} --id={{index}} {{args}}",
            escape(&shell_quote(scripts)),
            escape(&self.cluster.wrapper)
        )
    }

    fn run_context(&self, plan: Option<&AddressPlan>, placements: &[Placement<'_>]) -> RunContext {
        RunContext {
            unique: self.settings.unique(&self.cluster),
            cseg_service_host: self
                .settings
                .cseg_service_host
                .clone()
                .or_else(|| plan.and_then(|p| p.cseg_service_host.clone()))
                .unwrap_or_default(),
            index_endpoints: plan.map(|p| p.index_endpoints.clone()).unwrap_or_default(),
            object_host_ids: placements
                .iter()
                .filter(|p| p.role == Role::ObjectHost)
                .map(|p| p.position + 1)
                .collect(),
        }
    }

    /// Full cluster run.
    pub async fn run(&self) -> SimResult<RunOutcome> {
        let mut outcome = RunOutcome::default();
        let scripts = self.cluster.scripts_dir()?;
        let roles = cluster_roles(&self.settings);

        let deployment = match self.cluster.pool().allocate(slot_count(&roles), true) {
            Ok(d) => d,
            Err(e) => return Ok(outcome.fail(Failure::Allocation(e))),
        };
        let placements = match deployment.placements(&roles) {
            Ok(p) => p,
            Err(e) => return Ok(outcome.fail(Failure::Allocation(e))),
        };
        let hosts = distinct_nodes(deployment.nodes());
        info!(slots = deployment.len(), nodes = hosts.len(), "deployment allocated");
        outcome.complete(Step::Allocate);

        clean_local(&self.workdir)?;
        outcome.complete(Step::CleanLocal);

        let cmd = format!(
            "cd {} ; rm -f trace* ; rm -f serverip*",
            shell_quote(&scripts)
        );
        let report = self.executor.run_command(&hosts, &cmd).await;
        if let Some(failure) = batch_failure(Step::CleanRemote, &report) {
            return Ok(outcome.fail(failure));
        }
        outcome.complete(Step::CleanRemote);

        let plan = AddressPlan::build(
            &placements,
            self.cluster.port_base,
            &self.settings.cseg_ip_file,
        )?;
        let mut specs = Vec::new();
        for table in plan.tables() {
            specs.push(escape(&table.write_to(&self.workdir)?.display().to_string()));
        }
        specs.push(format!("remote:{}", escape(&scripts)));
        let pushed = self.copier.copy(&hosts, &specs).await?;
        if pushed.any_failed() {
            return Ok(outcome.fail(Failure::Execution {
                step: Step::AddressTables,
                code: pushed.summary_code(),
            }));
        }
        outcome.complete(Step::AddressTables);

        let composer =
            ParameterComposer::new(&self.settings, self.run_context(Some(&plan), &placements));
        let template = self.launch_template(&scripts);

        let mut local_pack = None;
        if self.settings.runs_pack_generation() {
            if let Some(failure) = self
                .generate_pack(&deployment, &composer, &template, &mut local_pack)
                .await?
            {
                return Ok(outcome.fail(failure));
            }
            outcome.complete(Step::PackGeneration);
        }

        if self.settings.num_pack_objects > 0 {
            let source = local_pack.unwrap_or_else(|| self.settings.object_pack.clone());
            let specs = [
                escape(&source),
                format!("remote:{}", escape(&self.settings.object_pack)),
            ];
            let pushed = self.copier.copy(&hosts, &specs).await?;
            if pushed.any_failed() {
                return Ok(outcome.fail(Failure::Execution {
                    step: Step::PushInputs,
                    code: pushed.summary_code(),
                }));
            }
        }
        outcome.complete(Step::PushInputs);

        let report = self
            .launch(&deployment, &placements, &composer, &template)
            .await?;
        if let Some(failure) = batch_failure(Step::Launch, &report) {
            return Ok(outcome.fail(failure));
        }
        outcome.complete(Step::Launch);

        let specs = [
            format!("remote:{}{}", escape(&scripts), "trace-{node:04}.txt"),
            escape(&self.workdir.display().to_string()),
        ];
        let retrieved = self.copier.copy(deployment.nodes(), &specs).await?;
        if retrieved.any_failed() {
            warn!(
                missing = retrieved.failures.len(),
                "some traces were not retrieved; analysing partial data"
            );
        }
        outcome.copy_failures = retrieved.failures;
        outcome.complete(Step::Retrieve);

        for pass in &self.passes {
            let exit = self.runner.run_pass(*pass, &self.settings).await?;
            if let Some(failure) = local_failure(Step::Analysis, &exit) {
                return Ok(outcome.fail(failure));
            }
        }
        outcome.complete(Step::Analysis);

        info!(outcome = %outcome, "cluster run finished");
        Ok(outcome)
    }

    async fn generate_pack(
        &self,
        deployment: &Deployment,
        composer: &ParameterComposer,
        template: &str,
        local_pack: &mut Option<String>,
    ) -> SimResult<Option<Failure>> {
        let first = deployment.head(1);
        let args = composer
            .pack_generation()
            .with_wait(&wait_until_now(), &self.settings.wait_additional)
            .resolve(0);
        let subs = Substitutions::new()
            .with("binary", vec![Role::ObjectHost.binary().to_string()])
            .with("args", vec![joined_args(&args)]);
        info!(node = ?first.first().map(Node::label), "generating object pack");
        let report = self.executor.run(first, template, &subs).await?;
        if let Some(failure) = batch_failure(Step::PackGeneration, &report) {
            return Ok(Some(failure));
        }

        let pack = &self.settings.object_pack;
        let file_name = Path::new(pack)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "objects.pack".to_string());
        let local = self.workdir.join(file_name).display().to_string();
        let specs = [
            format!("remote:{}", escape(pack)),
            escape(&local),
        ];
        let fetched = self.copier.copy(first, &specs).await?;
        if fetched.any_failed() {
            return Ok(Some(Failure::Execution {
                step: Step::PackGeneration,
                code: fetched.summary_code(),
            }));
        }
        *local_pack = Some(local);
        Ok(None)
    }

    async fn launch(
        &self,
        deployment: &Deployment,
        placements: &[Placement<'_>],
        composer: &ParameterComposer,
        template: &str,
    ) -> SimResult<BatchReport> {
        let wait_until = wait_until_now();
        let sets: BTreeMap<Role, ParameterSet> = placements
            .iter()
            .map(|p| p.role)
            .map(|role| {
                let set = composer
                    .compose(role)
                    .with_wait(&wait_until, &self.settings.wait_additional);
                (role, set)
            })
            .collect();

        let mut binaries = Vec::with_capacity(placements.len());
        let mut args = Vec::with_capacity(placements.len());
        for p in placements {
            binaries.push(p.role.binary().to_string());
            let resolved = sets
                .get(&p.role)
                .map(|set| set.resolve(p.role_index))
                .unwrap_or_default();
            args.push(joined_args(&resolved));
        }
        let subs = Substitutions::new()
            .with("binary", binaries)
            .with("args", args);

        info!(nodes = deployment.len(), wait_until = %wait_until, "launching deployment");
        Ok(self.executor.run(deployment.nodes(), template, &subs).await?)
    }

    /// Single local analysis run with the location-visualisation flags.
    pub async fn vis(&self) -> SimResult<RunOutcome> {
        let mut outcome = RunOutcome::default();
        let composer = ParameterComposer::new(&self.settings, self.run_context(None, &[]));
        let mut args = vec!["--id=1".to_string()];
        args.extend(
            composer
                .compose(Role::Analysis)
                .with_wait(&wait_until_now(), &self.settings.wait_additional)
                .resolve(0),
        );
        let exit = self.runner.run(Role::Analysis.binary(), &args, None).await?;
        if let Some(failure) = local_failure(Step::Vis, &exit) {
            return Ok(outcome.fail(failure));
        }
        outcome.complete(Step::Vis);
        Ok(outcome)
    }

    /// Remove stale local outputs.
    pub fn clean(&self) -> SimResult<usize> {
        clean_local(&self.workdir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_output_patterns() {
        for name in [
            "trace-0001.txt",
            "serverip.txt",
            "analysis.trace",
            "graph.ps",
            "windowed_bandwidth_packet_send.dat",
            "distance_latency_histogram.csv",
            "loc_latency_samples.txt",
            "prox.log",
        ] {
            assert!(is_stale_output(name), "{name}");
        }
        for name in ["sim.toml", ".cluster", "notes.txt", "cseg_serverip.txt"] {
            assert!(!is_stale_output(name), "{name}");
        }
    }

    #[test]
    fn clean_local_removes_only_outputs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["trace-0001.txt", "serverip.txt", "sim.toml"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        std::fs::create_dir(dir.path().join("trace-dir")).unwrap();
        assert_eq!(clean_local(dir.path()).unwrap(), 2);
        assert!(dir.path().join("sim.toml").exists());
        assert!(dir.path().join("trace-dir").exists());
    }

    #[test]
    fn roles_skip_empty_counts() {
        let roles = cluster_roles(&Settings::default());
        assert_eq!(
            roles,
            vec![RoleSpec::new(Role::Space, 4), RoleSpec::new(Role::ObjectHost, 1)]
        );
        let roles = cluster_roles(&Settings {
            cseg: "client".into(),
            num_index_servers: 1,
            ..Settings::default()
        });
        let order: Vec<Role> = roles.iter().map(|r| r.role).collect();
        assert_eq!(order, vec![Role::Space, Role::Cseg, Role::Index, Role::ObjectHost]);
    }

    #[test]
    fn remote_kill_is_classified() {
        assert_eq!(decode_remote(&ProcessExit::Code(137)).classify(), ExitKind::Killed);
        assert_eq!(decode_remote(&ProcessExit::Signal(9)).classify(), ExitKind::Killed);
        assert_eq!(decode_remote(&ProcessExit::Code(1)), ProcessExit::Code(1));
    }

    #[test]
    fn outcome_summary() {
        let mut outcome = RunOutcome::default();
        outcome.complete(Step::Allocate);
        assert_eq!(outcome.summary_code(), 0);
        assert_eq!(outcome.to_string(), "OK [code 0]");

        let outcome = outcome.fail(Failure::Execution {
            step: Step::CleanRemote,
            code: -1,
        });
        assert_eq!(outcome.last_completed(), Some(Step::Allocate));
        assert_eq!(outcome.summary_code(), -1);
        assert_eq!(
            outcome.to_string(),
            "FAILED: clean_remote failed with code -1 (last completed: allocate) [code -1]"
        );
    }

    #[test]
    fn distinct_nodes_keep_first_appearance() {
        let a = Node::new("u", "a", 2);
        let b = Node::new("u", "b", 1);
        let nodes = vec![a.clone(), b.clone(), a.clone()];
        assert_eq!(distinct_nodes(&nodes), vec![a, b]);
    }
}
