//! Checkout, build and profiling commands across the whole node pool.
//!
//! Each command is one batch over every configured node. A sequence stops at
//! the first command whose summary code is non-zero. The patchset commands
//! work per repository (see [`crate::patchset`]) and summarise to 0 or -1.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use cbench_core::{ClusterConfig, Node};
use cbench_remote::template::escape;
use cbench_remote::{OutputSink, RemoteCopier, RemoteExecutor, Transport};

use crate::error::{SimError, SimResult};
use crate::patchset::{self, Repository};

/// Binaries that can be profiled.
pub const PROFILE_BINARIES: [&str; 4] = ["cbr", "simoh", "cseg", "analysis"];

const CCACHE_CHECK: &str = "ls /usr/bin/ccache /usr/bin/g++ /usr/bin/gcc &> /dev/null";
const CCACHE_PREFIX: &str = r#"CC="/usr/bin/ccache /usr/bin/gcc" CXX="/usr/bin/ccache /usr/bin/g++""#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildType {
    /// Let cmake pick.
    #[default]
    Default,
    Debug,
    Release,
    RelWithDebInfo,
    Profile,
    Coverage,
}

impl BuildType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildType::Default => "Default",
            BuildType::Debug => "Debug",
            BuildType::Release => "Release",
            BuildType::RelWithDebInfo => "RelWithDebInfo",
            BuildType::Profile => "Profile",
            BuildType::Coverage => "Coverage",
        }
    }
}

impl FromStr for BuildType {
    type Err = ();

    /// Only the types an operator may name on the command line.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Debug" => Ok(BuildType::Debug),
            "Release" => Ok(BuildType::Release),
            "RelWithDebInfo" => Ok(BuildType::RelWithDebInfo),
            "Profile" => Ok(BuildType::Profile),
            "Coverage" => Ok(BuildType::Coverage),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildCommand {
    Destroy,
    Checkout,
    Update,
    Dependencies,
    Build { build_type: BuildType, timestamp: bool },
    Clean,
    Profile(String),
    Oprofile(String),
    /// Destroy, checkout, update, dependencies, then a default build.
    FullBuild,
    /// Write the local commits and changes of every repository to patch files.
    PatchsetCreate,
    /// Ship the patch files to every node and apply them.
    PatchsetApply,
    /// Reset every node's repositories to the tracked branch.
    PatchsetRevert,
}

impl BuildCommand {
    /// Parse an operator command line such as `build Release no-timestamp clean`.
    pub fn parse_sequence(args: &[String]) -> SimResult<Vec<BuildCommand>> {
        let expanded: Vec<&str> = args
            .iter()
            .flat_map(|a| match a.as_str() {
                "update_dependencies" => vec!["dependencies"],
                "deploy" => vec![
                    "patchset_revert",
                    "patchset_create",
                    "patchset_apply",
                    "clean",
                    "build",
                ],
                other => vec![other],
            })
            .collect();

        let mut commands = Vec::new();
        let mut i = 0;
        while i < expanded.len() {
            let cmd = expanded[i];
            i += 1;
            let command = match cmd {
                "destroy" => BuildCommand::Destroy,
                "checkout" => BuildCommand::Checkout,
                "update" => BuildCommand::Update,
                "dependencies" => BuildCommand::Dependencies,
                "clean" => BuildCommand::Clean,
                "fullbuild" => BuildCommand::FullBuild,
                "patchset_create" => BuildCommand::PatchsetCreate,
                "patchset_apply" => BuildCommand::PatchsetApply,
                "patchset_revert" => BuildCommand::PatchsetRevert,
                "build" => {
                    let mut build_type = BuildType::Debug;
                    let mut timestamp = true;
                    while let Some(arg) = expanded.get(i) {
                        if let Ok(t) = arg.parse::<BuildType>() {
                            build_type = t;
                        } else if *arg == "timestamp" {
                            timestamp = true;
                        } else if *arg == "no-timestamp" {
                            timestamp = false;
                        } else {
                            break;
                        }
                        i += 1;
                    }
                    BuildCommand::Build {
                        build_type,
                        timestamp,
                    }
                }
                "profile" | "oprofile" => {
                    let mut binary = "cbr";
                    if let Some(arg) = expanded.get(i)
                        && PROFILE_BINARIES.contains(arg)
                    {
                        binary = *arg;
                        i += 1;
                    }
                    if cmd == "profile" {
                        BuildCommand::Profile(binary.to_string())
                    } else {
                        BuildCommand::Oprofile(binary.to_string())
                    }
                }
                other => return Err(SimError::UnknownCommand(other.to_string())),
            };
            commands.push(command);
        }
        Ok(commands)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuildCommand::Destroy => "destroy",
            BuildCommand::Checkout => "checkout",
            BuildCommand::Update => "update",
            BuildCommand::Dependencies => "dependencies",
            BuildCommand::Build { .. } => "build",
            BuildCommand::Clean => "clean",
            BuildCommand::Profile(_) => "profile",
            BuildCommand::Oprofile(_) => "oprofile",
            BuildCommand::FullBuild => "fullbuild",
            BuildCommand::PatchsetCreate => "patchset_create",
            BuildCommand::PatchsetApply => "patchset_apply",
            BuildCommand::PatchsetRevert => "patchset_revert",
        }
    }
}

impl fmt::Display for BuildCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Join shell fragments with `&&`, dropping empty ones.
pub fn concat_commands(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Result of a command sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub completed: Vec<BuildCommand>,
    pub failed: Option<(BuildCommand, i32)>,
}

impl BuildReport {
    pub fn summary_code(&self) -> i32 {
        match &self.failed {
            Some((_, code)) => *code,
            None => 0,
        }
    }
}

pub struct ClusterBuild {
    cluster: ClusterConfig,
    nodes: Vec<Node>,
    executor: RemoteExecutor,
    copier: RemoteCopier,
    workdir: PathBuf,
    source_root: Option<PathBuf>,
    repositories: Vec<Repository>,
}

impl ClusterBuild {
    pub fn new(cluster: ClusterConfig, transport: Arc<dyn Transport>, sink: Arc<dyn OutputSink>) -> Self {
        let nodes = cluster.nodes.clone();
        let executor = RemoteExecutor::new(Arc::clone(&transport), Arc::clone(&sink))
            .with_launch_delay(cluster.launch_delay());
        Self {
            cluster,
            nodes,
            executor,
            copier: RemoteCopier::new(transport, sink),
            workdir: PathBuf::from("."),
            source_root: None,
            repositories: Repository::defaults(),
        }
    }

    /// Where profiles are copied back to and patch files are written.
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = dir.into();
        self
    }

    /// Local checkout patchsets are created from. Without one it is searched
    /// for upwards from the current directory.
    pub fn with_source_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_root = Some(dir.into());
        self
    }

    pub fn with_repositories(mut self, repositories: Vec<Repository>) -> Self {
        self.repositories = repositories;
        self
    }

    /// Shell line for `command`. `ccache` is prepended to the cmake call.
    pub fn command_line(&self, command: &BuildCommand, ccache: &str) -> SimResult<String> {
        let code_dir = self.cluster.code_dir()?;
        let cd_code = format!("cd {code_dir}");
        let line = match command {
            BuildCommand::Destroy => format!("rm -rf {code_dir}"),
            BuildCommand::Checkout => concat_commands(&[
                &format!("git clone {} {code_dir}", self.cluster.repository()?),
                &cd_code,
                &format!("git branch _cluster origin/{}", self.cluster.branch),
                "git checkout _cluster",
            ]),
            BuildCommand::Update => concat_commands(&[
                &cd_code,
                "git pull origin master",
                "git submodule init",
                "git submodule update",
            ]),
            BuildCommand::Dependencies => concat_commands(&[&cd_code, "make minimal-depends"]),
            BuildCommand::Build {
                build_type,
                timestamp,
            } => concat_commands(&[
                &cd_code,
                "cd build/cmake",
                &format!(
                    "{ccache} cmake -DCMAKE_BUILD_TYPE={} -DCBR_TIMESTAMP_PACKETS={} .",
                    build_type.as_str(),
                    if *timestamp { "True" } else { "False" }
                ),
                "make -j2",
            ]),
            BuildCommand::Clean => concat_commands(&[
                &cd_code,
                "make clean",
                "cd build/cmake",
                "rm -f CMakeCache.txt",
            ]),
            BuildCommand::Profile(binary) => concat_commands(&[
                &cd_code,
                "cd scripts",
                &format!("gprof ../build/cmake/{binary} > gprof.out"),
            ]),
            BuildCommand::Oprofile(binary) => concat_commands(&[
                &cd_code,
                "cd scripts",
                &format!(
                    r"opreport \*{binary}\* > oprofile.out; opreport -l \*{binary}\* >> oprofile.out"
                ),
            ]),
            BuildCommand::FullBuild
            | BuildCommand::PatchsetCreate
            | BuildCommand::PatchsetApply
            | BuildCommand::PatchsetRevert => {
                return Err(SimError::UnknownCommand(format!(
                    "{command} has no single command line"
                )));
            }
        };
        Ok(line)
    }

    async fn batch(&self, line: &str) -> i32 {
        self.executor.run_command(&self.nodes, line).await.summary_code()
    }

    /// `CC`/`CXX` overrides when every node has ccache, else empty.
    pub async fn ccache_prefix(&self) -> String {
        if !self.cluster.ccache {
            return String::new();
        }
        if self.batch(CCACHE_CHECK).await == 0 {
            CCACHE_PREFIX.to_string()
        } else {
            warn!("running without ccache");
            String::new()
        }
    }

    async fn fetch(&self, remote_file: &str, pattern: &str) -> SimResult<i32> {
        let code_dir = self.cluster.code_dir()?.trim_end_matches('/');
        let specs = [
            format!("remote:{}/scripts/{remote_file}", escape(code_dir)),
            format!("{}/{pattern}", escape(&self.workdir.display().to_string())),
        ];
        Ok(self.copier.copy(&self.nodes, &specs).await?.summary_code())
    }

    fn source_root(&self) -> SimResult<PathBuf> {
        if let Some(dir) = &self.source_root {
            return Ok(dir.clone());
        }
        let cwd = std::env::current_dir().map_err(|source| SimError::Io {
            path: ".".into(),
            source,
        })?;
        patchset::find_source_root(&cwd)
            .ok_or_else(|| SimError::NoSourceTree(cwd.display().to_string()))
    }

    /// Write `.<name>.commits.patch` and `.<name>.changes.patch` for every
    /// repository into the workdir.
    pub async fn patchset_create(&self) -> SimResult<i32> {
        let root = self.source_root()?;
        let mut failed = false;
        for repo in &self.repositories {
            let code = repo.create(&root, &self.cluster.branch, &self.workdir).await?;
            failed |= code != 0;
        }
        Ok(if failed { -1 } else { 0 })
    }

    /// Copy the non-empty patch files of every repository into its remote
    /// checkout and apply them there.
    pub async fn patchset_apply(&self) -> SimResult<i32> {
        let code_dir = self.cluster.code_dir()?;
        let mut failed = false;
        for repo in &self.repositories {
            let commits = self.workdir.join(repo.commits_patch());
            let changes = self.workdir.join(repo.changes_patch());
            let has_commits = patchset::has_content(&commits)?;
            let has_changes = patchset::has_content(&changes)?;
            if !has_commits && !has_changes {
                debug!(repository = %repo.name, "nothing to apply");
                continue;
            }

            let mut specs: Vec<String> = [(has_commits, &commits), (has_changes, &changes)]
                .into_iter()
                .filter(|(present, _)| *present)
                .map(|(_, path)| escape(&path.display().to_string()))
                .collect();
            specs.push(format!("remote:{}/", escape(&repo.remote_dir(code_dir))));
            if self.copier.copy(&self.nodes, &specs).await?.summary_code() != 0 {
                error!(repository = %repo.name, "patch files did not reach every node");
                failed = true;
                continue;
            }

            let line = repo.apply_line(code_dir, has_commits, has_changes);
            failed |= self.batch(&line).await != 0;
        }
        Ok(if failed { -1 } else { 0 })
    }

    /// Reset, clean and update every repository on every node. Each
    /// repository stops at its first failing step.
    pub async fn patchset_revert(&self) -> SimResult<i32> {
        let code_dir = self.cluster.code_dir()?;
        let mut failed = false;
        for repo in &self.repositories {
            let steps = [
                repo.reset_line(code_dir, &self.cluster.branch),
                repo.clean_line(code_dir),
                repo.update_line(code_dir, false),
            ];
            for line in &steps {
                if self.batch(line).await != 0 {
                    warn!(repository = %repo.name, "revert stopped");
                    failed = true;
                    break;
                }
            }
        }
        Ok(if failed { -1 } else { 0 })
    }

    /// Run one command on every node. Returns the summary code.
    pub async fn execute(&self, command: &BuildCommand) -> SimResult<i32> {
        info!(command = %command, nodes = self.nodes.len(), "cluster build command");
        let code = match command {
            BuildCommand::FullBuild => {
                let steps = [
                    BuildCommand::Destroy,
                    BuildCommand::Checkout,
                    BuildCommand::Update,
                    BuildCommand::Dependencies,
                    BuildCommand::Build {
                        build_type: BuildType::Default,
                        timestamp: true,
                    },
                ];
                for step in &steps {
                    let code = Box::pin(self.execute(step)).await?;
                    if code != 0 {
                        return Ok(code);
                    }
                }
                0
            }
            BuildCommand::PatchsetCreate => self.patchset_create().await?,
            BuildCommand::PatchsetApply => self.patchset_apply().await?,
            BuildCommand::PatchsetRevert => self.patchset_revert().await?,
            BuildCommand::Build { .. } => {
                let ccache = self.ccache_prefix().await;
                self.batch(&self.command_line(command, &ccache)?).await
            }
            BuildCommand::Profile(_) => {
                let code = self.batch(&self.command_line(command, "")?).await;
                let fetched = self.fetch("gprof.out", "gprof-{node:04}.txt").await?;
                if code != 0 { code } else { fetched }
            }
            BuildCommand::Oprofile(_) => {
                let code = self.batch(&self.command_line(command, "")?).await;
                let fetched = self.fetch("oprofile.out", "oprofile-{node:04}.txt").await?;
                if code != 0 { code } else { fetched }
            }
            _ => self.batch(&self.command_line(command, "")?).await,
        };
        Ok(code)
    }

    /// Run `commands` in order, stopping at the first failure.
    pub async fn run_sequence(&self, commands: &[BuildCommand]) -> SimResult<BuildReport> {
        let mut report = BuildReport::default();
        for command in commands {
            let code = self.execute(command).await?;
            if code != 0 {
                error!(command = %command, code, "cluster build command failed");
                report.failed = Some((command.clone(), code));
                break;
            }
            report.completed.push(command.clone());
        }
        Ok(report)
    }
}
