//! Offline analysis passes.
//!
//! Each pass re-runs the engine locally in the analysis role against the
//! retrieved trace files, supervised by a [`ProcSet`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use cbench_core::{ProcessExit, Role};
use cbench_proc::{OsBackend, ProcSet, ProcessBackend};
use cbench_remote::transport::shell_quote;

use crate::error::SimResult;
use crate::params::SERVER_IP_FILE;
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisPass {
    BandwidthPacket,
    BandwidthDatagram,
    Latency,
    Oseg,
    ObjectLatency,
    LocLatency,
    ProxDump,
    /// Not part of the default pipeline.
    MessageLatency,
}

impl AnalysisPass {
    /// Passes run after every cluster simulation, in order.
    pub const DEFAULT_PIPELINE: [AnalysisPass; 7] = [
        AnalysisPass::BandwidthPacket,
        AnalysisPass::BandwidthDatagram,
        AnalysisPass::Latency,
        AnalysisPass::Oseg,
        AnalysisPass::ObjectLatency,
        AnalysisPass::LocLatency,
        AnalysisPass::ProxDump,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AnalysisPass::BandwidthPacket => "bandwidth-packet",
            AnalysisPass::BandwidthDatagram => "bandwidth-datagram",
            AnalysisPass::Latency => "latency",
            AnalysisPass::Oseg => "oseg",
            AnalysisPass::ObjectLatency => "object-latency",
            AnalysisPass::LocLatency => "loc-latency",
            AnalysisPass::ProxDump => "prox-dump",
            AnalysisPass::MessageLatency => "message-latency",
        }
    }

    fn pass_flags(&self) -> Vec<&'static str> {
        match self {
            AnalysisPass::BandwidthPacket => vec![
                "--analysis.windowed-bandwidth=packet",
                "--analysis.windowed-bandwidth.rate=100ms",
            ],
            AnalysisPass::BandwidthDatagram => vec![
                "--analysis.windowed-bandwidth=datagram",
                "--analysis.windowed-bandwidth.rate=100ms",
            ],
            AnalysisPass::Latency => vec!["--analysis.latency=true"],
            AnalysisPass::Oseg => vec!["--analysis.oseg=true"],
            AnalysisPass::ObjectLatency => vec!["--analysis.object.latency=true"],
            AnalysisPass::LocLatency => vec!["--analysis.loc.latency=true"],
            AnalysisPass::ProxDump => vec!["--analysis.prox.dump=prox.log"],
            AnalysisPass::MessageLatency => vec!["--analysis.message.latency=true"],
        }
    }

    /// Engine arguments for this pass.
    pub fn args(&self, settings: &Settings) -> Vec<String> {
        let mut args = Vec::new();
        if matches!(
            self,
            AnalysisPass::BandwidthPacket | AnalysisPass::BandwidthDatagram | AnalysisPass::LocLatency
        ) {
            args.push("--debug".to_string());
        }
        args.extend([
            "--id=1".to_string(),
            format!("--layout={}", settings.layout()),
            format!("--num-oh={}", settings.num_oh),
            format!("--serverips={SERVER_IP_FILE}"),
            format!("--duration={}", settings.duration),
        ]);
        args.extend(self.pass_flags().into_iter().map(String::from));
        if *self != AnalysisPass::Oseg {
            args.push(format!("--max-servers={}", settings.space_server_pool));
        }
        args
    }

    /// File the pass transcript is redirected to, if any.
    pub fn output_file<'a>(&self, settings: &'a Settings) -> Option<&'a str> {
        match self {
            AnalysisPass::MessageLatency => settings.trace_file.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for AnalysisPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a local engine run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalExit {
    pub exit: ProcessExit,
    pub killed: bool,
}

impl LocalExit {
    pub fn success(&self) -> bool {
        self.exit.success()
    }
}

type BackendFactory<B> = Arc<dyn Fn() -> B + Send + Sync>;

/// Runs engine binaries on the coordinating machine.
pub struct LocalRunner<B: ProcessBackend = OsBackend> {
    binary_dir: PathBuf,
    make_backend: BackendFactory<B>,
    grace: Option<Duration>,
    kill: Option<Duration>,
    poll_interval: Duration,
}

impl LocalRunner<OsBackend> {
    pub fn os(binary_dir: impl Into<PathBuf>) -> Self {
        Self::new(binary_dir, OsBackend::new)
    }
}

impl<B: ProcessBackend> LocalRunner<B> {
    pub fn new(
        binary_dir: impl Into<PathBuf>,
        make_backend: impl Fn() -> B + Send + Sync + 'static,
    ) -> Self {
        Self {
            binary_dir: binary_dir.into(),
            make_backend: Arc::new(make_backend),
            grace: None,
            kill: None,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_deadlines(mut self, grace: Option<Duration>, kill: Option<Duration>) -> Self {
        self.grace = grace;
        self.kill = kill;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn binary_path(&self, binary: &str) -> PathBuf {
        self.binary_dir.join(binary)
    }

    /// Run `binary` with `args`, optionally redirecting its output to a file.
    pub async fn run(
        &self,
        binary: &str,
        args: &[String],
        output: Option<&Path>,
    ) -> SimResult<LocalExit> {
        let program = self.binary_path(binary).display().to_string();
        let (program, args) = match output {
            Some(file) => {
                let script = format!(
                    "exec \"$0\" \"$@\" > {} 2>&1",
                    shell_quote(&file.display().to_string())
                );
                let mut wrapped = vec!["-c".to_string(), script, program];
                wrapped.extend(args.iter().cloned());
                ("sh".to_string(), wrapped)
            }
            None => (program, args.to_vec()),
        };

        let mut set = ProcSet::with_backend((self.make_backend)())
            .with_poll_interval(self.poll_interval);
        set.spawn(&program, &args, true, true)?;
        set.wait_for(self.grace, self.kill).await?;

        let exit = set
            .exit()
            .cloned()
            .unwrap_or_else(|| ProcessExit::Lost("no exit observed".into()));
        Ok(LocalExit {
            exit,
            killed: set.was_killed(),
        })
    }

    /// Run one analysis pass.
    pub async fn run_pass(&self, pass: AnalysisPass, settings: &Settings) -> SimResult<LocalExit> {
        info!(pass = %pass, "running analysis pass");
        let output = pass.output_file(settings).map(Path::new);
        let result = self
            .run(Role::Analysis.binary(), &pass.args(settings), output)
            .await?;
        if !result.success() {
            warn!(pass = %pass, status = %result.exit, killed = result.killed, "analysis pass failed");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbench_proc::{ScriptedBackend, ScriptedProcess};

    #[test]
    fn oseg_pass_omits_max_servers() {
        let s = Settings::default();
        let args = AnalysisPass::Oseg.args(&s);
        assert!(!args.iter().any(|a| a.starts_with("--max-servers")));
        assert!(args.contains(&"--analysis.oseg=true".to_string()));
    }

    #[test]
    fn bandwidth_pass_runs_with_debug() {
        let s = Settings::default();
        let args = AnalysisPass::BandwidthDatagram.args(&s);
        assert_eq!(args[0], "--debug");
        assert!(args.contains(&"--analysis.windowed-bandwidth=datagram".to_string()));
        assert!(args.contains(&"--max-servers=4".to_string()));
    }

    #[test]
    fn message_latency_is_not_default() {
        assert!(!AnalysisPass::DEFAULT_PIPELINE.contains(&AnalysisPass::MessageLatency));
    }

    #[test]
    fn trace_file_is_explicit() {
        let mut s = Settings::default();
        assert_eq!(AnalysisPass::MessageLatency.output_file(&s), None);
        s.trace_file = Some("latency.txt".into());
        assert_eq!(AnalysisPass::MessageLatency.output_file(&s), Some("latency.txt"));
        assert_eq!(AnalysisPass::Latency.output_file(&s), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_pass_is_reported_killed() {
        let backend = ScriptedBackend::new().script("bin/analysis", ScriptedProcess::ignores_hup());
        let runner = LocalRunner::new("bin", move || backend.clone())
            .with_deadlines(Some(Duration::from_secs(5)), Some(Duration::from_secs(10)));
        let result = runner
            .run_pass(AnalysisPass::Latency, &Settings::default())
            .await
            .unwrap();
        assert!(result.killed);
        assert!(!result.success());
    }

    #[tokio::test(start_paused = true)]
    async fn redirected_pass_runs_through_sh() {
        let backend = ScriptedBackend::new()
            .script("sh", ScriptedProcess::exits_after(Duration::from_millis(10), 0));
        let observed = backend.clone();
        let runner = LocalRunner::new("bin", move || backend.clone());
        let settings = Settings {
            trace_file: Some("latency.txt".into()),
            ..Settings::default()
        };
        let result = runner
            .run_pass(AnalysisPass::MessageLatency, &settings)
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(observed.program(1001).as_deref(), Some("sh"));
    }
}
