//! Supervised process groups.
//!
//! Lifecycle of one process:
//!
//! ```text
//! Spawned ──► Exited
//!    │
//!    ├──► Hupped ──► Exited
//!    │       └─────► Killed
//!    └──► Killed
//! ```
//!
//! Deadlines passed to [`ProcSet::wait_for`] are measured from the group's
//! start instant (the first spawn), not from the call, so staggered starts
//! count against the same budget. One loop polls every process; nothing is
//! spawned per process.

use std::io::{self, Write};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use cbench_core::ProcessExit;

use crate::backend::{OsBackend, ProcessBackend};
use crate::error::{ProcError, ProcResult};

/// Default interval between supervisory polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One spawned process and its shutdown history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisedProcess {
    pub pid: u32,
    pub program: String,
    pub args: Vec<String>,
    /// Must exit on its own before the rest of the group is shut down.
    pub wait_flag: bool,
    pub hupped: bool,
    pub killed: bool,
    pub exit: Option<ProcessExit>,
}

impl SupervisedProcess {
    pub fn exited(&self) -> bool {
        self.exit.is_some()
    }

    /// True if the process had to be forcibly terminated.
    pub fn was_killed(&self) -> bool {
        self.killed
    }
}

/// A group of processes sharing one start instant and one shutdown policy.
pub struct ProcSet<B: ProcessBackend = OsBackend> {
    backend: B,
    procs: Vec<SupervisedProcess>,
    default: Option<usize>,
    start: Option<Instant>,
    poll_interval: Duration,
    hupped: bool,
    waiting: bool,
    out: Box<dyn Write + Send>,
}

impl ProcSet<OsBackend> {
    pub fn new() -> Self {
        Self::with_backend(OsBackend::new())
    }
}

impl Default for ProcSet<OsBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: ProcessBackend> ProcSet<B> {
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            procs: Vec::new(),
            default: None,
            start: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            hupped: false,
            waiting: false,
            out: Box::new(io::stdout()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Where shutdown and kill status lines are written.
    pub fn with_output(mut self, out: Box<dyn Write + Send>) -> Self {
        self.out = out;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Start the shared clock without spawning anything.
    pub fn start_clock(&mut self) -> Instant {
        *self.start.get_or_insert_with(Instant::now)
    }

    /// Time since the first spawn (zero before it).
    pub fn elapsed(&self) -> Duration {
        self.start.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// Launch `program` now. Returns its pid.
    pub fn spawn(
        &mut self,
        program: &str,
        args: &[String],
        wait_flag: bool,
        is_default: bool,
    ) -> ProcResult<u32> {
        if self.waiting || self.hupped {
            return Err(ProcError::ShuttingDown);
        }
        self.start_clock();

        let pid = self
            .backend
            .spawn(program, args)
            .map_err(|source| ProcError::Spawn {
                program: program.to_string(),
                source,
            })?;
        debug!(pid, program, wait_flag, "spawned");

        self.procs.push(SupervisedProcess {
            pid,
            program: program.to_string(),
            args: args.to_vec(),
            wait_flag,
            hupped: false,
            killed: false,
            exit: None,
        });
        if is_default {
            self.default = Some(self.procs.len() - 1);
        }
        Ok(pid)
    }

    /// Launch `program` once `at` has elapsed on the shared clock.
    pub async fn spawn_at(
        &mut self,
        at: Duration,
        program: &str,
        args: &[String],
        wait_flag: bool,
        is_default: bool,
    ) -> ProcResult<u32> {
        let start = self.start_clock();
        tokio::time::sleep_until(start + at).await;
        self.spawn(program, args, wait_flag, is_default)
    }

    pub fn processes(&self) -> &[SupervisedProcess] {
        &self.procs
    }

    pub fn get(&self, pid: u32) -> Option<&SupervisedProcess> {
        self.procs.iter().find(|p| p.pid == pid)
    }

    pub fn default_process(&self) -> Option<&SupervisedProcess> {
        self.default.and_then(|i| self.procs.get(i))
    }

    /// Exit of the default process, if it has exited.
    pub fn exit(&self) -> Option<&ProcessExit> {
        self.default_process().and_then(|p| p.exit.as_ref())
    }

    /// Numeric exit code of the default process (signals negative).
    pub fn exit_code(&self) -> Option<i32> {
        self.exit().map(ProcessExit::code)
    }

    /// True if the default process was force-killed.
    pub fn was_killed(&self) -> bool {
        self.default_process().is_some_and(|p| p.killed)
    }

    pub fn any_killed(&self) -> bool {
        self.procs.iter().any(|p| p.killed)
    }

    pub fn exits(&self) -> Vec<ProcessExit> {
        self.procs.iter().filter_map(|p| p.exit.clone()).collect()
    }

    /// Observe any exits since the last poll.
    pub fn poll(&mut self) -> ProcResult<()> {
        for proc in self.procs.iter_mut().filter(|p| p.exit.is_none()) {
            let exit = self
                .backend
                .try_wait(proc.pid)
                .map_err(|source| ProcError::Wait {
                    pid: proc.pid,
                    source,
                })?;
            if let Some(exit) = exit {
                debug!(pid = proc.pid, program = %proc.program, status = %exit, "process exited");
                proc.exit = Some(exit);
            }
        }
        Ok(())
    }

    pub fn all_exited(&self) -> bool {
        self.procs.iter().all(SupervisedProcess::exited)
    }

    /// True iff every wait-flagged process has exited.
    pub fn wait_group_exited(&self) -> bool {
        self.procs
            .iter()
            .filter(|p| p.wait_flag)
            .all(SupervisedProcess::exited)
    }

    fn has_wait_group(&self) -> bool {
        self.procs.iter().any(|p| p.wait_flag)
    }

    /// Send the graceful signal to every running process. Only the first
    /// call per group has any effect.
    pub fn request_graceful_shutdown(&mut self) -> ProcResult<()> {
        if self.hupped {
            return Ok(());
        }
        self.hupped = true;

        for proc in self.procs.iter_mut().filter(|p| p.exit.is_none()) {
            let _ = writeln!(self.out, "Sending SIGHUP to {} (pid {})", proc.program, proc.pid);
            info!(pid = proc.pid, program = %proc.program, "graceful shutdown requested");
            self.backend
                .signal_graceful(proc.pid)
                .map_err(|source| ProcError::Signal {
                    pid: proc.pid,
                    source,
                })?;
            proc.hupped = true;
        }
        let _ = self.out.flush();
        Ok(())
    }

    /// Send the forceful signal twice to every running process, then block
    /// until each exit has been observed.
    pub async fn force_kill(&mut self) -> ProcResult<()> {
        for proc in self.procs.iter_mut().filter(|p| p.exit.is_none()) {
            let _ = writeln!(self.out, "Killing {} (pid {})", proc.program, proc.pid);
            warn!(pid = proc.pid, program = %proc.program, "force killing");
            for _ in 0..2 {
                self.backend
                    .signal_force(proc.pid)
                    .map_err(|source| ProcError::Signal {
                        pid: proc.pid,
                        source,
                    })?;
            }
            proc.killed = true;
        }
        let _ = self.out.flush();

        loop {
            self.poll()?;
            if self.all_exited() {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Supervise until every process has exited.
    ///
    /// The graceful signal goes out at `grace` or when the wait group has
    /// exited, whichever comes first. The forced kill happens at `kill`.
    /// `None` disables the respective deadline.
    pub async fn wait_for(
        &mut self,
        grace: Option<Duration>,
        kill: Option<Duration>,
    ) -> ProcResult<()> {
        self.waiting = true;
        let start = self.start_clock();

        loop {
            self.poll()?;
            if self.all_exited() {
                break;
            }

            let elapsed = start.elapsed();
            let grace_due = grace.is_some_and(|g| elapsed >= g);
            let group_done = self.has_wait_group() && self.wait_group_exited();
            if !self.hupped && (grace_due || group_done) {
                debug!(?elapsed, grace_due, group_done, "starting graceful shutdown");
                self.request_graceful_shutdown()?;
                continue;
            }

            if kill.is_some_and(|k| elapsed >= k) {
                self.force_kill().await?;
                break;
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        info!(
            processes = self.procs.len(),
            killed = self.procs.iter().filter(|p| p.killed).count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "process set finished"
        );
        Ok(())
    }
}
