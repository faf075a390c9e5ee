//! Process control capability.
//!
//! [`ProcSet`](crate::ProcSet) never touches the OS directly. It spawns,
//! polls and signals through a [`ProcessBackend`], so the escalation logic
//! can be driven against [`ScriptedBackend`] under paused tokio time.

use std::collections::HashMap;
use std::io;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use cbench_core::ProcessExit;

/// Spawn, poll and signal processes by pid.
pub trait ProcessBackend: Send {
    fn spawn(&mut self, program: &str, args: &[String]) -> io::Result<u32>;

    /// `Ok(Some(_))` exactly once, when the exit is first observed.
    fn try_wait(&mut self, pid: u32) -> io::Result<Option<ProcessExit>>;

    /// Ask the process to exit (SIGHUP).
    fn signal_graceful(&mut self, pid: u32) -> io::Result<()>;

    /// Terminate unconditionally (SIGKILL).
    fn signal_force(&mut self, pid: u32) -> io::Result<()>;
}

/// Real OS processes.
#[derive(Debug, Default)]
pub struct OsBackend {
    children: HashMap<u32, Child>,
}

impl OsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn kill(pid: u32, signal: libc::c_int) -> io::Result<()> {
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        // Already gone; the next poll reaps it.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }
}

impl ProcessBackend for OsBackend {
    fn spawn(&mut self, program: &str, args: &[String]) -> io::Result<u32> {
        use std::os::unix::process::CommandExt;

        let mut command = Command::new(program);
        command.args(args);
        // Children must see SIGHUP even when we were started under nohup.
        // SAFETY: signal(2) is async-signal-safe.
        unsafe {
            command.pre_exec(|| {
                libc::signal(libc::SIGHUP, libc::SIG_DFL);
                Ok(())
            });
        }
        let child = command.spawn()?;
        let pid = child.id();
        self.children.insert(pid, child);
        Ok(pid)
    }

    fn try_wait(&mut self, pid: u32) -> io::Result<Option<ProcessExit>> {
        let Some(child) = self.children.get_mut(&pid) else {
            return Ok(None);
        };
        match child.try_wait()? {
            Some(status) => {
                self.children.remove(&pid);
                Ok(Some(ProcessExit::from_status(status)))
            }
            None => Ok(None),
        }
    }

    fn signal_graceful(&mut self, pid: u32) -> io::Result<()> {
        Self::kill(pid, libc::SIGHUP)
    }

    fn signal_force(&mut self, pid: u32) -> io::Result<()> {
        Self::kill(pid, libc::SIGKILL)
    }
}

/// Signal delivered to a scripted process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Graceful,
    Force,
}

/// Behaviour of one scripted program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedProcess {
    /// Exit on its own this long after spawn.
    pub exit_after: Option<Duration>,
    pub exit_code: i32,
    /// Exit as soon as the graceful signal arrives.
    pub honors_graceful: bool,
}

impl ScriptedProcess {
    /// Exits with `code` after `after`.
    pub fn exits_after(after: Duration, code: i32) -> Self {
        Self {
            exit_after: Some(after),
            exit_code: code,
            honors_graceful: true,
        }
    }

    /// Runs until signalled and honors SIGHUP.
    pub fn until_hup() -> Self {
        Self {
            exit_after: None,
            exit_code: 0,
            honors_graceful: true,
        }
    }

    /// Runs until SIGKILL.
    pub fn ignores_hup() -> Self {
        Self {
            exit_after: None,
            exit_code: 0,
            honors_graceful: false,
        }
    }
}

#[derive(Debug)]
struct ScriptedEntry {
    program: String,
    script: ScriptedProcess,
    spawned_at: Instant,
    exit: Option<ProcessExit>,
    reaped: usize,
    signals: Vec<SignalKind>,
}

#[derive(Debug, Default)]
struct ScriptedState {
    scripts: HashMap<String, ScriptedProcess>,
    entries: HashMap<u32, ScriptedEntry>,
    next_pid: u32,
}

/// In-memory backend whose processes follow a script.
///
/// Clones share state, so a test keeps one handle for inspection while the
/// `ProcSet` owns the other. Times come from `tokio::time`, which makes it
/// usable under `start_paused`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the behaviour for `program`.
    pub fn script(self, program: &str, script: ScriptedProcess) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.scripts.insert(program.to_string(), script);
        }
        self
    }

    /// Signals delivered to `pid`, in order.
    pub fn signals(&self, pid: u32) -> Vec<SignalKind> {
        self.with_entry(pid, |e| e.signals.clone()).unwrap_or_default()
    }

    /// Number of times an exit of `pid` was observed by a poll.
    pub fn reaped(&self, pid: u32) -> usize {
        self.with_entry(pid, |e| e.reaped).unwrap_or(0)
    }

    pub fn program(&self, pid: u32) -> Option<String> {
        self.with_entry(pid, |e| e.program.clone())
    }

    fn with_entry<T>(&self, pid: u32, f: impl FnOnce(&ScriptedEntry) -> T) -> Option<T> {
        let state = self.state.lock().ok()?;
        state.entries.get(&pid).map(f)
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, ScriptedState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::other("scripted backend poisoned"))
    }
}

impl ProcessBackend for ScriptedBackend {
    fn spawn(&mut self, program: &str, _args: &[String]) -> io::Result<u32> {
        let mut state = self.lock()?;
        let script = *state.scripts.get(program).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no script for {program}"))
        })?;
        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        state.entries.insert(
            pid,
            ScriptedEntry {
                program: program.to_string(),
                script,
                spawned_at: Instant::now(),
                exit: None,
                reaped: 0,
                signals: Vec::new(),
            },
        );
        Ok(pid)
    }

    fn try_wait(&mut self, pid: u32) -> io::Result<Option<ProcessExit>> {
        let mut state = self.lock()?;
        let entry = state
            .entries
            .get_mut(&pid)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown pid"))?;

        if entry.exit.is_none()
            && let Some(after) = entry.script.exit_after
            && entry.spawned_at.elapsed() >= after
        {
            entry.exit = Some(ProcessExit::Code(entry.script.exit_code));
        }

        if entry.reaped > 0 {
            return Ok(None);
        }
        match &entry.exit {
            Some(exit) => {
                entry.reaped += 1;
                Ok(Some(exit.clone()))
            }
            None => Ok(None),
        }
    }

    fn signal_graceful(&mut self, pid: u32) -> io::Result<()> {
        let mut state = self.lock()?;
        if let Some(entry) = state.entries.get_mut(&pid) {
            entry.signals.push(SignalKind::Graceful);
            if entry.exit.is_none() && entry.script.honors_graceful {
                entry.exit = Some(ProcessExit::Signal(libc::SIGHUP));
            }
        }
        Ok(())
    }

    fn signal_force(&mut self, pid: u32) -> io::Result<()> {
        let mut state = self.lock()?;
        if let Some(entry) = state.entries.get_mut(&pid) {
            entry.signals.push(SignalKind::Force);
            if entry.exit.is_none() {
                entry.exit = Some(ProcessExit::Signal(libc::SIGKILL));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn scripted_exit_is_reaped_once() {
        let mut backend =
            ScriptedBackend::new().script("quick", ScriptedProcess::exits_after(Duration::from_secs(1), 4));
        let pid = backend.spawn("quick", &[]).unwrap();
        assert_eq!(backend.try_wait(pid).unwrap(), None);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(backend.try_wait(pid).unwrap(), Some(ProcessExit::Code(4)));
        assert_eq!(backend.try_wait(pid).unwrap(), None);
        assert_eq!(backend.reaped(pid), 1);
    }

    #[tokio::test]
    async fn ignoring_hup_needs_force() {
        let mut backend = ScriptedBackend::new().script("stubborn", ScriptedProcess::ignores_hup());
        let pid = backend.spawn("stubborn", &[]).unwrap();
        backend.signal_graceful(pid).unwrap();
        assert_eq!(backend.try_wait(pid).unwrap(), None);
        backend.signal_force(pid).unwrap();
        assert_eq!(backend.try_wait(pid).unwrap(), Some(ProcessExit::Signal(9)));
    }

    #[test]
    fn unknown_program_fails_to_spawn() {
        let mut backend = ScriptedBackend::new();
        let err = backend.spawn("missing", &[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn os_backend_reaps_exit_code() {
        let mut backend = OsBackend::new();
        let pid = backend
            .spawn("sh", &["-c".to_string(), "exit 7".to_string()])
            .unwrap();
        let exit = loop {
            if let Some(exit) = backend.try_wait(pid).unwrap() {
                break exit;
            }
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(exit, ProcessExit::Code(7));
    }
}
