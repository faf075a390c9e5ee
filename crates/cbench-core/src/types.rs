//! Shared types used across cbench crates.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A class of engine process with its own parameter schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Space server (`cbr`).
    Space,
    /// Object host (`oh`).
    ObjectHost,
    /// Coordination-segment server (`cseg`).
    Cseg,
    /// Index server (`pinto`).
    Index,
    /// Offline analysis / visualisation run (`analysis`).
    Analysis,
}

impl Role {
    /// Engine binary launched for this role.
    pub fn binary(&self) -> &'static str {
        match self {
            Role::Space => "cbr",
            Role::ObjectHost => "oh",
            Role::Cseg => "cseg",
            Role::Index => "pinto",
            Role::Analysis => "analysis",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::Space => "space",
            Role::ObjectHost => "oh",
            Role::Cseg => "cseg",
            Role::Index => "index",
            Role::Analysis => "analysis",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A role plus how many slots it occupies in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub role: Role,
    pub count: usize,
}

impl RoleSpec {
    pub fn new(role: Role, count: usize) -> Self {
        Self { role, count }
    }
}

/// Total slot count for an ordered role list.
pub fn slot_count(roles: &[RoleSpec]) -> usize {
    roles.iter().map(|r| r.count).sum()
}

/// How a process (local or remote) finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessExit {
    /// Exited normally with a status code.
    Code(i32),
    /// Terminated by a signal.
    Signal(i32),
    /// The exit status could not be observed (spawn or wait failure).
    Lost(String),
}

/// Classified termination, so callers never interpret raw numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    Failed(i32),
    Killed,
    Aborted,
    Segfault,
    Hangup,
    Terminated,
    Interrupted,
    Signal(i32),
    Lost,
}

// Linux signal numbers. Kept local so this crate stays platform-neutral.
const SIGHUP: i32 = 1;
const SIGINT: i32 = 2;
const SIGABRT: i32 = 6;
const SIGKILL: i32 = 9;
const SIGSEGV: i32 = 11;
const SIGTERM: i32 = 15;

impl ProcessExit {
    /// Interpret a raw code where negative values denote the terminating
    /// signal (the convention used in aggregated batch codes).
    /// `i32::MIN` has no signal counterpart and stays a plain code.
    pub fn from_code(code: i32) -> Self {
        match code.checked_neg() {
            Some(signal) if code < 0 => ProcessExit::Signal(signal),
            _ => ProcessExit::Code(code),
        }
    }

    /// Interpret a process exit code that follows the shell convention of
    /// reporting a signal death as `128 + signal`, for signals 1 through 32.
    pub fn from_shell_code(code: i32) -> Self {
        if (129..=160).contains(&code) {
            ProcessExit::Signal(code - 128)
        } else {
            ProcessExit::from_code(code)
        }
    }

    /// Code to exit with when relaying this status through a shell.
    pub fn shell_code(&self) -> i32 {
        match self {
            ProcessExit::Code(c) => *c,
            ProcessExit::Signal(s) => s.saturating_add(128),
            ProcessExit::Lost(_) => 255,
        }
    }

    #[cfg(unix)]
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match (status.code(), status.signal()) {
            (Some(code), _) => ProcessExit::Code(code),
            (None, Some(sig)) => ProcessExit::Signal(sig),
            (None, None) => ProcessExit::Lost("no exit code or signal".to_string()),
        }
    }

    #[cfg(not(unix))]
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        match status.code() {
            Some(code) => ProcessExit::Code(code),
            None => ProcessExit::Lost("no exit code".to_string()),
        }
    }

    /// Numeric code; signals become negative, lost statuses become -1.
    pub fn code(&self) -> i32 {
        match self {
            ProcessExit::Code(c) => *c,
            ProcessExit::Signal(s) => -s,
            ProcessExit::Lost(_) => -1,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Code(0))
    }

    pub fn classify(&self) -> ExitKind {
        match self {
            ProcessExit::Code(0) => ExitKind::Success,
            ProcessExit::Code(c) => ExitKind::Failed(*c),
            ProcessExit::Signal(SIGKILL) => ExitKind::Killed,
            ProcessExit::Signal(SIGABRT) => ExitKind::Aborted,
            ProcessExit::Signal(SIGSEGV) => ExitKind::Segfault,
            ProcessExit::Signal(SIGHUP) => ExitKind::Hangup,
            ProcessExit::Signal(SIGTERM) => ExitKind::Terminated,
            ProcessExit::Signal(SIGINT) => ExitKind::Interrupted,
            ProcessExit::Signal(s) => ExitKind::Signal(*s),
            ProcessExit::Lost(_) => ExitKind::Lost,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.classify() {
            ExitKind::Success => f.write_str("exited cleanly"),
            ExitKind::Failed(c) => write!(f, "exited with code {c}"),
            ExitKind::Killed => f.write_str("killed"),
            ExitKind::Aborted => f.write_str("aborted"),
            ExitKind::Segfault => f.write_str("segfaulted"),
            ExitKind::Hangup => f.write_str("hung up"),
            ExitKind::Terminated => f.write_str("terminated"),
            ExitKind::Interrupted => f.write_str("interrupted"),
            ExitKind::Signal(s) => write!(f, "terminated by signal {s}"),
            ExitKind::Lost => match self {
                ProcessExit::Lost(reason) => write!(f, "status lost: {reason}"),
                _ => f.write_str("status lost"),
            },
        }
    }
}

/// True if any member of a batch did not exit cleanly.
pub fn any_failed(exits: &[ProcessExit]) -> bool {
    exits.iter().any(|e| !e.success())
}

/// Aggregate batch code: 0 when every member succeeded, -1 otherwise.
pub fn summary_code(exits: &[ProcessExit]) -> i32 {
    if any_failed(exits) { -1 } else { 0 }
}

/// Parse a duration string like "75s", "500ms", "2m" or a bare number of
/// seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_codes_are_signals() {
        assert_eq!(ProcessExit::from_code(-9).classify(), ExitKind::Killed);
        assert_eq!(ProcessExit::from_code(-6).classify(), ExitKind::Aborted);
        assert_eq!(ProcessExit::from_code(-11).classify(), ExitKind::Segfault);
        assert_eq!(ProcessExit::from_code(3).classify(), ExitKind::Failed(3));
        assert_eq!(ProcessExit::from_code(0).classify(), ExitKind::Success);
    }

    #[test]
    fn shell_codes_decode_signals() {
        assert_eq!(ProcessExit::from_shell_code(137).classify(), ExitKind::Killed);
        assert_eq!(ProcessExit::from_shell_code(129).classify(), ExitKind::Hangup);
        assert_eq!(ProcessExit::from_shell_code(2), ProcessExit::Code(2));
        assert_eq!(ProcessExit::from_shell_code(255), ProcessExit::Code(255));
        assert_eq!(ProcessExit::Signal(9).shell_code(), 137);
        assert_eq!(ProcessExit::Code(3).shell_code(), 3);
    }

    #[test]
    fn shell_code_signal_range_is_inclusive() {
        assert_eq!(ProcessExit::from_shell_code(128), ProcessExit::Code(128));
        assert_eq!(ProcessExit::from_shell_code(129), ProcessExit::Signal(1));
        assert_eq!(ProcessExit::from_shell_code(160), ProcessExit::Signal(32));
        assert_eq!(ProcessExit::from_shell_code(161), ProcessExit::Code(161));
    }

    #[test]
    fn most_negative_code_does_not_overflow() {
        assert_eq!(ProcessExit::from_code(i32::MIN), ProcessExit::Code(i32::MIN));
        assert_eq!(ProcessExit::from_code(-9), ProcessExit::Signal(9));
        assert_eq!(ProcessExit::from_code(i32::MIN + 1), ProcessExit::Signal(i32::MAX));
    }

    #[test]
    fn signal_codes_round_trip_through_code() {
        assert_eq!(ProcessExit::Signal(11).code(), -11);
        assert_eq!(ProcessExit::Lost("spawn".into()).code(), -1);
    }

    #[test]
    fn summary_code_aggregates() {
        let ok = vec![ProcessExit::Code(0), ProcessExit::Code(0)];
        assert_eq!(summary_code(&ok), 0);
        assert!(!any_failed(&ok));

        let bad = vec![ProcessExit::Code(0), ProcessExit::Signal(9)];
        assert_eq!(summary_code(&bad), -1);
        assert!(any_failed(&bad));

        assert_eq!(summary_code(&[]), 0);
    }

    #[test]
    fn display_names_the_classification() {
        assert_eq!(ProcessExit::Signal(9).to_string(), "killed");
        assert_eq!(ProcessExit::Code(2).to_string(), "exited with code 2");
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("75s"), Some(Duration::from_secs(75)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn role_binaries() {
        assert_eq!(Role::Space.binary(), "cbr");
        assert_eq!(Role::Index.binary(), "pinto");
        assert_eq!(slot_count(&[RoleSpec::new(Role::Space, 4), RoleSpec::new(Role::ObjectHost, 2)]), 6);
    }

    #[test]
    fn role_serializes_snake_case() {
        let json = serde_json::to_string(&Role::ObjectHost).unwrap();
        assert_eq!(json, "\"object_host\"");
    }
}
