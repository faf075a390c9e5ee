//! Destinations for per-node transcripts.

use std::io::Write;
use std::sync::Mutex;

/// Receives output lines as they stream from a node.
///
/// Called concurrently from one monitor task per node.
pub trait OutputSink: Send + Sync {
    fn line(&self, label: &str, line: &str);
}

/// Echoes `label: line` to the operator's terminal.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn line(&self, label: &str, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{label}: {line}");
    }
}

/// Collects lines in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(String, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(String, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Lines received from one label, in order.
    pub fn lines_for(&self, label: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(l, _)| l == label)
            .map(|(_, line)| line)
            .collect()
    }
}

impl OutputSink for MemorySink {
    fn line(&self, label: &str, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((label.to_string(), line.to_string()));
        }
    }
}
