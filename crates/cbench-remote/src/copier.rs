//! File distribution and retrieval.
//!
//! Copy specs follow scp: every argument but the last is a source, the last
//! is the destination. A `remote:` prefix means "on the node, through the
//! transport"; a bare path is local to the coordinating machine. Specs are
//! templates, so `remote:/srv/trace-{node:04}.txt` names a different file
//! per node.
//!
//! Each copy is a local `bash -c "<read> | <write>"` pipeline where the read
//! side is `cat` and the write side is `dd of=...`, either of them run
//! through the transport when remote. Nodes are processed one at a time.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, info, warn};

use cbench_core::{Node, ProcessExit};

use crate::error::{RemoteError, RemoteResult};
use crate::sink::OutputSink;
use crate::template::{self, NodeContext, Substitutions};
use crate::transport::{Transport, shell_quote};

const REMOTE_PREFIX: &str = "remote:";

/// A path on either side of a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(String),
    Remote(String),
}

impl Location {
    pub fn parse(spec: &str) -> Self {
        match spec.strip_prefix(REMOTE_PREFIX) {
            Some(path) => Location::Remote(path.to_string()),
            None => Location::Local(spec.to_string()),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Location::Local(p) | Location::Remote(p) => p,
        }
    }
}

/// One failed per-node copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFailure {
    pub label: String,
    pub source: String,
    pub destination: String,
    pub exit: ProcessExit,
}

/// Outcome of a copy call. Failures are logged and collected, not raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub copied: usize,
    pub failures: Vec<CopyFailure>,
}

impl CopyReport {
    pub fn any_failed(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn summary_code(&self) -> i32 {
        if self.any_failed() { -1 } else { 0 }
    }
}

pub struct RemoteCopier {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn OutputSink>,
}

impl RemoteCopier {
    pub fn new(transport: Arc<dyn Transport>, sink: Arc<dyn OutputSink>) -> Self {
        Self { transport, sink }
    }

    /// Copy `specs[..n-1]` to `specs[n-1]` for every node.
    pub async fn copy(&self, nodes: &[Node], specs: &[String]) -> RemoteResult<CopyReport> {
        let Some((dest_spec, sources)) = specs.split_last() else {
            return Err(RemoteError::MissingCopyOperands);
        };
        if sources.is_empty() {
            return Err(RemoteError::MissingCopyOperands);
        }

        let subs = Substitutions::new();
        let mut report = CopyReport::default();

        for (position, node) in nodes.iter().enumerate() {
            let ctx = NodeContext::new(node, position);
            let label = self.transport.label(node);
            let dest = Location::parse(&template::render(dest_spec, &ctx, &subs)?);

            for source_spec in sources {
                let source = Location::parse(&template::render(source_spec, &ctx, &subs)?);
                let destination = resolve_destination(&source, &dest);
                let pipeline = self.pipeline(node, &source, &destination);
                debug!(node = %label, %pipeline, "copy");

                let exit = self.run_pipeline(&label, &pipeline).await;
                if exit.success() {
                    report.copied += 1;
                } else {
                    warn!(
                        node = %label,
                        source = source.path(),
                        destination = destination.path(),
                        status = %exit,
                        "copy failed"
                    );
                    report.failures.push(CopyFailure {
                        label: label.clone(),
                        source: source.path().to_string(),
                        destination: destination.path().to_string(),
                        exit,
                    });
                }
            }
        }

        info!(
            copied = report.copied,
            failed = report.failures.len(),
            "copy finished"
        );
        Ok(report)
    }

    fn pipeline(&self, node: &Node, source: &Location, dest: &Location) -> String {
        let read = match source {
            Location::Local(p) => format!("cat {}", shell_quote(p)),
            Location::Remote(p) => self
                .transport
                .shell_line(node, &format!("cat {}", shell_quote(p))),
        };
        let write = match dest {
            Location::Local(p) => format!("dd of={} 2>/dev/null", shell_quote(p)),
            Location::Remote(p) => self.transport.shell_line(
                node,
                &format!("dd of={} 2>/dev/null", shell_quote(p)),
            ),
        };
        format!("set -o pipefail; {read} | {write}")
    }

    async fn run_pipeline(&self, label: &str, pipeline: &str) -> ProcessExit {
        let output = Command::new("bash")
            .arg("-c")
            .arg(pipeline)
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(out) => {
                for line in String::from_utf8_lossy(&out.stderr).lines() {
                    self.sink.line(label, line);
                }
                ProcessExit::from_status(out.status)
            }
            Err(e) => ProcessExit::Lost(format!("spawn: {e}")),
        }
    }
}

/// A destination ending in `/`, or an existing local directory, receives
/// the source's file name.
fn resolve_destination(source: &Location, dest: &Location) -> Location {
    let file_name = Path::new(source.path())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned());

    let into_dir = match dest {
        Location::Remote(p) => p.ends_with('/') || p.is_empty(),
        Location::Local(p) => p.ends_with('/') || Path::new(p).is_dir(),
    };

    match (into_dir, file_name) {
        (true, Some(name)) => {
            let joined = match dest.path() {
                "" => name,
                p if p.ends_with('/') => format!("{p}{name}"),
                p => format!("{p}/{name}"),
            };
            match dest {
                Location::Local(_) => Location::Local(joined),
                Location::Remote(_) => Location::Remote(joined),
            }
        }
        _ => dest.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remote_prefix() {
        assert_eq!(
            Location::parse("remote:/srv/x"),
            Location::Remote("/srv/x".into())
        );
        assert_eq!(Location::parse("x.txt"), Location::Local("x.txt".into()));
    }

    #[test]
    fn trailing_slash_appends_file_name() {
        let src = Location::Local("/tmp/serverip.txt".into());
        let dest = Location::Remote("/srv/cbr/scripts/".into());
        assert_eq!(
            resolve_destination(&src, &dest),
            Location::Remote("/srv/cbr/scripts/serverip.txt".into())
        );
    }

    #[test]
    fn relative_remote_dir_is_home() {
        let src = Location::Local("data.pack".into());
        let dest = Location::Remote(String::new());
        assert_eq!(
            resolve_destination(&src, &dest),
            Location::Remote("data.pack".into())
        );
    }

    #[test]
    fn existing_local_dir_receives_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let src = Location::Remote("/srv/trace-0001.txt".into());
        let dest = Location::Local(dir.path().display().to_string());
        let resolved = resolve_destination(&src, &dest);
        assert_eq!(
            resolved.path(),
            dir.path().join("trace-0001.txt").display().to_string()
        );
    }

    #[test]
    fn explicit_file_destination_is_kept() {
        let src = Location::Remote("/srv/gprof.out".into());
        let dest = Location::Local("gprof-0003.txt".into());
        assert_eq!(resolve_destination(&src, &dest), dest);
    }
}
