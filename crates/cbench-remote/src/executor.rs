//! Batch command execution across deployment nodes.
//!
//! One monitor task per node reads stdout and stderr line by line and
//! forwards each line (lossily decoded), prefixed with the node label, to the output sink.
//! `run` returns only after every monitor has joined. A non-zero exit on one
//! node never stops the batch; callers inspect the [`BatchReport`].

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cbench_core::{Node, ProcessExit, any_failed, summary_code};

use crate::error::RemoteResult;
use crate::sink::OutputSink;
use crate::template::{self, Substitutions};
use crate::transport::Transport;

/// Exit status of one node in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeExit {
    pub label: String,
    pub exit: ProcessExit,
}

/// Outcome of one batch, in node order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub exits: Vec<NodeExit>,
}

impl BatchReport {
    pub fn statuses(&self) -> Vec<ProcessExit> {
        self.exits.iter().map(|e| e.exit.clone()).collect()
    }

    pub fn any_failed(&self) -> bool {
        any_failed(&self.statuses())
    }

    /// 0 when every node exited cleanly, -1 otherwise.
    pub fn summary_code(&self) -> i32 {
        summary_code(&self.statuses())
    }

    pub fn failures(&self) -> impl Iterator<Item = &NodeExit> {
        self.exits.iter().filter(|e| !e.exit.success())
    }
}

/// Runs one templated command per node, concurrently.
pub struct RemoteExecutor {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn OutputSink>,
    launch_delay: Duration,
}

impl RemoteExecutor {
    pub fn new(transport: Arc<dyn Transport>, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            transport,
            sink,
            launch_delay: Duration::from_millis(50),
        }
    }

    /// Pause between channel launches so the gateway is not flooded.
    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn sink(&self) -> &Arc<dyn OutputSink> {
        &self.sink
    }

    /// Render `template` for every node, run all of them and wait.
    ///
    /// Template errors are reported before anything is launched.
    pub async fn run(
        &self,
        nodes: &[Node],
        template: &str,
        subs: &Substitutions,
    ) -> RemoteResult<BatchReport> {
        let commands = template::render_all(template, nodes, subs)?;
        Ok(self.run_rendered(nodes, commands).await)
    }

    /// Run the same literal command on every node.
    pub async fn run_command(&self, nodes: &[Node], cmd: &str) -> BatchReport {
        self.run_rendered(nodes, vec![cmd.to_string(); nodes.len()])
            .await
    }

    async fn run_rendered(&self, nodes: &[Node], commands: Vec<String>) -> BatchReport {
        let mut monitors: Vec<(String, JoinHandle<ProcessExit>)> = Vec::with_capacity(nodes.len());

        for (i, (node, cmd)) in nodes.iter().zip(commands).enumerate() {
            if i > 0 && !self.launch_delay.is_zero() {
                tokio::time::sleep(self.launch_delay).await;
            }
            let label = self.transport.label(node);
            debug!(node = %label, command = %cmd, "launching remote command");

            let mut command = self.transport.command(node, &cmd);
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let sink = Arc::clone(&self.sink);
            let monitor_label = label.clone();
            let handle = match command.spawn() {
                Ok(child) => tokio::spawn(monitor(child, monitor_label, sink)),
                Err(e) => {
                    warn!(node = %label, error = %e, "failed to launch remote command");
                    let reason = format!("spawn: {e}");
                    tokio::spawn(async move { ProcessExit::Lost(reason) })
                }
            };
            monitors.push((label, handle));
        }

        let mut exits = Vec::with_capacity(monitors.len());
        for (label, handle) in monitors {
            let exit = match handle.await {
                Ok(exit) => exit,
                Err(e) => ProcessExit::Lost(format!("monitor task: {e}")),
            };
            if !exit.success() {
                warn!(node = %label, code = exit.code(), status = %exit, "remote command failed");
            }
            exits.push(NodeExit { label, exit });
        }

        let report = BatchReport { exits };
        info!(
            nodes = report.exits.len(),
            failed = report.failures().count(),
            "remote batch finished"
        );
        report
    }
}

async fn monitor(
    mut child: tokio::process::Child,
    label: String,
    sink: Arc<dyn OutputSink>,
) -> ProcessExit {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    tokio::join!(
        forward(stdout, &label, sink.as_ref()),
        forward(stderr, &label, sink.as_ref()),
    );

    match child.wait().await {
        Ok(status) => ProcessExit::from_status(status),
        Err(e) => ProcessExit::Lost(format!("wait: {e}")),
    }
}

async fn forward<R>(stream: Option<R>, label: &str, sink: &dyn OutputSink)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                let line = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                sink.line(label, &String::from_utf8_lossy(line));
            }
            Err(e) => {
                // keep the pipe open so the command is not killed by SIGPIPE
                warn!(node = %label, error = %e, "output read failed, discarding the rest");
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                return;
            }
        }
    }
}
