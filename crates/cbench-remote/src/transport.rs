//! How a shell command reaches a node.
//!
//! `SshTransport` runs the command as `ssh user@host '<cmd>'`, or with a
//! gateway as `ssh gw_user@gw_host "ssh user@host '<cmd>'"` so a single
//! head node can reach machines the operator cannot. `LocalTransport`
//! ignores the node and runs `sh -c '<cmd>'`.

use tokio::process::Command;

use cbench_core::{Endpoint, Node};

/// Turns (node, shell command) into a runnable process.
pub trait Transport: Send + Sync {
    /// A process that executes `cmd` on `node`.
    fn command(&self, node: &Node, cmd: &str) -> Command;

    /// The same invocation as a single line for a local shell pipeline.
    fn shell_line(&self, node: &Node, cmd: &str) -> String;

    /// Transcript prefix for this node.
    fn label(&self, node: &Node) -> String {
        node.label()
    }
}

/// Quote `s` as one word for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Two-hop (or direct) ssh.
#[derive(Debug, Clone)]
pub struct SshTransport {
    gateway: Option<Endpoint>,
    options: Vec<String>,
}

impl SshTransport {
    pub fn new(gateway: Option<Endpoint>) -> Self {
        Self {
            gateway,
            options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
        }
    }

    /// Replace the ssh options passed on both hops.
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn gateway(&self) -> Option<&Endpoint> {
        self.gateway.as_ref()
    }

    fn target(node: &Node) -> String {
        format!("{}@{}", node.user, node.host)
    }

    /// Inner hop as text: `ssh <opts> user@host '<cmd>'`.
    fn inner(&self, node: &Node, cmd: &str) -> String {
        let mut parts = vec!["ssh".to_string()];
        parts.extend(self.options.iter().map(|o| shell_quote(o)));
        parts.push(Self::target(node));
        parts.push(shell_quote(cmd));
        parts.join(" ")
    }

    /// Argument vector for the local `ssh` process.
    pub fn args(&self, node: &Node, cmd: &str) -> Vec<String> {
        let mut args = self.options.clone();
        match &self.gateway {
            Some(gw) => {
                args.push(gw.to_string());
                args.push(self.inner(node, cmd));
            }
            None => {
                args.push(Self::target(node));
                args.push(cmd.to_string());
            }
        }
        args
    }
}

impl Transport for SshTransport {
    fn command(&self, node: &Node, cmd: &str) -> Command {
        let mut command = Command::new("ssh");
        command.args(self.args(node, cmd));
        command
    }

    fn shell_line(&self, node: &Node, cmd: &str) -> String {
        match &self.gateway {
            Some(gw) => {
                let mut parts = vec!["ssh".to_string()];
                parts.extend(self.options.iter().map(|o| shell_quote(o)));
                parts.push(gw.to_string());
                parts.push(shell_quote(&self.inner(node, cmd)));
                parts.join(" ")
            }
            None => self.inner(node, cmd),
        }
    }
}

/// Runs every command on the local machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn command(&self, _node: &Node, cmd: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        command
    }

    fn shell_line(&self, _node: &Node, cmd: &str) -> String {
        format!("sh -c {}", shell_quote(cmd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Node {
        Node::new("meru", "n07", 1)
    }

    #[test]
    fn quote_leaves_plain_words() {
        assert_eq!(shell_quote("trace-0001.txt"), "trace-0001.txt");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn direct_ssh_args() {
        let t = SshTransport::new(None);
        assert_eq!(
            t.args(&node(), "uptime"),
            vec!["-o", "BatchMode=yes", "meru@n07", "uptime"]
        );
    }

    #[test]
    fn gateway_wraps_inner_hop() {
        let gw = Endpoint::parse("head@gw.lab").unwrap();
        let t = SshTransport::new(Some(gw)).with_options(vec![]);
        let args = t.args(&node(), "cd /srv && ls");
        assert_eq!(args, vec!["head@gw.lab", "ssh meru@n07 'cd /srv && ls'"]);
    }

    #[test]
    fn gateway_shell_line_quotes_twice() {
        let gw = Endpoint::parse("head@gw.lab").unwrap();
        let t = SshTransport::new(Some(gw)).with_options(vec![]);
        assert_eq!(
            t.shell_line(&node(), "cat 'x y'"),
            r"ssh head@gw.lab 'ssh meru@n07 '\''cat '\''\'\'''\''x y'\''\'\'''\'''\'''"
        );
    }

    #[test]
    fn local_transport_runs_sh() {
        assert_eq!(LocalTransport.shell_line(&node(), "echo hi"), "sh -c 'echo hi'");
        assert_eq!(LocalTransport.label(&node()), "meru@n07");
    }
}
