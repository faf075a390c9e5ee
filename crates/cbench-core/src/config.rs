//! `.cluster` file parser.
//!
//! The operator-level configuration is a flat list of `key = value` lines.
//! `#` starts a comment, blank lines are ignored and `node` may repeat;
//! node order in the file is pool order.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::pool::{Node, NodePool};

/// Default file name looked up in the working directory.
pub const DEFAULT_CLUSTER_FILE: &str = ".cluster";

const DEFAULT_PORT_BASE: u16 = 6666;
const DEFAULT_BRANCH: &str = "master";
const DEFAULT_WRAPPER: &str = "util/cbr_wrapper.sh";
const DEFAULT_LAUNCH_DELAY_MS: u64 = 50;

/// A `user@host` pair, used for the gateway node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub user: String,
    pub host: String,
}

impl Endpoint {
    pub fn parse(s: &str) -> Option<Self> {
        let (user, host) = s.split_once('@')?;
        if user.is_empty() || host.is_empty() || host.contains(char::is_whitespace) {
            return None;
        }
        Some(Self {
            user: user.to_string(),
            host: host.to_string(),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Parsed `.cluster` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub nodes: Vec<Node>,
    pub gateway: Option<Endpoint>,
    pub code_dir: Option<String>,
    pub port_base: u16,
    pub unique: Option<String>,
    pub repository: Option<String>,
    pub branch: String,
    pub ccache: bool,
    pub wrapper: String,
    pub launch_delay_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            gateway: None,
            code_dir: None,
            port_base: DEFAULT_PORT_BASE,
            unique: None,
            repository: None,
            branch: DEFAULT_BRANCH.to_string(),
            ccache: false,
            wrapper: DEFAULT_WRAPPER.to_string(),
            launch_delay_ms: DEFAULT_LAUNCH_DELAY_MS,
        }
    }
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::parse(&content)?;
        debug!(
            path = %path.display(),
            nodes = config.nodes.len(),
            gateway = config.gateway.is_some(),
            "cluster config loaded"
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        let mut config = Self::default();

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = match raw.split_once('#') {
                Some((before, _)) => before,
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let malformed = |reason: &str| ConfigError::Malformed {
                line_no,
                line: raw.to_string(),
                reason: reason.to_string(),
            };

            let Some((key, value)) = line.split_once('=') else {
                return Err(malformed("expected key = value"));
            };
            let key = key.trim();
            let value = value.trim();
            if value.is_empty() {
                return Err(malformed("empty value"));
            }

            match key {
                "node" => config.nodes.push(parse_node(value).map_err(|r| malformed(r))?),
                "gateway" => {
                    config.gateway =
                        Some(Endpoint::parse(value).ok_or_else(|| malformed("expected user@host"))?)
                }
                "code_dir" => config.code_dir = Some(value.to_string()),
                "port_base" => {
                    config.port_base = value.parse().map_err(|_| malformed("invalid port"))?
                }
                "unique" => config.unique = Some(value.to_string()),
                "repository" => config.repository = Some(value.to_string()),
                "branch" => config.branch = value.to_string(),
                "ccache" => {
                    config.ccache = value.parse().map_err(|_| malformed("expected true or false"))?
                }
                "wrapper" => config.wrapper = value.to_string(),
                "launch_delay_ms" => {
                    config.launch_delay_ms =
                        value.parse().map_err(|_| malformed("invalid milliseconds"))?
                }
                _ => return Err(malformed("unknown key")),
            }
        }

        Ok(config)
    }

    pub fn pool(&self) -> NodePool {
        NodePool::new(self.nodes.clone())
    }

    /// Remote checkout directory; required by every remote step.
    pub fn code_dir(&self) -> ConfigResult<&str> {
        self.code_dir.as_deref().ok_or(ConfigError::MissingKey("code_dir"))
    }

    pub fn repository(&self) -> ConfigResult<&str> {
        self.repository
            .as_deref()
            .ok_or(ConfigError::MissingKey("repository"))
    }

    /// `<code_dir>/scripts/`, the working directory for engine runs.
    pub fn scripts_dir(&self) -> ConfigResult<String> {
        Ok(format!("{}/scripts/", self.code_dir()?.trim_end_matches('/')))
    }

    pub fn launch_delay(&self) -> Duration {
        Duration::from_millis(self.launch_delay_ms)
    }
}

fn parse_node(value: &str) -> Result<Node, &'static str> {
    let mut parts = value.split_whitespace();
    let target = parts.next().ok_or("expected user@host")?;
    let endpoint = Endpoint::parse(target).ok_or("expected user@host")?;
    let capacity = match parts.next() {
        Some(c) => c.parse::<u32>().map_err(|_| "invalid capacity")?,
        None => 1,
    };
    if capacity == 0 {
        return Err("capacity must be at least 1");
    }
    if parts.next().is_some() {
        return Err("trailing text after capacity");
    }
    Ok(Node {
        user: endpoint.user,
        host: endpoint.host,
        capacity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "\
# lab cluster
gateway = meru@head.lab
node = meru@n01 2
node = meru@n02
node = meru@n03   # spare
code_dir = /home/meru/cbr
port_base = 7000
unique = exp42
";

    #[test]
    fn parses_nodes_in_order() {
        let config = ClusterConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.nodes[0], Node::new("meru", "n01", 2));
        assert_eq!(config.nodes[2].host, "n03");
        assert_eq!(config.nodes[2].capacity, 1);
        assert_eq!(config.port_base, 7000);
        assert_eq!(config.unique.as_deref(), Some("exp42"));
        assert_eq!(config.gateway.unwrap().to_string(), "meru@head.lab");
    }

    #[test]
    fn defaults_apply() {
        let config = ClusterConfig::parse("node = a@b\n").unwrap();
        assert_eq!(config.port_base, 6666);
        assert_eq!(config.branch, "master");
        assert_eq!(config.wrapper, "util/cbr_wrapper.sh");
        assert_eq!(config.launch_delay(), Duration::from_millis(50));
        assert!(!config.ccache);
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let err = ClusterConfig::parse("node = a@b\n\nport_base = lots\n").unwrap_err();
        match err {
            ConfigError::Malformed { line_no, line, .. } => {
                assert_eq!(line_no, 3);
                assert_eq!(line, "port_base = lots");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_missing_equals_and_unknown_keys() {
        assert!(matches!(
            ClusterConfig::parse("node a@b"),
            Err(ConfigError::Malformed { line_no: 1, .. })
        ));
        assert!(matches!(
            ClusterConfig::parse("nodes = a@b"),
            Err(ConfigError::Malformed { line_no: 1, .. })
        ));
    }

    #[test]
    fn rejects_bad_node_specs() {
        for bad in ["node = hostonly", "node = a@b 0", "node = a@b x", "node = a@b 1 2"] {
            assert!(ClusterConfig::parse(bad).is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn scripts_dir_requires_code_dir() {
        let config = ClusterConfig::parse("node = a@b").unwrap();
        assert!(matches!(config.scripts_dir(), Err(ConfigError::MissingKey("code_dir"))));

        let config = ClusterConfig::parse("code_dir = /srv/cbr/").unwrap();
        assert_eq!(config.scripts_dir().unwrap(), "/srv/cbr/scripts/");
    }

    #[test]
    fn from_file_reads_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pool().len(), 3);
    }

    #[test]
    fn from_file_missing_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClusterConfig::from_file(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
