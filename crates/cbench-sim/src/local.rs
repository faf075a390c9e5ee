//! Single-machine space cluster.
//!
//! Starts coordination servers, one index server and, after a stagger delay,
//! the space servers under one [`ProcSet`]. With a duration the call blocks,
//! then shuts everything down through the usual graceful-then-forced
//! escalation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use cbench_proc::{ProcSet, ProcessBackend};

use crate::address::{AddressTable, PortRange};
use crate::error::{SimError, SimResult};

pub const SERVERMAP_FILE: &str = "servermap.txt";
pub const CSEG_SERVERMAP_FILE: &str = "cseg_servermap.txt";

#[derive(Debug, Clone, PartialEq)]
pub struct LocalCluster {
    pub host: String,
    pub nservers: usize,
    pub layout: [u32; 3],
    pub blocksize: [f64; 3],
    pub center: [f64; 3],
    pub port_base: u16,
    pub pinto_port: u16,
    pub cseg_servers: usize,
    pub cseg_upper_servers: usize,
    pub cseg_port_base: u16,
    pub cseg_service_tcp_port: u16,
    pub oseg_prefix: String,
    pub http_command_port_base: u16,
    /// Delay between the index server and the first space server.
    pub stagger: Duration,
    /// How long servers get to exit after the graceful signal.
    pub kill_grace: Duration,
    pub binary_dir: PathBuf,
    pub space_binary: String,
    pub cseg_binary: String,
    pub pinto_binary: String,
    pub space_config: Option<PathBuf>,
    pub cseg_config: Option<PathBuf>,
    pub pinto_config: Option<PathBuf>,
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            nservers: 2,
            layout: [2, 1, 1],
            blocksize: [4000.0, 8000.0, 8000.0],
            center: [0.0, 0.0, 0.0],
            port_base: 6666,
            pinto_port: 6665,
            cseg_servers: 0,
            cseg_upper_servers: 1,
            cseg_port_base: 6235,
            cseg_service_tcp_port: 6234,
            oseg_prefix: "myspace-".to_string(),
            http_command_port_base: 9000,
            stagger: Duration::from_secs(5),
            kill_grace: Duration::from_secs(10),
            binary_dir: PathBuf::from("."),
            space_binary: "space".to_string(),
            cseg_binary: "cseg".to_string(),
            pinto_binary: "pinto".to_string(),
            space_config: None,
            cseg_config: None,
            pinto_config: None,
        }
    }
}

fn two_port_table(file_name: &str, host: &str, base: u16, count: usize) -> SimResult<AddressTable> {
    let mut ports = PortRange::new(base, count);
    let mut lines = Vec::with_capacity(count);
    for _ in 0..count {
        let (internal, external) = ports.pair()?;
        lines.push(format!("{host}:{internal}:{external}"));
    }
    Ok(AddressTable {
        file_name: file_name.to_string(),
        lines,
    })
}

fn cfg_arg(config: &Option<PathBuf>) -> Option<String> {
    config.as_ref().map(|c| format!("--cfg={}", c.display()))
}

impl LocalCluster {
    pub fn layout(&self) -> String {
        let [x, y, z] = self.layout;
        format!("<{x},{y},{z}>")
    }

    pub fn region(&self) -> String {
        let half: Vec<f64> = self
            .blocksize
            .iter()
            .zip(self.layout)
            .map(|(block, n)| block * n as f64 / 2.0)
            .collect();
        let c = self.center;
        format!(
            "<<{:.6},{:.6},{:.6}>,<{:.6},{:.6},{:.6}>>",
            -half[0] + c[0],
            -half[1] + c[1],
            -half[2] + c[2],
            half[0] + c[0],
            half[1] + c[1],
            half[2] + c[2],
        )
    }

    pub fn servermap(&self) -> SimResult<AddressTable> {
        two_port_table(SERVERMAP_FILE, &self.host, self.port_base, self.nservers)
    }

    pub fn cseg_servermap(&self) -> SimResult<AddressTable> {
        two_port_table(
            CSEG_SERVERMAP_FILE,
            &self.host,
            self.cseg_port_base,
            self.cseg_servers,
        )
    }

    /// Arguments of the coordination server at zero-based `index`.
    pub fn cseg_args(&self, index: usize) -> Vec<String> {
        let mut args = vec![
            format!("--cseg-id={}", index + 1),
            "--servermap=tabular".to_string(),
            format!("--cseg-servermap-options=--filename={CSEG_SERVERMAP_FILE}"),
            format!("--layout={}", self.layout()),
            format!("--region={}", self.region()),
            format!("--cseg-service-tcp-port={}", self.cseg_service_tcp_port),
            format!("--num-cseg-servers={}", self.cseg_servers),
            format!("--num-upper-tree-cseg-servers={}", self.cseg_upper_servers),
        ];
        args.extend(cfg_arg(&self.cseg_config));
        args
    }

    pub fn pinto_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--port={}", self.pinto_port),
            "--handler=rtreecut".to_string(),
            "--command.commander=http".to_string(),
            format!(
                "--command.commander-options=--port={}",
                self.http_command_port_base as u32 + 100
            ),
        ];
        args.extend(cfg_arg(&self.pinto_config));
        args
    }

    /// Arguments of the space server at zero-based `index`. `select_pinto`
    /// is false when the extra space config already chooses a pinto mode.
    pub fn space_args(&self, index: usize, select_pinto: bool) -> Vec<String> {
        let mut args = vec![
            format!("--id={}", index + 1),
            "--servermap=tabular".to_string(),
            format!("--servermap-options=--filename={SERVERMAP_FILE}"),
            format!("--layout={}", self.layout()),
            format!("--region={}", self.region()),
            "--oseg=redis".to_string(),
            format!("--oseg-options=--prefix={}", self.oseg_prefix),
            "--command.commander=http".to_string(),
            format!(
                "--command.commander-options=--port={}",
                self.http_command_port_base as usize + index
            ),
        ];
        if select_pinto {
            args.push("--pinto=master".to_string());
        }
        args.push(format!(
            "--pinto-options=--host={} --port={}",
            self.host, self.pinto_port
        ));
        if self.cseg_servers > 0 {
            args.extend([
                "--cseg=client".to_string(),
                format!("--cseg-service-host={}", self.host),
                format!("--cseg-service-tcp-port={}", self.cseg_service_tcp_port),
            ]);
        }
        args.extend(cfg_arg(&self.space_config));
        args
    }

    /// False when the extra space config has its own `pinto=` line.
    fn selects_pinto(&self) -> SimResult<bool> {
        let Some(path) = &self.space_config else {
            return Ok(true);
        };
        let content = std::fs::read_to_string(path).map_err(|source| SimError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(!content.lines().any(|l| l.starts_with("pinto=")))
    }

    /// Hint for connecting an object host to the running space.
    pub fn oh_template(&self) -> String {
        format!(
            "To start an object host connecting to this space, use at least the following parameters:\n\n    cppoh --servermap=tabular --servermap-options=--filename={SERVERMAP_FILE}\n"
        )
    }

    fn program(&self, binary: &str) -> String {
        self.binary_dir.join(binary).display().to_string()
    }

    /// Write the server maps into `dir` and launch every server.
    pub async fn start<B: ProcessBackend>(&self, set: &mut ProcSet<B>, dir: &Path) -> SimResult<()> {
        let select_pinto = self.selects_pinto()?;
        let servermap = self.servermap()?;
        if self.cseg_servers > 0 {
            self.cseg_servermap()?.write_to(dir)?;
            for i in 0..self.cseg_servers {
                set.spawn(&self.program(&self.cseg_binary), &self.cseg_args(i), false, false)?;
            }
        }
        set.spawn(&self.program(&self.pinto_binary), &self.pinto_args(), false, false)?;

        servermap.write_to(dir)?;
        for i in 0..self.nservers {
            set.spawn_at(
                self.stagger,
                &self.program(&self.space_binary),
                &self.space_args(i, select_pinto),
                false,
                i == 0,
            )
            .await?;
        }
        info!(
            space = self.nservers,
            cseg = self.cseg_servers,
            host = %self.host,
            "local space cluster started"
        );
        Ok(())
    }

    /// Start, then supervise.
    pub async fn run<B: ProcessBackend>(
        &self,
        set: &mut ProcSet<B>,
        dir: &Path,
        duration: Option<Duration>,
    ) -> SimResult<()> {
        self.start(set, dir).await?;
        self.supervise(set, duration).await
    }

    /// With a duration, shut the servers down once it has passed after the
    /// stagger; without one, wait for them to exit on their own.
    pub async fn supervise<B: ProcessBackend>(
        &self,
        set: &mut ProcSet<B>,
        duration: Option<Duration>,
    ) -> SimResult<()> {
        match duration {
            Some(d) => {
                let grace = self.stagger + d;
                set.wait_for(Some(grace), Some(grace + self.kill_grace)).await?;
            }
            None => set.wait_for(None, None).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servermap_uses_even_internal_ports() {
        let cluster = LocalCluster {
            host: "box".into(),
            ..LocalCluster::default()
        };
        assert_eq!(
            cluster.servermap().unwrap().render(),
            "box:6666:6667\nbox:6668:6669\n"
        );
        assert!(cluster.cseg_servermap().unwrap().lines.is_empty());
    }

    #[test]
    fn servermap_rejects_ports_past_the_range() {
        let cluster = LocalCluster {
            port_base: 65534,
            ..LocalCluster::default()
        };
        assert!(matches!(
            cluster.servermap(),
            Err(SimError::PortRange { base: 65534, servers: 2 })
        ));
    }

    #[test]
    fn region_spans_layout() {
        let cluster = LocalCluster::default();
        assert_eq!(cluster.layout(), "<2,1,1>");
        assert_eq!(
            cluster.region(),
            "<<-4000.000000,-4000.000000,-4000.000000>,<4000.000000,4000.000000,4000.000000>>"
        );
    }

    #[test]
    fn space_args_follow_cseg_and_pinto_choice() {
        let cluster = LocalCluster {
            cseg_servers: 1,
            ..LocalCluster::default()
        };
        let args = cluster.space_args(1, false);
        assert_eq!(args[0], "--id=2");
        assert!(args.contains(&"--command.commander-options=--port=9001".to_string()));
        assert!(!args.contains(&"--pinto=master".to_string()));
        assert!(args.contains(&"--pinto-options=--host=localhost --port=6665".to_string()));
        assert!(args.contains(&"--cseg=client".to_string()));
    }

    #[test]
    fn pinto_commander_port_is_offset() {
        let args = LocalCluster::default().pinto_args();
        assert!(args.contains(&"--command.commander-options=--port=9100".to_string()));
    }

    #[test]
    fn space_config_can_select_pinto() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("space.cfg");
        std::fs::write(&cfg, "oseg=redis\npinto=manual\n").unwrap();
        let cluster = LocalCluster {
            space_config: Some(cfg.clone()),
            ..LocalCluster::default()
        };
        assert!(!cluster.selects_pinto().unwrap());
        let args = cluster.space_args(0, false);
        assert_eq!(args.last(), Some(&format!("--cfg={}", cfg.display())));
    }
}
