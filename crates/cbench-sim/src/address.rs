//! Node-address tables handed to the engine binaries.
//!
//! Two-port roles get `host:internal:external` lines with ports advancing
//! by two from the cluster's port base; index servers get `host:port`.
//! Lines are in deployment order, and port numbering continues across
//! tables so no two servers on a shared host collide.

use std::path::{Path, PathBuf};

use tracing::debug;

use cbench_core::{Placement, Role};

use crate::error::{SimError, SimResult};
use crate::params::SERVER_IP_FILE;

/// Address file for index servers.
pub const INDEX_IP_FILE: &str = "index_serverip.txt";

/// Contents of one address file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressTable {
    pub file_name: String,
    pub lines: Vec<String>,
}

impl AddressTable {
    fn new(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn render(&self) -> String {
        self.lines.iter().map(|l| format!("{l}\n")).collect()
    }

    pub fn write_to(&self, dir: &Path) -> SimResult<PathBuf> {
        let path = dir.join(&self.file_name);
        std::fs::write(&path, self.render()).map_err(|source| SimError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), entries = self.lines.len(), "address table written");
        Ok(path)
    }
}

/// Consecutive ports handed out from a base, never past 65535.
pub(crate) struct PortRange {
    base: u16,
    servers: usize,
    next: u32,
}

impl PortRange {
    pub(crate) fn new(base: u16, servers: usize) -> Self {
        Self {
            base,
            servers,
            next: u32::from(base),
        }
    }

    fn take(&mut self, width: u32) -> SimResult<u16> {
        let exhausted = || SimError::PortRange {
            base: self.base,
            servers: self.servers,
        };
        let first = u16::try_from(self.next).map_err(|_| exhausted())?;
        u16::try_from(self.next + width - 1).map_err(|_| exhausted())?;
        self.next += width;
        Ok(first)
    }

    /// `(internal, external)` ports of a two-port server.
    pub(crate) fn pair(&mut self) -> SimResult<(u16, u16)> {
        let internal = self.take(2)?;
        Ok((internal, internal + 1))
    }

    pub(crate) fn single(&mut self) -> SimResult<u16> {
        self.take(1)
    }
}

/// All address tables for one placed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressPlan {
    pub space: AddressTable,
    pub cseg: AddressTable,
    pub index: AddressTable,
    /// Host of the first coordination server, if any.
    pub cseg_service_host: Option<String>,
    /// `(host, port)` of each index server, in role order.
    pub index_endpoints: Vec<(String, u16)>,
}

impl AddressPlan {
    /// Fails when the servers need ports beyond 65535.
    pub fn build(
        placements: &[Placement<'_>],
        port_base: u16,
        cseg_ip_file: &str,
    ) -> SimResult<Self> {
        let mut plan = AddressPlan {
            space: AddressTable::new(SERVER_IP_FILE),
            cseg: AddressTable::new(cseg_ip_file),
            index: AddressTable::new(INDEX_IP_FILE),
            ..Default::default()
        };
        let mut ports = PortRange::new(port_base, placements.len());

        for role in [Role::Space, Role::Cseg, Role::Index] {
            for p in placements.iter().filter(|p| p.role == role) {
                let host = &p.node.host;
                match role {
                    Role::Space => {
                        let (internal, external) = ports.pair()?;
                        plan.space.lines.push(format!("{host}:{internal}:{external}"));
                    }
                    Role::Cseg => {
                        let (internal, external) = ports.pair()?;
                        plan.cseg.lines.push(format!("{host}:{internal}:{external}"));
                        plan.cseg_service_host.get_or_insert_with(|| host.clone());
                    }
                    _ => {
                        let port = ports.single()?;
                        plan.index.lines.push(format!("{host}:{port}"));
                        plan.index_endpoints.push((host.clone(), port));
                    }
                }
            }
        }
        Ok(plan)
    }

    /// Tables worth distributing (the space table always is).
    pub fn tables(&self) -> Vec<&AddressTable> {
        let mut tables = vec![&self.space];
        if !self.cseg.lines.is_empty() {
            tables.push(&self.cseg);
        }
        if !self.index.lines.is_empty() {
            tables.push(&self.index);
        }
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbench_core::{Deployment, Node, RoleSpec};

    fn deployment(n: usize) -> Deployment {
        Deployment::from_nodes(
            (1..=n)
                .map(|i| Node::new("meru", &format!("n{i}"), 1))
                .collect(),
        )
    }

    #[test]
    fn space_table_advances_ports_by_two() {
        let d = deployment(3);
        let placed = d
            .placements(&[RoleSpec::new(Role::Space, 2), RoleSpec::new(Role::ObjectHost, 1)])
            .unwrap();
        let plan = AddressPlan::build(&placed, 6666, "cseg_serverip.txt").unwrap();
        assert_eq!(plan.space.render(), "n1:6666:6667\nn2:6668:6669\n");
        assert!(plan.cseg.lines.is_empty());
        assert_eq!(plan.cseg_service_host, None);
        assert_eq!(plan.tables().len(), 1);
    }

    #[test]
    fn cseg_and_index_continue_numbering() {
        let d = deployment(5);
        let placed = d
            .placements(&[
                RoleSpec::new(Role::Space, 2),
                RoleSpec::new(Role::Cseg, 1),
                RoleSpec::new(Role::Index, 1),
                RoleSpec::new(Role::ObjectHost, 1),
            ])
            .unwrap();
        let plan = AddressPlan::build(&placed, 7000, "cseg_serverip.txt").unwrap();
        assert_eq!(plan.cseg.lines, vec!["n3:7004:7005"]);
        assert_eq!(plan.cseg_service_host.as_deref(), Some("n3"));
        assert_eq!(plan.index.lines, vec!["n4:7006"]);
        assert_eq!(plan.index_endpoints, vec![("n4".to_string(), 7006)]);
        assert_eq!(plan.tables().len(), 3);
    }

    #[test]
    fn ports_stop_at_the_top_of_the_range() {
        let d = deployment(3);
        let placed = d
            .placements(&[RoleSpec::new(Role::Space, 2), RoleSpec::new(Role::Index, 1)])
            .unwrap();

        let plan = AddressPlan::build(&placed, 65531, "cseg_serverip.txt").unwrap();
        assert_eq!(plan.space.lines, vec!["n1:65531:65532", "n2:65533:65534"]);
        assert_eq!(plan.index_endpoints, vec![("n3".to_string(), 65535)]);

        let err = AddressPlan::build(&placed, 65534, "cseg_serverip.txt").unwrap_err();
        assert!(matches!(
            err,
            SimError::PortRange {
                base: 65534,
                servers: 3
            }
        ));
    }

    #[test]
    fn writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let d = deployment(1);
        let placed = d.placements(&[RoleSpec::new(Role::Space, 1)]).unwrap();
        let plan = AddressPlan::build(&placed, 6666, "cseg_serverip.txt").unwrap();
        let path = plan.space.write_to(dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "n1:6666:6667\n");
    }
}
