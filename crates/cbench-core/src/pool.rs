//! Node pool and deployment allocation.
//!
//! A deployment maps logical run slots onto physical nodes. Nodes may host
//! more than one slot (their *reuse capacity*). Allocation is a tiered
//! round robin: every node is used once at depth 1, then every node with
//! capacity >= 2 once at depth 2, and so on. After the deepest tier the
//! sweep starts over at depth 1. No randomness is involved, so identical
//! pools always produce identical deployments.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AllocError, AllocResult};
use crate::types::{Role, RoleSpec};

/// A physical machine that can host deployment slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub user: String,
    pub host: String,
    /// How many slots may map to this node within one sweep.
    pub capacity: u32,
}

impl Node {
    pub fn new(user: &str, host: &str, capacity: u32) -> Self {
        Self {
            user: user.to_string(),
            host: host.to_string(),
            capacity,
        }
    }

    /// `user@host`, used for ssh targets and transcript prefixes.
    pub fn label(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// The finite, ordered set of nodes available to a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePool {
    nodes: Vec<Node>,
}

impl NodePool {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Deepest reuse tier in the pool.
    pub fn max_depth(&self) -> u32 {
        self.nodes.iter().map(|n| n.capacity).max().unwrap_or(0)
    }

    /// Compute a deployment of `slot_count` slots.
    ///
    /// With `allow_repeat == false` only depth 1 is used, so the request
    /// fails once it exceeds the number of distinct nodes.
    pub fn allocate(&self, slot_count: usize, allow_repeat: bool) -> AllocResult<Deployment> {
        if self.nodes.is_empty() {
            return Err(AllocError::EmptyPool);
        }
        if !allow_repeat && slot_count > self.nodes.len() {
            return Err(AllocError::InsufficientNodes {
                requested: slot_count,
                available: self.nodes.len(),
            });
        }

        // tiers[k] = indices of nodes usable at depth k + 1, in pool order.
        let tiers: Vec<Vec<usize>> = (1..=self.max_depth())
            .map(|depth| {
                self.nodes
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| n.capacity >= depth)
                    .map(|(i, _)| i)
                    .collect()
            })
            .filter(|tier: &Vec<usize>| !tier.is_empty())
            .collect();

        // A capacity of zero everywhere leaves nothing to sweep.
        if tiers.is_empty() {
            return Err(AllocError::InsufficientNodes {
                requested: slot_count,
                available: 0,
            });
        }

        let mut nodes = Vec::with_capacity(slot_count);
        'sweep: while nodes.len() < slot_count {
            for tier in &tiers {
                for &idx in tier {
                    if nodes.len() == slot_count {
                        break 'sweep;
                    }
                    nodes.push(self.nodes[idx].clone());
                }
            }
        }

        debug!(
            slots = slot_count,
            distinct = self.nodes.len(),
            depth = self.max_depth(),
            "deployment allocated"
        );
        Ok(Deployment { nodes })
    }
}

/// An ordered assignment of logical slots to nodes for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deployment {
    nodes: Vec<Node>,
}

/// One slot of a deployment, resolved against the run's role list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement<'a> {
    pub role: Role,
    /// Zero-based index of this slot within its role.
    pub role_index: usize,
    /// Zero-based position within the deployment.
    pub position: usize,
    pub node: &'a Node,
}

impl Deployment {
    pub fn from_nodes(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&Node> {
        self.nodes.get(position)
    }

    /// First `n` slots (or all of them if `n` exceeds the length).
    pub fn head(&self, n: usize) -> &[Node] {
        &self.nodes[..n.min(self.nodes.len())]
    }

    /// Map the ordered role list onto deployment positions.
    ///
    /// Roles consume consecutive positions in list order.
    pub fn placements(&self, roles: &[RoleSpec]) -> AllocResult<Vec<Placement<'_>>> {
        let wanted: usize = roles.iter().map(|r| r.count).sum();
        if wanted > self.nodes.len() {
            return Err(AllocError::InsufficientNodes {
                requested: wanted,
                available: self.nodes.len(),
            });
        }

        let mut out = Vec::with_capacity(wanted);
        let mut position = 0;
        for spec in roles {
            for role_index in 0..spec.count {
                out.push(Placement {
                    role: spec.role,
                    role_index,
                    position,
                    node: &self.nodes[position],
                });
                position += 1;
            }
        }
        Ok(out)
    }

    /// Positions `[start, start + count)` of the deployment, clamped.
    pub fn slice(&self, start: usize, count: usize) -> &[Node] {
        let start = start.min(self.nodes.len());
        let end = (start + count).min(self.nodes.len());
        &self.nodes[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacities: &[u32]) -> NodePool {
        NodePool::new(
            capacities
                .iter()
                .enumerate()
                .map(|(i, &c)| Node::new("meru", &format!("node{i}"), c))
                .collect(),
        )
    }

    fn hosts(d: &Deployment) -> Vec<&str> {
        d.nodes().iter().map(|n| n.host.as_str()).collect()
    }

    #[test]
    fn tiered_round_robin_fills_depth_one_first() {
        let d = pool(&[1, 1, 2]).allocate(4, true).unwrap();
        assert_eq!(hosts(&d), vec!["node0", "node1", "node2", "node2"]);
    }

    #[test]
    fn sweep_restarts_at_depth_one() {
        let d = pool(&[1, 2]).allocate(5, true).unwrap();
        assert_eq!(hosts(&d), vec!["node0", "node1", "node1", "node0", "node1"]);
    }

    #[test]
    fn allocation_is_deterministic() {
        let p = pool(&[3, 1, 2, 1]);
        assert_eq!(p.allocate(11, true).unwrap(), p.allocate(11, true).unwrap());
    }

    #[test]
    fn no_repeat_fails_when_slots_exceed_nodes() {
        let err = pool(&[1, 1, 1]).allocate(4, false).unwrap_err();
        assert_eq!(
            err,
            AllocError::InsufficientNodes {
                requested: 4,
                available: 3
            }
        );
    }

    #[test]
    fn no_repeat_uses_each_node_once() {
        let d = pool(&[2, 2, 2]).allocate(3, false).unwrap();
        assert_eq!(hosts(&d), vec!["node0", "node1", "node2"]);
    }

    #[test]
    fn empty_pool_is_an_error() {
        assert_eq!(
            NodePool::default().allocate(1, true).unwrap_err(),
            AllocError::EmptyPool
        );
    }

    #[test]
    fn zero_slots_yields_empty_deployment() {
        assert!(pool(&[1]).allocate(0, false).unwrap().is_empty());
    }

    #[test]
    fn capacity_one_never_repeats_before_deeper_nodes_fill() {
        // For every prefix, a capacity-1 node only reappears once every
        // capacity>=2 node has been used twice.
        let p = pool(&[1, 3, 1, 2]);
        let d = p.allocate(20, true).unwrap();
        let mut seen = std::collections::HashMap::new();
        for node in d.nodes() {
            let count = seen.entry(node.host.clone()).or_insert(0u32);
            *count += 1;
            if node.capacity == 1 && *count == 2 {
                for deeper in p.nodes().iter().filter(|n| n.capacity >= 2) {
                    assert!(seen.get(&deeper.host).copied().unwrap_or(0) >= 2);
                }
            }
        }
    }

    #[test]
    fn single_sweep_respects_capacity() {
        let p = pool(&[1, 3, 2]);
        let total: u32 = p.nodes().iter().map(|n| n.capacity).sum();
        let d = p.allocate(total as usize, true).unwrap();
        for node in p.nodes() {
            let used = d.nodes().iter().filter(|n| n.host == node.host).count();
            assert_eq!(used as u32, node.capacity);
        }
    }

    #[test]
    fn placements_follow_role_order() {
        let d = pool(&[1, 1, 1, 1]).allocate(4, false).unwrap();
        let roles = [
            RoleSpec::new(Role::Space, 2),
            RoleSpec::new(Role::Cseg, 1),
            RoleSpec::new(Role::ObjectHost, 1),
        ];
        let placed = d.placements(&roles).unwrap();
        assert_eq!(placed.len(), 4);
        assert_eq!(placed[1].role, Role::Space);
        assert_eq!(placed[1].role_index, 1);
        assert_eq!(placed[2].role, Role::Cseg);
        assert_eq!(placed[2].role_index, 0);
        assert_eq!(placed[3].node.host, "node3");
    }

    #[test]
    fn placements_reject_oversized_role_list() {
        let d = pool(&[1, 1]).allocate(2, false).unwrap();
        let roles = [RoleSpec::new(Role::Space, 3)];
        assert!(d.placements(&roles).is_err());
    }
}
