use std::{fmt::Display, str::FromStr, time::Duration};

use insert_protocol::{DEFAULT_INSERT_PORT, MAX_INSERT_PACKET_SIZE_FOR_ROUTER};

use crate::{Error, Result};

/// The group of storage nodes listed without a `group/` prefix.
pub const DEFAULT_GROUP: &str = "default";

/// The most storage nodes a cluster accepts.
pub const MAX_NODES: usize = 255;

/// The smallest per-node buffer, whatever the memory budget.
pub const MIN_BUF_SIZE_PER_NODE: usize = 64 * 1024;

/// A storage node address and the replication group it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddr {
    pub group: String,
    pub addr: String,
}

impl FromStr for NodeAddr {
    type Err = Error;

    /// Parse `addr` or `group/addr`, appending the default insert port to an
    /// address without one.
    fn from_str(entry: &str) -> Result<Self> {
        let invalid = |reason| Error::InvalidNode {
            entry: entry.to_string(),
            reason,
        };

        let entry_trimmed = entry.trim();
        let (group, addr) = match entry_trimmed.split_once('/') {
            None => (DEFAULT_GROUP, entry_trimmed),
            Some((_, addr)) if addr.contains('/') => {
                return Err(invalid("more than one '/' separator"));
            }
            Some(("", _)) => return Err(invalid("empty group name")),
            Some((group, addr)) => (group, addr),
        };
        if addr.is_empty() {
            return Err(invalid("empty address"));
        }

        Ok(Self {
            group: group.to_string(),
            addr: with_default_port(addr),
        })
    }
}

impl Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.addr)
    }
}

fn with_default_port(addr: &str) -> String {
    let has_port = match addr.strip_prefix('[') {
        // "[::1]" or "[::1]:8400"
        Some(rest) => !rest.ends_with(']'),
        None => addr.contains(':'),
    };
    if has_port {
        addr.to_string()
    } else {
        format!("{addr}:{DEFAULT_INSERT_PORT}")
    }
}

/// Everything needed to build a [`Cluster`](crate::Cluster).
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeAddr>,
    /// Copies written of every row, at most one per node of a group.
    pub replication_factor: usize,
    /// Bytes shared by all node and reroute buffers of the cluster. Each
    /// group gets the share of its nodes.
    pub memory_budget: usize,
    /// Compress data sent to storage nodes.
    pub compress: bool,
    /// How often workers flush buffers that have not filled up.
    pub flush_interval: Duration,
    pub dial_timeout: Duration,
    /// Seed mixed into every node selection.
    pub hash_seed: u64,
    /// Reroute passes a row may fail before it is dropped; 0 retries forever.
    pub max_reroute_passes: usize,
    /// Never try the RPC envelope, for clusters of old storage nodes.
    pub legacy_protocol: bool,
    /// Drop rows a healthy node has no buffer space for instead of
    /// rerouting them.
    pub drop_samples_on_overload: bool,
    /// Block writers of an unavailable node instead of rerouting its rows.
    pub disable_rerouting_on_unavailable: bool,
    /// How long rows keep waiting for a broken node before they are
    /// rerouted. Zero reroutes at once.
    pub reroute_delay: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: vec![],
            replication_factor: 1,
            memory_budget: 256 * 1024 * 1024,
            compress: true,
            flush_interval: Duration::from_secs(1),
            dial_timeout: Duration::from_secs(3),
            hash_seed: 0,
            max_reroute_passes: 600,
            legacy_protocol: false,
            drop_samples_on_overload: false,
            disable_rerouting_on_unavailable: false,
            reroute_delay: Duration::from_secs(20),
        }
    }
}

impl ClusterConfig {
    /// A default configuration over the parsed `entries`.
    pub fn from_addrs<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let nodes = entries
            .into_iter()
            .map(|e| e.as_ref().parse())
            .collect::<Result<Vec<NodeAddr>>>()?;
        Ok(Self {
            nodes,
            ..Default::default()
        })
    }

    /// Validate the node list and split it into groups, ordered by first
    /// appearance, each keeping its configured node order.
    pub fn groups(&self) -> Result<Vec<(String, Vec<String>)>> {
        if self.nodes.is_empty() {
            return Err(Error::NoNodes);
        }
        if self.nodes.len() > MAX_NODES {
            return Err(Error::TooManyNodes {
                count: self.nodes.len(),
                max: MAX_NODES,
            });
        }
        if self.replication_factor == 0 {
            return Err(Error::ZeroReplicationFactor);
        }

        let mut groups: Vec<(String, Vec<String>)> = vec![];
        for node in &self.nodes {
            let pos = match groups.iter().position(|(name, _)| *name == node.group) {
                Some(pos) => pos,
                None => {
                    groups.push((node.group.clone(), vec![]));
                    groups.len() - 1
                }
            };
            let members = &mut groups[pos].1;
            if members.contains(&node.addr) {
                return Err(Error::DuplicateNode {
                    group: node.group.clone(),
                    addr: node.addr.clone(),
                });
            }
            members.push(node.addr.clone());
        }
        Ok(groups)
    }
}

/// The part of a cluster wide `memory_budget` owed to a group of
/// `group_nodes` out of `total_nodes`.
pub fn group_budget(memory_budget: usize, group_nodes: usize, total_nodes: usize) -> usize {
    if total_nodes == 0 {
        return memory_budget;
    }
    (memory_budget as u128 * group_nodes as u128 / total_nodes as u128) as usize
}

/// Split `memory_budget` between the node buffers and the reroute buffer of
/// a group with `members` nodes.
///
/// Returns `(per_node, reroute)`. The per node cap never exceeds what fits
/// into one insert packet, and the reroute cap always lies between one and
/// `members` per node caps.
pub fn buffer_caps(memory_budget: usize, members: usize) -> (usize, usize) {
    let members = members.max(1);
    let per_node =
        (memory_budget / members).clamp(MIN_BUF_SIZE_PER_NODE, MAX_INSERT_PACKET_SIZE_FOR_ROUTER);
    let reroute = memory_budget.clamp(per_node, per_node * members);
    (per_node, reroute)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn node(group: &str, addr: &str) -> NodeAddr {
        NodeAddr {
            group: group.to_string(),
            addr: addr.to_string(),
        }
    }

    #[test]
    fn test_parse_node_addr() {
        let cases = [
            ("10.0.0.1", node(DEFAULT_GROUP, "10.0.0.1:8400")),
            ("10.0.0.1:9000", node(DEFAULT_GROUP, "10.0.0.1:9000")),
            ("az1/storage-1", node("az1", "storage-1:8400")),
            ("az1/storage-1:1234", node("az1", "storage-1:1234")),
            ("[::1]", node(DEFAULT_GROUP, "[::1]:8400")),
            ("az2/[::1]:8401", node("az2", "[::1]:8401")),
            (" padded ", node(DEFAULT_GROUP, "padded:8400")),
        ];
        for (input, want) in cases {
            assert_eq!(input.parse::<NodeAddr>().unwrap(), want, "{input}");
        }
    }

    #[test]
    fn test_parse_node_addr_errors() {
        for input in ["a/b/c", "/host", "group/", ""] {
            let err = input.parse::<NodeAddr>().unwrap_err();
            assert!(matches!(err, Error::InvalidNode { .. }), "{input}: {err}");
        }
    }

    #[test]
    fn test_groups_keep_order() {
        let config = ClusterConfig::from_addrs([
            "b/n1", "a/n2", "b/n3", "n4", "a/n5",
        ])
        .unwrap();
        let groups = config.groups().unwrap();
        assert_eq!(
            groups,
            [
                ("b".to_string(), vec!["n1:8400".to_string(), "n3:8400".to_string()]),
                ("a".to_string(), vec!["n2:8400".to_string(), "n5:8400".to_string()]),
                (DEFAULT_GROUP.to_string(), vec!["n4:8400".to_string()]),
            ]
        );
    }

    #[test]
    fn test_groups_validation() {
        let config = ClusterConfig::default();
        assert!(matches!(config.groups(), Err(Error::NoNodes)));

        let config =
            ClusterConfig::from_addrs((0..=MAX_NODES).map(|i| format!("node-{i}"))).unwrap();
        assert!(matches!(
            config.groups(),
            Err(Error::TooManyNodes { count: 256, .. })
        ));

        let mut config = ClusterConfig::from_addrs(["a"]).unwrap();
        config.replication_factor = 0;
        assert!(matches!(config.groups(), Err(Error::ZeroReplicationFactor)));

        // Same address in different groups is allowed, not within one.
        let config = ClusterConfig::from_addrs(["g1/a", "g2/a"]).unwrap();
        assert!(config.groups().is_ok());
        let config = ClusterConfig::from_addrs(["a", "a:8400"]).unwrap();
        assert!(matches!(
            config.groups(),
            Err(Error::DuplicateNode { .. })
        ));
    }

    #[test]
    fn test_buffer_caps() {
        const MIB: usize = 1024 * 1024;

        // Plenty of memory: the per node cap hits the packet limit.
        let (per_node, reroute) = buffer_caps(1024 * MIB, 3);
        assert_eq!(per_node, MAX_INSERT_PACKET_SIZE_FOR_ROUTER);
        assert_eq!(reroute, 3 * MAX_INSERT_PACKET_SIZE_FOR_ROUTER);

        let (per_node, reroute) = buffer_caps(30 * MIB, 3);
        assert_eq!(per_node, 10 * MIB);
        assert_eq!(reroute, 30 * MIB);

        // Starved: both caps are raised to the floor.
        let (per_node, reroute) = buffer_caps(1024, 4);
        assert_eq!(per_node, MIN_BUF_SIZE_PER_NODE);
        assert_eq!(reroute, MIN_BUF_SIZE_PER_NODE);

        for (budget, members) in [(0, 1), (100 * MIB, 1), (7 * MIB, 5), (usize::MAX / 2, 255)] {
            let (per_node, reroute) = buffer_caps(budget, members);
            assert!(reroute >= per_node);
            assert!(reroute <= per_node * members);
        }
    }
}
