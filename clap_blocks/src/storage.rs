//! CLI config for the storage nodes rows are routed to.

use std::time::Duration;

use router::{ClusterConfig, NodeAddr};

use crate::memory_size::MemorySize;

/// CLI config for the router's view of the storage cluster.
#[derive(Debug, Clone, clap::Parser)]
pub struct StorageConfig {
    /// Storage nodes to send rows to, as `addr` or `group/addr`.
    ///
    /// Nodes sharing a group name hold replicas of the same rows; rows are
    /// partitioned across groups. A missing port defaults to 8400.
    #[clap(
        long = "storage-node",
        env = "TSINSERT_STORAGE_NODES",
        required = true,
        num_args = 1..,
        value_delimiter = ',',
        action
    )]
    pub storage_nodes: Vec<NodeAddr>,

    /// Copies written of every row inside its group.
    ///
    /// Clamped to the number of nodes in the group.
    #[clap(
        long = "replication-factor",
        env = "TSINSERT_REPLICATION_FACTOR",
        default_value = "1",
        value_parser = clap::value_parser!(u64).range(1..),
        action
    )]
    pub replication_factor: u64,

    /// Memory for buffering rows, shared by the node and reroute buffers of
    /// all groups. Each group gets the share of its nodes.
    ///
    /// Can be given as absolute value in bytes, with a `KiB`, `MiB` or `GiB`
    /// suffix, or as a percentage of the total system memory.
    #[clap(
        long = "memory-budget",
        env = "TSINSERT_MEMORY_BUDGET",
        default_value = "8%",
        action
    )]
    pub memory_budget: MemorySize,

    /// Send rows to storage nodes uncompressed.
    #[clap(
        long = "rpc.disable-compression",
        env = "TSINSERT_RPC_DISABLE_COMPRESSION",
        default_value = "false",
        action
    )]
    pub disable_compression: bool,

    /// How often partially filled buffers are sent.
    #[clap(
        long = "rpc.flush-interval",
        env = "TSINSERT_RPC_FLUSH_INTERVAL",
        default_value = "1s",
        value_parser = humantime::parse_duration,
    )]
    pub flush_interval: Duration,

    /// Timeout for connecting to a storage node.
    #[clap(
        long = "rpc.dial-timeout",
        env = "TSINSERT_RPC_DIAL_TIMEOUT",
        default_value = "3s",
        value_parser = humantime::parse_duration,
    )]
    pub dial_timeout: Duration,

    /// Seed mixed into node selection.
    ///
    /// Routers writing to the same storage nodes must use the same seed.
    #[clap(
        long = "rpc.hash-seed",
        env = "TSINSERT_RPC_HASH_SEED",
        default_value = "0",
        action
    )]
    pub hash_seed: u64,

    /// Reroute passes after which a row that found no healthy node is
    /// dropped. 0 keeps retrying forever.
    #[clap(
        long = "rpc.max-reroute-passes",
        env = "TSINSERT_RPC_MAX_REROUTE_PASSES",
        default_value = "600",
        action
    )]
    pub max_reroute_passes: usize,

    /// Talk to storage nodes without the rpc envelope.
    #[clap(
        long = "rpc.legacy-protocol",
        env = "TSINSERT_RPC_LEGACY_PROTOCOL",
        default_value = "false",
        action
    )]
    pub legacy_protocol: bool,

    /// Drop rows a healthy storage node has no buffer space for instead of
    /// rerouting them to other nodes.
    #[clap(
        long = "rpc.drop-samples-on-overload",
        env = "TSINSERT_RPC_DROP_SAMPLES_ON_OVERLOAD",
        default_value = "false",
        action
    )]
    pub drop_samples_on_overload: bool,

    /// Wait for an unavailable storage node instead of rerouting its rows.
    ///
    /// Writers block until the node is back.
    #[clap(
        long = "rpc.disable-rerouting-on-unavailable",
        env = "TSINSERT_RPC_DISABLE_REROUTING_ON_UNAVAILABLE",
        default_value = "false",
        action
    )]
    pub disable_rerouting_on_unavailable: bool,

    /// How long rows wait for a broken storage node before they are
    /// rerouted to other nodes.
    #[clap(
        long = "rpc.reroute-delay",
        env = "TSINSERT_RPC_REROUTE_DELAY",
        default_value = "20s",
        value_parser = humantime::parse_duration,
    )]
    pub reroute_delay: Duration,
}

impl StorageConfig {
    pub fn to_cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            nodes: self.storage_nodes.clone(),
            replication_factor: usize::try_from(self.replication_factor).unwrap_or(usize::MAX),
            memory_budget: self.memory_budget.bytes(),
            compress: !self.disable_compression,
            flush_interval: self.flush_interval,
            dial_timeout: self.dial_timeout,
            hash_seed: self.hash_seed,
            max_reroute_passes: self.max_reroute_passes,
            legacy_protocol: self.legacy_protocol,
            drop_samples_on_overload: self.drop_samples_on_overload,
            disable_rerouting_on_unavailable: self.disable_rerouting_on_unavailable,
            reroute_delay: self.reroute_delay,
        }
    }
}
