use std::fmt::Display;

use thiserror::Error;

/// Why rows were dropped instead of being queued for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The reroute buffer is full and every member of the group is broken.
    AllNodesUnavailable,
    /// The rows kept failing to find a healthy node across reroute passes.
    RerouteExpired,
    /// The router stopped before the rows could be delivered.
    Shutdown,
}

impl Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AllNodesUnavailable => "all replicas unavailable",
            Self::RerouteExpired => "reroute attempts exhausted",
            Self::Shutdown => "router shut down before delivery",
        };
        f.write_str(s)
    }
}

/// Errors returned by the router.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration names no storage node.
    #[error("no storage nodes configured")]
    NoNodes,

    /// A storage node entry cannot be parsed.
    #[error("invalid storage node {entry:?}: {reason}")]
    InvalidNode { entry: String, reason: &'static str },

    /// More storage nodes than a cluster supports.
    #[error("too many storage nodes: {count}; at most {max} are supported")]
    TooManyNodes { count: usize, max: usize },

    /// The same address appears twice in one replication group.
    #[error("storage node {addr} is listed twice in group {group}")]
    DuplicateNode { group: String, addr: String },

    /// Replication needs at least one copy.
    #[error("replication factor must be at least 1")]
    ZeroReplicationFactor,

    /// The rows were not accepted and will never be delivered.
    #[error("{rows} rows dropped: {reason}")]
    RowsDropped { rows: usize, reason: DropReason },

    /// The rows were not accepted because the router is stopping.
    #[error("{rows} rows rejected: the router is shutting down")]
    ShuttingDown { rows: usize },

    /// A single chunk is larger than any buffer that could hold it.
    #[error("chunk of {size} bytes exceeds the buffer limit of {max} bytes")]
    ChunkTooLarge { size: usize, max: usize },

    /// A background worker thread could not be started.
    #[error("cannot spawn worker thread: {0}")]
    SpawnWorker(#[source] std::io::Error),
}

impl Error {
    /// The number of rows this error reports as not accepted, if any.
    pub fn rows(&self) -> usize {
        match self {
            Self::RowsDropped { rows, .. } | Self::ShuttingDown { rows } => *rows,
            _ => 0,
        }
    }
}

/// A specialized `Result` for router errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;
