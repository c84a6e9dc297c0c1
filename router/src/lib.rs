//! The write path from ingestion handlers to storage nodes.
//!
//! A [`Cluster`] owns one [`ReplicationGroup`] per configured group name.
//! Writers stage rows into a [`RouterContext`]:
//!
//! ```text
//!    RouterContext::write_row
//!            │
//!            ├─ partition_for(key) ──▶ ReplicationGroup
//!            │
//!            └─ rendezvous(key, healthy nodes) ──▶ staging buffer
//!                                                      │ flush_bufs
//!                                                      ▼
//!                          ReplicationGroup::replicate ──▶ StorageNode buffers
//!                                      │                       │ node worker
//!                            full / broken                     ▼
//!                                      ▼                  storage node (TCP)
//!                               reroute buffer ──▶ reroute worker ──▶ healthy nodes
//! ```
//!
//! Every node has a worker thread delivering its buffer, and every group has
//! a reroute worker spreading rows that a node could not take over the
//! healthy members. Writers only block when the reroute buffer is full, and
//! never when no member is left to drain it.

mod buf_rows;
mod cluster;
pub mod config;
mod context;
mod error;
mod group;
mod node;

pub use buf_rows::BufRows;
pub use cluster::{Cluster, ClusterStats, GroupReport, PooledContext};
pub use config::{ClusterConfig, NodeAddr};
pub use context::RouterContext;
pub use error::{DropReason, Error, Result};
pub use group::{GroupStats, ReplicationGroup};
pub use node::{NodeStats, StorageNode};
