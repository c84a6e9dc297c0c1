use std::sync::Arc;

use insert_protocol::{marshal_bytes, marshal_row, marshaled_row_len};
use sharder::{hash_key, partition_for};

use crate::{BufRows, DropReason, Error, ReplicationGroup, Result};

/// Per caller scratch state for writing rows into a cluster.
///
/// Rows are staged per destination node and handed to the nodes on
/// [`Self::flush_bufs`], or as soon as a staging buffer would exceed the
/// node's buffer cap. Obtain one through
/// [`Cluster::context`](crate::Cluster::context).
#[derive(Debug, Default)]
pub struct RouterContext {
    groups: Arc<[Arc<ReplicationGroup>]>,
    /// Encoded labels of the row being built.
    labels: Vec<u8>,
    /// Staging buffers indexed by group, then node.
    bufs: Vec<Vec<BufRows>>,
    staged_rows: usize,
    excluded: Vec<usize>,
}

impl RouterContext {
    pub(crate) fn new(groups: Arc<[Arc<ReplicationGroup>]>) -> Self {
        let bufs = groups
            .iter()
            .map(|g| vec![BufRows::default(); g.nodes().len()])
            .collect();
        Self {
            groups,
            labels: Vec::new(),
            bufs,
            staged_rows: 0,
            excluded: Vec::new(),
        }
    }

    /// Add a label to the identity of the next data point.
    ///
    /// The bytes are copied; the caller may reuse them immediately.
    pub fn add_label(&mut self, name: &[u8], value: &[u8]) {
        marshal_bytes(&mut self.labels, name);
        marshal_bytes(&mut self.labels, value);
    }

    /// Stage a data point identified by the labels added since the last one.
    ///
    /// The labels are cleared whatever the outcome.
    pub fn write_data_point(&mut self, timestamp: i64, value: f64) -> Result<()> {
        let labels = std::mem::take(&mut self.labels);
        let res = self.write_row(&labels, timestamp, value);
        self.labels = labels;
        self.labels.clear();
        res
    }

    /// Stage a row with an already encoded `key`.
    ///
    /// The row goes to the group its key partitions into and to the
    /// rendezvous choice among that group's eligible nodes. An error reports
    /// rows of an earlier chunk that could not be handed on; this row is
    /// staged regardless.
    pub fn write_row(&mut self, key: &[u8], timestamp: i64, value: f64) -> Result<()> {
        let key_hash = hash_key(key);
        let group_idx = match self.groups.len() {
            1 => 0,
            n => partition_for(key_hash, n),
        };
        let group = &self.groups[group_idx];

        group.excluded_nodes(&mut self.excluded);
        let node_idx = group.select_node(key_hash, &self.excluded);

        let row_len = marshaled_row_len(key.len());
        let max = group.max_buf_size_per_node();
        if row_len > max {
            return Err(Error::ChunkTooLarge { size: row_len, max });
        }

        let staged = &mut self.bufs[group_idx][node_idx];
        let mut res = Ok(());
        if staged.len() + row_len > max {
            res = group.replicate(node_idx, &staged.buf, staged.rows);
            self.staged_rows -= staged.rows;
            staged.reset();
        }
        marshal_row(&mut staged.buf, key, timestamp, value);
        staged.rows += 1;
        self.staged_rows += 1;
        res
    }

    /// The number of rows staged and not yet handed to a node.
    pub fn staged_rows(&self) -> usize {
        self.staged_rows
    }

    /// Hand every staged row to its node.
    ///
    /// All buffers are flushed even when some fail; the error sums up the
    /// rows that were not accepted.
    pub fn flush_bufs(&mut self) -> Result<()> {
        let mut dropped = 0;
        let mut reason = None;
        let mut rejected = 0;
        let mut other = None;

        for (group, bufs) in self.groups.iter().zip(&mut self.bufs) {
            for (node_idx, staged) in bufs.iter_mut().enumerate() {
                if staged.is_empty() {
                    continue;
                }
                match group.replicate(node_idx, &staged.buf, staged.rows) {
                    Ok(()) => {}
                    Err(Error::RowsDropped { rows, reason: r }) => {
                        dropped += rows;
                        reason.get_or_insert(r);
                    }
                    Err(Error::ShuttingDown { rows }) => rejected += rows,
                    Err(e) => {
                        other.get_or_insert(e);
                    }
                }
                staged.reset();
            }
        }
        self.staged_rows = 0;

        if let Some(e) = other {
            return Err(e);
        }
        match (dropped, rejected) {
            (0, 0) => Ok(()),
            (0, rows) => Err(Error::ShuttingDown { rows }),
            (rows, also) => Err(Error::RowsDropped {
                rows: rows + also,
                reason: reason.unwrap_or(DropReason::AllNodesUnavailable),
            }),
        }
    }

    /// Discard staged rows and labels, keeping the allocations.
    pub(crate) fn reset(&mut self) {
        self.labels.clear();
        for staged in self.bufs.iter_mut().flatten() {
            staged.reset();
        }
        self.staged_rows = 0;
    }
}
