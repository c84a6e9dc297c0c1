use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, select, tick};
use insert_protocol::unmarshal_row;
use parking_lot::{Condvar, Mutex};
use sharder::{RendezvousHash, hash_key};
use tracing::{debug, error, info, warn};

use crate::{
    BufRows, DropReason, Error, Result, StorageNode,
    config::buffer_caps,
    node::{Delivery, NodeSettings, NodeStats, READ_ONLY_CHECK_INTERVAL},
};

/// How long a blocked writer waits before re-checking node liveness.
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Minimum time between two shrinks of a worker's swap buffer.
const SHRINK_INTERVAL: Duration = Duration::from_secs(10);

/// Minimum time between two warnings about rows dropped on overload.
const OVERLOAD_WARN_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct GroupMetrics {
    rows_lost: AtomicU64,
    rows_incompletely_replicated: AtomicU64,
    reroutes_total: AtomicU64,
    rerouted_rows_processed: AtomicU64,
    rows_reroute_expired: AtomicU64,
}

/// A point in time copy of a [`ReplicationGroup`]'s counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub rows_lost: u64,
    pub rows_incompletely_replicated: u64,
    /// Chunks that entered the reroute buffer.
    pub reroutes_total: u64,
    pub rerouted_rows_processed: u64,
    pub rows_reroute_expired: u64,
    pub rerouted_pending_bytes: usize,
}

#[derive(Debug, Default)]
struct RerouteState {
    buf: BufRows,
    /// Bytes the reroute worker took out of `buf`: the rows of its current
    /// pass, then those it carries over to the next one. They count against
    /// the buffer cap until placed.
    held_bytes: usize,
}

/// Settings of a single [`ReplicationGroup`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct GroupSettings {
    pub(crate) node: NodeSettings,
    pub(crate) replication_factor: usize,
    pub(crate) memory_budget: usize,
    pub(crate) hash_seed: u64,
    pub(crate) max_reroute_passes: usize,
    pub(crate) policy: PushPolicy,
}

/// What [`ReplicationGroup::push`] does when a node cannot take rows.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PushPolicy {
    /// Drop rows a ready node has no room for, instead of rerouting them.
    pub(crate) drop_on_overload: bool,
    /// Wait for an unavailable node instead of rerouting its rows.
    pub(crate) disable_rerouting_on_unavailable: bool,
    /// How long a freshly broken node may recover before its rows are
    /// rerouted.
    pub(crate) reroute_delay: Duration,
}

impl Default for PushPolicy {
    fn default() -> Self {
        Self {
            drop_on_overload: false,
            disable_rerouting_on_unavailable: false,
            reroute_delay: Duration::ZERO,
        }
    }
}

/// Storage nodes holding copies of the same rows.
///
/// The group owns its nodes and a shared reroute buffer absorbing rows that a
/// node cannot take right now. A reroute worker spreads those rows over the
/// ready members. Writers block on a full reroute buffer until it drains,
/// except when no member is ready, in which case the rows are dropped.
#[derive(Debug)]
pub struct ReplicationGroup {
    name: String,
    nodes: Vec<StorageNode>,
    hash: RendezvousHash,
    replicas: usize,
    max_buf_size_per_node: usize,
    rerouted_buf_max_size: usize,
    max_reroute_passes: usize,
    policy: PushPolicy,

    stopping: AtomicBool,
    state: Mutex<RerouteState>,
    space_freed: Condvar,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    overload_warned_at: Mutex<Option<Instant>>,

    metrics: GroupMetrics,
}

impl ReplicationGroup {
    pub(crate) fn new(name: String, addrs: Vec<String>, settings: GroupSettings) -> Self {
        let (per_node, reroute) = buffer_caps(settings.memory_budget, addrs.len());
        let hash = RendezvousHash::new(addrs.iter().map(String::as_str), settings.hash_seed);

        let mut replicas = settings.replication_factor.max(1);
        if replicas > addrs.len() {
            warn!(
                group = %name,
                replication_factor = replicas,
                nodes = addrs.len(),
                "replication factor exceeds the group size; writing one copy per node",
            );
            replicas = addrs.len();
        }

        let nodes = addrs
            .into_iter()
            .map(|addr| StorageNode::new(addr, settings.node, per_node))
            .collect();
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);

        Self {
            name,
            nodes,
            hash,
            replicas,
            max_buf_size_per_node: per_node,
            rerouted_buf_max_size: reroute,
            max_reroute_passes: settings.max_reroute_passes,
            policy: settings.policy,
            stopping: AtomicBool::new(false),
            state: Default::default(),
            space_freed: Condvar::new(),
            wake_tx,
            wake_rx,
            overload_warned_at: Mutex::new(None),
            metrics: Default::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[StorageNode] {
        &self.nodes
    }

    /// The number of copies written of each row.
    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// The most bytes a single node buffer holds.
    pub fn max_buf_size_per_node(&self) -> usize {
        self.max_buf_size_per_node
    }

    pub fn rerouted_buf_max_size(&self) -> usize {
        self.rerouted_buf_max_size
    }

    /// The stable node choice for `key_hash`, skipping the indexes in
    /// `excluded`.
    pub(crate) fn select_node(&self, key_hash: u64, excluded: &[usize]) -> usize {
        self.hash.select_node(key_hash, excluded)
    }

    /// Replace `dst` with the indexes of nodes new rows should skip.
    ///
    /// A broken node stays eligible for the reroute delay, so a short outage
    /// does not move its series around.
    pub(crate) fn excluded_nodes(&self, dst: &mut Vec<usize>) {
        dst.clear();
        dst.extend(
            self.nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.is_excluded(self.policy.reroute_delay))
                .map(|(i, _)| i),
        );
    }

    pub fn stats(&self) -> GroupStats {
        let m = &self.metrics;
        let rerouted_pending_bytes = {
            let state = self.state.lock();
            state.buf.len() + state.held_bytes
        };
        GroupStats {
            rows_lost: m.rows_lost.load(Ordering::Relaxed),
            rows_incompletely_replicated: m.rows_incompletely_replicated.load(Ordering::Relaxed),
            reroutes_total: m.reroutes_total.load(Ordering::Relaxed),
            rerouted_rows_processed: m.rerouted_rows_processed.load(Ordering::Relaxed),
            rows_reroute_expired: m.rows_reroute_expired.load(Ordering::Relaxed),
            rerouted_pending_bytes,
        }
    }

    pub fn node_stats(&self) -> Vec<NodeStats> {
        self.nodes.iter().map(StorageNode::stats).collect()
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn none_ready(&self) -> bool {
        !self.nodes.iter().any(StorageNode::is_ready)
    }

    fn record_lost(&self, rows: usize) {
        self.metrics
            .rows_lost
            .fetch_add(rows as u64, Ordering::Relaxed);
    }

    /// Queue `rows` rows encoded in `buf` for the node at `idx`.
    ///
    /// A broken node is waited for during the reroute delay. A node that is
    /// still unavailable, or has no room, diverts the whole chunk to the
    /// reroute buffer, which may block. Rows a ready node has no room for
    /// are dropped instead when dropping on overload.
    pub(crate) fn push(&self, idx: usize, buf: &[u8], rows: usize) -> Result<()> {
        if self.is_stopping() {
            return Err(Error::ShuttingDown { rows });
        }
        let node = &self.nodes[idx];
        node.record_pushed(rows);

        self.wait_while_unavailable(node, rows)?;
        if node.try_push(buf, rows) {
            return Ok(());
        }
        if self.policy.drop_on_overload && !node.is_read_only() {
            node.record_dropped_on_overload(rows);
            self.warn_overload(node, rows);
            return Ok(());
        }

        self.add_to_rerouted_buf_may_block(buf, rows)?;
        node.record_rerouted_from_here(rows);
        Ok(())
    }

    /// Block while `node` is unavailable and its rows must not move yet.
    ///
    /// That is during the reroute delay of a broken node, or for as long as
    /// the node is not ready when rerouting on unavailability is disabled.
    fn wait_while_unavailable(&self, node: &StorageNode, rows: usize) -> Result<()> {
        loop {
            if self.is_stopping() {
                return Err(Error::ShuttingDown { rows });
            }
            let wait = if self.policy.disable_rerouting_on_unavailable {
                !node.is_ready()
            } else {
                node.is_broken()
                    && !node.is_read_only()
                    && node.broken_for() < self.policy.reroute_delay
            };
            if !wait {
                return Ok(());
            }
            node.wait_for_change(LIVENESS_CHECK_INTERVAL);
        }
    }

    fn warn_overload(&self, node: &StorageNode, rows: usize) {
        let mut warned_at = self.overload_warned_at.lock();
        if warned_at.is_some_and(|t| t.elapsed() < OVERLOAD_WARN_INTERVAL) {
            return;
        }
        *warned_at = Some(Instant::now());
        warn!(
            group = %self.name,
            addr = node.addr(),
            rows,
            "dropping rows: storage node cannot accept them now",
        );
    }

    /// Write `buf` to [`Self::replicas`] distinct healthy nodes, starting at
    /// `start` and wrapping around.
    ///
    /// A node with a full buffer does not count as a replica. With fewer
    /// healthy nodes than replicas the rows are written to as many as are
    /// available and the shortfall is counted. If no node accepts the rows
    /// they take the reroute path of `start`.
    pub(crate) fn replicate(&self, start: usize, buf: &[u8], rows: usize) -> Result<()> {
        if self.replicas == 1 {
            return self.push(start, buf, rows);
        }
        if self.is_stopping() {
            return Err(Error::ShuttingDown { rows });
        }
        self.wait_while_unavailable(&self.nodes[start], rows)?;

        let n = self.nodes.len();
        let mut copies = 0;
        for i in 0..n {
            if copies == self.replicas {
                break;
            }
            let node = &self.nodes[(start + i) % n];
            if !node.try_push(buf, rows) {
                continue;
            }
            node.record_pushed(rows);
            copies += 1;
        }

        match copies {
            0 => self.push(start, buf, rows),
            c if c < self.replicas => {
                self.metrics
                    .rows_incompletely_replicated
                    .fetch_add(rows as u64, Ordering::Relaxed);
                warn!(
                    group = %self.name,
                    copies = c,
                    replicas = self.replicas,
                    rows,
                    bytes = buf.len(),
                    "cannot make all copies since some storage nodes are unavailable",
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Append `buf` to the reroute buffer, blocking while it is full.
    ///
    /// Returns an error without blocking when the buffer is full and no
    /// member is ready, and unblocks with an error on shutdown.
    pub fn add_to_rerouted_buf_may_block(&self, buf: &[u8], rows: usize) -> Result<()> {
        if buf.len() > self.rerouted_buf_max_size {
            return Err(Error::ChunkTooLarge {
                size: buf.len(),
                max: self.rerouted_buf_max_size,
            });
        }

        let mut state = self.state.lock();
        loop {
            if self.is_stopping() {
                return Err(Error::ShuttingDown { rows });
            }
            if state.buf.len() + state.held_bytes + buf.len() <= self.rerouted_buf_max_size {
                state.buf.extend(buf, rows);
                let wake = state.buf.len() > self.rerouted_buf_max_size / 4;
                drop(state);

                self.metrics.reroutes_total.fetch_add(1, Ordering::Relaxed);
                if wake {
                    let _ = self.wake_tx.try_send(());
                }
                return Ok(());
            }
            if self.none_ready() {
                drop(state);
                self.record_lost(rows);
                error!(
                    group = %self.name,
                    rows,
                    bytes = buf.len(),
                    "dropping rows: reroute buffer is full and all storage nodes are unavailable",
                );
                return Err(Error::RowsDropped {
                    rows,
                    reason: DropReason::AllNodesUnavailable,
                });
            }
            self.space_freed
                .wait_for(&mut state, LIVENESS_CHECK_INTERVAL);
        }
    }

    /// Hand a block a node failed to send to the reroute buffer without
    /// blocking.
    ///
    /// Only done while another member is ready, so the rows can actually
    /// move elsewhere. Returns whether `br` was taken.
    fn try_reroute_failed(&self, idx: usize, br: &mut BufRows) -> bool {
        if self.is_stopping() {
            return false;
        }
        let others_healthy = self
            .nodes
            .iter()
            .enumerate()
            .any(|(i, n)| i != idx && n.is_ready());
        if !others_healthy {
            return false;
        }

        let wake = {
            let mut state = self.state.lock();
            if state.buf.len() + state.held_bytes + br.len() > self.rerouted_buf_max_size {
                return false;
            }
            state.buf.extend(&br.buf, br.rows);
            state.buf.len() > self.rerouted_buf_max_size / 4
        };
        self.metrics.reroutes_total.fetch_add(1, Ordering::Relaxed);
        self.nodes[idx].record_rerouted_from_here(br.rows);
        br.reset();
        if wake {
            let _ = self.wake_tx.try_send(());
        }
        true
    }

    /// Flag the group as stopping and wake every blocked writer.
    pub(crate) fn begin_stop(&self) {
        {
            let _state = self.state.lock();
            self.stopping.store(true, Ordering::SeqCst);
        }
        self.space_freed.notify_all();
        for n in &self.nodes {
            n.notify_state_change();
        }
    }

    /// Move the reroute buffer into the empty `br` for a pass that also
    /// covers `carried`. The taken rows stay counted against the cap.
    fn take_rerouted(&self, br: &mut BufRows, carried: &Carried) {
        let mut state = self.state.lock();
        std::mem::swap(&mut state.buf, br);
        state.held_bytes = br.len() + carried.rows.len();
    }

    /// Release the space of every row placed or dropped by the last pass;
    /// `carried` is what is left for the next one.
    fn finish_pass(&self, carried: &Carried) {
        self.state.lock().held_bytes = carried.rows.len();
        self.space_freed.notify_all();
    }

    /// Place one encoded row on a healthy node, starting at a position
    /// derived from the row key and trying every member once.
    fn place_rerouted_row(&self, row: &[u8], key: &[u8]) -> bool {
        let n = self.nodes.len();
        let start = (hash_key(key) % n as u64) as usize;
        (0..n).any(|i| {
            self.nodes[(start + i) % n].try_push_rerouted(row, 1)
        })
    }

    /// One pass over `br` followed by the rows carried from earlier passes.
    ///
    /// Rows that find no node are moved to `next`, along with their pass
    /// counts, unless they exceeded the pass limit.
    fn reroute_pass(&self, br: &BufRows, carried: &Carried, next: &mut Carried) {
        let mut expired = 0;
        let mut placed = 0;

        let fresh = RowSlices::new(&br.buf).map(|r| (r, 0));
        let old = RowSlices::new(&carried.rows.buf).zip(carried.passes.iter().copied());
        for (row, passes) in old.chain(fresh) {
            let (raw, key) = match row {
                Ok(v) => v,
                Err(e) => {
                    error!(group = %self.name, error = %e, "dropping undecodable rerouted rows");
                    break;
                }
            };
            if self.place_rerouted_row(raw, key) {
                placed += 1;
                continue;
            }
            let passes = passes + 1;
            if self.max_reroute_passes > 0 && passes as usize >= self.max_reroute_passes {
                expired += 1;
                continue;
            }
            next.rows.extend(raw, 1);
            next.passes.push(passes);
        }

        self.metrics
            .rerouted_rows_processed
            .fetch_add(placed, Ordering::Relaxed);
        if expired > 0 {
            self.metrics
                .rows_reroute_expired
                .fetch_add(expired, Ordering::Relaxed);
            self.record_lost(expired as usize);
            error!(
                group = %self.name,
                rows = expired,
                passes = self.max_reroute_passes,
                "dropping rerouted rows that found no healthy storage node",
            );
        }
    }
}

/// Rows the reroute worker could not place yet.
#[derive(Debug, Default)]
struct Carried {
    rows: BufRows,
    /// Failed passes per row, in buffer order.
    passes: Vec<u32>,
}

impl Carried {
    fn clear(&mut self) {
        self.rows.reset();
        self.passes.clear();
    }
}

/// Iterate over the raw encoding and key of each row in a block.
struct RowSlices<'a> {
    tail: &'a [u8],
}

impl<'a> RowSlices<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { tail: buf }
    }
}

impl<'a> Iterator for RowSlices<'a> {
    type Item = insert_protocol::Result<(&'a [u8], &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.tail.is_empty() {
            return None;
        }
        match unmarshal_row(self.tail) {
            Ok((row, rest)) => {
                let raw = &self.tail[..self.tail.len() - rest.len()];
                self.tail = rest;
                Some(Ok((raw, row.key)))
            }
            Err(e) => {
                self.tail = &[];
                Some(Err(e))
            }
        }
    }
}

/// Flush the outgoing buffer of `group.nodes()[idx]` until `stop` closes.
pub(crate) fn run_node_worker(
    group: Arc<ReplicationGroup>,
    idx: usize,
    stop: Receiver<()>,
    flush_interval: Duration,
) {
    let node = &group.nodes[idx];
    let ticker = tick(flush_interval);
    let mut br = BufRows::default();
    let mut last_shrink = Instant::now();
    let mut last_read_only_check = Instant::now();

    debug!(group = %group.name, addr = node.addr(), "node worker started");
    loop {
        let ready = br.is_empty() && node.pending_bytes() > node.max_buf_size() / 4;
        let mut stopping = false;
        if !ready {
            select! {
                recv(stop) -> _ => stopping = true,
                recv(ticker) -> _ => {},
                recv(node.wake_rx) -> _ => {},
            }
        }

        if stopping {
            flush_on_stop(&group, node, &mut br);
            break;
        }

        if node.is_read_only() && last_read_only_check.elapsed() >= READ_ONLY_CHECK_INTERVAL {
            node.check_read_only();
            last_read_only_check = Instant::now();
        }

        if br.is_empty() {
            node.take_buf(&mut br);
        }
        if last_shrink.elapsed() > SHRINK_INTERVAL && br.shrink_if_sparse() {
            last_shrink = Instant::now();
        }
        if br.is_empty() {
            node.check_health();
            continue;
        }

        // A read-only node discards whatever it is sent.
        let stored = !node.is_read_only() && node.send_buf(&br).ok() == Some(Delivery::Stored);
        if stored || group.try_reroute_failed(idx, &mut br) {
            br.reset();
        }
        // Otherwise keep br and retry on the next tick.
    }
    debug!(group = %group.name, addr = node.addr(), "node worker stopped");
}

fn flush_on_stop(group: &ReplicationGroup, node: &StorageNode, br: &mut BufRows) {
    loop {
        if br.is_empty() {
            node.take_buf(br);
        }
        if br.is_empty() {
            return;
        }
        if node.send_buf(br).ok() != Some(Delivery::Stored) {
            let mut rows = br.rows;
            br.reset();
            node.take_buf(br);
            rows += br.rows;
            group.record_lost(rows);
            error!(
                group = %group.name,
                addr = node.addr(),
                rows,
                reason = %DropReason::Shutdown,
                "dropping unsent rows",
            );
            return;
        }
        br.reset();
    }
}

/// Spread rerouted rows over the healthy members of `group` until `stop`
/// closes.
pub(crate) fn run_reroute_worker(
    group: Arc<ReplicationGroup>,
    stop: Receiver<()>,
    flush_interval: Duration,
) {
    let ticker = tick(flush_interval);
    let mut br = BufRows::default();
    let mut carried = Carried::default();
    let mut next = Carried::default();

    debug!(group = %group.name, "reroute worker started");
    loop {
        let ready = group.state.lock().buf.len() > group.rerouted_buf_max_size / 4;
        let mut stopping = false;
        if !ready {
            select! {
                recv(stop) -> _ => stopping = true,
                recv(ticker) -> _ => {},
                recv(group.wake_rx) -> _ => {},
            }
        }

        group.take_rerouted(&mut br, &carried);
        if br.is_empty() && carried.passes.is_empty() {
            if stopping {
                break;
            }
            continue;
        }

        group.reroute_pass(&br, &carried, &mut next);
        br.reset();
        std::mem::swap(&mut carried, &mut next);
        next.clear();
        group.finish_pass(&carried);

        if stopping {
            break;
        }
    }

    // Rows still waiting here have no way out once node workers stop.
    let mut left = carried.rows.rows;
    {
        let mut state = group.state.lock();
        left += state.buf.rows;
        state.buf.reset();
        state.held_bytes = 0;
    }
    if left > 0 {
        group.record_lost(left);
        error!(
            group = %group.name,
            rows = left,
            reason = %DropReason::Shutdown,
            "dropping rows left in the reroute buffer",
        );
    }
    info!(group = %group.name, "reroute worker stopped");
}
