use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use insert_protocol::{
    Ack, BufferedConn, ProtocolMode, RpcCall, send_block, send_empty_block,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::BufRows;

/// How often a read-only node is asked whether it accepts writes again.
pub(crate) const READ_ONLY_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// How a storage node answered a delivered block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// The rows are stored.
    Stored,
    /// The node is read-only and discarded the rows.
    Discarded,
}

/// Connection settings shared by all nodes of a cluster.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeSettings {
    pub(crate) compress: bool,
    pub(crate) dial_timeout: Duration,
    pub(crate) legacy_protocol: bool,
}

#[derive(Debug, Default)]
struct NodeMetrics {
    dial_errors: AtomicU64,
    handshake_errors: AtomicU64,
    connection_errors: AtomicU64,
    rows_pushed: AtomicU64,
    rows_sent: AtomicU64,
    rows_rerouted_from_here: AtomicU64,
    rows_rerouted_to_here: AtomicU64,
    read_only_acks: AtomicU64,
    rows_dropped_on_overload: AtomicU64,
}

/// A point in time copy of a [`StorageNode`]'s counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub dial_errors: u64,
    pub handshake_errors: u64,
    pub connection_errors: u64,
    pub rows_pushed: u64,
    pub rows_sent: u64,
    pub rows_rerouted_from_here: u64,
    pub rows_rerouted_to_here: u64,
    pub read_only_acks: u64,
    pub rows_dropped_on_overload: u64,
    pub pending_rows: usize,
    pub pending_bytes: usize,
    pub is_broken: bool,
    pub is_read_only: bool,
}

#[derive(Debug)]
struct ConnState {
    conn: Option<BufferedConn>,
    /// The hello used for the next dial.
    mode: ProtocolMode,
}

/// The client side of one remote storage process.
///
/// Rows are queued in an in-memory buffer and written out by a background
/// worker over a single lazily dialed connection. The buffer and the
/// connection sit behind separate locks so queueing never waits on the
/// network.
///
/// A node is ready for new rows while it is neither broken nor read-only.
#[derive(Debug)]
pub struct StorageNode {
    addr: String,
    settings: NodeSettings,
    max_buf_size: usize,

    broken: AtomicBool,
    read_only: AtomicBool,
    created: Instant,
    /// Milliseconds after `created` of the last healthy to broken switch.
    broken_at_ms: AtomicU64,
    /// Signalled whenever the node becomes ready or unready.
    state_lock: Mutex<()>,
    state_changed: Condvar,
    buf: Mutex<BufRows>,
    conn: Mutex<ConnState>,

    wake_tx: Sender<()>,
    pub(crate) wake_rx: Receiver<()>,

    metrics: NodeMetrics,
}

impl StorageNode {
    pub(crate) fn new(addr: String, settings: NodeSettings, max_buf_size: usize) -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let mode = if settings.legacy_protocol {
            ProtocolMode::Legacy
        } else {
            ProtocolMode::Rpc
        };
        Self {
            addr,
            settings,
            max_buf_size,
            broken: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            created: Instant::now(),
            broken_at_ms: AtomicU64::new(0),
            state_lock: Mutex::new(()),
            state_changed: Condvar::new(),
            buf: Default::default(),
            conn: Mutex::new(ConnState { conn: None, mode }),
            wake_tx,
            wake_rx,
            metrics: Default::default(),
        }
    }

    /// The dial target.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether the node is currently considered unreachable.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
    }

    /// Whether the node only acknowledges writes without storing them.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    /// Whether the node takes new rows.
    pub fn is_ready(&self) -> bool {
        !self.is_broken() && !self.is_read_only()
    }

    /// Set the broken flag, returning the previous value.
    pub(crate) fn set_broken(&self, broken: bool) -> bool {
        let was = self.broken.swap(broken, Ordering::Relaxed);
        if broken && !was {
            let now = self.created.elapsed().as_millis() as u64;
            self.broken_at_ms.store(now, Ordering::Relaxed);
        }
        if was != broken {
            self.notify_state_change();
        }
        was
    }

    /// Set the read-only flag, returning the previous value.
    pub(crate) fn set_read_only(&self, read_only: bool) -> bool {
        let was = self.read_only.swap(read_only, Ordering::Relaxed);
        if was != read_only {
            self.notify_state_change();
        }
        was
    }

    /// How long the node has been broken; zero while it is healthy.
    pub(crate) fn broken_for(&self) -> Duration {
        if !self.is_broken() {
            return Duration::ZERO;
        }
        let since = Duration::from_millis(self.broken_at_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(since)
    }

    /// Whether new rows should skip this node: it is read-only, or broken
    /// for at least `reroute_delay`.
    pub(crate) fn is_excluded(&self, reroute_delay: Duration) -> bool {
        self.is_read_only() || (self.is_broken() && self.broken_for() >= reroute_delay)
    }

    /// Wait until the node changes state or `timeout` passes.
    pub(crate) fn wait_for_change(&self, timeout: Duration) {
        let mut guard = self.state_lock.lock();
        self.state_changed.wait_for(&mut guard, timeout);
    }

    /// Wake every writer waiting on this node.
    pub(crate) fn notify_state_change(&self) {
        let _guard = self.state_lock.lock();
        self.state_changed.notify_all();
    }

    pub(crate) fn max_buf_size(&self) -> usize {
        self.max_buf_size
    }

    pub fn stats(&self) -> NodeStats {
        let m = &self.metrics;
        let (pending_rows, pending_bytes) = {
            let buf = self.buf.lock();
            (buf.rows, buf.len())
        };
        NodeStats {
            dial_errors: m.dial_errors.load(Ordering::Relaxed),
            handshake_errors: m.handshake_errors.load(Ordering::Relaxed),
            connection_errors: m.connection_errors.load(Ordering::Relaxed),
            rows_pushed: m.rows_pushed.load(Ordering::Relaxed),
            rows_sent: m.rows_sent.load(Ordering::Relaxed),
            rows_rerouted_from_here: m.rows_rerouted_from_here.load(Ordering::Relaxed),
            rows_rerouted_to_here: m.rows_rerouted_to_here.load(Ordering::Relaxed),
            read_only_acks: m.read_only_acks.load(Ordering::Relaxed),
            rows_dropped_on_overload: m.rows_dropped_on_overload.load(Ordering::Relaxed),
            pending_rows,
            pending_bytes,
            is_broken: self.is_broken(),
            is_read_only: self.is_read_only(),
        }
    }

    /// Append `buf` to the outgoing buffer if the node is ready and the rows
    /// fit under the cap.
    ///
    /// Wakes the worker once more than a quarter of the cap is queued.
    pub(crate) fn try_push(&self, buf: &[u8], rows: usize) -> bool {
        if !self.is_ready() {
            return false;
        }
        let len = {
            let mut queued = self.buf.lock();
            if !self.is_ready() || queued.len() + buf.len() > self.max_buf_size {
                return false;
            }
            queued.extend(buf, rows);
            queued.len()
        };
        if len > self.max_buf_size / 4 {
            self.wake();
        }
        true
    }

    /// [`Self::try_push`] for rows moved here from another node.
    pub(crate) fn try_push_rerouted(&self, buf: &[u8], rows: usize) -> bool {
        let ok = self.try_push(buf, rows);
        if ok {
            self.metrics
                .rows_rerouted_to_here
                .fetch_add(rows as u64, Ordering::Relaxed);
        }
        ok
    }

    pub(crate) fn record_pushed(&self, rows: usize) {
        self.metrics
            .rows_pushed
            .fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_on_overload(&self, rows: usize) {
        self.metrics
            .rows_dropped_on_overload
            .fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_rerouted_from_here(&self, rows: usize) {
        self.metrics
            .rows_rerouted_from_here
            .fetch_add(rows as u64, Ordering::Relaxed);
    }

    fn wake(&self) {
        // A full channel already holds a pending wakeup.
        let _ = self.wake_tx.try_send(());
    }

    /// Swap the outgoing buffer with the empty `dst`.
    pub(crate) fn take_buf(&self, dst: &mut BufRows) {
        debug_assert!(dst.is_empty());
        std::mem::swap(&mut *self.buf.lock(), dst);
    }

    /// The number of bytes waiting in the outgoing buffer.
    pub(crate) fn pending_bytes(&self) -> usize {
        self.buf.lock().len()
    }

    /// Deliver `br` over the connection, dialing first if necessary.
    ///
    /// Any failure closes the connection and marks the node broken. A
    /// read-only ack marks the node read-only. Unless the rows were stored,
    /// `br` is left untouched for the caller to reroute or retry.
    pub(crate) fn send_buf(&self, br: &BufRows) -> insert_protocol::Result<Delivery> {
        let mut state = self.conn.lock();

        let mut conn = match state.conn.take() {
            Some(conn) => conn,
            None => self.dial(&mut state).inspect_err(|e| self.mark_broken(br, e))?,
        };

        match send_block(&mut conn, RpcCall::WriteRows, &br.buf) {
            Ok(ack) => {
                state.conn = Some(conn);
                if self.set_broken(false) {
                    info!(addr = %self.addr, "storage node is healthy again");
                }
                let delivery = self.record_ack(ack);
                if delivery == Delivery::Stored {
                    self.metrics
                        .rows_sent
                        .fetch_add(br.rows as u64, Ordering::Relaxed);
                }
                Ok(delivery)
            }
            Err(e) => {
                Self::close(conn, &self.addr);
                self.metrics
                    .connection_errors
                    .fetch_add(1, Ordering::Relaxed);
                self.mark_broken(br, &e);
                Err(e)
            }
        }
    }

    fn close(conn: BufferedConn, addr: &str) {
        if let Err(e) = conn.close() {
            debug!(%addr, error = %e, "cannot close connection");
        }
    }

    fn record_ack(&self, ack: Ack) -> Delivery {
        let read_only = ack == Ack::ReadOnly;
        if read_only {
            self.metrics.read_only_acks.fetch_add(1, Ordering::Relaxed);
        }
        if self.set_read_only(read_only) != read_only {
            if read_only {
                warn!(addr = %self.addr, "storage node is read-only; rerouting its rows");
            } else {
                info!(addr = %self.addr, "storage node accepts writes again");
            }
        }
        if read_only {
            Delivery::Discarded
        } else {
            Delivery::Stored
        }
    }

    /// Ask a read-only node with an empty block whether it is writable again.
    pub(crate) fn check_read_only(&self) {
        if !self.is_read_only() {
            return;
        }
        let mut state = self.conn.lock();
        let mut conn = match state.conn.take() {
            Some(conn) => conn,
            None => match self.dial(&mut state) {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(addr = %self.addr, error = %e, "cannot check read-only storage node");
                    return;
                }
            },
        };

        match send_empty_block(&mut conn) {
            Ok(ack) => {
                state.conn = Some(conn);
                self.record_ack(ack);
            }
            Err(e) => {
                Self::close(conn, &self.addr);
                self.metrics
                    .connection_errors
                    .fetch_add(1, Ordering::Relaxed);
                self.mark_broken(&BufRows::default(), &e);
            }
        }
    }

    fn mark_broken(&self, br: &BufRows, error: &insert_protocol::Error) {
        // Only the first failure of an outage is logged.
        if !self.set_broken(true) {
            warn!(
                addr = %self.addr,
                rows = br.rows,
                bytes = br.len(),
                %error,
                "cannot send rows to storage node; rerouting to healthy nodes",
            );
        } else {
            debug!(addr = %self.addr, %error, "storage node still unavailable");
        }
    }

    /// Try to bring a broken node back without waiting for pending data.
    pub(crate) fn check_health(&self) {
        if !self.is_broken() {
            return;
        }
        let mut state = self.conn.lock();
        if !self.is_broken() {
            return;
        }
        match self.dial(&mut state) {
            Ok(conn) => {
                state.conn = Some(conn);
                self.set_broken(false);
                info!(addr = %self.addr, mode = %state.mode, "storage node is healthy again");
            }
            Err(e) => debug!(addr = %self.addr, error = %e, "storage node health check failed"),
        }
    }

    /// Dial and handshake with the preferred protocol mode, falling back to
    /// the legacy framing for good when the peer refuses the RPC hello.
    fn dial(&self, state: &mut ConnState) -> insert_protocol::Result<BufferedConn> {
        let connect = |mode| {
            BufferedConn::connect(
                &self.addr,
                self.settings.dial_timeout,
                self.settings.compress,
                mode,
            )
        };

        let err = match connect(state.mode) {
            Ok(conn) => return Ok(conn),
            Err(e) => e,
        };
        self.record_dial_error(&err);
        if state.mode != ProtocolMode::Rpc || !err.is_hello_rejected() {
            return Err(err);
        }

        let conn = connect(ProtocolMode::Legacy).inspect_err(|e| self.record_dial_error(e))?;
        info!(addr = %self.addr, "storage node rejected the rpc hello; using the legacy protocol");
        state.mode = ProtocolMode::Legacy;
        Ok(conn)
    }

    fn record_dial_error(&self, e: &insert_protocol::Error) {
        let counter = match e {
            insert_protocol::Error::Dial { .. } => &self.metrics.dial_errors,
            _ => &self.metrics.handshake_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// The protocol mode used for the next dial.
    pub fn protocol_mode(&self) -> ProtocolMode {
        self.conn.lock().mode
    }
}
