//! The storage peer side of the protocol.
//!
//! [`StorageServer`] accepts connections on a thread, handshakes each one on
//! its own thread, and hands every received block to a [`BlockHandler`] after
//! acknowledging it.

use std::{
    collections::HashMap,
    fmt::Debug,
    io,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{Ack, BufferedConn, Result, RpcCall, read_block, write_ack};

const ACK_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Receives the blocks read by a [`StorageServer`].
pub trait BlockHandler: Send + Sync + Debug + 'static {
    /// Process one acknowledged block. An error closes the connection.
    fn handle_block(&self, peer: SocketAddr, call: RpcCall, block: &[u8]) -> Result<()>;
}

/// Static settings of a [`StorageServer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerConfig {
    /// Compress everything written back to clients.
    pub compress: bool,
    /// Acknowledge blocks with [`Ack::ReadOnly`] and drop them.
    pub read_only: bool,
    /// Refuse the RPC hello like a peer that only knows the legacy framing.
    pub legacy_only: bool,
}

#[derive(Debug)]
struct Shared {
    config: ServerConfig,
    handler: Arc<dyn BlockHandler>,
    stop: AtomicBool,
    reject: AtomicBool,
    read_only: AtomicBool,
    next_conn_id: AtomicU64,
    conns: Mutex<HashMap<u64, TcpStream>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn drop_conns(&self) {
        for (_, stream) in self.conns.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// A thread-per-connection acceptor for insert connections.
///
/// Dropping the server stops it.
#[derive(Debug)]
pub struct StorageServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    acceptor: Option<JoinHandle<()>>,
}

impl StorageServer {
    /// Listen on `addr` and start accepting connections.
    pub fn bind(
        addr: impl std::net::ToSocketAddrs,
        config: ServerConfig,
        handler: Arc<dyn BlockHandler>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            config,
            handler,
            stop: AtomicBool::new(false),
            reject: AtomicBool::new(false),
            read_only: AtomicBool::new(config.read_only),
            next_conn_id: AtomicU64::new(0),
            conns: Default::default(),
            workers: Default::default(),
        });

        let acceptor = thread::Builder::new()
            .name(format!("insert-accept-{}", local_addr.port()))
            .spawn({
                let shared = Arc::clone(&shared);
                move || accept_loop(listener, shared)
            })?;

        info!(%local_addr, legacy_only = config.legacy_only, "accepting insert connections");
        Ok(Self {
            local_addr,
            shared,
            acceptor: Some(acceptor),
        })
    }

    /// The bound address; useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Simulate an outage.
    ///
    /// While rejecting, open connections are dropped without acknowledging
    /// anything still in flight and new connections are closed before the
    /// handshake.
    pub fn set_reject(&self, reject: bool) {
        self.shared.reject.store(reject, Ordering::SeqCst);
        if reject {
            self.shared.drop_conns();
        }
        info!(addr = %self.local_addr, reject, "changed reject mode");
    }

    /// Switch between storing blocks and acknowledging them as read-only.
    pub fn set_read_only(&self, read_only: bool) {
        self.shared.read_only.store(read_only, Ordering::SeqCst);
    }

    /// The number of currently open connections.
    pub fn open_connections(&self) -> usize {
        self.shared.conns.lock().len()
    }

    /// Stop accepting, close all connections and wait for their threads.
    pub fn stop(&mut self) {
        let Some(acceptor) = self.acceptor.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::SeqCst);
        let _ = acceptor.join();

        self.shared.drop_conns();
        let workers = std::mem::take(&mut *self.shared.workers.lock());
        for w in workers {
            let _ = w.join();
        }
        info!(addr = %self.local_addr, "stopped insert server");
    }
}

impl Drop for StorageServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while !shared.stop.load(Ordering::SeqCst) {
        let (stream, peer) = match listener.accept() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
            Err(e) => {
                warn!(error = %e, "cannot accept insert connection");
                thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
        };

        if shared.reject.load(Ordering::SeqCst) {
            debug!(%peer, "rejecting insert connection");
            let _ = stream.shutdown(Shutdown::Both);
            continue;
        }

        if let Err(e) = spawn_conn(stream, peer, &shared) {
            warn!(%peer, error = %e, "cannot start insert connection");
        }
    }
}

fn spawn_conn(stream: TcpStream, peer: SocketAddr, shared: &Arc<Shared>) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;

    let id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
    shared.conns.lock().insert(id, stream.try_clone()?);
    // set_reject may have drained the connections between the accept and
    // the insert above.
    if shared.reject.load(Ordering::SeqCst) {
        shared.conns.lock().remove(&id);
        debug!(%peer, "rejecting insert connection");
        let _ = stream.shutdown(Shutdown::Both);
        return Ok(());
    }

    let handle = thread::Builder::new()
        .name(format!("insert-conn-{id}"))
        .spawn({
            let shared = Arc::clone(shared);
            move || {
                match serve_conn(stream, peer, &shared) {
                    Ok(()) => debug!(%peer, "insert connection closed"),
                    Err(e) if shared.stop.load(Ordering::SeqCst) => {
                        debug!(%peer, error = %e, "insert connection closed on shutdown")
                    }
                    Err(e) => warn!(%peer, error = %e, "insert connection failed"),
                }
                shared.conns.lock().remove(&id);
            }
        })?;

    let mut workers = shared.workers.lock();
    workers.retain(|w| !w.is_finished());
    workers.push(handle);
    Ok(())
}

fn serve_conn(stream: TcpStream, peer: SocketAddr, shared: &Shared) -> Result<()> {
    let mut conn = BufferedConn::accept(stream, shared.config.compress, shared.config.legacy_only)?;
    debug!(%peer, mode = %conn.mode(), "insert handshake complete");

    let mut buf = Vec::new();
    while let Some(call) = read_block(&mut conn, &mut buf)? {
        if shared.reject.load(Ordering::SeqCst) {
            // Vanish without acking.
            return Ok(());
        }

        let read_only = shared.read_only.load(Ordering::SeqCst);
        let ack = if read_only {
            Ack::ReadOnly
        } else {
            Ack::Accepted
        };
        write_ack(&mut conn, ack, ACK_TIMEOUT)?;

        // Empty blocks only ask for the ack.
        if !read_only && !buf.is_empty() {
            shared.handler.handle_block(peer, call, &buf)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[derive(Debug)]
    struct Discard;

    impl BlockHandler for Discard {
        fn handle_block(&self, _peer: SocketAddr, _call: RpcCall, _block: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn shared() -> Arc<Shared> {
        Arc::new(Shared {
            config: ServerConfig::default(),
            handler: Arc::new(Discard),
            stop: AtomicBool::new(false),
            reject: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(0),
            conns: Default::default(),
            workers: Default::default(),
        })
    }

    #[test]
    fn test_connection_registered_after_reject_is_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();

        // Rejecting started after the accept loop let this connection in.
        let shared = shared();
        shared.reject.store(true, Ordering::SeqCst);
        spawn_conn(stream, peer, &shared).unwrap();

        assert!(shared.conns.lock().is_empty());
        assert!(shared.workers.lock().is_empty());
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
