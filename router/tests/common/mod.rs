use std::{net::SocketAddr, sync::Arc, time::Duration};

use hashbrown::HashMap;
use insert_protocol::{
    RpcCall, rows,
    server::{BlockHandler, ServerConfig, StorageServer},
};
use parking_lot::Mutex;
use router::{Cluster, ClusterConfig, NodeAddr};

/// How long tests wait for rows to arrive.
pub(crate) const DELIVERY_TIMEOUT: Duration = Duration::from_secs(20);

/// Counts every row key a storage peer received.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    keys: Mutex<HashMap<Vec<u8>, usize>>,
}

impl Recorder {
    /// Received keys and how often each arrived.
    pub(crate) fn keys(&self) -> HashMap<Vec<u8>, usize> {
        self.keys.lock().clone()
    }

    pub(crate) fn rows(&self) -> usize {
        self.keys.lock().values().sum()
    }
}

impl BlockHandler for Recorder {
    fn handle_block(
        &self,
        _peer: SocketAddr,
        call: RpcCall,
        block: &[u8],
    ) -> insert_protocol::Result<()> {
        assert_eq!(call, RpcCall::WriteRows);
        let mut keys = self.keys.lock();
        for row in rows(block) {
            *keys.entry(row?.key.to_vec()).or_default() += 1;
        }
        Ok(())
    }
}

/// A single group cluster over loopback storage peers.
#[derive(Debug)]
pub(crate) struct TestContext {
    pub(crate) peers: Vec<StorageServer>,
    pub(crate) recorders: Vec<Arc<Recorder>>,
    pub(crate) cluster: Cluster,
}

impl TestContext {
    pub(crate) fn new(peers: usize, replication_factor: usize) -> Self {
        test_helpers::maybe_start_logging();

        let recorders = (0..peers)
            .map(|_| Arc::new(Recorder::default()))
            .collect::<Vec<_>>();
        let peers = recorders
            .iter()
            .map(|r| {
                StorageServer::bind(
                    "127.0.0.1:0",
                    ServerConfig {
                        compress: true,
                        ..Default::default()
                    },
                    Arc::clone(r) as Arc<dyn BlockHandler>,
                )
                .expect("bind storage peer")
            })
            .collect::<Vec<_>>();

        let config = ClusterConfig {
            nodes: peers
                .iter()
                .map(|p| NodeAddr {
                    group: "test".to_string(),
                    addr: p.local_addr().to_string(),
                })
                .collect(),
            replication_factor,
            memory_budget: 16 * 1024 * 1024,
            flush_interval: Duration::from_millis(50),
            dial_timeout: Duration::from_millis(200),
            reroute_delay: Duration::ZERO,
            ..Default::default()
        };
        let cluster = Cluster::new(&config).expect("start cluster");

        Self {
            peers,
            recorders,
            cluster,
        }
    }

    /// Stage and flush one row per key.
    pub(crate) fn write(&self, keys: &[Vec<u8>]) {
        let mut ctx = self.cluster.context();
        for (i, key) in keys.iter().enumerate() {
            ctx.write_row(key, i as i64, i as f64).expect("write row");
            // Flush in request sized batches.
            if i % 500 == 499 {
                ctx.flush_bufs().expect("flush rows");
            }
        }
        ctx.flush_bufs().expect("flush rows");
    }

    /// Rows received by all peers together, counting duplicates.
    pub(crate) fn received_rows(&self) -> usize {
        self.recorders.iter().map(|r| r.rows()).sum()
    }

    /// Keys received by any of the peers at `idxs`, with their counts.
    pub(crate) fn received_by(&self, idxs: &[usize]) -> HashMap<Vec<u8>, usize> {
        let mut all = HashMap::new();
        for &i in idxs {
            for (k, n) in self.recorders[i].keys() {
                *all.entry(k).or_default() += n;
            }
        }
        all
    }
}

/// `n` distinct random series keys.
pub(crate) fn random_keys(n: usize, seed: u64) -> Vec<Vec<u8>> {
    use rand::{Rng, SeedableRng, rngs::StdRng};

    let mut rng = StdRng::seed_from_u64(seed);
    let mut seen = hashbrown::HashSet::new();
    let mut keys = Vec::with_capacity(n);
    while keys.len() < n {
        let key = format!("series-{:032x}", rng.r#gen::<u128>()).into_bytes();
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    }
    keys
}
