use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
    thread::JoinHandle,
};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::{
    ClusterConfig, Error, GroupStats, ReplicationGroup, Result, RouterContext,
    config::group_budget,
    group::{GroupSettings, PushPolicy, run_node_worker, run_reroute_worker},
    node::{NodeSettings, NodeStats},
};

/// Background threads and the senders whose drop stops them.
#[derive(Debug)]
struct Workers {
    reroute_stop: Sender<()>,
    reroute: Vec<JoinHandle<()>>,
    node_stop: Sender<()>,
    nodes: Vec<JoinHandle<()>>,
}

/// Statistics of one [`ReplicationGroup`] and its members.
#[derive(Debug, Clone)]
pub struct GroupReport {
    pub name: String,
    pub stats: GroupStats,
    /// Address and counters of each member, in configuration order.
    pub nodes: Vec<(String, NodeStats)>,
}

/// A point in time view of every group of a [`Cluster`].
#[derive(Debug, Clone)]
pub struct ClusterStats {
    pub groups: Vec<GroupReport>,
}

impl ClusterStats {
    /// Rows accepted by the router that will never reach a storage node.
    pub fn rows_lost(&self) -> u64 {
        self.groups.iter().map(|g| g.stats.rows_lost).sum()
    }

    /// Rows dropped because a healthy node had no buffer space left.
    pub fn rows_dropped_on_overload(&self) -> u64 {
        self.groups
            .iter()
            .flat_map(|g| &g.nodes)
            .map(|(_, s)| s.rows_dropped_on_overload)
            .sum()
    }

    /// Rows written to storage nodes, counting each copy.
    pub fn rows_sent(&self) -> u64 {
        self.groups
            .iter()
            .flat_map(|g| &g.nodes)
            .map(|(_, s)| s.rows_sent)
            .sum()
    }
}

/// The set of replication groups rows are routed to, with the background
/// workers delivering them.
///
/// Built once at startup and shared by every writer. Writers obtain a
/// [`RouterContext`] through [`Self::context`].
#[derive(Debug)]
pub struct Cluster {
    groups: Arc<[Arc<ReplicationGroup>]>,
    pool: Mutex<Vec<RouterContext>>,
    workers: Mutex<Option<Workers>>,
}

impl Cluster {
    /// Validate `config`, create the groups and start one worker per node
    /// and one reroute worker per group.
    pub fn new(config: &ClusterConfig) -> Result<Self> {
        let settings = GroupSettings {
            node: NodeSettings {
                compress: config.compress,
                dial_timeout: config.dial_timeout,
                legacy_protocol: config.legacy_protocol,
            },
            replication_factor: config.replication_factor,
            memory_budget: config.memory_budget,
            hash_seed: config.hash_seed,
            max_reroute_passes: config.max_reroute_passes,
            policy: PushPolicy {
                drop_on_overload: config.drop_samples_on_overload,
                disable_rerouting_on_unavailable: config.disable_rerouting_on_unavailable,
                reroute_delay: config.reroute_delay,
            },
        };
        let total_nodes = config.nodes.len();
        let groups: Arc<[Arc<ReplicationGroup>]> = config
            .groups()?
            .into_iter()
            .map(|(name, addrs)| {
                let settings = GroupSettings {
                    memory_budget: group_budget(config.memory_budget, addrs.len(), total_nodes),
                    ..settings
                };
                Arc::new(ReplicationGroup::new(name, addrs, settings))
            })
            .collect();

        let (reroute_stop, reroute_rx) = crossbeam_channel::bounded(0);
        let (node_stop, node_rx) = crossbeam_channel::bounded(0);
        let mut workers = Workers {
            reroute_stop,
            reroute: vec![],
            node_stop,
            nodes: vec![],
        };

        let flush_interval = config.flush_interval;
        let spawned = groups.iter().try_for_each(|group| {
            for idx in 0..group.nodes().len() {
                let group = Arc::clone(group);
                let stop = node_rx.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("tsinsert-node-{}", group.nodes()[idx].addr()))
                    .spawn(move || run_node_worker(group, idx, stop, flush_interval))
                    .map_err(Error::SpawnWorker)?;
                workers.nodes.push(handle);
            }

            let group = Arc::clone(group);
            let stop = reroute_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("tsinsert-reroute-{}", group.name()))
                .spawn(move || run_reroute_worker(group, stop, flush_interval))
                .map_err(Error::SpawnWorker)?;
            workers.reroute.push(handle);
            Ok::<_, Error>(())
        });

        let cluster = Self {
            groups,
            pool: Default::default(),
            workers: Mutex::new(Some(workers)),
        };
        // Dropping the cluster stops whatever did start.
        spawned?;

        for g in cluster.groups.iter() {
            info!(
                group = %g.name(),
                nodes = g.nodes().len(),
                replicas = g.replicas(),
                max_buf_size_per_node = g.max_buf_size_per_node(),
                rerouted_buf_max_size = g.rerouted_buf_max_size(),
                "replication group started",
            );
        }
        Ok(cluster)
    }

    pub fn groups(&self) -> &[Arc<ReplicationGroup>] {
        &self.groups
    }

    /// Borrow a context from the pool, creating one if the pool is empty.
    ///
    /// The context goes back to the pool when the guard drops.
    pub fn context(&self) -> PooledContext<'_> {
        let ctx = self
            .pool
            .lock()
            .pop()
            .unwrap_or_else(|| RouterContext::new(Arc::clone(&self.groups)));
        PooledContext { cluster: self, ctx }
    }

    pub fn stats(&self) -> ClusterStats {
        ClusterStats {
            groups: self
                .groups
                .iter()
                .map(|g| GroupReport {
                    name: g.name().to_string(),
                    stats: g.stats(),
                    nodes: g
                        .nodes()
                        .iter()
                        .map(|n| (n.addr().to_string(), n.stats()))
                        .collect(),
                })
                .collect(),
        }
    }

    pub fn rows_lost(&self) -> u64 {
        self.groups.iter().map(|g| g.stats().rows_lost).sum()
    }

    /// Stop all workers after a final delivery attempt.
    ///
    /// Blocked writers are released with [`Error::ShuttingDown`] and later
    /// writes are rejected. Rerouted rows get one last pass while the node
    /// workers still run; node buffers are then flushed once. Whatever is
    /// left is counted as lost. Calling this again is a no-op.
    pub fn shutdown(&self) {
        let Some(workers) = self.workers.lock().take() else {
            return;
        };
        info!("stopping storage node workers");

        for g in self.groups.iter() {
            g.begin_stop();
        }

        let Workers {
            reroute_stop,
            reroute,
            node_stop,
            nodes,
        } = workers;

        drop(reroute_stop);
        join_all(reroute);
        drop(node_stop);
        join_all(nodes);

        let lost = self.rows_lost();
        if lost > 0 {
            error!(rows_lost = lost, "rows were lost before delivery");
        }
        info!("storage node workers stopped");
    }
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for h in handles {
        let name = h.thread().name().unwrap_or("worker").to_string();
        if h.join().is_err() {
            error!(thread = %name, "worker thread panicked");
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A [`RouterContext`] on loan from a [`Cluster`].
///
/// Rows still staged when the guard drops are flushed first.
#[derive(Debug)]
pub struct PooledContext<'a> {
    cluster: &'a Cluster,
    ctx: RouterContext,
}

impl Deref for PooledContext<'_> {
    type Target = RouterContext;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

impl DerefMut for PooledContext<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ctx
    }
}

impl Drop for PooledContext<'_> {
    fn drop(&mut self) {
        if self.ctx.staged_rows() > 0 {
            if let Err(e) = self.ctx.flush_bufs() {
                warn!(error = %e, "cannot flush rows left in a released context");
            }
        }
        self.ctx.reset();
        let ctx = std::mem::take(&mut self.ctx);
        self.cluster.pool.lock().push(ctx);
    }
}
