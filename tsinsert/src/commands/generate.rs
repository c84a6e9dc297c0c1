//! Implementation of the `generate` command: synthetic rows pushed through
//! the router.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use clap_blocks::storage::StorageConfig;
use rand::{Rng, SeedableRng, rngs::StdRng};
use router::{Cluster, ClusterStats, Error};
use tracing::{info, warn};
use trogging::cli::LoggingConfig;

use super::sink::per_sec;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    #[clap(flatten)]
    storage: StorageConfig,

    #[clap(flatten)]
    workload: Workload,
}

/// The shape of the generated load.
#[derive(Debug, Clone, clap::Parser)]
pub(crate) struct Workload {
    /// Distinct series rows are spread over.
    #[clap(
        long = "series",
        env = "TSINSERT_SERIES",
        default_value = "10000",
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub(crate) series: u64,

    /// Rows to write in total. 0 writes until interrupted.
    #[clap(long = "rows", env = "TSINSERT_ROWS", default_value = "1000000")]
    pub(crate) rows: u64,

    /// Rows staged by a writer before flushing them to the nodes.
    #[clap(
        long = "batch-size",
        env = "TSINSERT_BATCH_SIZE",
        default_value = "1000",
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub(crate) batch_size: u64,

    /// Rows per second across all writers. 0 is unlimited.
    #[clap(long = "rate", env = "TSINSERT_RATE", default_value = "0")]
    pub(crate) rate: u64,

    /// Concurrent writer threads.
    #[clap(
        long = "writers",
        env = "TSINSERT_WRITERS",
        default_value = "4",
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub(crate) writers: u64,

    /// Value of the `__name__` label of every series.
    #[clap(
        long = "metric-name",
        env = "TSINSERT_METRIC_NAME",
        default_value = "tsinsert_generated"
    )]
    pub(crate) metric_name: String,
}

/// What the writers managed to hand to the router.
#[derive(Debug, Default)]
pub(crate) struct WriteSummary {
    pub(crate) rows_written: u64,
    pub(crate) rows_dropped: u64,
    pub(crate) elapsed: Duration,
}

pub(crate) async fn command(config: Config) -> anyhow::Result<()> {
    let cluster = Arc::new(
        Cluster::new(&config.storage.to_cluster_config())
            .context("cannot set up the storage cluster")?,
    );
    let stop = Arc::new(AtomicBool::new(false));

    info!(
        series = config.workload.series,
        rows = config.workload.rows,
        writers = config.workload.writers,
        rate = config.workload.rate,
        "generating rows",
    );
    let mut writers = tokio::task::spawn_blocking({
        let cluster = Arc::clone(&cluster);
        let stop = Arc::clone(&stop);
        let workload = config.workload.clone();
        move || run(&cluster, &workload, &stop)
    });

    let finished = tokio::select! {
        res = &mut writers => Some(res),
        res = crate::wait_for_signal() => {
            res.context("cannot listen for signals")?;
            None
        }
    };
    let joined = match finished {
        Some(res) => res,
        None => {
            stop.store(true, Ordering::SeqCst);
            // Writers blocked on a full reroute buffer are released by the
            // shutdown.
            cluster.shutdown();
            writers.await
        }
    };
    let summary = joined.context("writer pool panicked")??;

    cluster.shutdown();
    report(&summary, &cluster.stats());
    Ok(())
}

/// Run `workload` on its writer threads until done or `stop` is set.
pub(crate) fn run(
    cluster: &Arc<Cluster>,
    workload: &Workload,
    stop: &Arc<AtomicBool>,
) -> anyhow::Result<WriteSummary> {
    let start = Instant::now();
    let written = Arc::new(AtomicU64::new(0));
    let dropped = Arc::new(AtomicU64::new(0));

    let handles = (0..workload.writers)
        .map(|id| {
            let cluster = Arc::clone(cluster);
            let workload = workload.clone();
            let stop = Arc::clone(stop);
            let written = Arc::clone(&written);
            let dropped = Arc::clone(&dropped);
            thread::Builder::new()
                .name(format!("tsinsert-writer-{id}"))
                .spawn(move || write_rows(&cluster, &workload, id, &stop, &written, &dropped))
                .context("cannot spawn writer thread")
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut first_err = None;
    for h in handles {
        let res = match h.join() {
            Ok(res) => res,
            Err(_) => Err(anyhow::anyhow!("writer thread panicked")),
        };
        if let Err(e) = res {
            stop.store(true, Ordering::SeqCst);
            first_err.get_or_insert(e);
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }

    Ok(WriteSummary {
        rows_written: written.load(Ordering::Relaxed),
        rows_dropped: dropped.load(Ordering::Relaxed),
        elapsed: start.elapsed(),
    })
}

/// One writer: rows `id`, `id + writers`, `id + 2 * writers`, ...
fn write_rows(
    cluster: &Cluster,
    workload: &Workload,
    id: u64,
    stop: &AtomicBool,
    written: &AtomicU64,
    dropped: &AtomicU64,
) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(id);
    let rate = match workload.rate {
        0 => 0,
        rate => (rate / workload.writers).max(1),
    };
    let mut pacer = Pacer::new(rate);
    let mut ctx = cluster.context();
    let mut row = id;

    while !stop.load(Ordering::Relaxed) && (workload.rows == 0 || row < workload.rows) {
        let mut batch = 0;
        while batch < workload.batch_size && (workload.rows == 0 || row < workload.rows) {
            let s = row % workload.series;
            ctx.add_label(b"__name__", workload.metric_name.as_bytes());
            ctx.add_label(b"instance", format!("host-{}", s % 100).as_bytes());
            ctx.add_label(b"series_id", s.to_string().as_bytes());
            let res = ctx.write_data_point(now_millis(), rng.r#gen::<f64>() * 100.0);
            if !record(res, dropped)? {
                return Ok(());
            }
            batch += 1;
            row += workload.writers;
        }
        let res = ctx.flush_bufs();
        if !record(res, dropped)? {
            return Ok(());
        }
        written.fetch_add(batch, Ordering::Relaxed);
        pacer.wait(batch);
    }
    Ok(())
}

/// Count rows the router gave up on. Returns false once the router stops.
fn record(res: router::Result<()>, dropped: &AtomicU64) -> anyhow::Result<bool> {
    match res {
        Ok(()) => Ok(true),
        Err(e @ Error::RowsDropped { .. }) => {
            warn!(error = %e, "rows dropped");
            dropped.fetch_add(e.rows() as u64, Ordering::Relaxed);
            Ok(true)
        }
        Err(e @ Error::ShuttingDown { .. }) => {
            dropped.fetch_add(e.rows() as u64, Ordering::Relaxed);
            Ok(false)
        }
        Err(e) => Err(e).context("cannot write row"),
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Keeps a writer at or below `rate` rows per second.
#[derive(Debug)]
struct Pacer {
    rate: u64,
    start: Instant,
    rows: u64,
}

impl Pacer {
    fn new(rate: u64) -> Self {
        Self {
            rate,
            start: Instant::now(),
            rows: 0,
        }
    }

    /// How long to wait after `rows` more rows were written.
    fn delay(&mut self, rows: u64, now: Instant) -> Duration {
        if self.rate == 0 {
            return Duration::ZERO;
        }
        self.rows += rows;
        let due = self.start + Duration::from_secs_f64(self.rows as f64 / self.rate as f64);
        due.saturating_duration_since(now)
    }

    fn wait(&mut self, rows: u64) {
        let delay = self.delay(rows, Instant::now());
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

fn report(summary: &WriteSummary, stats: &ClusterStats) {
    info!(
        rows_written = summary.rows_written,
        rows_dropped = summary.rows_dropped,
        elapsed = %humantime::format_duration(summary.elapsed),
        rows_per_sec = per_sec(summary.rows_written, summary.elapsed),
        "generation finished",
    );

    for g in &stats.groups {
        info!(
            group = %g.name,
            rows_lost = g.stats.rows_lost,
            rows_incompletely_replicated = g.stats.rows_incompletely_replicated,
            reroutes_total = g.stats.reroutes_total,
            rows_reroute_expired = g.stats.rows_reroute_expired,
            "replication group",
        );
        for (addr, n) in &g.nodes {
            info!(
                group = %g.name,
                node = %addr,
                rows_sent = n.rows_sent,
                rows_rerouted_from_here = n.rows_rerouted_from_here,
                rows_rerouted_to_here = n.rows_rerouted_to_here,
                read_only_acks = n.read_only_acks,
                is_read_only = n.is_read_only,
                rows_dropped_on_overload = n.rows_dropped_on_overload,
                dial_errors = n.dial_errors,
                connection_errors = n.connection_errors,
                "storage node",
            );
        }
    }

    let lost = stats.rows_lost();
    if lost > 0 {
        warn!(rows_lost = lost, "not every row reached a storage node");
    }
    let dropped = stats.rows_dropped_on_overload();
    if dropped > 0 {
        warn!(
            rows_dropped_on_overload = dropped,
            "rows were dropped because storage nodes could not keep up",
        );
    }
}
