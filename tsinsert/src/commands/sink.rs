//! Implementation of the `sink` command: a stand-in storage node that counts
//! what it receives.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use clap_blocks::sink::SinkConfig;
use insert_protocol::{
    RpcCall, rows,
    server::{BlockHandler, StorageServer},
};
use tokio::time::MissedTickBehavior;
use tracing::info;
use trogging::cli::LoggingConfig;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    #[clap(flatten)]
    sink: SinkConfig,

    /// How often to log the received totals.
    #[clap(
        long = "report-interval",
        env = "TSINSERT_SINK_REPORT_INTERVAL",
        default_value = "10s",
        value_parser = humantime::parse_duration,
    )]
    report_interval: Duration,
}

/// Totals received by a [`CountingHandler`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Received {
    pub(crate) row_blocks: u64,
    pub(crate) rows: u64,
    pub(crate) metadata_blocks: u64,
    pub(crate) bytes: u64,
}

/// Validates and counts blocks without keeping them.
#[derive(Debug, Default)]
pub(crate) struct CountingHandler {
    row_blocks: AtomicU64,
    rows: AtomicU64,
    metadata_blocks: AtomicU64,
    bytes: AtomicU64,
}

impl CountingHandler {
    pub(crate) fn received(&self) -> Received {
        Received {
            row_blocks: self.row_blocks.load(Ordering::Relaxed),
            rows: self.rows.load(Ordering::Relaxed),
            metadata_blocks: self.metadata_blocks.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

impl BlockHandler for CountingHandler {
    fn handle_block(
        &self,
        _peer: SocketAddr,
        call: RpcCall,
        block: &[u8],
    ) -> insert_protocol::Result<()> {
        match call {
            RpcCall::WriteRows => {
                let mut n = 0;
                for row in rows(block) {
                    row?;
                    n += 1;
                }
                self.rows.fetch_add(n, Ordering::Relaxed);
                self.row_blocks.fetch_add(1, Ordering::Relaxed);
            }
            RpcCall::WriteMetadata => {
                self.metadata_blocks.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.bytes.fetch_add(block.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

pub(crate) async fn command(config: Config) -> anyhow::Result<()> {
    let handler = Arc::new(CountingHandler::default());
    let bind = config.sink.bind;
    let mut server = StorageServer::bind(
        SocketAddr::from(bind),
        config.sink.to_server_config(),
        Arc::clone(&handler) as Arc<dyn BlockHandler>,
    )
    .with_context(|| format!("cannot listen on {bind}"))?;

    let mut ticker = tokio::time::interval(config.report_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    let signal = crate::wait_for_signal();
    tokio::pin!(signal);
    let mut last = handler.received();
    let mut last_at = Instant::now();
    loop {
        tokio::select! {
            res = &mut signal => {
                res.context("cannot listen for signals")?;
                break;
            }
            _ = ticker.tick() => {
                let now = handler.received();
                info!(
                    rows = now.rows,
                    blocks = now.row_blocks,
                    rows_per_sec = per_sec(now.rows - last.rows, last_at.elapsed()),
                    connections = server.open_connections(),
                    "received rows",
                );
                last = now;
                last_at = Instant::now();
            }
        }
    }

    server.stop();
    let total = handler.received();
    info!(
        rows = total.rows,
        blocks = total.row_blocks,
        metadata_blocks = total.metadata_blocks,
        bytes = total.bytes,
        "sink stopped",
    );
    Ok(())
}

pub(crate) fn per_sec(n: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (n as f64 / secs) as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use insert_protocol::marshal_row;

    use super::*;

    const PEER: SocketAddr = SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        8400,
    );

    #[test]
    fn test_counts_rows_and_metadata() {
        let handler = CountingHandler::default();
        let mut block = Vec::new();
        marshal_row(&mut block, b"a", 1, 1.0);
        marshal_row(&mut block, b"b", 2, 2.0);

        handler.handle_block(PEER, RpcCall::WriteRows, &block).unwrap();
        handler.handle_block(PEER, RpcCall::WriteMetadata, b"meta").unwrap();

        assert_eq!(
            handler.received(),
            Received {
                row_blocks: 1,
                rows: 2,
                metadata_blocks: 1,
                bytes: block.len() as u64 + 4,
            }
        );
    }

    #[test]
    fn test_malformed_block_is_rejected() {
        let handler = CountingHandler::default();
        let mut block = Vec::new();
        marshal_row(&mut block, b"a", 1, 1.0);
        block.pop();

        assert!(handler.handle_block(PEER, RpcCall::WriteRows, &block).is_err());
        assert_eq!(handler.received(), Received::default());
    }

    #[test]
    fn test_per_sec() {
        assert_eq!(per_sec(500, Duration::from_millis(500)), 1000);
        assert_eq!(per_sec(500, Duration::ZERO), 0);
    }
}
