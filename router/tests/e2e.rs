use std::time::Duration;

use hashbrown::HashSet;
use test_helpers::assert_eventually;

mod common;
use common::{DELIVERY_TIMEOUT, TestContext, random_keys};

#[test_log::test]
fn test_rows_arrive_exactly_once() {
    let ctx = TestContext::new(3, 1);
    let keys = random_keys(10_000, 1);

    ctx.write(&keys);
    assert_eventually!(DELIVERY_TIMEOUT, ctx.received_rows() >= keys.len());
    // Nothing more trickles in.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(ctx.received_rows(), keys.len());

    let received = ctx.received_by(&[0, 1, 2]);
    assert!(received.values().all(|&n| n == 1));
    let want = keys.iter().cloned().collect::<HashSet<_>>();
    let got = received.keys().cloned().collect::<HashSet<_>>();
    assert_eq!(got, want);

    // Every peer took a fair share.
    for (i, r) in ctx.recorders.iter().enumerate() {
        assert!(r.rows() > 2_500, "peer {i} got {} rows", r.rows());
    }

    ctx.cluster.shutdown();
    let stats = ctx.cluster.stats();
    assert_eq!(stats.rows_lost(), 0);
    assert_eq!(stats.rows_sent(), 10_000);
    assert!(stats.groups[0].nodes.iter().all(|(_, s)| !s.is_broken));
}

#[test_log::test]
fn test_replicated_rows_reach_distinct_peers() {
    let ctx = TestContext::new(3, 2);
    let keys = random_keys(2_000, 2);

    ctx.write(&keys);
    assert_eventually!(DELIVERY_TIMEOUT, ctx.received_rows() >= 2 * keys.len());

    // Each key sits on exactly two of the three peers.
    for key in &keys {
        let holders = ctx
            .recorders
            .iter()
            .filter(|r| r.keys().contains_key(key))
            .count();
        assert_eq!(holders, 2);
    }
    assert_eq!(ctx.received_rows(), 2 * keys.len());

    ctx.cluster.shutdown();
    let stats = ctx.cluster.stats();
    assert_eq!(stats.rows_lost(), 0);
    assert_eq!(stats.groups[0].stats.rows_incompletely_replicated, 0);
}

#[test_log::test]
fn test_shutdown_delivers_staged_rows() {
    let ctx = TestContext::new(2, 1);
    let keys = random_keys(100, 3);
    {
        let mut rctx = ctx.cluster.context();
        for key in &keys {
            rctx.write_row(key, 0, 0.0).unwrap();
        }
        rctx.flush_bufs().unwrap();
    }
    // The final flush pushes out what the workers have not sent yet.
    ctx.cluster.shutdown();
    // Peers ack before handling, so the last block may still be in flight.
    assert_eventually!(DELIVERY_TIMEOUT, ctx.received_rows() >= keys.len());
    assert_eq!(ctx.received_rows(), keys.len());
    assert_eq!(ctx.cluster.rows_lost(), 0);
}
