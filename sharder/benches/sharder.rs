use criterion::{
    BenchmarkGroup, Criterion, Throughput, criterion_group, criterion_main, measurement::WallTime,
};
use rand::{Rng, distributions::Alphanumeric, thread_rng};
use sharder::{RendezvousHash, hash_key, partition_for};

fn get_random_string(length: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn node_addrs(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("10.0.{}.{}:8400", i / 256, i % 256)).collect()
}

fn sharder_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("rendezvous");

    // fixed key, varying number of nodes
    for nodes in [3, 10, 50, 255] {
        benchmark_scenario(
            &mut group,
            &format!("basic {nodes} nodes"),
            b"cpu_usage{host=\"a\",dc=\"1\"}",
            nodes,
            &[],
        );
    }

    // a couple of broken nodes to skip
    benchmark_scenario(
        &mut group,
        "10 nodes 2 excluded",
        b"cpu_usage{host=\"a\",dc=\"1\"}",
        10,
        &[3, 7],
    );

    // random keys of increasing length
    for len in [16, 64, 256] {
        benchmark_scenario(
            &mut group,
            &format!("random with key-length {len}"),
            get_random_string(len).as_bytes(),
            10,
            &[],
        );
    }

    group.finish();

    let mut group = c.benchmark_group("partition");
    group.throughput(Throughput::Elements(1));
    group.bench_function("hash and partition 4 groups", |b| {
        let key = get_random_string(64);
        b.iter(|| partition_for(hash_key(key.as_bytes()), 4));
    });
    group.finish();
}

fn benchmark_scenario(
    group: &mut BenchmarkGroup<'_, WallTime>,
    bench_name: &str,
    key: &[u8],
    nodes: usize,
    excluded: &[usize],
) {
    let addrs = node_addrs(nodes);
    let hash = RendezvousHash::new(addrs.iter().map(String::as_str), 0);

    group.throughput(Throughput::Elements(1));
    group.bench_function(bench_name, |b| {
        b.iter(|| hash.select_node(hash_key(key), excluded));
    });
}

criterion_group!(benches, sharder_benchmarks);
criterion_main!(benches);
