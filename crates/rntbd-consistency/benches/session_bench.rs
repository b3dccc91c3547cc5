// Criterion benchmarks for rntbd-consistency
//
// Run benchmarks with:
//   cargo bench -p rntbd-consistency

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rntbd_common::{PartitionId, SessionToken};
use rntbd_consistency::{ReplicaSelector, SessionTokenStore};

fn bench_read_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_order");

    for replica_count in [1, 4, 8].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(replica_count), replica_count, |b, &count| {
            let replicas: Vec<String> = (0..count).map(|i| format!("10.0.0.{}:10251", i)).collect();
            let selector = ReplicaSelector::new();
            b.iter(|| black_box(selector.read_order(black_box(&replicas))));
        });
    }

    group.finish();
}

fn bench_session_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_store");

    group.bench_function("merge_hot_partition", |b| {
        let store = SessionTokenStore::new();
        let partition = PartitionId::new("coll", "0");
        let mut lsn = 0;
        b.iter(|| {
            lsn += 1;
            store.merge(&partition, &SessionToken::new().with(1, lsn).with(2, lsn / 2));
        });
    });

    group.bench_function("get_among_1000_partitions", |b| {
        let store = SessionTokenStore::new();
        for range in 0..1000 {
            store.merge(&PartitionId::new("coll", range.to_string()), &SessionToken::new().with(1, range));
        }
        let partition = PartitionId::new("coll", "500");
        b.iter(|| black_box(store.get(black_box(&partition))));
    });

    group.finish();
}

criterion_group!(benches, bench_read_order, bench_session_store);
criterion_main!(benches);
