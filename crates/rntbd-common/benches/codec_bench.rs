// Criterion benchmarks for the rntbd-common frame codec
//
// Run benchmarks with:
//   cargo bench -p rntbd-common

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rntbd_common::{
    ConsistencyLevel, Frame, Metadata, OperationType, PartitionId, ResourceType, SessionToken,
    StoreRequest,
};
use uuid::Uuid;

fn response_frame(payload_size: usize) -> Frame {
    let metadata = Metadata {
        status_code: Some(200),
        sub_status_code: Some(0),
        lsn: Some(1_000_042),
        quorum_acked_lsn: Some(1_000_042),
        global_committed_lsn: Some(1_000_040),
        item_lsn: Some(1_000_001),
        number_of_read_regions: Some(1),
        replica_set_size: Some(4),
        write_quorum: Some(3),
        request_charge: Some(1.0),
        session_token: Some("0=1000042#1=998".to_string()),
        partition_key_range_id: Some("0".to_string()),
        response_headers: vec![("etag".to_string(), "\"00000000-0000\"".to_string())],
        ..Metadata::default()
    };
    Frame::new(
        Uuid::new_v4(),
        ResourceType::Document,
        OperationType::Read,
        metadata,
        Bytes::from(vec![b'x'; payload_size]),
    )
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [0usize, 1024, 64 * 1024] {
        let frame = response_frame(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            let mut buf = BytesMut::with_capacity(size + 256);
            b.iter(|| {
                buf.clear();
                black_box(frame).encode(&mut buf).unwrap();
            });
        });
    }

    group.bench_function("request_to_frame", |b| {
        let request = StoreRequest::read("dbs/db/colls/c/docs/d", PartitionId::new("c", "0"))
            .with_consistency(ConsistencyLevel::Session)
            .with_session_token(SessionToken::new().with(0, 100).with(1, 90));
        b.iter(|| black_box(&request).to_frame());
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [0usize, 1024, 64 * 1024] {
        let mut encoded = BytesMut::new();
        response_frame(size).encode(&mut encoded).unwrap();
        let encoded = encoded.freeze();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = BytesMut::from(&encoded[..]);
                Frame::decode(black_box(&mut buf)).unwrap()
            });
        });
    }

    group.finish();
}

fn bench_session_token(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_token");

    let a: SessionToken = "0=100#1=200#2=300".parse().unwrap();
    let b_token: SessionToken = "0=150#2=250#3=10".parse().unwrap();

    group.bench_function("merge", |b| {
        b.iter(|| black_box(&a).merged(black_box(&b_token)));
    });

    group.bench_function("parse", |b| {
        b.iter(|| black_box("0=100#1=200#2=300").parse::<SessionToken>().unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_session_token);
criterion_main!(benches);
