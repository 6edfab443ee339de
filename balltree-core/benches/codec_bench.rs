//! Node payload I/O benchmarks.
//!
//! Compares one batched read per leaf against one read per vector, and
//! measures a full streaming pass (the unit of work of every split phase).

use balltree_core::codec::{NodeFile, VectorBuffer};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use tempfile::TempDir;

const DIMENSIONS: usize = 256;

fn write_node(dir: &TempDir, count: usize) -> std::path::PathBuf {
    let mut rng = StdRng::seed_from_u64(7);
    let path = dir.path().join(format!("node-{count}"));
    let vectors = (0..count).map(|_| {
        (0..DIMENSIONS).map(|_| rng.random_range(-1.0..1.0)).collect::<Vec<f64>>()
    });
    NodeFile::create_root(&path, DIMENSIONS, vectors).expect("Failed to write node");
    path
}

fn bench_leaf_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("leaf_reads");
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    for count in [10usize, 100, 1000] {
        let path = write_node(&temp_dir, count);
        group.throughput(Throughput::Bytes((count * DIMENSIONS * 8) as u64));

        group.bench_with_input(BenchmarkId::new("batched", count), &count, |b, &count| {
            let mut node = NodeFile::open_read(&path).unwrap();
            let mut buffer = VectorBuffer::default();
            b.iter(|| {
                node.seek_to_payload(DIMENSIONS).unwrap();
                black_box(node.read_batch(DIMENSIONS, count, &mut buffer).unwrap().len());
            });
        });

        group.bench_with_input(BenchmarkId::new("per_vector", count), &count, |b, &count| {
            let mut node = NodeFile::open_read(&path).unwrap();
            b.iter(|| {
                node.seek_to_payload(DIMENSIONS).unwrap();
                for _ in 0..count {
                    black_box(node.read_vector(DIMENSIONS).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_streaming_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("streaming_pass");
    group.sample_size(20);
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let count = 10_000usize;
    let path = write_node(&temp_dir, count);
    group.throughput(Throughput::Bytes((count * DIMENSIONS * 8) as u64));

    group.bench_function("centroid_10k", |b| {
        let mut node = NodeFile::open_read(&path).unwrap();
        let mut buffer = VectorBuffer::default();
        b.iter(|| black_box(node.compute_centroid(DIMENSIONS, count as u64, &mut buffer).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_leaf_reads, bench_streaming_pass);
criterion_main!(benches);
