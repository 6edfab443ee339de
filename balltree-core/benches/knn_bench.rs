//! Tree search vs linear scan.
//!
//! Both answer the same exact query; the tree should win once pruning cuts
//! off most leaves.

use balltree_core::codec::NodeFile;
use balltree_core::{KnnSearch, build, linear_knn};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use tempfile::TempDir;

/// Clustered data, so pruning has structure to work with
fn generate_vectors(count: usize, dims: usize) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(42);
    let centers: Vec<Vec<f64>> =
        (0..32).map(|_| (0..dims).map(|_| rng.random_range(-10.0..10.0)).collect()).collect();
    (0..count)
        .map(|i| centers[i % centers.len()].iter().map(|c| c + rng.random_range(-0.5..0.5)).collect())
        .collect()
}

fn bench_knn(c: &mut Criterion) {
    let mut group = c.benchmark_group("knn");
    group.sample_size(30);

    for dims in [16usize, 128] {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().join("root");
        let vectors = generate_vectors(20_000, dims);
        NodeFile::create_root(&root, dims, &vectors).expect("Failed to write root");
        build(&root, true, 100).expect("Failed to build tree");
        let query = vectors[777].clone();

        group.bench_with_input(BenchmarkId::new("tree", dims), &dims, |b, _| {
            let mut search = KnnSearch::default();
            b.iter(|| black_box(search.search(&root, black_box(&query), 10).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("linear_scan", dims), &dims, |b, _| {
            b.iter(|| black_box(linear_knn(&root, black_box(&query), 10).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_knn);
criterion_main!(benches);
