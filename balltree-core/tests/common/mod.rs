//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use balltree_core::codec::{NodeFile, Vector};
use balltree_core::ids::node_path;
use balltree_core::{NodeHeader, euclidean_distance};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

/// Installs a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

/// `n` vectors with coordinates uniform in `[-1, 1)`.
pub fn random_vectors(seed: u64, n: usize, dimension: usize) -> Vec<Vector> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dimension).map(|_| rng.random_range(-1.0..1.0)).collect())
        .collect()
}

/// Exact reference: every vector ranked by distance, first `k` kept.
pub fn brute_force(vectors: &[Vector], target: &[f64], k: usize) -> Vec<(f64, Vector)> {
    let mut ranked: Vec<(f64, Vector)> =
        vectors.iter().map(|v| (euclidean_distance(target, v), v.clone())).collect();
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
    ranked.truncate(k);
    ranked
}

/// Vectors sorted by their bit patterns, for multiset comparisons.
pub fn canonical(mut vectors: Vec<Vector>) -> Vec<Vec<u64>> {
    let mut keys: Vec<Vec<u64>> =
        vectors.drain(..).map(|v| v.iter().map(|x| x.to_bits()).collect()).collect();
    keys.sort();
    keys
}

/// Header and full payload of one node file.
pub fn read_node(path: &Path) -> (NodeHeader, Vec<Vector>) {
    let mut node = NodeFile::open_read(path).unwrap();
    node.verify_format().unwrap();
    let header = node.read_header().unwrap();
    node.seek_to_payload(header.dimension).unwrap();
    let count = usize::try_from(header.count).unwrap();
    let vectors = node.read_vectors_batch(header.dimension, count).unwrap();
    (header, vectors)
}

/// Every node reachable from `root`, parents before children.
pub fn walk_tree(root: &Path) -> Vec<PathBuf> {
    let dir = root.parent().unwrap().to_path_buf();
    let mut order = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let (header, _) = read_node(&path);
        if let Some(children) = header.children {
            stack.push(node_path(&dir, children.right));
            stack.push(node_path(&dir, children.left));
        }
        order.push(path);
    }
    order
}

/// Leaf payloads of the tree rooted at `root`, concatenated.
pub fn leaf_vectors(root: &Path) -> Vec<Vector> {
    walk_tree(root)
        .iter()
        .map(|path| read_node(path))
        .filter(|(header, _)| header.is_leaf())
        .flat_map(|(_, vectors)| vectors)
        .collect()
}

/// Number of regular files in `dir`.
pub fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().filter(|e| e.as_ref().unwrap().path().is_file()).count()
}
