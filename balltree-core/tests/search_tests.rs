//! Integration tests for KNN search.
//!
//! Tests cover:
//! - Agreement with brute force across dimensions and leaf sizes
//! - Pruning soundness (pruned and unpruned walks agree)
//! - Boundaries: k == 0, k >= count, a single vector
//! - Dimension and format errors
//! - The 10,000 x 256 reference scenario

mod common;

use balltree_core::codec::NodeFile;
use balltree_core::header::payload_offset;
use balltree_core::{
    BallTreeError, KnnSearch, SearchOptions, build, euclidean_distance, knn, linear_knn,
};
use common::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn built_tree(dir: &TempDir, vectors: &[Vec<f64>], dimension: usize, leaf_size: u64) -> PathBuf {
    let root = dir.path().join("root");
    NodeFile::create_root(&root, dimension, vectors).unwrap();
    build(&root, true, leaf_size).unwrap();
    root
}

fn assert_matches_brute_force(root: &Path, vectors: &[Vec<f64>], queries: &[Vec<f64>], k: usize) {
    let mut search = KnnSearch::default();
    for query in queries {
        let found = search.search(root, query, k).unwrap();
        let expected = brute_force(vectors, query, k);

        assert_eq!(found.len(), expected.len());
        let found_distances: Vec<f64> = found.iter().map(|n| n.distance).collect();
        let expected_distances: Vec<f64> = expected.iter().map(|(d, _)| *d).collect();
        assert_eq!(found_distances, expected_distances);

        let found_vectors = found.into_iter().map(|n| n.vector).collect();
        let expected_vectors = expected.into_iter().map(|(_, v)| v).collect();
        assert_eq!(canonical(found_vectors), canonical(expected_vectors));
    }
}

#[test]
fn test_brute_force_equivalence_dim_16() {
    init_tracing();
    let vectors = random_vectors(11, 2000, 16);
    let queries = random_vectors(12, 8, 16);

    for leaf_size in [1, 100, 10_000] {
        let dir = TempDir::new().unwrap();
        let root = built_tree(&dir, &vectors, 16, leaf_size);
        assert_matches_brute_force(&root, &vectors, &queries, 10);
    }
}

#[test]
fn test_brute_force_equivalence_dim_256() {
    let vectors = random_vectors(13, 1000, 256);
    let queries = random_vectors(14, 4, 256);

    for leaf_size in [1, 100, 10_000] {
        let dir = TempDir::new().unwrap();
        let root = built_tree(&dir, &vectors, 256, leaf_size);
        assert_matches_brute_force(&root, &vectors, &queries, 25);
    }
}

#[test]
fn test_pruning_is_sound() {
    let vectors = random_vectors(15, 3000, 8);
    let queries = random_vectors(16, 10, 8);
    let dir = TempDir::new().unwrap();
    let root = built_tree(&dir, &vectors, 8, 20);

    let mut pruned = KnnSearch::new(SearchOptions::default());
    let mut exhaustive = KnnSearch::new(SearchOptions { prune: false, ..SearchOptions::default() });

    let mut skipped = 0;
    for query in &queries {
        let a = pruned.search(&root, query, 15).unwrap();
        let b = exhaustive.search(&root, query, 15).unwrap();
        assert_eq!(a, b);

        assert_eq!(exhaustive.last_stats().pruned, 0);
        assert!(pruned.last_stats().leaves_scanned <= exhaustive.last_stats().leaves_scanned);
        skipped += pruned.last_stats().pruned;
    }
    assert!(skipped > 0, "pruning never fired");
}

#[test]
fn test_tree_agrees_with_linear_scan() {
    let vectors = random_vectors(17, 1500, 32);
    let dir = TempDir::new().unwrap();
    let root = built_tree(&dir, &vectors, 32, 40);

    for query in random_vectors(18, 5, 32) {
        let tree = KnnSearch::default().search(&root, &query, 12).unwrap();
        let scan = linear_knn(&root, &query, 12).unwrap();
        assert_eq!(tree, scan);
    }
}

#[test]
fn test_k_zero_touches_nothing() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("does-not-exist");

    let found = knn(&[1.0, 2.0], 0, &missing).unwrap();
    assert!(found.is_empty());
}

#[test]
fn test_k_covering_dataset_returns_everything_sorted() {
    let vectors = random_vectors(19, 30, 4);
    let dir = TempDir::new().unwrap();
    let root = built_tree(&dir, &vectors, 4, 5);
    let query = vec![0.0; 4];

    let mut search = KnnSearch::default();
    let found = search.search(&root, &query, 50).unwrap();

    assert_eq!(found.len(), 30);
    assert!(found.windows(2).all(|w| w[0].distance <= w[1].distance));
    assert_eq!(search.last_stats().visited, 0, "no traversal when k >= count");
    let found_vectors = found.into_iter().map(|n| n.vector).collect();
    assert_eq!(canonical(found_vectors), canonical(vectors));
}

#[test]
fn test_single_vector_tree() {
    let dir = TempDir::new().unwrap();
    let root = built_tree(&dir, &[vec![3.0, 4.0]], 2, 100);

    let found = knn(&[0.0, 0.0], 5, &root).unwrap();
    assert_eq!(found, vec![vec![3.0, 4.0]]);
}

#[test]
fn test_dimension_mismatch_before_payload_read() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    NodeFile::create_root(&root, 3, random_vectors(20, 10, 3)).unwrap();

    // Cut the payload off entirely; only the metadata remains.
    let bytes = std::fs::read(&root).unwrap();
    let meta = usize::try_from(payload_offset(3)).unwrap();
    std::fs::write(&root, &bytes[..meta]).unwrap();

    let err = knn(&[1.0, 2.0], 3, &root).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BallTreeError>(),
        Some(BallTreeError::DimensionMismatch { expected: 3, found: 2 })
    ));
}

#[test]
fn test_truncated_payload_is_reported() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    NodeFile::create_root(&root, 3, random_vectors(21, 10, 3)).unwrap();

    let bytes = std::fs::read(&root).unwrap();
    std::fs::write(&root, &bytes[..bytes.len() - 20]).unwrap();

    let err = knn(&[1.0, 2.0, 3.0], 4, &root).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BallTreeError>(),
        Some(BallTreeError::TruncatedRead { .. })
    ));
}

#[test]
fn test_foreign_root_is_rejected() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    std::fs::write(&root, vec![0u8; 64]).unwrap();

    let err = knn(&[0.0], 1, &root).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BallTreeError>(),
        Some(BallTreeError::FormatMismatch { .. })
    ));
}

#[test]
fn test_missing_child_names_the_node() {
    let vectors = random_vectors(22, 200, 4);
    let dir = TempDir::new().unwrap();
    let root = built_tree(&dir, &vectors, 4, 10);

    let (header, _) = read_node(&root);
    let left = header.children.unwrap().left;
    let missing = dir.path().join(left.to_string());
    std::fs::remove_file(&missing).unwrap();

    let err = knn(&[0.0; 4], 3, &root).unwrap_err();
    assert!(err.to_string().contains(&missing.display().to_string()));
    assert!(matches!(err.downcast_ref::<BallTreeError>(), Some(BallTreeError::Io { .. })));
}

#[test]
fn test_duplicates_in_data() {
    let mut vectors = random_vectors(23, 100, 3);
    let twin = vectors[7].clone();
    vectors.push(twin.clone());
    vectors.push(twin.clone());
    let dir = TempDir::new().unwrap();
    let root = built_tree(&dir, &vectors, 3, 4);

    let found = knn(&twin, 5, &root).unwrap();

    assert_eq!(found.len(), 5);
    assert_eq!(found[0], twin);
    // leaf copies of an already held value are skipped
    assert_eq!(found.iter().filter(|v| **v == twin).count(), 1);
    assert_eq!(linear_knn(&root, &twin, 5).unwrap().iter().filter(|n| n.vector == twin).count(), 3);
}

#[test]
fn test_reference_scenario_10k_by_256() {
    init_tracing();
    let vectors = random_vectors(42, 10_000, 256);
    let dir = TempDir::new().unwrap();
    let root = built_tree(&dir, &vectors, 256, 100);
    let query = vectors[1234].clone();

    let found = KnnSearch::default().search(&root, &query, 100).unwrap();

    assert_eq!(found.len(), 100);
    assert_eq!(found[0].distance, 0.0);
    assert_eq!(found[0].vector, query);
    assert_eq!(euclidean_distance(&found[0].vector, &query), 0.0);

    let expected = brute_force(&vectors, &query, 100);
    let found_vectors = found.into_iter().map(|n| n.vector).collect();
    let expected_vectors = expected.into_iter().map(|(_, v)| v).collect();
    assert_eq!(canonical(found_vectors), canonical(expected_vectors));
}
