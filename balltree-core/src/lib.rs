//! Balltree - disk-resident ball tree for exact k-nearest-neighbor search
//!
//! A dataset of fixed-dimension `f64` vectors is written once as a root node
//! file, split offline into a binary tree of node files, then queried many
//! times. Each node stores a bounding ball (centroid and radius) so a query
//! can skip every subtree that cannot hold a closer point than its current
//! k-th best.
//!
//! # Example
//!
//! ```no_run
//! use balltree_core::{BallTree, TreeOptions};
//!
//! # fn main() -> anyhow::Result<()> {
//! let vectors = vec![vec![0.0, 1.0], vec![2.0, 3.0], vec![4.0, 5.0]];
//! BallTree::create("data/root", 2, &vectors)?;
//!
//! let mut tree = BallTree::open("data/root", TreeOptions::default())?;
//! tree.build()?;
//!
//! let nearest = tree.knn(&[1.0, 2.0], 2)?;
//! assert_eq!(nearest.len(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! # On-Disk Model
//!
//! - One file per node, named by a 64-bit id, all in the root's directory
//! - Big-endian, fixed-offset metadata followed by the node's vectors
//! - Internal nodes keep their payload after splitting; the root therefore
//!   always holds the complete dataset
//!
//! # Split Direction
//!
//! A node is split by comparing the coordinate sum of each vector's
//! projection onto the line through its two most distant points. When that
//! line's coordinates sum to zero (points along an anti-diagonal such as
//! `(i, -i)`), every vector gets the same key, the node cannot be split and
//! stays one oversized leaf. Such nodes are counted in
//! [`BuildReport::degenerate_splits`]; queries on them are still exact but
//! scan the whole leaf.
//!
//! # What It Is Not
//!
//! The tree is built once and then read. There are no incremental inserts,
//! deletes or concurrent writers, and results are exact rather than
//! approximate.

pub mod builder;
pub mod distance;
pub mod error;
pub mod header;
pub mod scan;
pub mod search;

#[cfg(feature = "internals")]
pub mod codec;
#[cfg(not(feature = "internals"))]
pub(crate) mod codec;

#[cfg(feature = "internals")]
pub mod ids;
#[cfg(not(feature = "internals"))]
pub(crate) mod ids;

pub use builder::{BuildOptions, BuildReport, TreeBuilder, build};
pub use codec::Vector;
pub use distance::euclidean_distance;
pub use error::BallTreeError;
pub use header::{MAGIC, NodeHeader, NodeId};
pub use scan::linear_knn;
pub use search::{BoundedCandidates, KnnSearch, Neighbor, SearchOptions, SearchStats, knn};

use anyhow::{Context, Result};
use codec::NodeFile;
use std::path::{Path, PathBuf};
use tracing::info;

/// Configuration for a [`BallTree`]
#[derive(Debug, Clone, Default)]
pub struct TreeOptions {
    /// Used by [`BallTree::build`]
    pub build: BuildOptions,

    /// Used by [`BallTree::knn`]
    pub search: SearchOptions,
}

/// A tree rooted at one node file.
///
/// Holds no file handles between calls; every operation opens the node
/// files it needs and releases them before returning.
#[derive(Debug)]
pub struct BallTree {
    root: PathBuf,
    count: u64,
    dimension: usize,
    options: TreeOptions,
    search: KnnSearch,
}

impl BallTree {
    /// Writes a new root node holding `vectors` and opens it with default
    /// options. An existing file at `path` is replaced.
    ///
    /// The tree is not built yet; searching it scans every vector.
    ///
    /// # Errors
    ///
    /// Returns an error if `dimension` is zero, a vector has a different
    /// length, or the file cannot be written.
    pub fn create<P, I, V>(path: P, dimension: usize, vectors: I) -> Result<Self>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = V>,
        V: AsRef<[f64]>,
    {
        let path = path.as_ref();
        let header = NodeFile::create_root(path, dimension, vectors)
            .with_context(|| format!("Failed to write root node {}", path.display()))?;
        info!(root = %path.display(), count = header.count, dimension, "wrote root node");

        Ok(Self::from_parts(path, &header, TreeOptions::default()))
    }

    /// Opens an existing root node.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, locked by a writer, not in
    /// ball tree format or has a damaged header.
    pub fn open<P: AsRef<Path>>(path: P, options: TreeOptions) -> Result<Self> {
        let path = path.as_ref();
        options.build.validate()?;
        options.search.validate()?;

        let header = {
            let mut node = NodeFile::open_read(path)?;
            node.verify_format()?;
            node.read_header()
                .with_context(|| format!("Failed to read root node {}", path.display()))?
        };

        Ok(Self::from_parts(path, &header, options))
    }

    fn from_parts(path: &Path, header: &NodeHeader, options: TreeOptions) -> Self {
        let search = KnnSearch::new(options.search.clone());
        Self {
            root: path.to_path_buf(),
            count: header.count,
            dimension: header.dimension,
            options,
            search,
        }
    }

    /// Splits the tree down to leaves of at most `leaf_size` vectors.
    ///
    /// Meant for a freshly written root. Building an already built root
    /// recomputes its bounds and writes a second set of child files; the
    /// first set is left orphaned on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if any node cannot be read or written. The tree is
    /// still searchable afterwards: a parent only points at children once
    /// both are complete.
    pub fn build(&mut self) -> Result<BuildReport> {
        TreeBuilder::new(self.options.build.clone()).build(&self.root, true)
    }

    /// The `k` nearest stored vectors to `target`, nearest first.
    ///
    /// # Errors
    ///
    /// Returns an error if `target` has the wrong dimension or a node file
    /// cannot be read.
    pub fn knn(&mut self, target: &[f64], k: usize) -> Result<Vec<Neighbor>> {
        self.search.search(&self.root, target, k)
    }

    /// Counters from the last [`knn`](Self::knn) call.
    #[must_use]
    pub fn last_search_stats(&self) -> SearchStats {
        self.search.last_stats()
    }

    /// Number of vectors in the tree.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.count
    }

    /// True if the tree holds no vectors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Coordinates per vector.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Path of the root node file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn line(n: u32, dimension: usize) -> Vec<Vec<f64>> {
        (0..n)
            .map(|i| {
                let mut v = vec![0.0; dimension];
                v[0] = f64::from(i);
                v
            })
            .collect()
    }

    #[test]
    fn test_create_and_open() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");

        let created = BallTree::create(&root, 8, line(10, 8)).unwrap();
        assert_eq!(created.len(), 10);
        assert_eq!(created.dimension(), 8);
        assert_eq!(created.path(), root.as_path());
        assert!(!created.is_empty());

        let opened = BallTree::open(&root, TreeOptions::default()).unwrap();
        assert_eq!(opened.len(), 10);
        assert_eq!(opened.dimension(), 8);
    }

    #[test]
    fn test_build_then_search() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        BallTree::create(&root, 4, line(50, 4)).unwrap();

        let options = TreeOptions { build: BuildOptions::with_leaf_size(4), ..TreeOptions::default() };
        let mut tree = BallTree::open(&root, options).unwrap();
        let report = tree.build().unwrap();
        assert!(report.splits > 0);

        let hits = tree.knn(&[20.2, 0.0, 0.0, 0.0], 3).unwrap();
        let firsts: Vec<f64> = hits.iter().map(|n| n.vector[0]).collect();
        assert_eq!(firsts, vec![20.0, 21.0, 19.0]);
        assert!(tree.last_search_stats().visited > 0);
    }

    #[test]
    fn test_search_before_build_scans_everything() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let mut tree = BallTree::create(&root, 2, line(30, 2)).unwrap();

        let hits = tree.knn(&[7.4, 0.0], 2).unwrap();

        assert_eq!(hits[0].vector, vec![7.0, 0.0]);
        assert_eq!(hits[1].vector, vec![8.0, 0.0]);
        assert_eq!(tree.last_search_stats().leaves_scanned, 1);
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "just some text, long enough").unwrap();

        let err = BallTree::open(&path, TreeOptions::default()).unwrap_err();
        assert!(err.to_string().contains("not in ball tree format"));
    }

    #[test]
    fn test_open_rejects_zero_leaf_size() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        BallTree::create(&root, 2, line(3, 2)).unwrap();

        let options = TreeOptions { build: BuildOptions::with_leaf_size(0), ..TreeOptions::default() };
        assert!(BallTree::open(&root, options).is_err());
    }
}
