//! Exact k-nearest-neighbor search over a built tree.
//!
//! # Algorithm
//!
//! 1. Seed a [`BoundedCandidates`] with the first `min(k, count)` vectors of
//!    the root payload. The root keeps the full dataset after a build, so
//!    these are real points and give a finite pruning bound from the start.
//! 2. Walk the tree depth-first, left before right. A node whose ball cannot
//!    hold anything closer than the current k-th best is skipped:
//!    `d(centroid, target) - radius >= worst`.
//! 3. Leaves stream their payload into the candidate set; a vector is only
//!    admitted if it beats the current worst and is not already present.
//!
//! The walk uses an explicit stack and opens one node file at a time.

use crate::codec::{DEFAULT_SCAN_CHUNK_BYTES, NodeFile, Vector, VectorBuffer};
use crate::distance::euclidean_distance;
use crate::error::BallTreeError;
use crate::header::{ChildIds, NodeHeader};
use crate::ids::node_path;
use anyhow::{Context, Result};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// A result vector and its distance to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    /// The stored vector
    pub vector: Vector,
    /// Euclidean distance to the query
    pub distance: f64,
}

/// Search parameters
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Skip nodes whose ball cannot improve the result. Disabling this visits
    /// every node and is only useful for checking pruning.
    pub prune: bool,

    /// Approximate bytes per leaf read
    pub scan_chunk_bytes: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { prune: true, scan_chunk_bytes: DEFAULT_SCAN_CHUNK_BYTES }
    }
}

impl SearchOptions {
    /// Rejects unusable values.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOptions` if `scan_chunk_bytes` is zero.
    pub fn validate(&self) -> Result<(), BallTreeError> {
        if self.scan_chunk_bytes == 0 {
            return Err(BallTreeError::InvalidOptions("scan_chunk_bytes must be > 0".into()));
        }
        Ok(())
    }
}

/// Counters for one query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    /// Node files opened during the walk
    pub visited: u64,
    /// Nodes skipped by the ball test
    pub pruned: u64,
    /// Leaves whose payload was read
    pub leaves_scanned: u64,
    /// Vectors compared against the query (seeds included)
    pub vectors_scanned: u64,
}

//
// === CANDIDATE SET ===
//

struct Entry {
    distance: f64,
    vector: Vector,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance.total_cmp(&other.distance)
    }
}

/// Exact-value key of a vector (one bit pattern per coordinate).
fn value_key(vector: &[f64]) -> Vec<u64> {
    vector.iter().map(|x| x.to_bits()).collect()
}

/// The best `k` vectors seen so far.
///
/// A max-heap by distance, so the current worst is at the top, plus a
/// multiset of exact values for O(1) membership tests.
pub struct BoundedCandidates {
    capacity: usize,
    heap: BinaryHeap<Entry>,
    members: HashMap<Vec<u64>, usize>,
}

impl BoundedCandidates {
    /// Empty set holding at most `capacity` vectors.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity.saturating_add(1).min(1 << 16)),
            members: HashMap::new(),
        }
    }

    /// Number of vectors held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True if nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// True once `capacity` vectors are held.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    /// Distance of the k-th best vector, or infinity while not full.
    #[must_use]
    pub fn worst(&self) -> f64 {
        match self.heap.peek() {
            Some(top) if self.is_full() => top.distance,
            _ => f64::INFINITY,
        }
    }

    /// True if a vector with exactly these coordinates is held.
    #[must_use]
    pub fn contains(&self, vector: &[f64]) -> bool {
        self.members.contains_key(&value_key(vector))
    }

    /// Inserts unconditionally, evicting the worst if over capacity.
    /// Duplicate values are kept.
    pub fn seed(&mut self, vector: Vector, distance: f64) {
        *self.members.entry(value_key(&vector)).or_insert(0) += 1;
        self.heap.push(Entry { distance, vector });
        if self.heap.len() > self.capacity {
            self.evict_worst();
        }
    }

    /// Inserts if `distance` beats the current worst and the value is not
    /// already held. Returns whether the vector was admitted.
    pub fn offer(&mut self, vector: &[f64], distance: f64) -> bool {
        if self.capacity == 0 || !(distance < self.worst()) || self.contains(vector) {
            return false;
        }
        self.seed(vector.to_vec(), distance);
        true
    }

    /// Contents ordered by ascending distance.
    #[must_use]
    pub fn into_sorted(self) -> Vec<Neighbor> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|Entry { distance, vector }| Neighbor { vector, distance })
            .collect()
    }

    fn evict_worst(&mut self) {
        let Some(evicted) = self.heap.pop() else { return };
        let key = value_key(&evicted.vector);
        if let Some(n) = self.members.get_mut(&key) {
            *n -= 1;
            if *n == 0 {
                self.members.remove(&key);
            }
        }
    }
}

//
// === SEARCH ENGINE ===
//

/// Answers KNN queries against trees on disk, reusing one read buffer.
#[derive(Debug)]
pub struct KnnSearch {
    options: SearchOptions,
    buffer: VectorBuffer,
    last_stats: SearchStats,
}

impl Default for KnnSearch {
    fn default() -> Self {
        Self::new(SearchOptions::default())
    }
}

/// The `k` nearest vectors to `target` in the tree rooted at `root_path`,
/// nearest first.
///
/// # Errors
///
/// See [`KnnSearch::search`].
pub fn knn<P: AsRef<Path>>(target: &[f64], k: usize, root_path: P) -> Result<Vec<Vector>> {
    let neighbors = KnnSearch::default().search(root_path, target, k)?;
    Ok(neighbors.into_iter().map(|n| n.vector).collect())
}

impl KnnSearch {
    /// Engine with its own read buffer sized by `options`.
    #[must_use]
    pub fn new(options: SearchOptions) -> Self {
        let buffer = VectorBuffer::new(options.scan_chunk_bytes);
        Self { options, buffer, last_stats: SearchStats::default() }
    }

    /// Counters of the most recent query.
    #[must_use]
    pub fn last_stats(&self) -> SearchStats {
        self.last_stats
    }

    /// The `k` nearest vectors to `target`, ascending by distance.
    ///
    /// Returns `min(k, count)` results. With `k == 0` no file is touched.
    ///
    /// # Errors
    ///
    /// Returns an error whose root cause is a [`BallTreeError`]:
    /// `DimensionMismatch` if `target` does not match the tree (checked
    /// before any payload is read), `FormatMismatch` if a node is not a ball
    /// tree file, and `TruncatedRead`, `CorruptHeader`, `Locked` or `Io` for
    /// damaged or unavailable nodes.
    pub fn search<P: AsRef<Path>>(
        &mut self,
        root_path: P,
        target: &[f64],
        k: usize,
    ) -> Result<Vec<Neighbor>> {
        self.last_stats = SearchStats::default();
        if k == 0 {
            return Ok(Vec::new());
        }
        self.options.validate()?;

        let root = root_path.as_ref();
        let (header, mut candidates) = self
            .seed(root, target, k)
            .with_context(|| format!("Failed to read root node {}", root.display()))?;

        if header.count <= k as u64 {
            warn!(
                root = %root.display(),
                k,
                count = header.count,
                "k covers the whole dataset, returning every vector"
            );
            return Ok(candidates.into_sorted());
        }

        self.walk(root, target, header.dimension, &mut candidates)?;

        let stats = self.last_stats;
        debug!(
            root = %root.display(),
            k,
            visited = stats.visited,
            pruned = stats.pruned,
            leaves = stats.leaves_scanned,
            scanned = stats.vectors_scanned,
            worst = candidates.worst(),
            "knn search complete"
        );
        Ok(candidates.into_sorted())
    }

    /// Opens the root, validates the query against it and loads the seed
    /// vectors.
    fn seed(
        &mut self,
        root: &Path,
        target: &[f64],
        k: usize,
    ) -> Result<(NodeHeader, BoundedCandidates), BallTreeError> {
        let mut node = NodeFile::open_read(root)?;
        node.verify_format()?;
        let header = node.read_header()?;
        if target.len() != header.dimension {
            return Err(BallTreeError::DimensionMismatch {
                expected: header.dimension,
                found: target.len(),
            });
        }

        // at most k, which is a usize
        let seeds = header.count.min(k as u64) as usize;
        let dimension = header.dimension;
        node.seek_to_payload(dimension)?;
        let values = node.read_batch(dimension, seeds, &mut self.buffer)?;

        let mut candidates = BoundedCandidates::new(k);
        for vector in values.chunks_exact(dimension) {
            candidates.seed(vector.to_vec(), euclidean_distance(target, vector));
        }
        self.last_stats.vectors_scanned += seeds as u64;
        Ok((header, candidates))
    }

    fn walk(
        &mut self,
        root: &Path,
        target: &[f64],
        dimension: usize,
        candidates: &mut BoundedCandidates,
    ) -> Result<()> {
        let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];

        while let Some(path) = stack.pop() {
            let children = self
                .visit(&path, target, dimension, candidates)
                .with_context(|| format!("Failed to search node {}", path.display()))?;

            if let Some(ChildIds { left, right }) = children {
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                stack.push(node_path(dir, right));
                stack.push(node_path(dir, left));
            }
        }
        Ok(())
    }

    /// Handles one node. Returns its children if they need visiting.
    fn visit(
        &mut self,
        path: &Path,
        target: &[f64],
        dimension: usize,
        candidates: &mut BoundedCandidates,
    ) -> Result<Option<ChildIds>, BallTreeError> {
        let mut node = NodeFile::open_read(path)?;
        node.verify_format()?;
        let header = node.read_header()?;
        if header.dimension != dimension {
            return Err(BallTreeError::CorruptHeader {
                path: path.to_owned(),
                reason: format!("dimension {} differs from root dimension {dimension}", header.dimension),
            });
        }
        self.last_stats.visited += 1;

        if self.options.prune && can_prune(&header, target, candidates.worst()) {
            trace!(path = %path.display(), "pruned node");
            self.last_stats.pruned += 1;
            return Ok(None);
        }

        if header.children.is_some() {
            return Ok(header.children);
        }

        trace!(path = %path.display(), count = header.count, "scanning leaf");
        node.for_each_vector(dimension, header.count, &mut self.buffer, |vector| {
            candidates.offer(vector, euclidean_distance(target, vector));
            Ok(())
        })?;
        self.last_stats.leaves_scanned += 1;
        self.last_stats.vectors_scanned += header.count;
        Ok(None)
    }
}

/// Ball test: nothing inside the node can be closer than `worst`.
///
/// Unset bounds (`NaN`) never prune.
fn can_prune(header: &NodeHeader, target: &[f64], worst: f64) -> bool {
    euclidean_distance(&header.centroid, target) - header.radius >= worst
}
