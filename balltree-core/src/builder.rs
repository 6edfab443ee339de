//! Ball tree construction.
//!
//! # Algorithm
//!
//! A node with more than `leaf_size` vectors is split in four streaming
//! passes over its payload:
//!
//! 1. `farthest`: the vector farthest from the centroid.
//! 2. `second`: the vector maximising `d(centroid, v) + d(v, farthest)`,
//!    ignoring copies of `farthest`.
//! 3. Partition along `baseline = farthest - second`: each vector's
//!    projection key (coordinate sum of its projection onto the baseline) is
//!    compared with the key of the midpoint of the pair. Greater goes right,
//!    everything else left.
//! 4. Each child computes its own centroid and radius from the data just
//!    written, so children never recompute them when their turn comes.
//!
//! # Stale Payload
//!
//! The parent's payload is never truncated. Once its child ids are written
//! the bytes are dead for the tree walk, but the root's payload keeps the
//! whole dataset, which search reads as its initial candidate set.
//!
//! # Worklist
//!
//! Nodes are processed from an explicit stack instead of call recursion, so
//! an unbalanced tree cannot exhaust the call stack. The left subtree is
//! finished before the right one is started.

use crate::codec::{DEFAULT_SCAN_CHUNK_BYTES, NodeFile, Vector, VectorBuffer};
use crate::distance::{dot_product, euclidean_distance, projection_key};
use crate::error::BallTreeError;
use crate::header::{ChildIds, NodeHeader};
use crate::ids::{IdSource, RandomIds, Siblings, allocate_siblings, node_path};
use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

/// Construction parameters
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Nodes with at most this many vectors become leaves (must be > 0)
    pub leaf_size: u64,

    /// Nodes at this depth become leaves regardless of size
    pub max_depth: usize,

    /// Approximate bytes per streaming read
    pub scan_chunk_bytes: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self { leaf_size: 100, max_depth: 128, scan_chunk_bytes: DEFAULT_SCAN_CHUNK_BYTES }
    }
}

impl BuildOptions {
    /// Options with the given leaf size and defaults otherwise.
    #[must_use]
    pub fn with_leaf_size(leaf_size: u64) -> Self {
        Self { leaf_size, ..Self::default() }
    }

    /// Rejects unusable values.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOptions` if `leaf_size` or `scan_chunk_bytes` is zero.
    pub fn validate(&self) -> Result<(), BallTreeError> {
        if self.leaf_size == 0 {
            return Err(BallTreeError::InvalidOptions("leaf_size must be > 0".into()));
        }
        if self.scan_chunk_bytes == 0 {
            return Err(BallTreeError::InvalidOptions("scan_chunk_bytes must be > 0".into()));
        }
        Ok(())
    }
}

/// Summary of one build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Nodes visited (internal and leaf)
    pub nodes: u64,
    /// Nodes finalized as leaves
    pub leaves: u64,
    /// Successful splits
    pub splits: u64,
    /// Oversized nodes that could not be split (all vectors coincide, or one
    /// side of the partition was empty). The second case includes data whose
    /// split line has a zero coordinate sum, where every projection key ties;
    /// such a node stays a single leaf that every query scans in full.
    pub degenerate_splits: u64,
    /// Oversized nodes turned into leaves by the depth limit
    pub depth_limited: u64,
    /// Deepest level processed (root is 0)
    pub max_depth_reached: usize,
}

/// Builds a tree rooted at `path` with default options and random ids.
///
/// # Errors
///
/// Returns an error if any node in the tree fails format verification or
/// cannot be read or written. See [`TreeBuilder::build`].
pub fn build<P: AsRef<Path>>(path: P, is_root: bool, leaf_size: u64) -> Result<BuildReport> {
    TreeBuilder::new(BuildOptions::with_leaf_size(leaf_size)).build(path, is_root)
}

struct BuildTask {
    path: PathBuf,
    is_root: bool,
    depth: usize,
}

/// Splits a node file in place, writing child node files next to it.
#[derive(Debug)]
pub struct TreeBuilder<S = RandomIds> {
    options: BuildOptions,
    ids: S,
    buffer: VectorBuffer,
}

impl TreeBuilder<RandomIds> {
    /// Builder drawing child ids at random.
    #[must_use]
    pub fn new(options: BuildOptions) -> Self {
        Self::with_ids(options, RandomIds::new())
    }
}

impl<S: IdSource> TreeBuilder<S> {
    /// Builder drawing child ids from `ids`.
    pub fn with_ids(options: BuildOptions, ids: S) -> Self {
        let buffer = VectorBuffer::new(options.scan_chunk_bytes);
        Self { options, ids, buffer }
    }

    /// Options in use.
    #[must_use]
    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Builds the subtree rooted at `path`.
    ///
    /// With `is_root` the node's centroid and radius are computed and
    /// persisted first; otherwise the values written by the parent's split
    /// are reused.
    ///
    /// # Errors
    ///
    /// Returns an error (with a [`BallTreeError`] root cause) if any node
    /// fails format verification or I/O. A node's child ids are only written
    /// after both children are complete, so a failed build never leaves a
    /// parent pointing at half-written children.
    pub fn build<P: AsRef<Path>>(&mut self, path: P, is_root: bool) -> Result<BuildReport> {
        self.options.validate()?;
        let root = path.as_ref().to_path_buf();
        info!(
            root = %root.display(),
            leaf_size = self.options.leaf_size,
            max_depth = self.options.max_depth,
            "building ball tree"
        );

        let mut report = BuildReport::default();
        let mut stack = vec![BuildTask { path: root.clone(), is_root, depth: 0 }];

        while let Some(task) = stack.pop() {
            let children = self
                .build_node(&task, &mut report)
                .with_context(|| format!("Failed to build node {}", task.path.display()))?;

            if let Some((left, right)) = children {
                let depth = task.depth + 1;
                stack.push(BuildTask { path: right, is_root: false, depth });
                stack.push(BuildTask { path: left, is_root: false, depth });
            }
        }

        info!(
            root = %root.display(),
            nodes = report.nodes,
            leaves = report.leaves,
            splits = report.splits,
            degenerate = report.degenerate_splits,
            depth = report.max_depth_reached,
            "ball tree built"
        );
        Ok(report)
    }

    /// Processes one node. Returns the child paths if it was split.
    fn build_node(
        &mut self,
        task: &BuildTask,
        report: &mut BuildReport,
    ) -> Result<Option<(PathBuf, PathBuf)>> {
        let mut node = NodeFile::open_write(&task.path)?;
        node.verify_format()?;
        let header = node.read_header()?;
        let NodeHeader { count, dimension, .. } = header;

        report.nodes += 1;
        report.max_depth_reached = report.max_depth_reached.max(task.depth);
        trace!(path = %task.path.display(), count, dimension, depth = task.depth, "visiting node");

        if count <= self.options.leaf_size {
            node.set_child_ids(dimension, None)?;
            report.leaves += 1;
            return Ok(None);
        }

        if task.depth >= self.options.max_depth {
            warn!(
                path = %task.path.display(),
                count,
                depth = task.depth,
                "depth limit reached, keeping oversized leaf"
            );
            node.set_child_ids(dimension, None)?;
            report.leaves += 1;
            report.depth_limited += 1;
            return Ok(None);
        }

        let centroid = if task.is_root || !header.has_bounds() {
            let centroid = node.compute_centroid(dimension, count, &mut self.buffer)?;
            let radius = node.compute_radius(dimension, count, &centroid, &mut self.buffer)?;
            node.write_bounds(radius, &centroid)?;
            debug!(path = %task.path.display(), radius, "computed node bounds");
            centroid
        } else {
            header.centroid
        };

        let Some(plan) = plan_split(&mut node, dimension, count, &centroid, &mut self.buffer)? else {
            warn!(path = %task.path.display(), count, "all vectors coincide, keeping oversized leaf");
            return finish_degenerate(&mut node, dimension, report);
        };

        let dir = task.path.parent().unwrap_or_else(|| Path::new("."));
        let siblings = allocate_siblings(&mut self.ids, dir)?;
        let left_path = node_path(dir, siblings.left_id);
        let right_path = node_path(dir, siblings.right_id);
        let ids = ChildIds { left: siblings.left_id, right: siblings.right_id };

        let counts = write_children(&mut node, dimension, count, &plan, siblings, &mut self.buffer);
        let (left_count, right_count) = match counts {
            Ok(counts) => counts,
            Err(e) => {
                discard(&[&left_path, &right_path]);
                return Err(e.into());
            }
        };

        if left_count == 0 || right_count == 0 {
            discard(&[&left_path, &right_path]);
            warn!(
                path = %task.path.display(),
                count,
                "partition left one side empty, keeping oversized leaf"
            );
            return finish_degenerate(&mut node, dimension, report);
        }

        node.set_child_ids(dimension, Some(ids))?;
        report.splits += 1;
        debug!(
            path = %task.path.display(),
            count,
            left = ids.left,
            left_count,
            right = ids.right,
            right_count,
            "split node"
        );

        Ok(Some((left_path, right_path)))
    }
}

/// Split direction and threshold for one node.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SplitPlan {
    /// `farthest - second`, not normalized
    pub(crate) baseline: Vector,
    /// `baseline · baseline`
    pub(crate) baseline_norm_sq: f64,
    /// Projection key of the midpoint of the farthest pair
    pub(crate) median_key: f64,
}

impl SplitPlan {
    /// True if `vector` belongs to the right child.
    #[must_use]
    pub(crate) fn goes_right(&self, vector: &[f64]) -> bool {
        projection_key(vector, &self.baseline, self.baseline_norm_sq) > self.median_key
    }
}

/// Finds the farthest pair and derives the split. Returns `None` when the
/// node cannot be split (every vector equals the centroid or `farthest`).
///
/// # Errors
///
/// Returns any read error.
pub(crate) fn plan_split<H: std::io::Read + std::io::Seek>(
    node: &mut NodeFile<H>,
    dimension: usize,
    count: u64,
    centroid: &[f64],
    buffer: &mut VectorBuffer,
) -> Result<Option<SplitPlan>, BallTreeError> {
    let mut farthest: Option<Vector> = None;
    let mut max_distance = 0.0;
    node.for_each_vector(dimension, count, buffer, |v| {
        let distance = euclidean_distance(centroid, v);
        if distance > max_distance {
            max_distance = distance;
            farthest = Some(v.to_vec());
        }
        Ok(())
    })?;
    let Some(farthest) = farthest else { return Ok(None) };

    let mut second: Option<Vector> = None;
    let mut max_span = 0.0;
    node.for_each_vector(dimension, count, buffer, |v| {
        if bit_identical(v, &farthest) {
            return Ok(());
        }
        let span = euclidean_distance(centroid, v) + euclidean_distance(v, &farthest);
        if span > max_span {
            max_span = span;
            second = Some(v.to_vec());
        }
        Ok(())
    })?;
    let Some(second) = second else { return Ok(None) };

    let baseline: Vector = farthest.iter().zip(&second).map(|(f, s)| f - s).collect();
    let baseline_norm_sq = dot_product(&baseline, &baseline);
    if !(baseline_norm_sq.is_finite() && baseline_norm_sq > 0.0) {
        return Ok(None);
    }

    let midpoint: Vector = farthest.iter().zip(&second).map(|(f, s)| (f + s) / 2.0).collect();
    let median_key = projection_key(&midpoint, &baseline, baseline_norm_sq);
    if median_key.is_nan() {
        return Ok(None);
    }

    Ok(Some(SplitPlan { baseline, baseline_norm_sq, median_key }))
}

/// Streams the parent's payload into the two sibling files and finalizes
/// their metadata. Returns the vector count of each side.
fn write_children<H: std::io::Read + std::io::Seek>(
    parent: &mut NodeFile<H>,
    dimension: usize,
    count: u64,
    plan: &SplitPlan,
    siblings: Siblings,
    buffer: &mut VectorBuffer,
) -> Result<(u64, u64), BallTreeError> {
    let Siblings { mut left, mut right, .. } = siblings;

    let (left_count, right_count) = {
        let mut left_out = left.payload_writer(dimension)?;
        let mut right_out = right.payload_writer(dimension)?;
        parent.for_each_vector(dimension, count, buffer, |v| {
            if plan.goes_right(v) { right_out.push(v) } else { left_out.push(v) }
        })?;
        (left_out.finish()?, right_out.finish()?)
    };

    if left_count > 0 && right_count > 0 {
        finalize_child(&mut left, dimension, left_count, buffer)?;
        finalize_child(&mut right, dimension, right_count, buffer)?;
    }
    Ok((left_count, right_count))
}

/// Writes a child's header with bounds computed from its own payload.
fn finalize_child(
    child: &mut NodeFile<File>,
    dimension: usize,
    count: u64,
    buffer: &mut VectorBuffer,
) -> Result<(), BallTreeError> {
    let centroid = child.compute_centroid(dimension, count, buffer)?;
    let radius = child.compute_radius(dimension, count, &centroid, buffer)?;
    child.write_header(&NodeHeader { count, dimension, radius, centroid, children: None })
}

fn finish_degenerate<H: std::io::Write + std::io::Seek>(
    node: &mut NodeFile<H>,
    dimension: usize,
    report: &mut BuildReport,
) -> Result<Option<(PathBuf, PathBuf)>> {
    node.set_child_ids(dimension, None)?;
    report.leaves += 1;
    report.degenerate_splits += 1;
    Ok(None)
}

/// Removes child files of an abandoned split.
fn discard(paths: &[&Path]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to remove abandoned child file");
        }
    }
}

fn bit_identical(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
}
