//! Fixed-offset layout of a ball tree node file.
//!
//! # Layout (big-endian)
//!
//! ```text
//! Offset        Size         Field
//! ------        ----         -----
//! 0             15           magic "BALLTREEVECTORS"
//! 15            8            vector count (i64)
//! 23            4            dimension (i32)
//! 27            8            radius (f64)
//! 35            8 * dim      centroid
//! 35 + 8*dim    8            left child id (i64, -1 for a leaf)
//! 43 + 8*dim    8            right child id (i64, -1 for a leaf)
//! 51 + 8*dim    count*dim*8  payload
//! ```
//!
//! Only the payload varies in length with the vector count; every metadata
//! field sits at an offset that depends on the dimension alone.

use std::mem;

/// Node identifier. Child files are named after their id.
pub type NodeId = i64;

/// Child id stored by a leaf.
pub const LEAF_SENTINEL: NodeId = -1;

/// Magic bytes identifying a ball tree node file
pub const MAGIC: &[u8; 15] = b"BALLTREEVECTORS";

/// Offset of the vector count
pub const COUNT_OFFSET: u64 = MAGIC.len() as u64;

/// Offset of the dimension
pub const DIMENSION_OFFSET: u64 = COUNT_OFFSET + mem::size_of::<i64>() as u64;

/// Offset of the radius
pub const RADIUS_OFFSET: u64 = DIMENSION_OFFSET + mem::size_of::<i32>() as u64;

/// Offset of the centroid
pub const CENTROID_OFFSET: u64 = RADIUS_OFFSET + mem::size_of::<f64>() as u64;

/// Size of one coordinate on disk
pub const COORD_SIZE: usize = mem::size_of::<f64>();

/// Byte length of one vector of `dimension` coordinates.
#[inline]
#[must_use]
pub const fn vector_size(dimension: usize) -> usize {
    dimension * COORD_SIZE
}

/// Offset of the left child id; the right child id follows it.
#[inline]
#[must_use]
pub const fn children_offset(dimension: usize) -> u64 {
    CENTROID_OFFSET + vector_size(dimension) as u64
}

/// Offset of the first payload vector: `51 + 8 * dimension`.
#[inline]
#[must_use]
pub const fn payload_offset(dimension: usize) -> u64 {
    children_offset(dimension) + 2 * mem::size_of::<NodeId>() as u64
}

/// Child pointers of an internal node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildIds {
    /// Left child id
    pub left: NodeId,
    /// Right child id
    pub right: NodeId,
}

/// Decoded node metadata (everything before the payload).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeHeader {
    /// Number of vectors logically owned by the node
    pub count: u64,

    /// Coordinates per vector
    pub dimension: usize,

    /// Bounding-ball radius around `centroid`; `NaN` until computed
    pub radius: f64,

    /// Mean of the node's vectors; `NaN` coordinates until computed
    pub centroid: Vec<f64>,

    /// `None` for a leaf
    pub children: Option<ChildIds>,
}

impl NodeHeader {
    /// Header of a freshly written node whose bounds are not known yet.
    #[must_use]
    pub fn unbounded(count: u64, dimension: usize) -> Self {
        Self {
            count,
            dimension,
            radius: f64::NAN,
            centroid: vec![f64::NAN; dimension],
            children: None,
        }
    }

    /// True once radius and centroid hold computed values.
    #[must_use]
    pub fn has_bounds(&self) -> bool {
        !self.radius.is_nan() && self.centroid.iter().all(|c| !c.is_nan())
    }

    /// True if the node has no children.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }
}

/// Encodes the child id pair; a leaf is `(-1, -1)`.
#[must_use]
pub fn encode_children(children: Option<ChildIds>) -> [u8; 16] {
    let (left, right) = match children {
        Some(ChildIds { left, right }) => (left, right),
        None => (LEAF_SENTINEL, LEAF_SENTINEL),
    };
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&left.to_be_bytes());
    out[8..].copy_from_slice(&right.to_be_bytes());
    out
}

/// Decodes the child id pair. A half-leaf pair is rejected.
///
/// # Errors
///
/// Returns a description of the problem if exactly one id is the sentinel.
pub fn decode_children(left: NodeId, right: NodeId) -> Result<Option<ChildIds>, String> {
    match (left == LEAF_SENTINEL, right == LEAF_SENTINEL) {
        (true, true) => Ok(None),
        (false, false) => Ok(Some(ChildIds { left, right })),
        _ => Err(format!("partially split node: left child {left}, right child {right}")),
    }
}
