//! Brute-force KNN over a memory-mapped root node.
//!
//! The root payload always holds the complete dataset (a build never
//! truncates it), so a linear pass over it is an exact reference for the tree
//! search. Decoding goes through the codec's pure byte functions.

use crate::codec::{check_magic, decode_f64s, decode_header};
use crate::distance::euclidean_distance;
use crate::error::BallTreeError;
use crate::header::{payload_offset, vector_size};
use crate::search::Neighbor;
use anyhow::{Context, Result};
use fs2::FileExt;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// The `k` nearest vectors of the root payload, ascending by distance.
///
/// Unlike the tree search, duplicate vectors in the data are all eligible.
///
/// # Errors
///
/// Returns `FormatMismatch`, `TruncatedRead` or `CorruptHeader` for a bad
/// root, `DimensionMismatch` for a query of the wrong length and `Io` or
/// `Locked` if the file cannot be mapped.
pub fn linear_knn<P: AsRef<Path>>(root_path: P, target: &[f64], k: usize) -> Result<Vec<Neighbor>> {
    let path = root_path.as_ref();
    let file = File::open(path).map_err(|e| BallTreeError::io(path, e))?;
    FileExt::try_lock_shared(&file).map_err(|_| BallTreeError::Locked { path: path.to_owned() })?;

    // SAFETY: the shared advisory lock keeps cooperating writers out while
    // the map is alive.
    let map = unsafe { Mmap::map(&file) }
        .map_err(|e| BallTreeError::io(path, e))
        .with_context(|| format!("Failed to map {}", path.display()))?;

    check_magic(&map, path)?;
    let header = decode_header(&map, path)?;
    if target.len() != header.dimension {
        return Err(BallTreeError::DimensionMismatch {
            expected: header.dimension,
            found: target.len(),
        }
        .into());
    }
    if k == 0 {
        return Ok(Vec::new());
    }

    let stride = vector_size(header.dimension);
    let start = usize::try_from(payload_offset(header.dimension))?;
    let len = usize::try_from(header.count)
        .ok()
        .and_then(|n| n.checked_mul(stride))
        .ok_or_else(|| BallTreeError::CorruptHeader {
            path: path.to_owned(),
            reason: format!("payload of {} vectors overflows", header.count),
        })?;
    let payload = map.get(start..start.saturating_add(len)).ok_or_else(|| {
        BallTreeError::TruncatedRead {
            path: path.to_owned(),
            expected: start.saturating_add(len),
            actual: map.len(),
        }
    })?;

    let mut scratch = Vec::with_capacity(header.dimension);
    let mut ranked: Vec<(f64, usize)> = payload
        .chunks_exact(stride)
        .enumerate()
        .map(|(i, bytes)| {
            scratch.clear();
            decode_f64s(bytes, &mut scratch);
            (euclidean_distance(target, &scratch), i)
        })
        .collect();
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    ranked.truncate(k);

    Ok(ranked
        .into_iter()
        .filter_map(|(distance, i)| {
            let bytes = payload.get(i * stride..(i + 1) * stride)?;
            let mut vector = Vec::with_capacity(header.dimension);
            decode_f64s(bytes, &mut vector);
            Some(Neighbor { vector, distance })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NodeFile;
    use tempfile::TempDir;

    #[test]
    fn test_linear_knn_orders_by_distance() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let vectors = vec![vec![5.0, 0.0], vec![1.0, 0.0], vec![3.0, 0.0], vec![-2.0, 0.0]];
        NodeFile::create_root(&root, 2, &vectors).unwrap();

        let hits = linear_knn(&root, &[0.0, 0.0], 3).unwrap();

        let found: Vec<Vec<f64>> = hits.iter().map(|n| n.vector.clone()).collect();
        assert_eq!(found, vec![vec![1.0, 0.0], vec![-2.0, 0.0], vec![3.0, 0.0]]);
        assert_eq!(hits[0].distance, 1.0);
    }

    #[test]
    fn test_linear_knn_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        std::fs::write(&root, b"plain text, nothing to see here").unwrap();

        let err = linear_knn(&root, &[0.0], 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BallTreeError>(),
            Some(BallTreeError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn test_linear_knn_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        NodeFile::create_root(&root, 3, [[1.0, 2.0, 3.0]]).unwrap();

        let err = linear_knn(&root, &[1.0, 2.0], 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BallTreeError>(),
            Some(BallTreeError::DimensionMismatch { expected: 3, found: 2 })
        ));
    }
}
