//! Typed failures raised while reading, writing or walking node files.
//!
//! Builder, search and facade functions return `anyhow::Result`; the root
//! cause is always one of these variants, so callers can inspect it with
//! `err.downcast_ref::<BallTreeError>()`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the node codec and the operations built on it.
#[derive(Debug, Error)]
pub enum BallTreeError {
    /// The first 15 bytes of the file are not the ball tree magic.
    #[error(
        "file {} is not in ball tree format: found header {:?}, wanted {:?}",
        path.display(),
        String::from_utf8_lossy(found),
        String::from_utf8_lossy(crate::header::MAGIC)
    )]
    FormatMismatch {
        /// Offending node file.
        path: PathBuf,
        /// Bytes actually found at offset 0 (may be shorter than the magic).
        found: Vec<u8>,
    },

    /// End of file was reached in the middle of a field or vector.
    #[error(
        "truncated read in {}: expected {expected} bytes, got {actual}",
        path.display()
    )]
    TruncatedRead {
        /// Offending node file.
        path: PathBuf,
        /// Bytes the field or vector required.
        expected: usize,
        /// Bytes that were available.
        actual: usize,
    },

    /// Header fields decode but describe an impossible node.
    #[error("corrupt header in {}: {reason}", path.display())]
    CorruptHeader {
        /// Offending node file.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// Query vector length differs from the tree's dimension.
    #[error("dimension mismatch: tree has {expected}, query has {found}")]
    DimensionMismatch {
        /// Dimension stored in the tree.
        expected: usize,
        /// Dimension of the supplied vector.
        found: usize,
    },

    /// Another handle holds a conflicting advisory lock on the node file.
    #[error("node file {} is locked by another operation", path.display())]
    Locked {
        /// Offending node file.
        path: PathBuf,
    },

    /// Rejected builder or search configuration.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Underlying I/O failure.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File being accessed.
        path: PathBuf,
        /// Original error.
        #[source]
        source: io::Error,
    },
}

impl BallTreeError {
    /// Wraps an [`io::Error`] with the path it happened on.
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
