//! Identifier generation for child node files.
//!
//! A split creates two sibling files named after fresh ids. Any source only
//! has to produce non-negative ids; uniqueness is enforced by
//! [`allocate_siblings`], which resamples when the two ids coincide or a file
//! of that name already exists.

use crate::codec::NodeFile;
use crate::header::NodeId;
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{trace, warn};

/// Upper bound on resamples before a split gives up.
const MAX_ATTEMPTS: usize = 1024;

/// A source of candidate node ids.
pub trait IdSource {
    /// Returns a non-negative candidate id. Repeats are allowed; callers check.
    fn next_id(&mut self) -> NodeId;
}

/// Uniformly random ids (the default).
#[derive(Debug)]
pub struct RandomIds {
    rng: StdRng,
}

impl RandomIds {
    /// Seeds from the operating system.
    #[must_use]
    pub fn new() -> Self {
        Self { rng: StdRng::from_os_rng() }
    }

    /// Deterministic sequence, for reproducible trees.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl Default for RandomIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for RandomIds {
    fn next_id(&mut self) -> NodeId {
        self.rng.random_range(0..NodeId::MAX)
    }
}

/// Monotonic counter ids.
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicI64,
}

impl SequentialIds {
    /// Starts counting at `start` (clamped to zero).
    #[must_use]
    pub fn starting_at(start: NodeId) -> Self {
        Self { next: AtomicI64::new(start.max(0)) }
    }
}

impl IdSource for SequentialIds {
    fn next_id(&mut self) -> NodeId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl<S: IdSource + ?Sized> IdSource for &mut S {
    fn next_id(&mut self) -> NodeId {
        (**self).next_id()
    }
}

/// Path of the node file for `id` inside `dir`.
#[must_use]
pub fn node_path(dir: &Path, id: NodeId) -> PathBuf {
    dir.join(id.to_string())
}

/// Two freshly created, empty sibling node files.
#[derive(Debug)]
pub struct Siblings {
    /// Left child id
    pub left_id: NodeId,
    /// Left child file, locked for writing
    pub left: NodeFile<File>,
    /// Right child id
    pub right_id: NodeId,
    /// Right child file, locked for writing
    pub right: NodeFile<File>,
}

/// Creates two new node files in `dir` with distinct ids drawn from `ids`.
///
/// Equal ids and names that already exist on disk are both treated as
/// collisions and resolved by drawing again.
///
/// # Errors
///
/// Returns an error if a file cannot be created, or if no free id was found
/// after a bounded number of attempts. A left file created before the
/// failure is removed again.
pub fn allocate_siblings<S: IdSource + ?Sized>(ids: &mut S, dir: &Path) -> Result<Siblings> {
    let (left_id, left) = create_fresh(ids, dir, None)?;
    let (right_id, right) = match create_fresh(ids, dir, Some(left_id)) {
        Ok(created) => created,
        Err(e) => {
            drop(left);
            let left_path = node_path(dir, left_id);
            if let Err(remove) = std::fs::remove_file(&left_path) {
                warn!(
                    path = %left_path.display(),
                    error = %remove,
                    "failed to remove unpaired child file"
                );
            }
            return Err(e);
        }
    };
    Ok(Siblings { left_id, left, right_id, right })
}

fn create_fresh<S: IdSource + ?Sized>(
    ids: &mut S,
    dir: &Path,
    sibling: Option<NodeId>,
) -> Result<(NodeId, NodeFile<File>)> {
    for _ in 0..MAX_ATTEMPTS {
        let id = ids.next_id();
        if id < 0 {
            trace!(id, "negative identifier is reserved, resampling");
            continue;
        }
        if Some(id) == sibling {
            trace!(id, "identifier collision with sibling, resampling");
            continue;
        }
        match NodeFile::create_new(node_path(dir, id))? {
            Some(file) => return Ok((id, file)),
            None => trace!(id, "node file already exists, resampling"),
        }
    }
    anyhow::bail!("no free node id in {} after {MAX_ATTEMPTS} attempts", dir.display())
}
