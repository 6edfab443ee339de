//! Node codec and vector I/O.
//!
//! [`NodeFile`] is the only place that turns node bytes into vectors and
//! metadata (the memory-mapped scan in `scan.rs` reuses the pure decoding
//! functions at the bottom of this module). It has no notion of tree shape:
//! callers decide which node to open and what to do with its vectors.
//!
//! # Handle Model
//!
//! `NodeFile<H>` is generic over any random-access handle. Reading requires
//! `H: Read + Seek`, writing `H: Write + Seek`. On-disk nodes use
//! [`File`]; unit tests run the same code over `Cursor<Vec<u8>>`.
//!
//! # Scratch Buffers
//!
//! Bulk reads land in a caller-owned [`VectorBuffer`]. The buffer is resized
//! to the exact request on every call, so one buffer can be reused across
//! nodes of any size and dimension.

use crate::distance::euclidean_distance;
use crate::error::BallTreeError;
use crate::header::{
    COORD_SIZE, COUNT_OFFSET, ChildIds, MAGIC, NodeHeader, RADIUS_OFFSET, children_offset,
    decode_children, encode_children, payload_offset, vector_size,
};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A vector of coordinates.
pub type Vector = Vec<f64>;

/// Default size of one streaming read (1 MiB)
pub const DEFAULT_SCAN_CHUNK_BYTES: usize = 1 << 20;

type Result<T> = std::result::Result<T, BallTreeError>;

/// Caller-owned scratch space for bulk vector reads.
#[derive(Debug)]
pub struct VectorBuffer {
    bytes: Vec<u8>,
    values: Vec<f64>,
    chunk_bytes: usize,
}

impl Default for VectorBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SCAN_CHUNK_BYTES)
    }
}

impl VectorBuffer {
    /// Creates a buffer whose streaming scans read about `chunk_bytes` at a time.
    #[must_use]
    pub fn new(chunk_bytes: usize) -> Self {
        Self { bytes: Vec::new(), values: Vec::new(), chunk_bytes: chunk_bytes.max(1) }
    }

    /// Vectors per streaming read for the given dimension (at least one).
    #[must_use]
    pub fn chunk_vectors(&self, dimension: usize) -> usize {
        (self.chunk_bytes / vector_size(dimension).max(1)).max(1)
    }

    /// Values decoded by the last read.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// A node file opened through a random-access handle.
#[derive(Debug)]
pub struct NodeFile<H = File> {
    handle: H,
    path: PathBuf,
}

impl NodeFile<File> {
    /// Opens an existing node for reading under a shared advisory lock.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be opened and `Locked` if a writer
    /// holds it.
    pub fn open_read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| BallTreeError::io(path, e))?;
        FileExt::try_lock_shared(&file).map_err(|_| BallTreeError::Locked { path: path.to_owned() })?;
        Ok(Self { handle: file, path: path.to_owned() })
    }

    /// Opens an existing node for reading and writing under an exclusive
    /// advisory lock.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be opened and `Locked` if any other
    /// handle holds a lock on it.
    pub fn open_write<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| BallTreeError::io(path, e))?;
        FileExt::try_lock_exclusive(&file).map_err(|_| BallTreeError::Locked { path: path.to_owned() })?;
        Ok(Self { handle: file, path: path.to_owned() })
    }

    /// Creates a new, empty node file. Returns `None` if the name is taken.
    ///
    /// # Errors
    ///
    /// Returns `Io` for any failure other than the file already existing.
    pub fn create_new<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        let file = match OpenOptions::new().read(true).write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(BallTreeError::io(path, e)),
        };
        FileExt::try_lock_exclusive(&file).map_err(|_| BallTreeError::Locked { path: path.to_owned() })?;
        Ok(Some(Self { handle: file, path: path.to_owned() }))
    }

    /// Writes a root node holding `vectors` as a flat payload.
    ///
    /// Radius and centroid are stored as `NaN` (not yet computed) and both
    /// child ids as the leaf sentinel. An existing file is truncated once the
    /// exclusive lock is held; a locked file is left as it was.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOptions` for a zero dimension, `DimensionMismatch` if
    /// any vector has the wrong length, `Locked` if another handle holds the
    /// file, and `Io` on write failure.
    pub fn create_root<P, I, V>(path: P, dimension: usize, vectors: I) -> Result<NodeHeader>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = V>,
        V: AsRef<[f64]>,
    {
        let path = path.as_ref();
        if dimension == 0 || i32::try_from(dimension).is_err() {
            return Err(BallTreeError::InvalidOptions(format!(
                "dimension must be in 1..={}, got {dimension}",
                i32::MAX
            )));
        }

        // truncate only once the lock is held
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| BallTreeError::io(path, e))?;
        FileExt::try_lock_exclusive(&file).map_err(|_| BallTreeError::Locked { path: path.to_owned() })?;
        file.set_len(0).map_err(|e| BallTreeError::io(path, e))?;
        let mut node = Self { handle: file, path: path.to_owned() };

        let mut writer = node.payload_writer(dimension)?;
        for vector in vectors {
            writer.push(vector.as_ref())?;
        }
        let count = writer.finish()?;

        let header = NodeHeader::unbounded(count, dimension);
        node.write_header(&header)?;
        node.sync()?;
        Ok(header)
    }

    /// Flushes file contents to disk.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the sync fails.
    pub fn sync(&mut self) -> Result<()> {
        self.handle.sync_data().map_err(|e| BallTreeError::io(&self.path, e))
    }
}

impl<H> NodeFile<H> {
    /// Wraps an arbitrary handle; `path` is only used in error messages.
    pub fn from_handle(handle: H, path: impl Into<PathBuf>) -> Self {
        Self { handle, path: path.into() }
    }

    /// Path of the node file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the underlying handle.
    pub fn into_inner(self) -> H {
        self.handle
    }

    fn io_err(&self, source: io::Error) -> BallTreeError {
        BallTreeError::io(&self.path, source)
    }
}

impl<H: Seek> NodeFile<H> {
    /// Positions the handle at the first payload vector.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the seek fails.
    pub fn seek_to_payload(&mut self, dimension: usize) -> Result<()> {
        self.seek(payload_offset(dimension))
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.handle.seek(SeekFrom::Start(offset)).map(|_| ()).map_err(|e| self.io_err(e))
    }
}

impl<H: Read + Seek> NodeFile<H> {
    /// Checks the 15-byte magic at offset 0. Never writes.
    ///
    /// # Errors
    ///
    /// Returns `FormatMismatch` with the bytes actually found if they differ
    /// from the magic (a file shorter than the magic is a mismatch too).
    pub fn verify_format(&mut self) -> Result<()> {
        self.seek(0)?;
        let mut found = [0u8; MAGIC.len()];
        let read = read_full(&mut self.handle, &mut found).map_err(|e| self.io_err(e))?;
        let found = found.get(..read).unwrap_or_default();
        if found != MAGIC.as_slice() {
            return Err(BallTreeError::FormatMismatch {
                path: self.path.clone(),
                found: found.to_vec(),
            });
        }
        Ok(())
    }

    /// Reads every metadata field in layout order.
    ///
    /// # Errors
    ///
    /// Returns `TruncatedRead` if the metadata is cut short and
    /// `CorruptHeader` if it describes an impossible node.
    pub fn read_header(&mut self) -> Result<NodeHeader> {
        self.seek(COUNT_OFFSET)?;
        let mut prefix = [0u8; 12];
        self.read_exact_checked(&mut prefix)?;
        let (_, dimension) = decode_count_and_dimension(&prefix, &self.path)?;

        let len = usize::try_from(payload_offset(dimension)).map_err(|_| self.corrupt("dimension too large"))?;
        self.ensure_available(0, len)?;
        let mut meta = vec![0u8; len];
        self.read_exact_checked(&mut meta)?;
        decode_header(&meta, &self.path)
    }

    /// Reads one vector at the current position.
    ///
    /// # Errors
    ///
    /// Returns `TruncatedRead` if fewer than `8 * dimension` bytes remain.
    pub fn read_vector(&mut self, dimension: usize) -> Result<Vector> {
        let mut bytes = vec![0u8; vector_size(dimension)];
        self.read_exact_checked(&mut bytes)?;
        let mut out = Vec::with_capacity(dimension);
        decode_f64s(&bytes, &mut out);
        Ok(out)
    }

    /// Reads `count` vectors at the current position with a single read.
    ///
    /// # Errors
    ///
    /// Returns `TruncatedRead` if the payload is shorter than requested.
    pub fn read_vectors_batch(&mut self, dimension: usize, count: usize) -> Result<Vec<Vector>> {
        let mut buffer = VectorBuffer::default();
        let values = self.read_batch(dimension, count, &mut buffer)?;
        Ok(values.chunks_exact(dimension.max(1)).map(<[f64]>::to_vec).collect())
    }

    /// Reads `count` vectors at the current position into `buffer` with a
    /// single read and returns the decoded coordinates (`count * dimension`
    /// values, vector after vector).
    ///
    /// # Errors
    ///
    /// Returns `TruncatedRead` if the payload is shorter than requested.
    pub fn read_batch<'b>(
        &mut self,
        dimension: usize,
        count: usize,
        buffer: &'b mut VectorBuffer,
    ) -> Result<&'b [f64]> {
        let len = count
            .checked_mul(vector_size(dimension))
            .ok_or_else(|| self.corrupt("payload size overflows"))?;
        let position = self.handle.stream_position().map_err(|e| self.io_err(e))?;
        self.ensure_available(position, len)?;
        buffer.bytes.resize(len, 0);
        self.read_exact_checked(&mut buffer.bytes)?;
        buffer.values.clear();
        decode_f64s(&buffer.bytes, &mut buffer.values);
        Ok(&buffer.values)
    }

    /// Streams the whole payload in chunks, calling `f` once per vector in
    /// file order.
    ///
    /// # Errors
    ///
    /// Returns the first error from reading or from `f`.
    pub fn for_each_vector<F>(
        &mut self,
        dimension: usize,
        count: u64,
        buffer: &mut VectorBuffer,
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(&[f64]) -> Result<()>,
    {
        self.seek_to_payload(dimension)?;
        let chunk = buffer.chunk_vectors(dimension) as u64;
        let mut remaining = count;
        while remaining > 0 {
            let take = remaining.min(chunk);
            // take <= chunk, which came from a usize
            let values = self.read_batch(dimension, take as usize, buffer)?;
            for vector in values.chunks_exact(dimension.max(1)) {
                f(vector)?;
            }
            remaining -= take;
        }
        Ok(())
    }

    /// Coordinate-wise mean of all payload vectors, in one streaming pass.
    ///
    /// # Errors
    ///
    /// Returns any read error.
    pub fn compute_centroid(
        &mut self,
        dimension: usize,
        count: u64,
        buffer: &mut VectorBuffer,
    ) -> Result<Vector> {
        let mut sum = vec![0.0; dimension];
        self.for_each_vector(dimension, count, buffer, |v| {
            for (acc, x) in sum.iter_mut().zip(v) {
                *acc += x;
            }
            Ok(())
        })?;

        #[allow(clippy::cast_precision_loss)]
        let n = count as f64;
        Ok(sum.into_iter().map(|s| s / n).collect())
    }

    /// Largest distance from `centroid` to any payload vector, in one
    /// streaming pass.
    ///
    /// # Errors
    ///
    /// Returns any read error.
    pub fn compute_radius(
        &mut self,
        dimension: usize,
        count: u64,
        centroid: &[f64],
        buffer: &mut VectorBuffer,
    ) -> Result<f64> {
        let mut radius = 0.0_f64;
        self.for_each_vector(dimension, count, buffer, |v| {
            radius = radius.max(euclidean_distance(v, centroid));
            Ok(())
        })?;
        Ok(radius)
    }

    fn read_exact_checked(&mut self, bytes: &mut [u8]) -> Result<()> {
        let read = read_full(&mut self.handle, bytes).map_err(|e| self.io_err(e))?;
        if read < bytes.len() {
            return Err(BallTreeError::TruncatedRead {
                path: self.path.clone(),
                expected: bytes.len(),
                actual: read,
            });
        }
        Ok(())
    }

    /// Fails with `TruncatedRead` unless `needed` bytes exist from `offset`,
    /// then leaves the handle positioned at `offset`. Lets callers size
    /// buffers from header fields without trusting them.
    fn ensure_available(&mut self, offset: u64, needed: usize) -> Result<()> {
        let end = self.handle.seek(SeekFrom::End(0)).map_err(|e| self.io_err(e))?;
        let actual = end.saturating_sub(offset);
        if actual < needed as u64 {
            return Err(BallTreeError::TruncatedRead {
                path: self.path.clone(),
                expected: needed,
                actual: usize::try_from(actual).unwrap_or(usize::MAX),
            });
        }
        self.seek(offset)
    }

    fn corrupt(&self, reason: &str) -> BallTreeError {
        BallTreeError::CorruptHeader { path: self.path.clone(), reason: reason.to_owned() }
    }
}

impl<H: Write + Seek> NodeFile<H> {
    /// Writes one vector at the current position: `dimension` big-endian
    /// doubles, no padding.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the write fails.
    pub fn write_vector(&mut self, vector: &[f64]) -> Result<()> {
        let mut bytes = Vec::with_capacity(vector_size(vector.len()));
        encode_vector(vector, &mut bytes);
        self.handle.write_all(&bytes).map_err(|e| self.io_err(e))
    }

    /// Overwrites the whole metadata block (magic through child ids).
    /// The payload is left untouched.
    ///
    /// # Errors
    ///
    /// Returns `CorruptHeader` if the header cannot be represented and `Io`
    /// if the write fails.
    pub fn write_header(&mut self, header: &NodeHeader) -> Result<()> {
        let bytes = encode_header(header, &self.path)?;
        self.seek(0)?;
        self.handle.write_all(&bytes).map_err(|e| self.io_err(e))
    }

    /// Overwrites radius and centroid.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the write fails.
    pub fn write_bounds(&mut self, radius: f64, centroid: &[f64]) -> Result<()> {
        let mut bytes = Vec::with_capacity(COORD_SIZE + vector_size(centroid.len()));
        bytes.extend_from_slice(&radius.to_be_bytes());
        encode_vector(centroid, &mut bytes);
        self.seek(RADIUS_OFFSET)?;
        self.handle.write_all(&bytes).map_err(|e| self.io_err(e))
    }

    /// Overwrites the two child id fields; `None` marks a leaf.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the write fails.
    pub fn set_child_ids(&mut self, dimension: usize, children: Option<ChildIds>) -> Result<()> {
        self.seek(children_offset(dimension))?;
        self.handle.write_all(&encode_children(children)).map_err(|e| self.io_err(e))
    }

    /// Positions at the payload and returns a buffered vector writer.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the seek fails.
    pub fn payload_writer(&mut self, dimension: usize) -> Result<PayloadWriter<'_, H>> {
        self.seek_to_payload(dimension)?;
        Ok(PayloadWriter {
            out: BufWriter::new(&mut self.handle),
            path: &self.path,
            dimension,
            scratch: Vec::with_capacity(vector_size(dimension)),
            written: 0,
        })
    }
}

/// Appends vectors to a node payload through a buffered writer.
pub struct PayloadWriter<'a, H: Write> {
    out: BufWriter<&'a mut H>,
    path: &'a Path,
    dimension: usize,
    scratch: Vec<u8>,
    written: u64,
}

impl<H: Write> PayloadWriter<'_, H> {
    /// Appends one vector.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` for a vector of the wrong length and `Io`
    /// if the write fails.
    pub fn push(&mut self, vector: &[f64]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(BallTreeError::DimensionMismatch {
                expected: self.dimension,
                found: vector.len(),
            });
        }
        self.scratch.clear();
        encode_vector(vector, &mut self.scratch);
        self.out.write_all(&self.scratch).map_err(|e| BallTreeError::io(self.path, e))?;
        self.written += 1;
        Ok(())
    }

    /// Vectors appended so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes buffered bytes and returns the number of vectors written.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the flush fails.
    pub fn finish(mut self) -> Result<u64> {
        self.out.flush().map_err(|e| BallTreeError::io(self.path, e))?;
        Ok(self.written)
    }
}

/// Reads until `buf` is full or the handle reports end of file; returns the
/// number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let Some(rest) = buf.get_mut(filled..) else { break };
        match reader.read(rest) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

//
// === BYTE-LEVEL ENCODING ===
//

/// Appends the big-endian encoding of `vector` to `out`.
pub fn encode_vector(vector: &[f64], out: &mut Vec<u8>) {
    for x in vector {
        out.extend_from_slice(&x.to_be_bytes());
    }
}

/// Decodes big-endian doubles from `bytes` (a multiple of 8 long) into `out`.
pub fn decode_f64s(bytes: &[u8], out: &mut Vec<f64>) {
    out.extend(bytes.chunks_exact(COORD_SIZE).map(|chunk| {
        let mut raw = [0u8; COORD_SIZE];
        raw.copy_from_slice(chunk);
        f64::from_be_bytes(raw)
    }));
}

/// Compares the leading bytes of a node image with the magic.
///
/// # Errors
///
/// Returns `FormatMismatch` carrying the bytes found.
pub fn check_magic(bytes: &[u8], path: &Path) -> Result<()> {
    let found = bytes.get(..MAGIC.len()).unwrap_or(bytes);
    if found == MAGIC.as_slice() {
        Ok(())
    } else {
        Err(BallTreeError::FormatMismatch { path: path.to_owned(), found: found.to_vec() })
    }
}

/// Decodes the count and dimension fields (the 12 bytes at offset 15).
///
/// # Errors
///
/// Returns `CorruptHeader` for a negative count or a non-positive dimension.
pub fn decode_count_and_dimension(prefix: &[u8], path: &Path) -> Result<(u64, usize)> {
    let corrupt = |reason: String| BallTreeError::CorruptHeader { path: path.to_owned(), reason };

    let count = be_array::<8>(prefix, 0).map(i64::from_be_bytes);
    let dimension = be_array::<4>(prefix, 8).map(i32::from_be_bytes);
    let (Some(count), Some(dimension)) = (count, dimension) else {
        return Err(BallTreeError::TruncatedRead {
            path: path.to_owned(),
            expected: 12,
            actual: prefix.len(),
        });
    };

    let count = u64::try_from(count).map_err(|_| corrupt(format!("negative vector count {count}")))?;
    let dimension = usize::try_from(dimension)
        .ok()
        .filter(|d| *d > 0)
        .ok_or_else(|| corrupt(format!("invalid dimension {dimension}")))?;
    Ok((count, dimension))
}

/// Decodes a full metadata block (offset 0 up to the payload).
///
/// # Errors
///
/// Returns `TruncatedRead` if `meta` is shorter than the layout requires and
/// `CorruptHeader` for impossible field values.
pub fn decode_header(meta: &[u8], path: &Path) -> Result<NodeHeader> {
    let prefix = meta.get(MAGIC.len()..).unwrap_or_default();
    let (count, dimension) = decode_count_and_dimension(prefix, path)?;

    let needed = usize::try_from(payload_offset(dimension)).unwrap_or(usize::MAX);
    if meta.len() < needed {
        return Err(BallTreeError::TruncatedRead {
            path: path.to_owned(),
            expected: needed,
            actual: meta.len(),
        });
    }

    let radius_at = usize::try_from(RADIUS_OFFSET).unwrap_or(usize::MAX);
    let centroid_at = radius_at + COORD_SIZE;
    let children_at = centroid_at + vector_size(dimension);

    let radius = be_array::<8>(meta, radius_at).map(f64::from_be_bytes).unwrap_or(f64::NAN);
    let mut centroid = Vec::with_capacity(dimension);
    decode_f64s(meta.get(centroid_at..children_at).unwrap_or_default(), &mut centroid);
    let left = be_array::<8>(meta, children_at).map(i64::from_be_bytes);
    let right = be_array::<8>(meta, children_at + 8).map(i64::from_be_bytes);
    let (Some(left), Some(right)) = (left, right) else {
        return Err(BallTreeError::TruncatedRead {
            path: path.to_owned(),
            expected: needed,
            actual: meta.len(),
        });
    };
    let children = decode_children(left, right)
        .map_err(|reason| BallTreeError::CorruptHeader { path: path.to_owned(), reason })?;

    Ok(NodeHeader { count, dimension, radius, centroid, children })
}

/// Encodes a full metadata block.
///
/// # Errors
///
/// Returns `CorruptHeader` if the count or dimension do not fit the on-disk
/// integer widths, or the centroid length differs from the dimension.
pub fn encode_header(header: &NodeHeader, path: &Path) -> Result<Vec<u8>> {
    let corrupt = |reason: String| BallTreeError::CorruptHeader { path: path.to_owned(), reason };
    let count = i64::try_from(header.count)
        .map_err(|_| corrupt(format!("vector count {} too large", header.count)))?;
    let dimension = i32::try_from(header.dimension)
        .map_err(|_| corrupt(format!("dimension {} too large", header.dimension)))?;
    if header.centroid.len() != header.dimension {
        return Err(corrupt(format!(
            "centroid has {} coordinates, dimension is {}",
            header.centroid.len(),
            header.dimension
        )));
    }

    let mut bytes = Vec::with_capacity(usize::try_from(payload_offset(header.dimension)).unwrap_or(0));
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&count.to_be_bytes());
    bytes.extend_from_slice(&dimension.to_be_bytes());
    bytes.extend_from_slice(&header.radius.to_be_bytes());
    encode_vector(&header.centroid, &mut bytes);
    bytes.extend_from_slice(&encode_children(header.children));
    Ok(bytes)
}

fn be_array<const N: usize>(bytes: &[u8], at: usize) -> Option<[u8; N]> {
    bytes.get(at..at.checked_add(N)?).and_then(|s| s.try_into().ok())
}
