//! FFI bindings for the ball tree
//!
//! A C-compatible interface over `balltree-core`. A tree is addressed by the
//! path of its root node file; no handles are kept between calls, so there is
//! nothing to open or free.
//!
//! # Safety Guarantees
//!
//! - No panic may cross the FFI boundary (enforced by `ffi_guard`)
//! - Strict UTF-8 validation for all path arguments
//! - Null pointer checks on all pointer arguments
//!
//! # Error Handling
//!
//! Errors are reported through:
//! - Return values: `-1` from every function returning a signed integer
//! - Thread-local error message: `balltree_last_error_message()`

use balltree_core::{BallTree, BuildOptions, TreeBuilder, TreeOptions};
use libc::{c_char, c_double, c_int, size_t, ssize_t};
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::ptr;
use std::slice;

thread_local! {
    /// Each thread keeps its own last error.
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Set the last error message for the current thread. Interior NULs are
/// escaped so reporting itself never fails.
fn set_last_error(err: impl std::fmt::Display) {
    LAST_ERROR.with(|cell| {
        let safe_msg = err.to_string().replace('\0', "\\0");
        let c_str = CString::new(safe_msg).unwrap_or_default();
        *cell.borrow_mut() = Some(c_str);
    });
}

/// Records a library error with its whole context chain.
fn report(err: &anyhow::Error) {
    set_last_error(format!("{err:#}"));
}

fn clear_last_error() {
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = None;
    });
}

/// Panic barrier at the FFI boundary.
///
/// Returns `None` if `f` panicked, after recording the panic message as the
/// last error. `AssertUnwindSafe` is fine here: a panicking call is abandoned
/// and no shared state outlives it.
fn ffi_guard<F, R>(f: F) -> Option<R>
where
    F: FnOnce() -> R,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => Some(result),
        Err(e) => {
            let msg = if let Some(s) = e.downcast_ref::<&str>() {
                format!("Panic: {s}")
            } else if let Some(s) = e.downcast_ref::<String>() {
                format!("Panic: {s}")
            } else {
                "Unknown panic".to_string()
            };
            set_last_error(msg);
            None
        }
    }
}

/// Borrows a C path argument as UTF-8, recording an error if it is NULL or
/// not valid UTF-8.
///
/// # Safety
///
/// `path` must be NULL or a valid NUL-terminated string.
unsafe fn path_arg<'a>(path: *const c_char) -> Option<&'a str> {
    if path.is_null() {
        set_last_error("Path cannot be NULL");
        return None;
    }
    // SAFETY: Caller guarantees path is a valid C string
    let c_path = unsafe { CStr::from_ptr(path) };

    // STRICT UTF-8 CHECK: Do not use to_string_lossy()
    match c_path.to_str() {
        Ok(s) => Some(s),
        Err(_) => {
            set_last_error("Path must be valid UTF-8");
            None
        }
    }
}

//
// === TREE LIFECYCLE ===
//

/// Write a new root node holding `count` vectors of `dimension` doubles
///
/// `vectors` is read row after row: vector `i` occupies
/// `vectors[i * dimension .. (i + 1) * dimension]`. An existing file at
/// `path` is replaced. The tree is searchable right away (every query scans
/// all vectors) and gets fast once `balltree_build()` has run.
///
/// # Returns
///
/// - 0 on success
/// - -1 on failure (check `balltree_last_error_message()`)
///
/// # Example (C)
///
/// ```c
/// double data[3 * 2] = {0.0, 1.0, 2.0, 3.0, 4.0, 5.0};
/// if (balltree_write_root("tree/root", data, 3, 2) != 0) {
///     fprintf(stderr, "Error: %s\n", balltree_last_error_message());
/// }
/// ```
///
/// # Safety
///
/// - `path` must be a valid, NUL-terminated UTF-8 string
/// - `vectors` must point to `count * dimension` valid doubles
#[unsafe(no_mangle)]
pub unsafe extern "C" fn balltree_write_root(
    path: *const c_char,
    vectors: *const c_double,
    count: size_t,
    dimension: size_t,
) -> c_int {
    ffi_guard(|| {
        // SAFETY: forwarded caller guarantee
        let Some(path) = (unsafe { path_arg(path) }) else { return -1 };

        if dimension == 0 {
            set_last_error("Dimension must be > 0");
            return -1;
        }
        let Some(total) = count.checked_mul(dimension) else {
            set_last_error("count * dimension overflows");
            return -1;
        };
        if vectors.is_null() && total > 0 {
            set_last_error("Null vector pointer");
            return -1;
        }

        let data: &[f64] = if total == 0 {
            &[]
        } else {
            // SAFETY: Caller guarantees vectors points to count * dimension doubles
            unsafe { slice::from_raw_parts(vectors, total) }
        };

        match BallTree::create(path, dimension, data.chunks_exact(dimension)) {
            Ok(_) => {
                clear_last_error();
                0
            }
            Err(e) => {
                report(&e);
                -1
            }
        }
    })
    .unwrap_or(-1)
}

/// Build the tree rooted at `path` with leaves of at most `leaf_size`
/// vectors
///
/// # Returns
///
/// - Number of leaves on success
/// - -1 on failure (check `balltree_last_error_message()`)
///
/// # Safety
///
/// - `path` must be a valid, NUL-terminated UTF-8 string
/// - No other thread or process may use the tree during the build
#[unsafe(no_mangle)]
pub unsafe extern "C" fn balltree_build(path: *const c_char, leaf_size: u64) -> i64 {
    // SAFETY: forwarded caller guarantee
    unsafe { balltree_build_with_options(path, leaf_size, 0) }
}

/// Build with an explicit depth limit
///
/// Nodes at depth `max_depth` become leaves whatever their size. Pass 0 to
/// keep the default limit.
///
/// # Returns
///
/// - Number of leaves on success
/// - -1 on failure (check `balltree_last_error_message()`)
///
/// # Safety
///
/// Same requirements as `balltree_build()`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn balltree_build_with_options(
    path: *const c_char,
    leaf_size: u64,
    max_depth: u32,
) -> i64 {
    ffi_guard(|| {
        // SAFETY: forwarded caller guarantee
        let Some(path) = (unsafe { path_arg(path) }) else { return -1 };

        let mut options = BuildOptions::with_leaf_size(leaf_size);
        if max_depth > 0 {
            options.max_depth = max_depth as usize;
        }

        match TreeBuilder::new(options).build(path, true) {
            Ok(summary) => {
                clear_last_error();
                i64::try_from(summary.leaves).unwrap_or(i64::MAX)
            }
            Err(e) => {
                report(&e);
                -1
            }
        }
    })
    .unwrap_or(-1)
}

//
// === SEARCH ===
//

/// Find the `k` nearest vectors to `query`
///
/// # Arguments
///
/// - `path`: root node file
/// - `query`: pointer to `len` doubles (`len` must equal the tree's dimension)
/// - `k`: number of neighbors wanted
/// - `out_vectors`: space for `k * len` doubles; result `i` is written to
///   `out_vectors[i * len .. (i + 1) * len]`
/// - `out_dists`: space for `k` doubles, or NULL if distances are not needed
///
/// # Returns
///
/// - Number of results (`min(k, count)`), nearest first
/// - -1 on failure (check `balltree_last_error_message()`)
///
/// # Example (C)
///
/// ```c
/// double query[2] = {1.0, 2.0};
/// double found[5 * 2];
/// double dists[5];
/// ssize_t n = balltree_knn("tree/root", query, 2, 5, found, dists);
/// for (ssize_t i = 0; i < n; i++) {
///     printf("%f: (%f, %f)\n", dists[i], found[2 * i], found[2 * i + 1]);
/// }
/// ```
///
/// # Safety
///
/// - `path` must be a valid, NUL-terminated UTF-8 string
/// - `query` must point to `len` valid doubles
/// - `out_vectors` must have space for `k * len` doubles
/// - `out_dists` must be NULL or have space for `k` doubles
#[unsafe(no_mangle)]
pub unsafe extern "C" fn balltree_knn(
    path: *const c_char,
    query: *const c_double,
    len: size_t,
    k: size_t,
    out_vectors: *mut c_double,
    out_dists: *mut c_double,
) -> ssize_t {
    ffi_guard(|| {
        // SAFETY: forwarded caller guarantee
        let Some(path) = (unsafe { path_arg(path) }) else { return -1 };

        if query.is_null() || out_vectors.is_null() {
            set_last_error("Null buffer pointers");
            return -1;
        }
        if len == 0 {
            set_last_error("Query length must be > 0");
            return -1;
        }

        // SAFETY: Caller guarantees query points to len valid doubles
        let query = unsafe { slice::from_raw_parts(query, len) };

        let mut tree = match BallTree::open(path, TreeOptions::default()) {
            Ok(tree) => tree,
            Err(e) => {
                report(&e);
                return -1;
            }
        };

        match tree.knn(query, k) {
            Ok(neighbors) => {
                for (i, neighbor) in neighbors.iter().enumerate() {
                    // SAFETY: Caller guarantees space for k results; there
                    // are at most k and each has len coordinates
                    unsafe {
                        ptr::copy_nonoverlapping(
                            neighbor.vector.as_ptr(),
                            out_vectors.add(i * len),
                            len,
                        );
                        if !out_dists.is_null() {
                            *out_dists.add(i) = neighbor.distance;
                        }
                    }
                }
                clear_last_error();
                ssize_t::try_from(neighbors.len()).unwrap_or(-1)
            }
            Err(e) => {
                report(&e);
                -1
            }
        }
    })
    .unwrap_or(-1)
}

//
// === INTROSPECTION ===
//

/// Number of vectors in the tree rooted at `path`
///
/// # Returns
///
/// - Vector count on success
/// - -1 on failure (check `balltree_last_error_message()`)
///
/// # Safety
///
/// - `path` must be a valid, NUL-terminated UTF-8 string
#[unsafe(no_mangle)]
pub unsafe extern "C" fn balltree_len(path: *const c_char) -> i64 {
    ffi_guard(|| {
        // SAFETY: forwarded caller guarantee
        let Some(path) = (unsafe { path_arg(path) }) else { return -1 };

        match BallTree::open(path, TreeOptions::default()) {
            Ok(tree) => {
                clear_last_error();
                i64::try_from(tree.len()).unwrap_or(i64::MAX)
            }
            Err(e) => {
                report(&e);
                -1
            }
        }
    })
    .unwrap_or(-1)
}

//
// === ERROR HANDLING ===
//

/// Get the last error message for the current thread
///
/// # Returns
///
/// - Pointer to NUL-terminated error string
/// - NULL if the last call succeeded
///
/// # Lifetime
///
/// The returned pointer is valid until the next FFI call on this thread.
/// **Do NOT** free the returned pointer.
#[unsafe(no_mangle)]
pub extern "C" fn balltree_last_error_message() -> *const c_char {
    LAST_ERROR.with(|cell| cell.borrow().as_ref().map_or(ptr::null(), |s| s.as_ptr()))
}

//
// === VERSIONING ===
//

/// Get the library version
///
/// The returned string lives for the whole program. **Do NOT** free it.
#[unsafe(no_mangle)]
pub extern "C" fn balltree_version() -> *const c_char {
    // concat! appends the terminator C expects
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

    VERSION.as_ptr().cast::<c_char>()
}

//
// === TESTS ===
//
