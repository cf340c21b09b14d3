//! FFI bindings for the Mapstore indexes
//!
//! This module provides a C-compatible interface to [`MapIndex`]: entity
//! registration, ID lookup, bounding-box queries and attribute keys.
//! All functions are panic-safe and use thread-local error reporting.
//!
//! # Safety Guarantees
//!
//! - No panic may cross the FFI boundary (enforced by `ffi_guard`)
//! - Strict UTF-8 validation for all string inputs
//! - Null pointer checks on all pointer arguments
//!
//! # Error Handling
//!
//! Errors are reported through:
//! - Return values: NULL for open, `-1` for status codes, `SIZE_MAX` for
//!   queries, `INT16_MIN` for attribute keys
//! - Thread-local error message: `mapstore_last_error_message()`
//!
//! # Thread Safety
//!
//! - Single-writer: register, unregister and flush require exclusive access
//! - Multi-reader: lookup, query and attribute functions allow concurrent readers
//! - Each thread has its own error message storage

use libc::{c_char, c_int, size_t};
use mapstore_core::{BoundingBox, GeoPoint, IndexOptions, MapIndex, MapIndexOptions, StoreOptions};
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::ptr;
use std::slice;

/// Returned by `mapstore_attribute_key` on failure
pub const MAPSTORE_KEY_ERROR: i16 = i16::MIN;

/// Internal state holder (not exposed to C)
struct MapStoreState {
    inner: MapIndex,
}

/// Opaque handle to an open index directory (C-compatible)
///
/// C code only sees pointers to this type, never the actual struct.
/// The real data is stored in `MapStoreState`.
#[repr(C)]
pub struct MapStore {
    _private: [u8; 0],
}

thread_local! {
    /// Thread-local storage for error messages
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Set the last error message for the current thread
///
/// Interior NULs are escaped so that error reporting itself cannot fail.
fn set_last_error(err: impl std::fmt::Display) {
    LAST_ERROR.with(|cell| {
        let safe_msg = err.to_string().replace('\0', "\\0");
        let c_str = CString::new(safe_msg).unwrap_or_default();
        *cell.borrow_mut() = Some(c_str);
    });
}

/// Clear the last error message for the current thread
fn clear_last_error() {
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = None;
    });
}

/// Panic barrier that catches all panics at the FFI boundary
///
/// Returns `None` on panic after recording the panic message, so callers
/// can fall back to their sentinel value.
fn ffi_guard<F, R>(f: F) -> Option<R>
where
    F: FnOnce() -> R,
{
    // The operation is abandoned on panic, never resumed
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => Some(result),
        Err(e) => {
            let msg = if let Some(s) = e.downcast_ref::<&str>() {
                format!("Panic: {}", s)
            } else if let Some(s) = e.downcast_ref::<String>() {
                format!("Panic: {}", s)
            } else {
                "Unknown panic".to_string()
            };
            set_last_error(msg);
            None
        }
    }
}

/// Borrows a UTF-8 C string, recording an error on failure
///
/// # Safety
///
/// `s` must be NULL or a valid NUL-terminated string.
unsafe fn utf8_arg<'a>(s: *const c_char, what: &str) -> Option<&'a str> {
    if s.is_null() {
        set_last_error(format!("{} cannot be NULL", what));
        return None;
    }

    // SAFETY: Caller guarantees s is a valid C string
    let c_str = unsafe { CStr::from_ptr(s) };

    // STRICT UTF-8 CHECK: Do not use to_string_lossy()
    match c_str.to_str() {
        Ok(s) => Some(s),
        Err(_) => {
            set_last_error(format!("{} must be valid UTF-8", what));
            None
        }
    }
}

fn open_index(dir: &str, options: MapIndexOptions) -> *mut MapStore {
    match MapIndex::open(dir, options) {
        Ok(index) => {
            clear_last_error();
            let state = Box::new(MapStoreState { inner: index });
            Box::into_raw(state).cast::<MapStore>()
        }
        Err(e) => {
            set_last_error(format!("{:#}", e));
            ptr::null_mut()
        }
    }
}

/// Turns a `Result<bool>` into the 1 / 0 / -1 status convention
fn status<E: std::fmt::Display>(result: Result<bool, E>) -> c_int {
    match result {
        Ok(flag) => {
            clear_last_error();
            c_int::from(flag)
        }
        Err(e) => {
            set_last_error(format!("{:#}", e));
            -1
        }
    }
}

//
// === LIFECYCLE MANAGEMENT ===
//

/// Open or create the index files in a directory
///
/// # Arguments
///
/// - `dir`: UTF-8 encoded path of the index directory (must not be NULL).
///   The directory is created if missing.
///
/// # Returns
///
/// - Non-NULL pointer on success
/// - NULL on failure (check `mapstore_last_error_message()`)
///
/// # Example (C)
///
/// ```c
/// MapStore* store = mapstore_open("planet-index");
/// if (store == NULL) {
///     fprintf(stderr, "Error: %s\n", mapstore_last_error_message());
///     exit(1);
/// }
/// ```
///
/// # Safety
///
/// - `dir` must be a valid, NUL-terminated UTF-8 string
/// - Caller must free the returned pointer with `mapstore_free()`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapstore_open(dir: *const c_char) -> *mut MapStore {
    ffi_guard(|| {
        // SAFETY: Caller guarantees dir is NULL or a valid C string
        let Some(dir) = (unsafe { utf8_arg(dir, "Directory") }) else {
            return ptr::null_mut();
        };
        open_index(dir, MapIndexOptions::default())
    })
    .unwrap_or(ptr::null_mut())
}

/// Open or create an index with custom storage options
///
/// # Arguments
///
/// - `dir`: UTF-8 encoded path of the index directory (must not be NULL)
/// - `map_records`: 0 to always use conventional I/O, nonzero to memory-map
/// - `cache_capacity`: Record buffers cached when not mapped
/// - `id_batch`: Records added per growth step of the ID index (must be > 0)
/// - `point_batch`: Records added per growth step of the point index (must be > 0)
///
/// # Safety
///
/// Same safety requirements as `mapstore_open()`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapstore_open_with_options(
    dir: *const c_char,
    map_records: c_int,
    cache_capacity: size_t,
    id_batch: u32,
    point_batch: u32,
) -> *mut MapStore {
    ffi_guard(|| {
        // SAFETY: Caller guarantees dir is NULL or a valid C string
        let Some(dir) = (unsafe { utf8_arg(dir, "Directory") }) else {
            return ptr::null_mut();
        };

        if id_batch == 0 || point_batch == 0 {
            set_last_error("Growth batches must be > 0");
            return ptr::null_mut();
        }

        let defaults = MapIndexOptions::default();
        let options = MapIndexOptions {
            store: StoreOptions {
                map_records: map_records != 0,
                cache_capacity,
                ..StoreOptions::default()
            },
            ids: IndexOptions::for_ids()
                .with_batch(id_batch, defaults.ids.grow_minimum.min(id_batch)),
            points: IndexOptions::for_points()
                .with_batch(point_batch, defaults.points.grow_minimum.min(point_batch)),
        };
        open_index(dir, options)
    })
    .unwrap_or(ptr::null_mut())
}

/// Close an index and release all resources
///
/// # Arguments
///
/// - `ptr`: Pointer returned by `mapstore_open()` or NULL
///
/// # Safety
///
/// - `ptr` must be NULL or a valid pointer from `mapstore_open()`
/// - After this call, `ptr` is invalid and must not be used
/// - Safe to call with NULL (no-op)
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapstore_free(ptr: *mut MapStore) {
    if !ptr.is_null() {
        ffi_guard(|| {
            // SAFETY: Caller guarantees ptr is valid (from mapstore_open)
            let state = unsafe { Box::from_raw(ptr.cast::<MapStoreState>()) };
            if let Err(e) = state.inner.close() {
                set_last_error(format!("{:#}", e));
            }
        });
    }
}

//
// === WRITES ===
//

/// Register an entity without a location
///
/// # Returns
///
/// - 0 on success
/// - -1 on failure (check `mapstore_last_error_message()`)
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid
/// - No other thread may access `ptr` during this call
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapstore_register(ptr: *mut MapStore, id: u64, record: u32) -> c_int {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is valid and has exclusive access
        let Some(state) = (unsafe { ptr.cast::<MapStoreState>().as_mut() }) else {
            set_last_error("Null index pointer");
            return -1;
        };
        status(state.inner.register(id, record, None).map(|()| false))
    })
    .unwrap_or(-1)
}

/// Register a point entity at fixed-point (`lat`, `lon`)
///
/// # Returns
///
/// - 0 on success
/// - -1 on failure (check `mapstore_last_error_message()`)
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid
/// - No other thread may access `ptr` during this call
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapstore_register_point(
    ptr: *mut MapStore,
    id: u64,
    record: u32,
    lat: i64,
    lon: i64,
) -> c_int {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is valid and has exclusive access
        let Some(state) = (unsafe { ptr.cast::<MapStoreState>().as_mut() }) else {
            set_last_error("Null index pointer");
            return -1;
        };
        status(state.inner.register(id, record, Some(GeoPoint::new(lat, lon))).map(|()| false))
    })
    .unwrap_or(-1)
}

/// Forget an entity without a location
///
/// # Returns
///
/// - 1 if the ID was registered
/// - 0 if it was not
/// - -1 on failure (check `mapstore_last_error_message()`)
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid
/// - No other thread may access `ptr` during this call
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapstore_unregister(ptr: *mut MapStore, id: u64) -> c_int {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is valid and has exclusive access
        let Some(state) = (unsafe { ptr.cast::<MapStoreState>().as_mut() }) else {
            set_last_error("Null index pointer");
            return -1;
        };
        status(state.inner.unregister(id, 0, None))
    })
    .unwrap_or(-1)
}

/// Forget a point entity registered at (`lat`, `lon`)
///
/// # Returns
///
/// Same as `mapstore_unregister()`
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid
/// - No other thread may access `ptr` during this call
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapstore_unregister_point(
    ptr: *mut MapStore,
    id: u64,
    record: u32,
    lat: i64,
    lon: i64,
) -> c_int {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is valid and has exclusive access
        let Some(state) = (unsafe { ptr.cast::<MapStoreState>().as_mut() }) else {
            set_last_error("Null index pointer");
            return -1;
        };
        status(state.inner.unregister(id, record, Some(GeoPoint::new(lat, lon))))
    })
    .unwrap_or(-1)
}

/// Flush both index files to disk
///
/// # Returns
///
/// - 0 on success
/// - -1 on failure (check `mapstore_last_error_message()`)
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid
/// - No other thread may access `ptr` during this call
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapstore_flush(ptr: *mut MapStore) -> c_int {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is valid and has exclusive access
        let Some(state) = (unsafe { ptr.cast::<MapStoreState>().as_mut() }) else {
            set_last_error("Null index pointer");
            return -1;
        };
        status(state.inner.flush().map(|()| false))
    })
    .unwrap_or(-1)
}

//
// === READS ===
//

/// Look up the record number of an entity
///
/// # Arguments
///
/// - `ptr`: Non-NULL pointer to index (shared access allowed)
/// - `id`: Entity ID
/// - `out_record`: Receives the record number when found (must not be NULL)
///
/// # Returns
///
/// - 1 if found (`*out_record` is set)
/// - 0 if not found
/// - -1 on failure (check `mapstore_last_error_message()`)
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid
/// - `out_record` must point to writable memory for one `uint32_t`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapstore_lookup(
    ptr: *const MapStore,
    id: u64,
    out_record: *mut u32,
) -> c_int {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is valid (shared access)
        let Some(state) = (unsafe { ptr.cast::<MapStoreState>().as_ref() }) else {
            set_last_error("Null index pointer");
            return -1;
        };

        if out_record.is_null() {
            set_last_error("Null output pointer");
            return -1;
        }

        let found = state.inner.lookup(id).map(|found| {
            if let Some(record) = found {
                // SAFETY: Caller guarantees out_record is writable
                unsafe { *out_record = record };
            }
            found.is_some()
        });
        status(found)
    })
    .unwrap_or(-1)
}

/// Find the records of all point entities inside a closed box
///
/// # Arguments
///
/// - `ptr`: Non-NULL pointer to index (shared access allowed)
/// - `min_lat`, `min_lon`, `max_lat`, `max_lon`: Box corners, edges included
/// - `out_records`: Output buffer (may be NULL only if `capacity` is 0)
/// - `capacity`: Number of elements `out_records` can hold
///
/// # Returns
///
/// - Total number of matches on success. Only the first `capacity` record
///   numbers (ascending) are written, so a call with `capacity` 0 sizes the
///   buffer for a second call.
/// - `SIZE_MAX` on failure (check `mapstore_last_error_message()`)
///
/// # Example (C)
///
/// ```c
/// size_t n = mapstore_query_box(store, lat0, lon0, lat1, lon1, NULL, 0);
/// uint32_t* records = malloc(n * sizeof(uint32_t));
/// mapstore_query_box(store, lat0, lon0, lat1, lon1, records, n);
/// ```
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid
/// - `out_records` must have space for at least `capacity` values
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapstore_query_box(
    ptr: *const MapStore,
    min_lat: i64,
    min_lon: i64,
    max_lat: i64,
    max_lon: i64,
    out_records: *mut u32,
    capacity: size_t,
) -> size_t {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is valid (shared access)
        let Some(state) = (unsafe { ptr.cast::<MapStoreState>().as_ref() }) else {
            set_last_error("Null index pointer");
            return size_t::MAX;
        };

        if out_records.is_null() && capacity > 0 {
            set_last_error("Null output buffer with nonzero capacity");
            return size_t::MAX;
        }

        let bbox = BoundingBox::new(min_lat, min_lon, max_lat, max_lon);
        match state.inner.within(&bbox) {
            Ok(found) => {
                let mut records: Vec<u32> = found.into_iter().collect();
                records.sort_unstable();

                if capacity > 0 {
                    // SAFETY: Caller guarantees out_records has space for capacity values
                    let out = unsafe { slice::from_raw_parts_mut(out_records, capacity) };
                    for (slot, record) in out.iter_mut().zip(&records) {
                        *slot = *record;
                    }
                }

                clear_last_error();
                records.len()
            }
            Err(e) => {
                set_last_error(format!("{:#}", e));
                size_t::MAX
            }
        }
    })
    .unwrap_or(size_t::MAX)
}

/// Key of an attribute name
///
/// # Arguments
///
/// - `ptr`: Non-NULL pointer to index
/// - `name`: UTF-8 attribute name (must not be NULL)
/// - `create`: Nonzero to add unknown names to the table
///
/// # Returns
///
/// - The key (`>= 1`) for a known or newly added name
/// - 0 for a blank name
/// - -1 for an unknown name when `create` is 0
/// - `MAPSTORE_KEY_ERROR` on failure (check `mapstore_last_error_message()`)
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid
/// - `name` must be a valid, NUL-terminated UTF-8 string
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapstore_attribute_key(
    ptr: *const MapStore,
    name: *const c_char,
    create: c_int,
) -> i16 {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is valid (shared access)
        let Some(state) = (unsafe { ptr.cast::<MapStoreState>().as_ref() }) else {
            set_last_error("Null index pointer");
            return MAPSTORE_KEY_ERROR;
        };

        // SAFETY: Caller guarantees name is NULL or a valid C string
        let Some(name) = (unsafe { utf8_arg(name, "Attribute name") }) else {
            return MAPSTORE_KEY_ERROR;
        };

        let attributes = state.inner.attributes();
        if create == 0 {
            clear_last_error();
            return attributes.get_key(name);
        }

        match attributes.get_or_create_key(name) {
            Ok(key) => {
                clear_last_error();
                key
            }
            Err(e) => {
                set_last_error(format!("{:#}", e));
                MAPSTORE_KEY_ERROR
            }
        }
    })
    .unwrap_or(MAPSTORE_KEY_ERROR)
}

//
// === ERROR HANDLING ===
//

/// Get the last error message for the current thread
///
/// # Returns
///
/// - Pointer to NUL-terminated error string
/// - NULL if the last call on this thread succeeded
///
/// # Lifetime
///
/// The returned pointer is valid until the next FFI call on this thread.
/// **Do NOT** free the returned pointer.
#[unsafe(no_mangle)]
pub extern "C" fn mapstore_last_error_message() -> *const c_char {
    LAST_ERROR.with(|cell| cell.borrow().as_ref().map_or(ptr::null(), |s| s.as_ptr()))
}

//
// === VERSIONING ===
//

/// Get the Mapstore library version
///
/// # Returns
///
/// Pointer to NUL-terminated version string, valid for the lifetime of the
/// program. **Do NOT** free the returned pointer.
#[unsafe(no_mangle)]
pub extern "C" fn mapstore_version() -> *const c_char {
    // concat! appends the terminator required by C
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

    VERSION.as_ptr().cast::<c_char>()
}

//
// === TESTS ===
//
