//! Fixed-length record file with memory-mapped and conventional I/O paths.
//!
//! A record file is a flat sequence of `record_count * record_length` bytes.
//! There is no header: the record count is derived from the file length.
//!
//! # Backing
//!
//! The whole file is memory-mapped whenever possible. If a mapping cannot be
//! established (address-space limits, memory pressure, the configured
//! `map_limit`), the file silently degrades to positioned reads and writes
//! through a single locked file handle, with an LRU cache of record buffers
//! in front of it. Callers see the same behaviour either way.
//!
//! # Borrowing
//!
//! Reads take `&self` and may hand out slices that point straight into the
//! mapping. Writes and growth take `&mut self`, so a record view can never
//! outlive a remap:
//!
//! ```compile_fail
//! # use mapstore_core::{RecordFile, StoreOptions};
//! # fn main() -> anyhow::Result<()> {
//! let mut file = RecordFile::open("nodes.idx", 16, StoreOptions::default())?;
//! file.grow_file(8, 8)?;
//! let record = file.read_record(0)?;
//! file.grow_file(8, 8)?; // ERROR: `record` still borrows `file`
//! println!("{:?}", record);
//! # Ok(())
//! # }
//! ```

use crate::config::StoreOptions;
use crate::store::{MAX_RECORDS, RecordNo, RecordStore, check_bounds, check_length};
use anyhow::{Context, Result};
use fs2::FileExt;
use log::{debug, warn};
use lru::LruCache;
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on recycled buffers kept around after eviction
const MAX_POOLED_BUFFERS: usize = 256;

/// Base back-off between mapping attempts
const MAP_RETRY_DELAY: Duration = Duration::from_millis(10);

/// LRU cache of record buffers for the unmapped path.
///
/// Evicted buffers are not freed but parked in `pool` and handed out again
/// for the next miss, so steady-state reads do not allocate cache storage.
struct RecordCache {
    entries: Option<LruCache<RecordNo, Vec<u8>>>,
    pool: Vec<Vec<u8>>,
}

impl RecordCache {
    fn new(capacity: usize) -> Self {
        Self { entries: NonZeroUsize::new(capacity).map(LruCache::new), pool: Vec::new() }
    }

    fn get(&mut self, record: RecordNo) -> Option<Vec<u8>> {
        self.entries.as_mut()?.get(&record).cloned()
    }

    /// Takes a recycled buffer of `len` bytes, or allocates one
    fn take_buffer(&mut self, len: usize) -> Vec<u8> {
        match self.pool.pop() {
            Some(buf) if buf.len() == len => buf,
            _ => vec![0; len],
        }
    }

    fn recycle(&mut self, buf: Vec<u8>) {
        if self.pool.len() < MAX_POOLED_BUFFERS {
            self.pool.push(buf);
        }
    }

    /// Caches an owned buffer for `record`
    fn put(&mut self, record: RecordNo, buf: Vec<u8>) {
        let Some(entries) = self.entries.as_mut() else {
            self.recycle(buf);
            return;
        };

        if let Some((_, evicted)) = entries.push(record, buf) {
            self.recycle(evicted);
        }
    }

    /// Write-through: refreshes or inserts a copy of `bytes`
    fn store(&mut self, record: RecordNo, bytes: &[u8]) {
        if let Some(existing) = self.entries.as_mut().and_then(|e| e.get_mut(&record)) {
            existing.copy_from_slice(bytes);
            return;
        }

        if self.entries.is_some() {
            let mut buf = self.take_buffer(bytes.len());
            buf.copy_from_slice(bytes);
            self.put(record, buf);
        }
    }

    fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, LruCache::len)
    }

    fn clear(&mut self) {
        let drained: Vec<Vec<u8>> = match self.entries.as_mut() {
            Some(entries) => std::iter::from_fn(|| entries.pop_lru().map(|(_, buf)| buf)).collect(),
            None => Vec::new(),
        };
        for buf in drained {
            self.recycle(buf);
        }
    }
}

/// Opens (creating if needed) and exclusively locks a record file
fn open_locked(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open record file: {}", path.display()))?;

    file.try_lock_exclusive()
        .with_context(|| {
            format!("Record file {} is already open by another process", path.display())
        })?;

    Ok(file)
}

/// Writes all of `bytes`, continuing after short writes
fn write_fully(file: &mut File, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        match file.write(bytes) {
            Ok(0) => {
                return Err(io::Error::new(ErrorKind::WriteZero, "record write made no progress"));
            }
            Ok(written) => bytes = bytes.get(written..).unwrap_or_default(),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// File of equal-length records addressed by record number
pub struct RecordFile {
    path: PathBuf,
    record_length: usize,
    record_count: RecordNo,
    options: StoreOptions,

    /// Conventional I/O handle (owns the file lock).
    /// `None` only between a failed operation and its reopen.
    file: Mutex<Option<File>>,

    /// Mapping of the whole file, when one is established
    mmap: Option<MmapMut>,

    /// Whether mapping is still being attempted (cleared on degradation)
    mapping_enabled: bool,

    cache: Mutex<RecordCache>,
    closed: bool,
}

impl std::fmt::Debug for RecordFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordFile")
            .field("path", &self.path)
            .field("record_length", &self.record_length)
            .field("record_count", &self.record_count)
            .field("mapped", &self.mmap.is_some())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl RecordFile {
    /// Opens or creates a record file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the backing file
    /// * `record_length` - Length of every record in bytes
    /// * `options` - Mapping and cache configuration
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `record_length` is zero
    /// - The file cannot be opened or created
    /// - The file is already locked by another process
    /// - The file holds more records than a record number can address
    ///
    /// A failure to memory-map the file is not an error; the file is then
    /// served through conventional I/O.
    pub fn open<P: AsRef<Path>>(
        path: P,
        record_length: usize,
        options: StoreOptions,
    ) -> Result<Self> {
        if record_length == 0 {
            anyhow::bail!("Record length must be > 0");
        }

        let path = path.as_ref().to_path_buf();
        let file = open_locked(&path)?;
        let file_len = file
            .metadata()
            .with_context(|| format!("Failed to stat record file: {}", path.display()))?
            .len();

        let count = file_len / record_length as u64;
        if count > MAX_RECORDS {
            anyhow::bail!(
                "Record file {} holds {} records, more than the {} addressable",
                path.display(),
                count,
                MAX_RECORDS
            );
        }
        if file_len % record_length as u64 != 0 {
            warn!(
                "{}: {} trailing bytes past the last whole record are ignored",
                path.display(),
                file_len % record_length as u64
            );
        }

        let mut this = Self {
            path,
            record_length,
            // Checked against MAX_RECORDS above
            record_count: count as RecordNo,
            mapping_enabled: options.map_records,
            cache: Mutex::new(RecordCache::new(options.cache_capacity)),
            options,
            file: Mutex::new(Some(file)),
            mmap: None,
            closed: false,
        };
        this.remap();

        debug!(
            "Opened {} ({} records of {} bytes, mapped: {})",
            this.path.display(),
            this.record_count,
            this.record_length,
            this.is_mapped()
        );
        Ok(this)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of every record in bytes
    pub fn record_length(&self) -> usize {
        self.record_length
    }

    /// Number of records in the file
    pub fn record_count(&self) -> RecordNo {
        self.record_count
    }

    /// Whether record access currently goes through a memory mapping
    pub fn is_mapped(&self) -> bool {
        self.mmap.is_some()
    }

    /// Number of record buffers held by the unmapped-mode cache
    pub fn cached_records(&self) -> usize {
        self.cache.lock().len()
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reads a record
    ///
    /// When mapped, the returned bytes borrow the mapping directly (zero-copy).
    /// Otherwise they are a copy of the cached record buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file is closed
    /// - `record >= record_count()`
    /// - The read fails even after reopening the file handle
    pub fn read_record(&self, record: RecordNo) -> Result<Cow<'_, [u8]>> {
        self.ensure_open()?;
        check_bounds(record, self.record_count, false)?;

        let len = self.record_length;
        let offset = self.offset(record);

        if let Some(mmap) = &self.mmap {
            let start = usize::try_from(offset)
                .context("Record offset too large for this platform")?;
            let bytes = mmap
                .get(start..start + len)
                .with_context(|| format!("Record {} extends beyond the mapping", record))?;
            return Ok(Cow::Borrowed(bytes));
        }

        if let Some(hit) = self.cache.lock().get(record) {
            return Ok(Cow::Owned(hit));
        }

        let mut buf = self.cache.lock().take_buffer(len);
        self.with_file("read", |file| {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)
        })?;

        let out = buf.clone();
        self.cache.lock().put(record, buf);
        Ok(Cow::Owned(out))
    }

    /// Writes a record
    ///
    /// Writing at `record_count()` appends a single record.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file is closed
    /// - `record > record_count()`
    /// - `bytes` is not exactly one record long
    /// - The write fails even after reopening the file handle
    ///
    /// # Note
    ///
    /// Mapped writes become visible immediately but are only durable after
    /// [`flush`](Self::flush).
    pub fn write_record(&mut self, record: RecordNo, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        check_bounds(record, self.record_count, true)?;
        check_length(bytes.len(), self.record_length)?;

        if record == self.record_count {
            self.grow_file(1, 1)?;
        }

        let offset = self.offset(record);

        if let Some(mmap) = self.mmap.as_mut() {
            let start = usize::try_from(offset)
                .context("Record offset too large for this platform")?;
            mmap.get_mut(start..start + bytes.len())
                .with_context(|| format!("Record {} extends beyond the mapping", record))?
                .copy_from_slice(bytes);
            return Ok(());
        }

        self.with_file("write", |file| {
            file.seek(SeekFrom::Start(offset))?;
            write_fully(file, bytes)
        })?;
        self.cache.lock().store(record, bytes);

        Ok(())
    }

    /// Grows the file by `preferred` records, or by `minimum` if that fails
    ///
    /// Any existing mapping is released before the file is extended and a
    /// new one covering the whole file is created afterwards. If the new
    /// mapping cannot be established, the file keeps its new length and
    /// continues through conventional I/O.
    ///
    /// New records are not initialised; callers must write them before the
    /// first read.
    ///
    /// # Returns
    ///
    /// The number of records actually added
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file is closed
    /// - Even `minimum` more records would exceed the addressable range
    /// - The file cannot be extended by `minimum` records
    ///
    /// # Warning
    ///
    /// This method invalidates all record views handed out by
    /// [`read_record`](Self::read_record).
    pub fn grow_file(&mut self, preferred: u32, minimum: u32) -> Result<u32> {
        self.ensure_open()?;

        let count = u64::from(self.record_count);
        let headroom = MAX_RECORDS - count;
        if u64::from(minimum) > headroom {
            anyhow::bail!(
                "Cannot grow {}: {} records plus {} exceeds the {} record limit",
                self.path.display(),
                count,
                minimum,
                MAX_RECORDS
            );
        }
        // headroom fits u32 once clamped below u32::MAX by MAX_RECORDS
        let preferred = u64::from(preferred).min(headroom) as u32;

        // Some platforms refuse to resize a file that is still mapped
        self.mmap = None;

        let added = match self.extend_to(count + u64::from(preferred)) {
            Ok(()) => Ok(preferred),
            Err(e) if minimum < preferred => {
                warn!(
                    "{}: growing by {} records failed ({:#}), retrying with {}",
                    self.path.display(),
                    preferred,
                    e,
                    minimum
                );
                self.extend_to(count + u64::from(minimum)).map(|()| minimum)
            }
            Err(e) => Err(e),
        };

        let added = match added {
            Ok(added) => added,
            Err(e) => {
                self.remap();
                return Err(e);
            }
        };

        self.record_count += added;
        debug!("Grew {} by {} records to {}", self.path.display(), added, self.record_count);
        self.remap();

        Ok(added)
    }

    /// Flushes pending writes to disk
    ///
    /// Flushes the mapping (if any) and then forces a physical write via
    /// fsync.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is closed or the flush fails
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;

        if let Some(mmap) = &self.mmap {
            mmap.flush().context("Failed to flush record mapping")?;
        }
        self.with_file("sync", |file| file.sync_all())
    }

    /// Releases the mapping and the file handle
    ///
    /// Calling `close` more than once is a no-op. Every other operation fails
    /// after the file has been closed.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing the mapping fails. The file is closed
    /// regardless.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let flushed = match self.mmap.take() {
            Some(mmap) => mmap.flush().context("Failed to flush record mapping"),
            None => Ok(()),
        };

        if let Some(file) = self.file.get_mut().take() {
            let _ = file.unlock();
        }
        self.cache.get_mut().clear();

        debug!("Closed {}", self.path.display());
        flushed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            anyhow::bail!("Record file {} is closed", self.path.display());
        }
        Ok(())
    }

    fn offset(&self, record: RecordNo) -> u64 {
        u64::from(record) * self.record_length as u64
    }

    fn extend_to(&self, records: u64) -> Result<()> {
        let bytes = records * self.record_length as u64;
        self.with_file("extend", |file| file.set_len(bytes))
    }

    /// Runs `op` against the file handle under the file lock.
    ///
    /// On failure the handle is dropped, the file reopened (and relocked),
    /// and `op` retried once. A failed reopen is reported like a failed
    /// retry.
    fn with_file<T>(
        &self,
        what: &str,
        mut op: impl FnMut(&mut File) -> io::Result<T>,
    ) -> Result<T> {
        let mut guard = self.file.lock();

        if guard.is_none() {
            *guard = Some(open_locked(&self.path)?);
        }
        let file = guard.as_mut().context("Record file handle missing")?;

        match op(file) {
            Ok(value) => Ok(value),
            Err(first) => {
                warn!(
                    "{}: {} failed ({}), reopening file handle",
                    self.path.display(),
                    what,
                    first
                );
                *guard = None;
                let retried = open_locked(&self.path).and_then(|file| {
                    op(guard.insert(file)).map_err(anyhow::Error::from)
                });
                retried.with_context(|| {
                    format!("Record file {}: {} failed after reopening", self.path.display(), what)
                })
            }
        }
    }

    /// Maps the whole file, degrading to conventional I/O on failure.
    fn remap(&mut self) {
        self.mmap = None;
        if !self.mapping_enabled {
            return;
        }

        let bytes = u64::from(self.record_count) * self.record_length as u64;
        if bytes == 0 {
            return;
        }

        if bytes > self.options.map_limit {
            warn!(
                "{}: {} bytes exceeds the mapping limit of {}, using conventional I/O",
                self.path.display(),
                bytes,
                self.options.map_limit
            );
            self.degrade();
            return;
        }

        let attempts = self.options.map_attempts.max(1);
        let mut mapping = None;
        {
            let guard = self.file.lock();
            if let Some(file) = guard.as_ref() {
                for attempt in 1..=attempts {
                    // SAFETY: the file is exclusively locked by this process and
                    // only ever resized through `grow_file`, which takes
                    // `&mut self` and drops this mapping first.
                    match unsafe { MmapMut::map_mut(file) } {
                        Ok(map) => {
                            mapping = Some(map);
                            break;
                        }
                        Err(e) => {
                            warn!(
                                "{}: mapping attempt {}/{} failed: {}",
                                self.path.display(),
                                attempt,
                                attempts,
                                e
                            );
                            if attempt < attempts {
                                std::thread::sleep(MAP_RETRY_DELAY * attempt);
                            }
                        }
                    }
                }
            }
        }

        match mapping {
            Some(map) => self.mmap = Some(map),
            None => self.degrade(),
        }
    }

    fn degrade(&mut self) {
        if self.mapping_enabled {
            warn!("{}: falling back to conventional I/O", self.path.display());
        }
        self.mapping_enabled = false;
        self.mmap = None;
    }
}

impl RecordStore for RecordFile {
    fn record_length(&self) -> usize {
        self.record_length
    }

    fn record_count(&self) -> RecordNo {
        self.record_count
    }

    fn read(&self, record: RecordNo) -> Result<Cow<'_, [u8]>> {
        self.read_record(record)
    }

    fn write(&mut self, record: RecordNo, bytes: &[u8]) -> Result<()> {
        self.write_record(record, bytes)
    }

    fn grow(&mut self, preferred: u32, minimum: u32) -> Result<u32> {
        self.grow_file(preferred, minimum)
    }

    fn flush(&mut self) -> Result<()> {
        RecordFile::flush(self)
    }
}

impl Drop for RecordFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("{}: error while closing: {:#}", self.path.display(), e);
        }
    }
}
