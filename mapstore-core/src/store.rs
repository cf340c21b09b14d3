//! The record-store seam the indexes are built on.
//!
//! Both indexes only need four things from their backing storage: read a
//! record, write a record, know how many records exist, and grow. Keeping
//! that behind a trait lets the same tree code run over a memory-mapped
//! [`RecordFile`](crate::RecordFile) or over a plain in-memory buffer.

use anyhow::{Context, Result};
use std::borrow::Cow;

/// Record number (0-based address of a fixed-length record)
pub type RecordNo = u32;

/// Highest record count any store may reach.
/// Tree links are stored as `i32`, so record numbers must fit one.
pub const MAX_RECORDS: u64 = i32::MAX as u64;

/// Storage of equal-sized records addressed by record number
pub trait RecordStore {
    /// Length of every record in bytes
    fn record_length(&self) -> usize;

    /// Number of records currently addressable
    fn record_count(&self) -> RecordNo;

    /// Reads record `record`.
    ///
    /// The returned bytes are exactly `record_length()` long.
    ///
    /// # Errors
    ///
    /// Returns an error if `record >= record_count()` or the read fails.
    fn read(&self, record: RecordNo) -> Result<Cow<'_, [u8]>>;

    /// Writes record `record`. Writing at `record_count()` appends one record.
    ///
    /// # Errors
    ///
    /// Returns an error if `record > record_count()`, if `bytes` is not
    /// exactly one record long, or if the write fails.
    fn write(&mut self, record: RecordNo, bytes: &[u8]) -> Result<()>;

    /// Adds `preferred` records, or at least `minimum` if that is all that
    /// can be had. New records are uninitialised.
    ///
    /// Returns the number of records actually added.
    ///
    /// # Errors
    ///
    /// Returns an error if not even `minimum` records can be added.
    fn grow(&mut self, preferred: u32, minimum: u32) -> Result<u32>;

    /// Pushes pending writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> Result<()>;
}

/// Validates a record access against the store bounds.
pub(crate) fn check_bounds(
    record: RecordNo,
    count: RecordNo,
    inclusive: bool,
) -> Result<()> {
    let ok = if inclusive { record <= count } else { record < count };
    if !ok {
        anyhow::bail!("Record {} out of range (record count is {})", record, count);
    }
    Ok(())
}

/// Validates a buffer length against the record length.
pub(crate) fn check_length(actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        anyhow::bail!("Record length mismatch: expected {}, got {}", expected, actual);
    }
    Ok(())
}

/// Record store kept entirely in memory.
///
/// Used for scratch indexes and in tests. An optional record limit makes
/// growth fail the way a full disk or exhausted address space would.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    data: Vec<u8>,
    record_length: usize,
    limit: u32,
}

impl MemoryStore {
    /// Creates an empty store of `record_length`-byte records
    #[must_use]
    pub fn new(record_length: usize) -> Self {
        Self { data: Vec::new(), record_length, limit: i32::MAX as u32 }
    }

    /// Creates an empty store that refuses to grow past `limit` records
    #[must_use]
    pub fn with_limit(record_length: usize, limit: u32) -> Self {
        Self { data: Vec::new(), record_length, limit }
    }

    fn range(&self, record: RecordNo) -> std::ops::Range<usize> {
        let start = record as usize * self.record_length;
        start..start + self.record_length
    }
}

impl RecordStore for MemoryStore {
    fn record_length(&self) -> usize {
        self.record_length
    }

    fn record_count(&self) -> RecordNo {
        // data.len() is always a whole number of records below `limit`
        (self.data.len() / self.record_length) as RecordNo
    }

    fn read(&self, record: RecordNo) -> Result<Cow<'_, [u8]>> {
        check_bounds(record, self.record_count(), false)?;
        let bytes = self.data.get(self.range(record)).context("Record outside buffer")?;
        Ok(Cow::Borrowed(bytes))
    }

    fn write(&mut self, record: RecordNo, bytes: &[u8]) -> Result<()> {
        check_bounds(record, self.record_count(), true)?;
        check_length(bytes.len(), self.record_length)?;

        if record == self.record_count() {
            self.grow(1, 1)?;
        }

        let range = self.range(record);
        self.data
            .get_mut(range)
            .context("Record outside buffer")?
            .copy_from_slice(bytes);
        Ok(())
    }

    fn grow(&mut self, preferred: u32, minimum: u32) -> Result<u32> {
        let count = u64::from(self.record_count());
        let limit = u64::from(self.limit).min(MAX_RECORDS);

        let added = if count + u64::from(preferred) <= limit {
            preferred
        } else if count + u64::from(minimum) <= limit {
            minimum
        } else {
            anyhow::bail!(
                "Cannot grow store: {} records plus minimum {} exceeds limit {}",
                count,
                minimum,
                limit
            );
        };

        self.data.resize(self.data.len() + added as usize * self.record_length, 0);
        Ok(added)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
