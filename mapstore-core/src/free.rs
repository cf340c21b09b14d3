//! Free-record bookkeeping for the tree indexes.
//!
//! Records are never returned to the file; a record is free when its content
//! is the structure's "never used" pattern. Scanning for such records from 0
//! on every insert would be quadratic, so a cursor remembers how far the
//! scan got. Everything below the cursor is known to be taken.

use crate::config::IndexOptions;
use crate::store::{RecordNo, RecordStore};
use anyhow::{Context, Result};
use log::{debug, trace, warn};

/// Bit vector of records handed out during this session
#[derive(Debug, Default, Clone)]
pub struct UsageMap {
    words: Vec<u64>,
}

impl UsageMap {
    /// Creates an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `record` as used
    pub fn set(&mut self, record: RecordNo) {
        let word = record as usize / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        if let Some(bits) = self.words.get_mut(word) {
            *bits |= 1 << (record % 64);
        }
    }

    /// Whether `record` has been marked
    #[must_use]
    pub fn contains(&self, record: RecordNo) -> bool {
        self.words
            .get(record as usize / 64)
            .is_some_and(|bits| bits & (1 << (record % 64)) != 0)
    }
}

/// Allocation cursor over a record store
#[derive(Debug, Clone)]
pub struct FreeList {
    next: RecordNo,
    used: Option<UsageMap>,
}

impl FreeList {
    /// Cursor without usage tracking. Record 0 (the root) is never handed out.
    #[must_use]
    pub fn new() -> Self {
        Self { next: 1, used: None }
    }

    /// Cursor that also remembers every record it hands out, for structures
    /// whose freshly allocated records still look free until written.
    #[must_use]
    pub fn with_usage() -> Self {
        let mut used = UsageMap::new();
        used.set(0);
        Self { next: 1, used: Some(used) }
    }

    /// Lowest record number not yet known to be taken
    #[cfg(any(test, feature = "internals"))]
    #[must_use]
    pub fn cursor(&self) -> RecordNo {
        self.next
    }

    /// Returns the next free record below the store's record count, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if reading a candidate record fails.
    pub fn allocate<S: RecordStore>(
        &mut self,
        store: &S,
        is_free: impl Fn(&[u8]) -> bool,
    ) -> Result<Option<RecordNo>> {
        let count = store.record_count();

        while self.next < count {
            let record = self.next;
            self.next += 1;

            if self.used.as_ref().is_some_and(|used| used.contains(record)) {
                continue;
            }

            if is_free(&*store.read(record)?) {
                if let Some(used) = self.used.as_mut() {
                    used.set(record);
                }
                trace!("Allocated record {}", record);
                return Ok(Some(record));
            }
        }

        Ok(None)
    }

    /// Allocates a record, growing the store when none is left.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot grow or a read/write fails.
    pub fn allocate_or_grow<S: RecordStore>(
        &mut self,
        store: &mut S,
        options: &IndexOptions,
        blank: &[u8],
        is_free: impl Fn(&[u8]) -> bool,
    ) -> Result<RecordNo> {
        if let Some(record) = self.allocate(store, &is_free)? {
            return Ok(record);
        }

        grow_blank(store, options, blank)?;
        self.allocate(store, &is_free)?
            .context("No free record available after growing the index")
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

/// Grows `store` by the configured batch and writes `blank` into every new
/// record. A failed growth is retried once with a quarter of the batch.
///
/// Returns the number of records added.
///
/// # Errors
///
/// Returns an error if both growth attempts fail or invalidation fails.
pub fn grow_blank<S: RecordStore>(
    store: &mut S,
    options: &IndexOptions,
    blank: &[u8],
) -> Result<u32> {
    let first = store.record_count();

    let added = match store.grow(options.grow_batch, options.grow_minimum) {
        Ok(added) => added,
        Err(e) => {
            let quarter = (options.grow_batch / 4).max(1);
            warn!(
                "Growing index by {} records failed ({:#}), retrying with {}",
                options.grow_batch, e, quarter
            );
            store
                .grow(quarter, options.grow_minimum.min(quarter))
                .context("Index growth failed even with a reduced batch")?
        }
    };

    for record in first..first + added {
        store.write(record, blank)?;
    }

    debug!("Index grown by {} records to {}", added, store.record_count());
    Ok(added)
}
