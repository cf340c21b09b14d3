//! Persistent radix trie mapping 64-bit entity IDs to record numbers.
//!
//! # Layout
//!
//! Every node is one 16-byte record of four big-endian `i32` slots:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       4     slot 0
//! 4       4     slot 1
//! 8       4     slot 2
//! 12      4     slot 3
//! ```
//!
//! Each level consumes two bits of the ID, most significant first, and the
//! trie is `64 / 2 + 1 = 33` levels deep. The root level sits above bit 63,
//! so the root only ever uses slot 0. Slots of inner levels hold child record
//! numbers; slots of the last level hold the external record number.
//!
//! Negative slots are empty. `-1` is the state of a never-used record and
//! `-2` is written by [`IdIndex::remove`]; only records with all four slots at
//! `-1` are considered free for allocation.

use crate::config::{IndexOptions, StoreOptions};
use crate::free::{FreeList, grow_blank};
use crate::record_file::RecordFile;
use crate::repair::follow_link;
use crate::store::{RecordNo, RecordStore};
use anyhow::{Context, Result};
use log::debug;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::path::Path;

/// Slots per node
pub const ORDER: usize = 4;

/// ID bits consumed per trie level
pub const BITS_PER_LEVEL: u32 = 2;

/// Trie depth
pub const LEVELS: u32 = u64::BITS / BITS_PER_LEVEL + 1;

/// Size of a node record in bytes
pub const NODE_SIZE: usize = ORDER * std::mem::size_of::<i32>();

/// Slot state of a record that has never been used
pub const FREE_SLOT: i32 = -1;

/// Slot state after a removal
pub const CLEARED_SLOT: i32 = -2;

/// Largest ID the trie accepts
pub const MAX_ID: u64 = i64::MAX as u64;

/// Largest external record number the trie accepts
pub const MAX_VALUE: u32 = i32::MAX as u32;

/// Bytes of a never-used node (every slot `-1`)
const BLANK_NODE: [u8; NODE_SIZE] = [0xFF; NODE_SIZE];

const INDEX_NAME: &str = "id index";

/// One decoded trie node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdNode {
    /// Child links or, at the last level, external record numbers
    pub slots: [i32; ORDER],
}

impl IdNode {
    /// Node with every slot free
    pub const BLANK: Self = Self { slots: [FREE_SLOT; ORDER] };

    /// Empty node that is no longer free for allocation
    pub const CLAIMED: Self = Self { slots: [CLEARED_SLOT; ORDER] };

    /// Slot `index`, empty if out of range
    #[must_use]
    pub fn slot(&self, index: usize) -> i32 {
        self.slots.get(index).copied().unwrap_or(FREE_SLOT)
    }

    /// Sets slot `index`; out-of-range indices are ignored
    pub fn set_slot(&mut self, index: usize, value: i32) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = value;
        }
    }

    /// Decodes a node record
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not exactly [`NODE_SIZE`] long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != NODE_SIZE {
            anyhow::bail!("ID node must be {} bytes, got {}", NODE_SIZE, bytes.len());
        }

        let mut slots = [FREE_SLOT; ORDER];
        for (slot, chunk) in slots.iter_mut().zip(bytes.chunks_exact(4)) {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(chunk);
            *slot = i32::from_be_bytes(raw);
        }
        Ok(Self { slots })
    }

    /// Encodes the node as a record
    #[must_use]
    pub fn to_bytes(&self) -> [u8; NODE_SIZE] {
        let mut bytes = [0u8; NODE_SIZE];
        for (chunk, slot) in bytes.chunks_exact_mut(4).zip(self.slots) {
            chunk.copy_from_slice(&slot.to_be_bytes());
        }
        bytes
    }

    /// Whether the record has never been used
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.slots.iter().all(|&slot| slot == FREE_SLOT)
    }
}

fn record_is_free(bytes: &[u8]) -> bool {
    bytes == BLANK_NODE.as_slice()
}

/// Slot selected by `id` at trie level `level`
#[inline]
#[must_use]
pub fn slot_index(id: u64, level: u32) -> usize {
    let shift = BITS_PER_LEVEL * (LEVELS - 1 - level);
    // The root level shifts by 64, which leaves nothing
    (id.checked_shr(shift).unwrap_or(0) & 0b11) as usize
}

fn check_capacity(id: u64, value: u32) -> Result<()> {
    if id > MAX_ID {
        anyhow::bail!("ID {} exceeds the maximum of {}", id, MAX_ID);
    }
    if value > MAX_VALUE {
        anyhow::bail!("Record number {} exceeds the maximum of {}", value, MAX_VALUE);
    }
    Ok(())
}

/// ID → record number trie over a record store
pub struct IdIndex<S: RecordStore = RecordFile> {
    store: S,
    options: IndexOptions,
    free: FreeList,

    /// Write-through cache of recently used IDs
    cache: Option<Mutex<LruCache<u64, u32>>>,
}

impl IdIndex<RecordFile> {
    /// Opens or creates an ID index file
    ///
    /// # Errors
    ///
    /// Returns an error if the record file cannot be opened.
    pub fn open<P: AsRef<Path>>(
        path: P,
        store_options: StoreOptions,
        options: IndexOptions,
    ) -> Result<Self> {
        let file = RecordFile::open(path, NODE_SIZE, store_options)?;
        Self::new(file, options)
    }
}

impl<S: RecordStore + std::fmt::Debug> std::fmt::Debug for IdIndex<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdIndex")
            .field("store", &self.store)
            .field("options", &self.options)
            .field("free", &self.free)
            .finish_non_exhaustive()
    }
}

impl<S: RecordStore> IdIndex<S> {
    /// Wraps an existing store
    ///
    /// # Errors
    ///
    /// Returns an error if the store's record length is not [`NODE_SIZE`].
    pub fn new(store: S, options: IndexOptions) -> Result<Self> {
        if store.record_length() != NODE_SIZE {
            anyhow::bail!(
                "ID index needs {}-byte records, store has {}",
                NODE_SIZE,
                store.record_length()
            );
        }

        let cache = NonZeroUsize::new(options.id_cache_capacity)
            .map(|cap| Mutex::new(LruCache::new(cap)));

        Ok(Self { store, options, free: FreeList::with_usage(), cache })
    }

    /// Maps `id` to the external record number `value`
    ///
    /// Overwrites any previous mapping for `id`. A new node is claimed on
    /// disk before its parent links to it, so an interrupted put leaves at
    /// worst an unreachable node, never a linked one that looks free.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `id` exceeds [`MAX_ID`] or `value` exceeds [`MAX_VALUE`] (checked
    ///   before any I/O)
    /// - The index cannot grow
    /// - A record read or write fails
    pub fn put(&mut self, id: u64, value: u32) -> Result<()> {
        check_capacity(id, value)?;
        self.ensure_root()?;

        let mut record: RecordNo = 0;
        for level in 0..LEVELS {
            let slot = slot_index(id, level);
            let mut node = self.read_node(record)?;

            if level == LEVELS - 1 {
                // check_capacity bounds value by i32::MAX
                node.set_slot(slot, value as i32);
                self.write_node(record, &node)?;
                break;
            }

            let count = self.store.record_count();
            record = match follow_link(INDEX_NAME, record, node.slot(slot), count) {
                Some(child) => child,
                None => {
                    let child = self.free.allocate_or_grow(
                        &mut self.store,
                        &self.options,
                        &BLANK_NODE,
                        record_is_free,
                    )?;
                    let link = i32::try_from(child).context("Child record number overflow")?;
                    self.write_node(child, &IdNode::CLAIMED)?;
                    node.set_slot(slot, link);
                    self.write_node(record, &node)?;
                    child
                }
            };
        }

        if let Some(cache) = &self.cache {
            cache.lock().put(id, value);
        }
        Ok(())
    }

    /// Looks up the external record number stored for `id`
    ///
    /// Returns `None` if the ID was never stored, was removed, or its path is
    /// broken by corruption. An empty index is never touched.
    ///
    /// # Errors
    ///
    /// Returns an error if a record read fails.
    pub fn get(&self, id: u64) -> Result<Option<u32>> {
        if id > MAX_ID {
            return Ok(None);
        }

        if let Some(hit) = self.cache.as_ref().and_then(|cache| cache.lock().get(&id).copied()) {
            return Ok(Some(hit));
        }

        let Some(leaf) = self.find_leaf(id)? else {
            return Ok(None);
        };
        let node = self.read_node(leaf)?;
        let found = u32::try_from(node.slot(slot_index(id, LEVELS - 1))).ok();

        if let (Some(value), Some(cache)) = (found, &self.cache) {
            cache.lock().put(id, value);
        }
        Ok(found)
    }

    /// Clears the mapping for `id`
    ///
    /// Returns whether a mapping existed. The trie is not compacted: the
    /// path to the cleared slot stays allocated.
    ///
    /// # Errors
    ///
    /// Returns an error if a record read or write fails.
    pub fn remove(&mut self, id: u64) -> Result<bool> {
        if let Some(cache) = &self.cache {
            cache.lock().pop(&id);
        }

        if id > MAX_ID {
            return Ok(false);
        }

        let Some(leaf) = self.find_leaf(id)? else {
            return Ok(false);
        };

        let slot = slot_index(id, LEVELS - 1);
        let mut node = self.read_node(leaf)?;
        if node.slot(slot) < 0 {
            return Ok(false);
        }

        node.set_slot(slot, CLEARED_SLOT);
        self.write_node(leaf, &node)?;
        Ok(true)
    }

    /// Number of records in the backing store
    pub fn record_count(&self) -> RecordNo {
        self.store.record_count()
    }

    /// The backing store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The backing store, mutably. Writing through it bypasses the ID cache.
    pub fn store_mut(&mut self) -> &mut S {
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
        &mut self.store
    }

    /// Unwraps the backing store
    pub fn into_store(self) -> S {
        self.store
    }

    /// Flushes the backing store
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.store.flush()
    }

    /// Descends to the last-level node on `id`'s path
    fn find_leaf(&self, id: u64) -> Result<Option<RecordNo>> {
        let count = self.store.record_count();
        if count == 0 {
            return Ok(None);
        }

        let mut record: RecordNo = 0;
        for level in 0..LEVELS - 1 {
            let node = self.read_node(record)?;
            match follow_link(INDEX_NAME, record, node.slot(slot_index(id, level)), count) {
                Some(child) => record = child,
                None => return Ok(None),
            }
        }
        Ok(Some(record))
    }

    fn ensure_root(&mut self) -> Result<()> {
        if self.store.record_count() == 0 {
            grow_blank(&mut self.store, &self.options, &BLANK_NODE)?;
            debug!("Created {} root", INDEX_NAME);
        }
        Ok(())
    }

    fn read_node(&self, record: RecordNo) -> Result<IdNode> {
        IdNode::from_bytes(&self.store.read(record)?)
    }

    fn write_node(&mut self, record: RecordNo, node: &IdNode) -> Result<()> {
        self.store.write(record, &node.to_bytes())
    }
}
