//! Mapstore - file-backed indexes for very large map datasets
//!
//! Mapstore finds map entities by 64-bit ID or by bounding box without
//! loading the entity set into memory. It does not store the entities
//! themselves: both indexes map keys to *record numbers* in an external
//! entity file owned by the application.
//!
//! # Features
//!
//! - Fixed-length record files, memory-mapped with a conventional I/O fallback
//! - ID trie (`u64` → record number), 2 bits per level
//! - kd-style point index (fixed-point latitude/longitude → record number)
//! - Interned attribute names with stable 16-bit keys
//! - Self-healing reads: corrupt self-referencing links are logged and skipped
//! - Single-writer, multi-reader concurrency (SWMR)
//!
//! # Example
//!
//! ```no_run
//! use mapstore_core::{BoundingBox, GeoPoint, MapIndex, MapIndexOptions};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut index = MapIndex::open("planet-index", MapIndexOptions::default())?;
//!
//! // Entity 4242 lives at record 17 of the entity file
//! index.register(4242, 17, Some(GeoPoint::new(515_000_000, -1_200_000)))?;
//!
//! assert_eq!(index.lookup(4242)?, Some(17));
//! let nearby = index.within(&BoundingBox::new(510_000_000, -2_000_000, 520_000_000, 0))?;
//! assert!(nearby.contains(&17));
//!
//! index.flush()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Non-goals
//!
//! Mapstore does not provide transactions, multi-writer safety, schema
//! evolution or a network protocol. One process writes; any number of
//! threads read.

pub mod attributes;
pub mod config;
pub mod geo_index;
pub mod id_index;
pub mod record_file;
pub mod store;

#[cfg(feature = "internals")]
pub mod free;
#[cfg(not(feature = "internals"))]
pub(crate) mod free;

#[cfg(feature = "internals")]
pub mod repair;
#[cfg(not(feature = "internals"))]
pub(crate) mod repair;

pub use attributes::{AttributeTable, NO_ATTRIBUTE, UNKNOWN_KEY};
pub use config::{IndexOptions, MapIndexOptions, StoreOptions};
pub use geo_index::{BoundingBox, GeoIndex, GeoNode, GeoPoint};
pub use id_index::{IdIndex, IdNode};
pub use record_file::RecordFile;
pub use store::{MemoryStore, RecordNo, RecordStore};

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// File name of the ID trie inside an index directory
pub const ID_INDEX_FILE: &str = "ids.idx";

/// File name of the point index inside an index directory
pub const POINT_INDEX_FILE: &str = "points.idx";

/// File name of the attribute table inside an index directory
pub const ATTRIBUTE_FILE: &str = "attributes.txt";

/// ID index, point index and attribute table of one dataset
///
/// This is the entry point used by import pipelines: register an entity's
/// record number once the entity file has stored it, look it up by ID or by
/// area later.
#[derive(Debug)]
pub struct MapIndex {
    dir: PathBuf,
    ids: IdIndex,
    points: GeoIndex,
    attributes: AttributeTable,
}

impl MapIndex {
    /// Opens or creates the index files in `dir`
    ///
    /// # Arguments
    ///
    /// * `dir` - Directory holding the index files (created if missing)
    /// * `options` - Store and growth configuration
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - Any index file cannot be opened or is locked by another process
    /// - The attribute table cannot be read
    pub fn open<P: AsRef<Path>>(dir: P, options: MapIndexOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create index directory: {}", dir.display()))?;

        let ids = IdIndex::open(dir.join(ID_INDEX_FILE), options.store.clone(), options.ids)?;
        let points = GeoIndex::open(dir.join(POINT_INDEX_FILE), options.store, options.points)?;
        let attributes = AttributeTable::open(dir.join(ATTRIBUTE_FILE))?;

        Ok(Self { dir, ids, points, attributes })
    }

    /// Directory holding the index files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Registers entity `id` stored at external record `record`
    ///
    /// Point-like entities also pass their location so they can be found by
    /// [`within`](Self::within).
    ///
    /// # Errors
    ///
    /// Returns an error if the ID or record number is out of range, or an
    /// index write fails. A failure in the point index leaves the ID
    /// registered.
    pub fn register(&mut self, id: u64, record: u32, point: Option<GeoPoint>) -> Result<()> {
        self.ids.put(id, record)?;
        if let Some(point) = point {
            self.points.put(record, point.lat, point.lon)?;
        }
        Ok(())
    }

    /// Record number of entity `id`
    ///
    /// # Errors
    ///
    /// Returns an error if an index read fails.
    pub fn lookup(&self, id: u64) -> Result<Option<u32>> {
        self.ids.get(id)
    }

    /// Record numbers of all point entities inside `bbox`
    ///
    /// # Errors
    ///
    /// Returns an error if an index read fails or the point index is
    /// corrupt beyond self-repair.
    pub fn within(&self, bbox: &BoundingBox) -> Result<HashSet<u32>> {
        self.points.query(bbox)
    }

    /// Forgets entity `id` (and its point, if given)
    ///
    /// Returns whether the ID was registered.
    ///
    /// # Errors
    ///
    /// Returns an error if an index read or write fails.
    pub fn unregister(&mut self, id: u64, record: u32, point: Option<GeoPoint>) -> Result<bool> {
        let existed = self.ids.remove(id)?;
        if let Some(point) = point {
            self.points.remove(record, point.lat, point.lon)?;
        }
        Ok(existed)
    }

    /// The attribute name table
    pub fn attributes(&self) -> &AttributeTable {
        &self.attributes
    }

    /// The ID trie
    pub fn ids(&self) -> &IdIndex {
        &self.ids
    }

    /// The point index
    pub fn points(&self) -> &GeoIndex {
        &self.points
    }

    /// Flushes both index files to disk
    ///
    /// # Errors
    ///
    /// Returns an error if either flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.ids.flush()?;
        self.points.flush()?;
        Ok(())
    }

    /// Closes both index files
    ///
    /// # Errors
    ///
    /// Returns an error if flushing a mapping fails while closing.
    pub fn close(mut self) -> Result<()> {
        self.ids.store_mut().close()?;
        self.points.store_mut().close()?;
        Ok(())
    }
}
