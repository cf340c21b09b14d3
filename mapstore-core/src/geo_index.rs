//! Persistent 2-D point index with kd-tree splitting.
//!
//! Points are stored one per node in a binary tree. Even depths split on
//! latitude, odd depths on longitude; a point whose key is strictly lower
//! than the node's goes left, everything else goes right. Insertion never
//! rebalances, so the shape depends on insertion order.
//!
//! # Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       8     latitude:  i64 (fixed point, big-endian)
//! 8       8     longitude: i64
//! 16      4     record:    i32 (external record number, -1 after removal)
//! 20      4     left:      i32 (child record, -1 if none)
//! 24      4     right:     i32
//! ```
//!
//! A node whose latitude and longitude are both `i64::MIN` is empty.

use crate::config::{IndexOptions, StoreOptions};
use crate::free::{FreeList, grow_blank};
use crate::record_file::RecordFile;
use crate::repair::follow_link;
use crate::store::{RecordNo, RecordStore};
use anyhow::{Context, Result};
use log::debug;
use std::collections::HashSet;
use std::path::Path;

/// Size of a node record in bytes
pub const NODE_SIZE: usize = 28;

/// Coordinate value marking an empty node
pub const EMPTY_COORD: i64 = i64::MIN;

/// Record field of a node whose value was removed
pub const NO_RECORD: i32 = -1;

/// Child field without a child
pub const NO_CHILD: i32 = -1;

const INDEX_NAME: &str = "geo index";

/// Fixed-point coordinate pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeoPoint {
    /// Latitude
    pub lat: i64,
    /// Longitude
    pub lon: i64,
}

impl GeoPoint {
    /// Creates a point
    #[must_use]
    pub const fn new(lat: i64, lon: i64) -> Self {
        Self { lat, lon }
    }

    fn along(self, axis: Axis) -> i64 {
        match axis {
            Axis::Latitude => self.lat,
            Axis::Longitude => self.lon,
        }
    }
}

/// Closed latitude/longitude box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    /// Southern edge (inclusive)
    pub min_lat: i64,
    /// Western edge (inclusive)
    pub min_lon: i64,
    /// Northern edge (inclusive)
    pub max_lat: i64,
    /// Eastern edge (inclusive)
    pub max_lon: i64,
}

impl BoundingBox {
    /// Creates a box from its corners
    #[must_use]
    pub const fn new(min_lat: i64, min_lon: i64, max_lat: i64, max_lon: i64) -> Self {
        Self { min_lat, min_lon, max_lat, max_lon }
    }

    /// Whether `point` lies inside the box, edges included
    #[must_use]
    pub fn contains(&self, point: GeoPoint) -> bool {
        (self.min_lat..=self.max_lat).contains(&point.lat)
            && (self.min_lon..=self.max_lon).contains(&point.lon)
    }

    fn bounds(&self, axis: Axis) -> (i64, i64) {
        match axis {
            Axis::Latitude => (self.min_lat, self.max_lat),
            Axis::Longitude => (self.min_lon, self.max_lon),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Latitude,
    Longitude,
}

impl Axis {
    fn at_depth(depth: u32) -> Self {
        if depth % 2 == 0 { Axis::Latitude } else { Axis::Longitude }
    }
}

/// One decoded tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeoNode {
    /// Latitude of the stored point
    pub lat: i64,
    /// Longitude of the stored point
    pub lon: i64,
    /// External record number, or [`NO_RECORD`]
    pub record: i32,
    /// Left child, or [`NO_CHILD`]
    pub left: i32,
    /// Right child, or [`NO_CHILD`]
    pub right: i32,
}

impl GeoNode {
    /// Empty node
    pub const BLANK: Self =
        Self {
            lat: EMPTY_COORD,
            lon: EMPTY_COORD,
            record: NO_RECORD,
            left: NO_CHILD,
            right: NO_CHILD,
        };

    /// Childless node holding `point`
    #[must_use]
    pub const fn leaf(point: GeoPoint, record: i32) -> Self {
        Self { lat: point.lat, lon: point.lon, record, left: NO_CHILD, right: NO_CHILD }
    }

    /// Decodes a node record
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not exactly [`NODE_SIZE`] long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != NODE_SIZE {
            anyhow::bail!("Geo node must be {} bytes, got {}", NODE_SIZE, bytes.len());
        }

        let i64_at = |at: usize| -> Result<i64> {
            let raw = bytes.get(at..at + 8).context("Geo node truncated")?;
            Ok(i64::from_be_bytes(raw.try_into()?))
        };
        let i32_at = |at: usize| -> Result<i32> {
            let raw = bytes.get(at..at + 4).context("Geo node truncated")?;
            Ok(i32::from_be_bytes(raw.try_into()?))
        };

        Ok(Self {
            lat: i64_at(0)?,
            lon: i64_at(8)?,
            record: i32_at(16)?,
            left: i32_at(20)?,
            right: i32_at(24)?,
        })
    }

    /// Encodes the node as a record
    #[must_use]
    pub fn to_bytes(&self) -> [u8; NODE_SIZE] {
        let fields = self.lat.to_be_bytes().into_iter()
            .chain(self.lon.to_be_bytes())
            .chain(self.record.to_be_bytes())
            .chain(self.left.to_be_bytes())
            .chain(self.right.to_be_bytes());

        let mut bytes = [0u8; NODE_SIZE];
        for (byte, value) in bytes.iter_mut().zip(fields) {
            *byte = value;
        }
        bytes
    }

    /// Whether the node holds no point
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.lat == EMPTY_COORD && self.lon == EMPTY_COORD
    }

    /// The stored point
    #[must_use]
    pub const fn point(&self) -> GeoPoint {
        GeoPoint { lat: self.lat, lon: self.lon }
    }

    /// The stored record number, unless removed
    #[must_use]
    pub fn value(&self) -> Option<u32> {
        u32::try_from(self.record).ok()
    }
}

fn record_is_free(bytes: &[u8]) -> bool {
    GeoNode::from_bytes(bytes).is_ok_and(|node| node.is_empty())
}

/// Point → record number index over a record store
pub struct GeoIndex<S: RecordStore = RecordFile> {
    store: S,
    options: IndexOptions,
    free: FreeList,
}

impl GeoIndex<RecordFile> {
    /// Opens or creates a geo index file
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

impl<S: RecordStore + std::fmt::Debug> std::fmt::Debug for GeoIndex<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoIndex")
            .field("store", &self.store)
            .field("options", &self.options)
            .field("free", &self.free)
            .finish_non_exhaustive()
    }
}

impl<S: RecordStore> GeoIndex<S> {
    /// Wraps an existing store
    ///
    /// # Errors
    ///
    /// Returns an error if the store's record length is not [`NODE_SIZE`].
    pub fn new(store: S, options: IndexOptions) -> Result<Self> {
        if store.record_length() != NODE_SIZE {
            anyhow::bail!(
                "Geo index needs {}-byte records, store has {}",
                NODE_SIZE,
                store.record_length()
            );
        }
        Ok(Self { store, options, free: FreeList::new() })
    }

    /// Stores `record` at (`lat`, `lon`)
    ///
    /// The point lands in the first empty node along its search path.
    /// Inserting the same point twice stores it twice.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `record` does not fit an `i32`
    /// - Both coordinates equal `i64::MIN` (the empty-node marker)
    /// - The index cannot grow, a read/write fails, or a cycle longer than a
    ///   self reference is found
    pub fn put(&mut self, record: u32, lat: i64, lon: i64) -> Result<()> {
        let value = i32::try_from(record)
            .map_err(|_| {
                anyhow::anyhow!("Record number {} exceeds the maximum of {}", record, i32::MAX)
            })?;
        let point = GeoPoint::new(lat, lon);
        if point == GeoNode::BLANK.point() {
            anyhow::bail!("Coordinates ({}, {}) are reserved for empty nodes", lat, lon);
        }

        self.ensure_root()?;
        let count = self.store.record_count();

        let mut current: RecordNo = 0;
        let mut depth: u32 = 0;
        loop {
            if depth > count {
                anyhow::bail!("{}: cycle detected while inserting at depth {}", INDEX_NAME, depth);
            }

            let mut node = self.read_node(current)?;
            if node.is_empty() {
                return self.write_node(current, &GeoNode::leaf(point, value));
            }

            let axis = Axis::at_depth(depth);
            let go_left = point.along(axis) < node.point().along(axis);
            let link = if go_left { node.left } else { node.right };

            if let Some(child) = follow_link(INDEX_NAME, current, link, count) {
                current = child;
                depth += 1;
                continue;
            }

            let blank = GeoNode::BLANK.to_bytes();
            let child =
                self.free.allocate_or_grow(&mut self.store, &self.options, &blank, record_is_free)?;
            // Child first, so the parent never links to an unwritten node
            self.write_node(child, &GeoNode::leaf(point, value))?;

            let child_link = i32::try_from(child).context("Child record number overflow")?;
            if go_left {
                node.left = child_link;
            } else {
                node.right = child_link;
            }
            return self.write_node(current, &node);
        }
    }

    /// Removes `record` stored at (`lat`, `lon`)
    ///
    /// Only the node's record field is cleared; the node keeps its point and
    /// children so the tree shape is unchanged.
    ///
    /// Returns whether the record was found.
    ///
    /// # Errors
    ///
    /// Returns an error if a read/write fails or a cycle is found.
    pub fn remove(&mut self, record: u32, lat: i64, lon: i64) -> Result<bool> {
        let Ok(value) = i32::try_from(record) else {
            return Ok(false);
        };
        let point = GeoPoint::new(lat, lon);
        let count = self.store.record_count();
        if count == 0 {
            return Ok(false);
        }

        let mut current: RecordNo = 0;
        let mut depth: u32 = 0;
        loop {
            if depth > count {
                anyhow::bail!("{}: cycle detected while removing at depth {}", INDEX_NAME, depth);
            }

            let mut node = self.read_node(current)?;
            if node.is_empty() {
                return Ok(false);
            }

            if node.record == value {
                node.record = NO_RECORD;
                self.write_node(current, &node)?;
                return Ok(true);
            }

            let axis = Axis::at_depth(depth);
            let link =
                if point.along(axis) < node.point().along(axis) { node.left } else { node.right };

            match follow_link(INDEX_NAME, current, link, count) {
                Some(child) => {
                    current = child;
                    depth += 1;
                }
                None => return Ok(false),
            }
        }
    }

    /// Collects every record whose point lies in the closed box
    ///
    /// # Errors
    ///
    /// Returns an error if a read fails or the tree contains a cycle longer
    /// than a self reference.
    pub fn range_query(
        &self,
        min_lat: i64,
        min_lon: i64,
        max_lat: i64,
        max_lon: i64,
    ) -> Result<HashSet<u32>> {
        self.query(&BoundingBox::new(min_lat, min_lon, max_lat, max_lon))
    }

    /// Collects every record whose point lies in `bbox`
    ///
    /// # Errors
    ///
    /// Same as [`range_query`](Self::range_query).
    pub fn query(&self, bbox: &BoundingBox) -> Result<HashSet<u32>> {
        let mut found = HashSet::new();
        let count = self.store.record_count();
        if count == 0 {
            return Ok(found);
        }

        // Explicit stack: unbalanced trees can be as deep as they are large
        let mut stack: Vec<(RecordNo, u32)> = vec![(0, 0)];
        let mut visited: u64 = 0;

        while let Some((current, depth)) = stack.pop() {
            visited += 1;
            if visited > u64::from(count) {
                anyhow::bail!(
                    "{}: cycle detected, visited more nodes than records exist",
                    INDEX_NAME
                );
            }

            let node = self.read_node(current)?;
            if node.is_empty() {
                continue;
            }

            if let Some(value) = node.value() {
                if bbox.contains(node.point()) {
                    found.insert(value);
                }
            }

            let axis = Axis::at_depth(depth);
            let key = node.point().along(axis);
            let (low, high) = bbox.bounds(axis);

            if low < key {
                if let Some(child) = follow_link(INDEX_NAME, current, node.left, count) {
                    stack.push((child, depth + 1));
                }
            }
            if high >= key {
                if let Some(child) = follow_link(INDEX_NAME, current, node.right, count) {
                    stack.push((child, depth + 1));
                }
            }
        }

        Ok(found)
    }

    /// Number of records in the backing store
    pub fn record_count(&self) -> RecordNo {
        self.store.record_count()
    }

    /// The backing store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The backing store, mutably
    pub fn store_mut(&mut self) -> &mut S {
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

    fn ensure_root(&mut self) -> Result<()> {
        if self.store.record_count() == 0 {
            grow_blank(&mut self.store, &self.options, &GeoNode::BLANK.to_bytes())?;
            debug!("Created {} root", INDEX_NAME);
        }
        Ok(())
    }

    fn read_node(&self, record: RecordNo) -> Result<GeoNode> {
        GeoNode::from_bytes(&self.store.read(record)?)
    }

    fn write_node(&mut self, record: RecordNo, node: &GeoNode) -> Result<()> {
        self.store.write(record, &node.to_bytes())
    }
}
