//! Tunables for record files and the indexes built on them.

/// Default capacity of the unmapped-mode record buffer cache
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Records added per growth step of the ID index
pub const ID_GROW_BATCH: u32 = 5_000_000;

/// Records added per growth step of the geo index
pub const POINT_GROW_BATCH: u32 = 512_000;

/// Smallest growth either index accepts before giving up
pub const GROW_MINIMUM: u32 = 4096;

/// Default capacity of the ID index write-through cache
pub const DEFAULT_ID_CACHE_CAPACITY: usize = 1024;

/// Configuration for a [`RecordFile`](crate::RecordFile)
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Maximum record buffers kept when the file is not mapped
    pub cache_capacity: usize,

    /// Try to memory-map the file at all
    pub map_records: bool,

    /// Largest mapping (in bytes) the store will attempt.
    /// Anything larger is served through conventional I/O.
    pub map_limit: u64,

    /// How many times a remap is attempted after growth
    pub map_attempts: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            map_records: true,
            map_limit: u64::MAX,
            map_attempts: 3,
        }
    }
}

impl StoreOptions {
    /// Options for a store that never maps and always goes through the cache
    #[must_use]
    pub fn unmapped() -> Self {
        Self { map_records: false, ..Self::default() }
    }
}

/// Growth and caching parameters for an index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOptions {
    /// Records requested when the index runs out of free records
    pub grow_batch: u32,

    /// Records that must be obtained for an insert to proceed
    pub grow_minimum: u32,

    /// Entries in the ID write-through cache (0 disables it)
    pub id_cache_capacity: usize,
}

impl IndexOptions {
    /// Defaults for the ID trie
    #[must_use]
    pub const fn for_ids() -> Self {
        Self {
            grow_batch: ID_GROW_BATCH,
            grow_minimum: GROW_MINIMUM,
            id_cache_capacity: DEFAULT_ID_CACHE_CAPACITY,
        }
    }

    /// Defaults for the point index
    #[must_use]
    pub const fn for_points() -> Self {
        Self { grow_batch: POINT_GROW_BATCH, grow_minimum: GROW_MINIMUM, id_cache_capacity: 0 }
    }

    /// Small growth steps, handy for tests and tiny datasets
    #[must_use]
    pub const fn with_batch(mut self, grow_batch: u32, grow_minimum: u32) -> Self {
        self.grow_batch = grow_batch;
        self.grow_minimum = grow_minimum;
        self
    }
}

/// Options for the [`MapIndex`](crate::MapIndex) facade
#[derive(Debug, Clone)]
pub struct MapIndexOptions {
    /// Options shared by both record files
    pub store: StoreOptions,

    /// ID trie options
    pub ids: IndexOptions,

    /// Point index options
    pub points: IndexOptions,
}

impl Default for MapIndexOptions {
    fn default() -> Self {
        Self {
            store: StoreOptions::default(),
            ids: IndexOptions::for_ids(),
            points: IndexOptions::for_points(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_defaults() {
        let ids = IndexOptions::for_ids();
        assert_eq!(ids.grow_batch, 5_000_000);
        assert_eq!(ids.grow_minimum, 4096);
        assert!(ids.id_cache_capacity > 0);

        let points = IndexOptions::for_points();
        assert_eq!(points.grow_batch, 512_000);
        assert_eq!(points.id_cache_capacity, 0);
    }

    #[test]
    fn test_with_batch() {
        let opts = IndexOptions::for_ids().with_batch(64, 8);
        assert_eq!(opts.grow_batch, 64);
        assert_eq!(opts.grow_minimum, 8);
        assert_eq!(opts.id_cache_capacity, DEFAULT_ID_CACHE_CAPACITY);
    }

    #[test]
    fn test_unmapped_store_options() {
        let opts = StoreOptions::unmapped();
        assert!(!opts.map_records);
        assert_eq!(opts.cache_capacity, DEFAULT_CACHE_CAPACITY);
    }
}
