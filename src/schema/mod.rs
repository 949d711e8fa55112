//! # Schema & layout
//!
//! Descriptors for tables, column families and regions, plus the on-disk
//! directory layout shared by stores, flushes, compactions, splits and
//! merges.
//!
//! ## Layout (relative to a configured root)
//!
//! ```text
//! /{table}/{encoded-region}/                        region dir
//! /{table}/{encoded-region}/{family}/mapfiles/{id}  data file ({id}.{parent} when a reference)
//! /{table}/{encoded-region}/{family}/info/{id}      info sidecar (max flushed sequence id)
//! /{table}/{encoded-region}/{family}/filter/filter  optional bloom filter
//! /{table}/compaction.dir/{encoded-region}/         compaction scratch
//! /{table}/{encoded-region}/splits/{child}/         split scratch
//! /{table}/{encoded-region}/merges/                 merge scratch
//! /{table}/{encoded-region}/oldlogfile.log          WAL share to replay at open
//! ```
//!
//! A region's `[start_key, end_key)` is inclusive/exclusive; empty bytes
//! mean unbounded on that side.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Name of a region's share of a pre-existing WAL, replayed at open.
pub const OLD_LOG_FILE_NAME: &str = "oldlogfile.log";

/// Split scratch directory name inside a region dir.
pub const SPLIT_DIR_NAME: &str = "splits";

/// Merge scratch directory name inside a region dir.
pub const MERGE_DIR_NAME: &str = "merges";

/// Compaction scratch directory name inside a table dir.
pub const COMPACTION_DIR_NAME: &str = "compaction.dir";

// ------------------------------------------------------------------------------------------------
// Column family descriptors
// ------------------------------------------------------------------------------------------------

/// The closed set of bloom filter flavours a store may own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum BloomFilterKind {
    /// Plain membership filter.
    Plain,
    /// Counting filter.
    Counting,
    /// Retouched filter.
    Retouched,
}

/// Bloom filter schema for a column family.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct BloomFilterSpec {
    /// Which filter flavour the store should build.
    pub kind: BloomFilterKind,

    /// Expected number of distinct rows; sizes the filter.
    pub expected_rows: usize,

    /// Target false-positive rate.
    pub false_positive_rate: f64,
}

impl BloomFilterSpec {
    /// A plain filter with the default 1% false-positive target.
    pub fn plain(expected_rows: usize) -> Self {
        Self {
            kind: BloomFilterKind::Plain,
            expected_rows,
            false_positive_rate: 0.01,
        }
    }
}

/// Schema of one column family: versions retained and bloom policy.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct ColumnDescriptor {
    /// Family name, without the trailing `:`.
    pub name: Vec<u8>,

    /// Maximum number of cell versions compaction retains per
    /// (row, column).
    pub max_versions: u32,

    /// Bloom filter schema, if the family keeps one.
    pub bloom_filter: Option<BloomFilterSpec>,
}

impl ColumnDescriptor {
    /// Family with the default of three retained versions and no bloom
    /// filter.
    pub fn new(name: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            max_versions: 3,
            bloom_filter: None,
        }
    }

    /// Sets the number of retained versions.
    pub fn with_max_versions(mut self, max_versions: u32) -> Self {
        self.max_versions = max_versions;
        self
    }

    /// Attaches a bloom filter spec.
    pub fn with_bloom_filter(mut self, spec: BloomFilterSpec) -> Self {
        self.bloom_filter = Some(spec);
        self
    }
}

// ------------------------------------------------------------------------------------------------
// Table descriptor
// ------------------------------------------------------------------------------------------------

/// Schema of a table: its name and column families.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct TableDescriptor {
    /// Table name.
    pub name: Vec<u8>,

    /// Column families keyed by family name.
    pub families: BTreeMap<Vec<u8>, ColumnDescriptor>,
}

impl TableDescriptor {
    /// Empty table schema.
    pub fn new(name: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            families: BTreeMap::new(),
        }
    }

    /// Adds a column family.
    pub fn with_family(mut self, family: ColumnDescriptor) -> Self {
        self.families.insert(family.name.clone(), family);
        self
    }

    /// True iff the table has a family of this name.
    pub fn has_family(&self, family: &[u8]) -> bool {
        self.families.contains_key(family)
    }

    /// Descriptor for a family, if present.
    pub fn family(&self, family: &[u8]) -> Option<&ColumnDescriptor> {
        self.families.get(family)
    }
}

// ------------------------------------------------------------------------------------------------
// Region descriptor
// ------------------------------------------------------------------------------------------------

/// Identity of one region: a contiguous `[start_key, end_key)` slice of
/// a table's row space.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct RegionInfo {
    /// Schema of the table this region belongs to.
    pub table: TableDescriptor,

    /// Inclusive start row; empty means unbounded below.
    pub start_key: Vec<u8>,

    /// Exclusive end row; empty means unbounded above.
    pub end_key: Vec<u8>,

    /// Unique region id, drawn from the creation clock.
    pub region_id: u64,

    /// Set while the region is not being served.
    pub offline: bool,

    /// Full region name: `{table},{start_key},{region_id}`.
    region_name: Vec<u8>,

    /// Filesystem-safe digest of the region name.
    encoded_name: String,
}

impl RegionInfo {
    /// New region descriptor with a clock-drawn region id.
    pub fn new(table: TableDescriptor, start_key: Vec<u8>, end_key: Vec<u8>) -> Self {
        let region_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::with_region_id(table, start_key, end_key, region_id)
    }

    /// New region descriptor with an explicit region id.
    pub fn with_region_id(
        table: TableDescriptor,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        region_id: u64,
    ) -> Self {
        let mut region_name = table.name.clone();
        region_name.push(b',');
        region_name.extend_from_slice(&start_key);
        region_name.extend_from_slice(format!(",{}", region_id).as_bytes());

        let encoded_name = format!("{}", crc32fast::hash(&region_name));

        Self {
            table,
            start_key,
            end_key,
            region_id,
            offline: false,
            region_name,
            encoded_name,
        }
    }

    /// Full region name.
    pub fn region_name(&self) -> &[u8] {
        &self.region_name
    }

    /// Filesystem-safe encoded region name.
    pub fn encoded_name(&self) -> &str {
        &self.encoded_name
    }

    /// True iff `row` falls inside `[start_key, end_key)`; empty bounds
    /// are unbounded.
    pub fn contains_row(&self, row: &[u8]) -> bool {
        (self.start_key.is_empty() || self.start_key.as_slice() <= row)
            && (self.end_key.is_empty() || row < self.end_key.as_slice())
    }
}

// ------------------------------------------------------------------------------------------------
// Layout helpers
// ------------------------------------------------------------------------------------------------

fn bytes_component(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

/// Table directory under the store root.
pub fn table_dir(root: &Path, table: &[u8]) -> PathBuf {
    root.join(bytes_component(table))
}

/// Region directory under a table directory.
pub fn region_dir(table_dir: &Path, encoded_region: &str) -> PathBuf {
    table_dir.join(encoded_region)
}

/// Data file directory of one family.
pub fn map_dir(basedir: &Path, encoded_region: &str, family: &[u8]) -> PathBuf {
    basedir
        .join(encoded_region)
        .join(bytes_component(family))
        .join("mapfiles")
}

/// Info sidecar directory of one family.
pub fn info_dir(basedir: &Path, encoded_region: &str, family: &[u8]) -> PathBuf {
    basedir
        .join(encoded_region)
        .join(bytes_component(family))
        .join("info")
}

/// Bloom filter directory of one family.
pub fn filter_dir(basedir: &Path, encoded_region: &str, family: &[u8]) -> PathBuf {
    basedir
        .join(encoded_region)
        .join(bytes_component(family))
        .join("filter")
}

/// Compaction scratch directory for a table directory.
pub fn compaction_dir(table_dir: &Path) -> PathBuf {
    table_dir.join(COMPACTION_DIR_NAME)
}
