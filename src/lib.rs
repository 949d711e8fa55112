//! # Strata
//!
//! The per-region storage engine of a column-family-oriented, sorted
//! key-value store. A table is horizontally partitioned into
//! non-overlapping row ranges called **regions**; within a region each
//! column family is served by an independent **store** made of an
//! in-memory buffer, an immutable flush snapshot, and a set of sorted
//! on-disk files.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         Region                            │
//! │  row locks · update lock · write state · scanner gate     │
//! │                                                           │
//! │   ┌───────────────────────┐  ┌───────────────────────┐    │
//! │   │     Store (cf1)       │  │     Store (cf2)       │    │
//! │   │  ┌─────────┐          │  │  ┌─────────┐          │    │
//! │   │  │Memcache │ snapshot │  │  │Memcache │ snapshot │    │
//! │   │  └────┬────┘          │  │  └────┬────┘          │    │
//! │   │       │ flush         │  │       │ flush         │    │
//! │   │  ┌────▼────────────┐  │  │  ┌────▼────────────┐  │    │
//! │   │  │ Store files     │  │  │  │ Store files     │  │    │
//! │   │  │ (by seq id)     │  │  │  │ (by seq id)     │  │    │
//! │   │  └─────────────────┘  │  │  └─────────────────┘  │    │
//! │   └───────────────────────┘  └───────────────────────┘    │
//! │                                                           │
//! │   WAL (shared handle, region-tagged records)              │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes append to the WAL first, then land in the owning family's
//! memcache; reads merge memcache, snapshot and files newest-first;
//! background activity flushes memory to disk, compacts files, and
//! splits the region via cheap reference half-files once a file grows
//! past the configured size.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`key`] | Row/column/timestamp keys, ordering, tombstone marker |
//! | [`schema`] | Table/family/region descriptors and the on-disk layout |
//! | [`wal`] | CRC-protected write-ahead log with flush markers and replay |
//! | [`memcache`] | The in-memory buffer and its flush snapshot |
//! | [`storefile`] | Immutable sorted files, info sidecars, references, blooms |
//! | [`scanner`] | Column matchers and the row-filter contract |
//! | [`store`] | Per-family store: reads, flush, compaction, scanning |
//! | [`region`] | The region coordinator: locks, batches, split/merge/close |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strata::region::{BatchUpdate, Region, RegionConfig};
//! use strata::schema::{ColumnDescriptor, RegionInfo, TableDescriptor};
//! use strata::key::LATEST_TIMESTAMP;
//!
//! let table = TableDescriptor::new(b"people".to_vec())
//!     .with_family(ColumnDescriptor::new(b"info".to_vec()));
//! let info = RegionInfo::new(table, Vec::new(), Vec::new());
//! let region = Region::create("/tmp/strata".as_ref(), info, RegionConfig::default()).unwrap();
//!
//! let mut batch = BatchUpdate::new(b"row1".to_vec());
//! batch.put(b"info:name".to_vec(), b"ada".to_vec());
//! region.batch_update(LATEST_TIMESTAMP, &batch).unwrap();
//!
//! let values = region
//!     .get(b"row1", b"info:name", LATEST_TIMESTAMP, 1)
//!     .unwrap();
//! assert_eq!(values[0], b"ada".to_vec());
//!
//! region.close(false, None).unwrap();
//! ```

pub mod key;
pub mod memcache;
pub mod region;
pub mod scanner;
pub mod schema;
pub mod store;
pub mod storefile;
pub mod wal;
