//! # Region
//!
//! A region serves one contiguous `[start_key, end_key)` slice of a
//! table: one family store per column family, a shared WAL handle, row
//! locks, and the coordination that lets readers, writers, flushes,
//! compactions, splits and closes interleave safely.
//!
//! ## Locking
//!
//! - **split lock**: held for the entirety of a split or close.
//! - **write state** (mutex + condvar): the `flushing` / `compacting` /
//!   `writes_enabled` flags; holders only check or toggle and wait.
//! - **update lock**: held across WAL append + memcache inserts of one
//!   batch, and across memcache snapshots — which is what makes batch
//!   visibility atomic and keeps visibility order equal to WAL order.
//! - **region read/write lock**: row operations and scanner
//!   construction take read; close takes write and therefore waits for
//!   them all.
//! - **row locks**: per-row exclusion with opaque monotonic tokens; the
//!   reverse map exists so an external lease service can release by
//!   token alone.
//! - **scanner gate**: close waits until the active scanner count
//!   reaches zero.
//!
//! ## Crash consistency
//!
//! Every edit reaches the WAL before any memcache; `flushcache` logs a
//! cache-flush-start, flushes every family at that sequence id, then
//! logs flush-complete. A failure in between is surfaced as
//! [`RegionError::DroppedSnapshot`] — the region is dead to writes
//! until its log share is replayed.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

mod scanner;
pub use scanner::RegionScanner;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Condvar, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::key::{
    ALL_VERSIONS, DELETE_MARKER, HexKey, LATEST_TIMESTAMP, StoreKey, family_of, is_deleted,
};
use crate::scanner::{RowFilter, ScannerError};
use crate::schema::{
    MERGE_DIR_NAME, OLD_LOG_FILE_NAME, RegionInfo, SPLIT_DIR_NAME, region_dir, table_dir,
};
use crate::store::{ScannerGate, Store, StoreError, StoreSize};
use crate::storefile::{Half, Reference, StoreFile, StoreFileError};
use crate::wal::{Wal, WalError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Region`] operations.
#[derive(Debug, Error)]
pub enum RegionError {
    /// The row lies outside this region's `[start_key, end_key)`.
    #[error("Requested row out of range for region {region}: {row}")]
    OutOfRangeRow {
        /// Region name, lossily decoded.
        region: String,
        /// Offending row, hex.
        row: String,
    },

    /// The column's family is not part of this region's table.
    #[error("Requested column family {family} does not exist in region {region}")]
    UnknownFamily {
        /// Family name, lossily decoded.
        family: String,
        /// Region name, lossily decoded.
        region: String,
    },

    /// The operation arrived after close started.
    #[error("Region {0} closed")]
    RegionClosed(String),

    /// A flush began writing but failed before flush-complete; the
    /// region requires WAL replay.
    #[error("Dropped memcache snapshot for region {region}: {reason}")]
    DroppedSnapshot {
        /// Region name, lossily decoded.
        region: String,
        /// The underlying failure.
        reason: String,
    },

    /// Regions cannot be merged as requested.
    #[error("Merge precondition failed: {0}")]
    MergePrecondition(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Family store failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Store file failure.
    #[error("Store file error: {0}")]
    StoreFile(#[from] StoreFileError),

    /// Scanner construction failure.
    #[error("Scanner error: {0}")]
    Scanner(#[from] ScannerError),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tunables of one region.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Aggregate memcache size that triggers a flush request.
    pub memcache_flush_size: usize,

    /// Writers block while the aggregate memcache size is at or above
    /// `memcache_flush_size × blocking_memcache_multiplier`.
    pub blocking_memcache_multiplier: usize,

    /// Store file count at which a store wants compaction.
    pub compaction_threshold: usize,

    /// Largest-file size beyond which the region should split.
    pub desired_max_file_size: u64,

    /// Wake interval for timed waits, so shutdown can propagate.
    pub thread_wake_frequency: Duration,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            memcache_flush_size: 64 * 1024 * 1024,
            blocking_memcache_multiplier: 1,
            compaction_threshold: 3,
            desired_max_file_size: 256 * 1024 * 1024,
            thread_wake_frequency: Duration::from_secs(10),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Listeners
// ------------------------------------------------------------------------------------------------

/// Callback a hosting process registers to schedule asynchronous
/// flushes when a region's memcache crosses the flush threshold.
pub trait FlushListener: Send + Sync {
    /// The named region wants its cache flushed.
    fn flush_requested(&self, region_name: &[u8]);
}

/// Callbacks reporting a region going unavailable during close/split.
pub trait RegionUnavailableListener: Send + Sync {
    /// All locks are held; the close is starting.
    fn closing(&self, region_name: &[u8]);

    /// The region is fully closed.
    fn closed(&self, region_name: &[u8]);
}

// ------------------------------------------------------------------------------------------------
// Batched updates
// ------------------------------------------------------------------------------------------------

/// One operation inside a batched update.
#[derive(Debug, Clone)]
pub enum BatchOperation {
    /// Store a value.
    Put {
        /// Target column (`family:qualifier`).
        column: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },

    /// Delete the cell (at the batch timestamp, or the newest version
    /// when the batch uses [`LATEST_TIMESTAMP`]).
    Delete {
        /// Target column (`family:qualifier`).
        column: Vec<u8>,
    },
}

/// A batch of puts and deletes against a single row, applied
/// atomically with one WAL sequence id.
#[derive(Debug, Clone)]
pub struct BatchUpdate {
    row: Vec<u8>,
    operations: Vec<BatchOperation>,
}

impl BatchUpdate {
    /// Empty batch against `row`.
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            operations: Vec::new(),
        }
    }

    /// Queues a put.
    pub fn put(&mut self, column: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.operations.push(BatchOperation::Put {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    /// Queues a delete.
    pub fn delete(&mut self, column: impl Into<Vec<u8>>) -> &mut Self {
        self.operations.push(BatchOperation::Delete {
            column: column.into(),
        });
        self
    }

    /// The row this batch targets.
    pub fn row(&self) -> &[u8] {
        &self.row
    }
}

// ------------------------------------------------------------------------------------------------
// Row locks
// ------------------------------------------------------------------------------------------------

struct RowLocks {
    rows: HashMap<Vec<u8>, u64>,
    tokens: HashMap<u64, Vec<u8>>,
    next_token: u64,
}

/// Per-row exclusion registry. Tokens are opaque, monotonically drawn
/// identifiers; the reverse map supports release by token alone (lease
/// expiry).
pub struct RowLockRegistry {
    inner: Mutex<RowLocks>,
    released: Condvar,
}

impl RowLockRegistry {
    fn new() -> Self {
        Self {
            inner: Mutex::new(RowLocks {
                rows: HashMap::new(),
                tokens: HashMap::new(),
                next_token: 1,
            }),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RowLocks>, RegionError> {
        self.inner
            .lock()
            .map_err(|_| RegionError::Internal("row lock registry poisoned".into()))
    }

    /// Blocks until the row is free, then locks it and returns the
    /// token.
    fn obtain(&self, row: &[u8]) -> Result<u64, RegionError> {
        let mut guard = self.lock()?;
        while guard.rows.contains_key(row) {
            guard = self
                .released
                .wait(guard)
                .map_err(|_| RegionError::Internal("row lock registry poisoned".into()))?;
        }
        let token = guard.next_token;
        guard.next_token += 1;
        guard.rows.insert(row.to_vec(), token);
        guard.tokens.insert(token, row.to_vec());
        self.released.notify_all();
        Ok(token)
    }

    /// Releases the lock on `row`.
    fn release(&self, row: &[u8]) {
        if let Ok(mut guard) = self.inner.lock() {
            if let Some(token) = guard.rows.remove(row) {
                guard.tokens.remove(&token);
            }
            self.released.notify_all();
        }
    }

    /// Releases by token alone; returns the row that was locked.
    /// Supports an external lease service expiring abandoned locks.
    fn release_token(&self, token: u64) -> Option<Vec<u8>> {
        let mut guard = self.inner.lock().ok()?;
        let row = guard.tokens.remove(&token)?;
        guard.rows.remove(&row);
        self.released.notify_all();
        Some(row)
    }

    /// The row a token holds, if still held.
    fn row_for(&self, token: u64) -> Option<Vec<u8>> {
        self.inner.lock().ok()?.tokens.get(&token).cloned()
    }

    /// Blocks until no row lock is outstanding.
    fn wait_until_empty(&self, wake: Duration) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        while !guard.rows.is_empty() {
            debug!(outstanding = guard.rows.len(), "waiting for row locks");
            match self.released.wait_timeout(guard, wake) {
                Ok((g, _)) => guard = g,
                Err(_) => return,
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Write state
// ------------------------------------------------------------------------------------------------

/// Flags coordinating flushes, compactions and closes.
struct WriteState {
    /// Set while a memcache flush is happening.
    flushing: bool,
    /// Set while a compaction is running.
    compacting: bool,
    /// Cleared in close; once cleared, no further flush or compaction.
    writes_enabled: bool,
}

// ------------------------------------------------------------------------------------------------
// Region Core
// ------------------------------------------------------------------------------------------------

/// A region: one store per column family over a row-key slice of a
/// table.
pub struct Region {
    info: Arc<RegionInfo>,

    /// Table directory.
    basedir: PathBuf,

    region_dir: PathBuf,

    /// `{table}/compaction.dir/{encoded-region}`.
    region_compaction_dir: PathBuf,

    wal: Arc<Wal>,

    stores: BTreeMap<Vec<u8>, Store>,

    row_locks: RowLockRegistry,

    write_state: Mutex<WriteState>,
    write_state_changed: Condvar,

    /// Held across WAL append + memcache inserts, and across snapshots.
    update_lock: Mutex<()>,

    /// Row ops and scanner construction read; close writes.
    lock: RwLock<()>,

    /// Held for the entirety of a split or close.
    split_close_lock: Mutex<()>,

    scanner_gate: Arc<ScannerGate>,

    /// Aggregate size of all family memcaches.
    memcache_size: AtomicU64,

    /// Writers park here when the memcache saturates; flushes notify.
    memory_gate: Mutex<()>,
    memory_available: Condvar,

    closed: AtomicBool,

    config: RegionConfig,

    flush_listener: Option<Arc<dyn FlushListener>>,

    /// Updates must carry sequence ids above this.
    min_sequence_id: u64,
}

impl Region {
    /// Opens a region under a table directory with a shared WAL handle.
    ///
    /// `initial_files`, when present, is a prefab region directory (a
    /// split or merge scratch) renamed into place first. A leftover
    /// `oldlogfile.log` is replayed into the stores and deleted;
    /// leftover split/merge scratch directories are removed.
    pub fn open(
        basedir: &Path,
        wal: Arc<Wal>,
        info: RegionInfo,
        config: RegionConfig,
        initial_files: Option<&Path>,
        flush_listener: Option<Arc<dyn FlushListener>>,
    ) -> Result<Self, RegionError> {
        let info = Arc::new(info);
        let regiondir = region_dir(basedir, info.encoded_name());

        // Pick up prefab store files from a split or merge.
        if let Some(initial) = initial_files {
            if initial.exists() && !regiondir.exists() {
                fs::rename(initial, &regiondir)?;
            }
        }
        fs::create_dir_all(&regiondir)?;

        let old_log = regiondir.join(OLD_LOG_FILE_NAME);
        let reconstruction = old_log.exists().then_some(old_log.as_path());

        let mut stores = BTreeMap::new();
        let mut min_sequence_id = 0u64;
        for family in info.table.families.values() {
            let store = Store::open(
                basedir,
                Arc::clone(&info),
                family.clone(),
                reconstruction,
                &config,
            )?;
            min_sequence_id = min_sequence_id.max(store.max_sequence_id());
            stores.insert(family.name.clone(), store);
        }

        if old_log.exists() {
            debug!(path = %old_log.display(), "deleting replayed log file");
            fs::remove_file(&old_log)?;
        }

        debug!(
            region = %String::from_utf8_lossy(info.region_name()),
            min_sequence_id,
            "next sequence id floor for region"
        );
        wal.advance_sequence(min_sequence_id);

        // Get rid of any splits or merges that were lost in-progress.
        for scratch in [SPLIT_DIR_NAME, MERGE_DIR_NAME] {
            let dir = regiondir.join(scratch);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }

        let region_compaction_dir =
            crate::schema::compaction_dir(basedir).join(info.encoded_name());

        let region = Self {
            basedir: basedir.to_path_buf(),
            region_dir: regiondir,
            region_compaction_dir,
            wal,
            stores,
            row_locks: RowLockRegistry::new(),
            write_state: Mutex::new(WriteState {
                flushing: false,
                compacting: false,
                writes_enabled: true,
            }),
            write_state_changed: Condvar::new(),
            update_lock: Mutex::new(()),
            lock: RwLock::new(()),
            split_close_lock: Mutex::new(()),
            scanner_gate: Arc::new(ScannerGate::new()),
            memcache_size: AtomicU64::new(0),
            memory_gate: Mutex::new(()),
            memory_available: Condvar::new(),
            closed: AtomicBool::new(false),
            config,
            flush_listener,
            min_sequence_id,
            info,
        };

        info!(
            region = %String::from_utf8_lossy(region.info.region_name()),
            "region available"
        );
        Ok(region)
    }

    /// Creates a brand-new region under `root`, making its directories
    /// and a region-owned WAL.
    pub fn create(
        root: &Path,
        info: RegionInfo,
        config: RegionConfig,
    ) -> Result<Self, RegionError> {
        let tabledir = table_dir(root, &info.table.name);
        let regiondir = region_dir(&tabledir, info.encoded_name());
        fs::create_dir_all(&regiondir)?;

        let log_dir = regiondir.join("log");
        fs::create_dir_all(&log_dir)?;
        let wal = Arc::new(Wal::open(log_dir.join("wal.log"), None)?);

        Self::open(&tabledir, wal, info, config, None, None)
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    /// Region descriptor.
    pub fn info(&self) -> &RegionInfo {
        &self.info
    }

    /// Inclusive start row (empty = unbounded).
    pub fn start_key(&self) -> &[u8] {
        &self.info.start_key
    }

    /// Exclusive end row (empty = unbounded).
    pub fn end_key(&self) -> &[u8] {
        &self.info.end_key
    }

    /// The shared WAL handle.
    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    /// Updates must carry sequence ids at or above this.
    pub fn min_sequence_id(&self) -> u64 {
        self.min_sequence_id
    }

    /// True once close has completed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn region_name_lossy(&self) -> String {
        String::from_utf8_lossy(self.info.region_name()).into_owned()
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, ()>, RegionError> {
        self.lock
            .read()
            .map_err(|_| RegionError::Internal("region lock poisoned".into()))
    }

    fn check_row(&self, row: &[u8]) -> Result<(), RegionError> {
        if !self.info.contains_row(row) {
            return Err(RegionError::OutOfRangeRow {
                region: self.region_name_lossy(),
                row: format!("{}", HexKey(row)),
            });
        }
        Ok(())
    }

    fn check_column(&self, column: &[u8]) -> Result<(), RegionError> {
        let family = family_of(column);
        if !self.info.table.has_family(family) {
            return Err(RegionError::UnknownFamily {
                family: String::from_utf8_lossy(family).into_owned(),
                region: self.region_name_lossy(),
            });
        }
        Ok(())
    }

    fn check_open(&self) -> Result<(), RegionError> {
        if self.is_closed() {
            return Err(RegionError::RegionClosed(self.region_name_lossy()));
        }
        Ok(())
    }

    fn store_for_column(&self, column: &[u8]) -> Result<&Store, RegionError> {
        self.stores
            .get(family_of(column))
            .ok_or_else(|| RegionError::UnknownFamily {
                family: String::from_utf8_lossy(family_of(column)).into_owned(),
                region: self.region_name_lossy(),
            })
    }

    // --------------------------------------------------------------------------------------------
    // Row locks
    // --------------------------------------------------------------------------------------------

    /// Obtains the per-row lock, blocking until free. Returns the
    /// opaque token.
    pub fn obtain_row_lock(&self, row: &[u8]) -> Result<u64, RegionError> {
        self.check_row(row)?;
        let _guard = self.read_lock()?;
        self.check_open()?;
        self.row_locks.obtain(row)
    }

    /// Releases the lock on `row`.
    pub fn release_row_lock(&self, row: &[u8]) {
        self.row_locks.release(row);
    }

    /// Releases a lock by token (lease expiry path); returns the row it
    /// held.
    pub fn release_row_lock_token(&self, token: u64) -> Option<Vec<u8>> {
        self.row_locks.release_token(token)
    }

    /// The row a token holds, if any.
    pub fn row_for_lock(&self, token: u64) -> Option<Vec<u8>> {
        self.row_locks.row_for(token)
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Up to `versions` values of (row, column) visible at `timestamp`,
    /// newest first.
    pub fn get(
        &self,
        row: &[u8],
        column: &[u8],
        timestamp: u64,
        versions: usize,
    ) -> Result<Vec<Vec<u8>>, RegionError> {
        self.check_open()?;
        self.check_row(row)?;
        self.check_column(column)?;

        let key = StoreKey::new(row.to_vec(), column.to_vec(), timestamp);
        Ok(self.store_for_column(column)?.get(&key, versions)?)
    }

    /// Every column of the row visible at `timestamp`, newest value per
    /// column, across all families. Row-locked for a consistent view.
    pub fn get_full(
        &self,
        row: &[u8],
        timestamp: u64,
    ) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, RegionError> {
        self.obtain_row_lock(row)?;
        let result = (|| {
            let key = StoreKey::for_row_at(row.to_vec(), timestamp);
            let mut results = BTreeMap::new();
            for store in self.stores.values() {
                store.get_full(&key, &mut results)?;
            }
            Ok(results)
        })();
        self.release_row_lock(row);
        result
    }

    /// The row at or immediately before `row`, with all its columns.
    pub fn get_closest_row_before(
        &self,
        row: &[u8],
    ) -> Result<Option<(Vec<u8>, BTreeMap<Vec<u8>, Vec<u8>>)>, RegionError> {
        self.check_row(row)?;
        let _guard = self.read_lock()?;

        // The data may be sparse: the closest key can differ per
        // family, so take the largest across all of them.
        let mut best: Option<Vec<u8>> = None;
        for store in self.stores.values() {
            let closest = store.row_key_at_or_before(row)?;
            let Some(closest) = closest else { continue };
            if closest == row {
                best = Some(closest);
                break;
            }
            if best.as_deref().is_none_or(|b| closest.as_slice() > b) {
                best = Some(closest);
            }
        }

        let Some(found) = best else {
            return Ok(None);
        };

        let key = StoreKey::for_row(found.clone());
        let mut results = BTreeMap::new();
        for store in self.stores.values() {
            store.get_full(&key, &mut results)?;
        }
        Ok(Some((found, results)))
    }

    /// Up to `versions` keys matching the origin within its family.
    fn get_keys(&self, origin: &StoreKey, versions: usize) -> Result<Vec<StoreKey>, RegionError> {
        Ok(self.store_for_column(&origin.column)?.get_keys(origin, versions)?)
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Applies a batch of puts and deletes to one row: waits for
    /// memcache headroom, takes the row lock, logs the edits as one WAL
    /// record, inserts them into the family memcaches, and finally
    /// resolves any delete-at-latest operations against the newest
    /// existing versions.
    pub fn batch_update(&self, timestamp: u64, batch: &BatchUpdate) -> Result<(), RegionError> {
        // Rough headroom check; between it and the row lock resources
        // may run out again, which we accept.
        self.check_resources();

        let row = batch.row().to_vec();
        self.obtain_row_lock(&row)?;

        let commit_time = if timestamp == LATEST_TIMESTAMP {
            now_millis()
        } else {
            timestamp
        };

        let result = (|| {
            let mut edits: BTreeMap<StoreKey, Vec<u8>> = BTreeMap::new();
            let mut latest_deletes: Vec<Vec<u8>> = Vec::new();

            for operation in &batch.operations {
                match operation {
                    BatchOperation::Put { column, value } => {
                        self.check_column(column)?;
                        if is_deleted(value) {
                            return Err(RegionError::Internal(
                                "cannot insert the delete marker as a value".into(),
                            ));
                        }
                        edits.insert(
                            StoreKey::new(row.clone(), column.clone(), commit_time),
                            value.clone(),
                        );
                    }
                    BatchOperation::Delete { column } => {
                        self.check_column(column)?;
                        if timestamp == LATEST_TIMESTAMP {
                            // Resolved after the batch lands: the
                            // newest version gets a same-timestamp
                            // tombstone.
                            latest_deletes.push(column.clone());
                        } else {
                            edits.insert(
                                StoreKey::new(row.clone(), column.clone(), commit_time),
                                DELETE_MARKER.to_vec(),
                            );
                        }
                    }
                }
            }

            self.update(&edits)?;

            for column in latest_deletes {
                self.delete_multiple(&row, &column, LATEST_TIMESTAMP, 1)?;
            }
            Ok(())
        })();

        self.release_row_lock(&row);
        result
    }

    /// Deletes versions of (row, column) at or below `timestamp` — all
    /// of them, or every cell of the row across families when no column
    /// is given.
    pub fn delete_all(
        &self,
        row: &[u8],
        column: Option<&[u8]>,
        timestamp: u64,
    ) -> Result<(), RegionError> {
        if let Some(column) = column {
            self.check_column(column)?;
        }
        self.obtain_row_lock(row)?;
        let result = (|| {
            match column {
                Some(column) => self.delete_multiple(row, column, timestamp, ALL_VERSIONS)?,
                None => {
                    for store in self.stores.values() {
                        let keys = store
                            .get_keys(&StoreKey::for_row_at(row.to_vec(), timestamp), ALL_VERSIONS)?;
                        let edits: BTreeMap<StoreKey, Vec<u8>> = keys
                            .into_iter()
                            .map(|key| (key, DELETE_MARKER.to_vec()))
                            .collect();
                        self.update(&edits)?;
                    }
                }
            }
            Ok(())
        })();
        self.release_row_lock(row);
        result
    }

    /// Deletes every cell of the row within one family at or below
    /// `timestamp`.
    pub fn delete_family(
        &self,
        row: &[u8],
        family: &[u8],
        timestamp: u64,
    ) -> Result<(), RegionError> {
        self.obtain_row_lock(row)?;
        let result = (|| {
            let store = self
                .stores
                .get(family_of(family))
                .ok_or_else(|| RegionError::UnknownFamily {
                    family: String::from_utf8_lossy(family_of(family)).into_owned(),
                    region: self.region_name_lossy(),
                })?;
            // Row-scoped listing within the family store, then
            // tombstones for everything found.
            let keys = store.get_keys(
                &StoreKey::for_row_at(row.to_vec(), timestamp),
                ALL_VERSIONS,
            )?;
            let edits: BTreeMap<StoreKey, Vec<u8>> = keys
                .into_iter()
                .map(|key| (key, DELETE_MARKER.to_vec()))
                .collect();
            self.update(&edits)
        })();
        self.release_row_lock(row);
        result
    }

    /// Tombstones up to `versions` existing versions of (row, column)
    /// at or below `timestamp`, each at its own timestamp.
    fn delete_multiple(
        &self,
        row: &[u8],
        column: &[u8],
        timestamp: u64,
        versions: usize,
    ) -> Result<(), RegionError> {
        let origin = StoreKey::new(row.to_vec(), column.to_vec(), timestamp);
        let keys = self.get_keys(&origin, versions)?;
        if keys.is_empty() {
            return Ok(());
        }
        let edits: BTreeMap<StoreKey, Vec<u8>> = keys
            .into_iter()
            .map(|key| (key, DELETE_MARKER.to_vec()))
            .collect();
        self.update(&edits)
    }

    /// Appends the edits to the WAL as one record and makes them
    /// visible in the family memcaches — a single critical section, so
    /// visibility order equals WAL order. Asks for a flush when the
    /// aggregate memcache size crosses the threshold.
    fn update(&self, edits: &BTreeMap<StoreKey, Vec<u8>>) -> Result<(), RegionError> {
        if edits.is_empty() {
            return Ok(());
        }

        let _update_guard = self
            .update_lock
            .lock()
            .map_err(|_| RegionError::Internal("update lock poisoned".into()))?;

        self.wal
            .append_edits(self.info.region_name(), &self.info.table.name, edits)?;

        let mut size = 0u64;
        for (key, value) in edits {
            let delta = (key.row.len() + key.column.len() + 8 + value.len()) as u64;
            size = self.memcache_size.fetch_add(delta, Ordering::SeqCst) + delta;
            self.store_for_column(&key.column)?
                .add(key.clone(), value.clone())?;
        }

        if size > self.config.memcache_flush_size as u64 {
            if let Some(listener) = &self.flush_listener {
                listener.flush_requested(self.info.region_name());
            }
        }
        Ok(())
    }

    /// Blocks while the aggregate memcache size is at or above the
    /// blocking threshold; flush completion wakes us.
    fn check_resources(&self) {
        let blocking =
            (self.config.memcache_flush_size * self.config.blocking_memcache_multiplier) as u64;
        let Ok(mut guard) = self.memory_gate.lock() else {
            return;
        };
        let mut blocked = false;
        while self.memcache_size.load(Ordering::SeqCst) >= blocking {
            if !blocked {
                info!(
                    region = %self.region_name_lossy(),
                    size = self.memcache_size.load(Ordering::SeqCst),
                    blocking,
                    "blocking updates on memcache pressure"
                );
                blocked = true;
            }
            match self
                .memory_available
                .wait_timeout(guard, self.config.thread_wake_frequency)
            {
                Ok((g, _)) => guard = g,
                Err(_) => return,
            }
        }
        if blocked {
            info!(region = %self.region_name_lossy(), "unblocking updates");
        }
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Flushes every family's memcache to new store files.
    ///
    /// Returns false when there was nothing to flush, the region is
    /// closed, a flush is already running, or writes are disabled.
    /// A failure between the cache-flush marker and flush-complete
    /// surfaces as [`RegionError::DroppedSnapshot`].
    pub fn flushcache(&self) -> Result<bool, RegionError> {
        if self.is_closed() {
            return Ok(false);
        }
        {
            let mut state = self.lock_write_state()?;
            if !state.flushing && state.writes_enabled {
                state.flushing = true;
            } else {
                debug!(
                    region = %self.region_name_lossy(),
                    flushing = state.flushing,
                    writes_enabled = state.writes_enabled,
                    "not flushing memcache"
                );
                return Ok(false);
            }
        }

        let result = (|| {
            // Prevent splits and closes for the duration.
            let _guard = self.read_lock()?;
            let sequence_id = {
                // Stop updates while we snapshot the memcaches; the
                // flush marker lands exactly after the last
                // snapshotted edit.
                let _update_guard = self
                    .update_lock
                    .lock()
                    .map_err(|_| RegionError::Internal("update lock poisoned".into()))?;
                self.snapshot_memcaches()?
            };
            self.internal_flushcache(sequence_id)
        })();

        {
            if let Ok(mut state) = self.lock_write_state() {
                state.flushing = false;
                self.write_state_changed.notify_all();
            }
        }
        result
    }

    fn lock_write_state(&self) -> Result<std::sync::MutexGuard<'_, WriteState>, RegionError> {
        self.write_state
            .lock()
            .map_err(|_| RegionError::Internal("write state poisoned".into()))
    }

    /// Snapshot every family memcache and log the cache-flush marker.
    /// Returns `None` when the region holds no unflushed edits.
    ///
    /// Callers must hold the update lock.
    fn snapshot_memcaches(&self) -> Result<Option<u64>, RegionError> {
        if self.memcache_size.load(Ordering::SeqCst) == 0 {
            return Ok(None);
        }

        debug!(
            region = %self.region_name_lossy(),
            size = self.memcache_size.load(Ordering::SeqCst),
            "started memcache flush"
        );

        // Subsequent updates accumulate into a fresh accounting period.
        self.memcache_size.store(0, Ordering::SeqCst);

        for store in self.stores.values() {
            store.snapshot_memcache()?;
        }

        let sequence_id = self
            .wal
            .start_cache_flush(self.info.region_name(), &self.info.table.name)?;
        Ok(Some(sequence_id))
    }

    /// Flushes the snapshots taken at `sequence_id` and logs
    /// flush-complete. Any failure in between is a dropped snapshot.
    fn internal_flushcache(&self, sequence_id: Option<u64>) -> Result<bool, RegionError> {
        let Some(sequence_id) = sequence_id else {
            return Ok(false);
        };

        for store in self.stores.values() {
            if let Err(e) = store.flush_cache(sequence_id) {
                // The snapshot did not reach disk; only a log replay
                // can restore it.
                return Err(RegionError::DroppedSnapshot {
                    region: self.region_name_lossy(),
                    reason: e.to_string(),
                });
            }
        }

        if let Err(e) =
            self.wal
                .complete_cache_flush(self.info.region_name(), &self.info.table.name, sequence_id)
        {
            return Err(RegionError::DroppedSnapshot {
                region: self.region_name_lossy(),
                reason: e.to_string(),
            });
        }

        // Wake writers parked on memcache pressure.
        if let Ok(_guard) = self.memory_gate.lock() {
            self.memory_available.notify_all();
        }

        debug!(
            region = %self.region_name_lossy(),
            sequence_id,
            "finished memcache flush"
        );
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Compacts every family store, cleaning the region's compaction
    /// scratch directory before and after. Returns false when the
    /// region is closed, already compacting, or writes are disabled.
    pub fn compact_stores(&self) -> Result<bool, RegionError> {
        if self.is_closed() {
            return Ok(false);
        }
        {
            let mut state = self.lock_write_state()?;
            if !state.compacting && state.writes_enabled {
                state.compacting = true;
            } else {
                info!(
                    region = %self.region_name_lossy(),
                    compacting = state.compacting,
                    writes_enabled = state.writes_enabled,
                    "not compacting region"
                );
                return Ok(false);
            }
        }

        let result = (|| {
            info!(region = %self.region_name_lossy(), "starting compaction");
            self.cleanup_compaction_dir()?;
            let mut status = true;
            for store in self.stores.values() {
                if !store.compact()? {
                    status = false;
                }
            }
            self.cleanup_compaction_dir()?;
            info!(region = %self.region_name_lossy(), "compaction completed");
            Ok(status)
        })();

        {
            if let Ok(mut state) = self.lock_write_state() {
                state.compacting = false;
                self.write_state_changed.notify_all();
            }
        }
        result
    }

    /// Compacts only when some store asks for it.
    pub fn compact_if_needed(&self) -> Result<bool, RegionError> {
        let needed = self.stores.values().any(|store| {
            let needs = store.needs_compaction();
            if needs {
                debug!(store = %store.name(), "needs compaction");
            }
            needs
        });
        if !needed {
            return Ok(false);
        }
        self.compact_stores()
    }

    fn cleanup_compaction_dir(&self) -> Result<(), RegionError> {
        if self.region_compaction_dir.exists() {
            fs::remove_dir_all(&self.region_compaction_dir)?;
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Split
    // --------------------------------------------------------------------------------------------

    /// Size of the largest family store, with overall splitability.
    fn largest_store(&self) -> Result<Option<StoreSize>, RegionError> {
        let mut splitable = true;
        let mut biggest: Option<StoreSize> = None;
        for store in self.stores.values() {
            let size = store.size()?;
            // A reference anywhere makes the whole region non-splitable.
            if splitable {
                splitable = size.splitable;
            }
            let largest_so_far = match &biggest {
                None => true,
                Some(b) => size.aggregate > b.aggregate,
            };
            if largest_so_far {
                biggest = Some(size);
            }
        }
        if let Some(biggest) = &mut biggest {
            biggest.splitable = splitable;
        }
        Ok(biggest)
    }

    /// When the largest store's aggregate exceeds the configured
    /// maximum and the region is splitable, returns the mid key to
    /// split at.
    pub fn needs_split(&self) -> Result<Option<Vec<u8>>, RegionError> {
        let Some(biggest) = self.largest_store()? else {
            return Ok(None);
        };
        let Some(mid_key) = biggest.mid_key.clone() else {
            return Ok(None);
        };
        if mid_key.as_slice() == self.start_key() && mid_key.as_slice() == self.end_key() {
            return Ok(None);
        }

        if biggest.aggregate < self.config.desired_max_file_size {
            return Ok(None);
        }
        if !biggest.splitable {
            warn!(
                region = %self.region_name_lossy(),
                aggregate = biggest.aggregate,
                desired = self.config.desired_max_file_size,
                "region is NOT splitable though it exceeds the desired size"
            );
            return Ok(None);
        }
        info!(
            region = %self.region_name_lossy(),
            aggregate = biggest.aggregate,
            desired = self.config.desired_max_file_size,
            "region needs split"
        );
        Ok(Some(mid_key))
    }

    /// Splits this region into two children at the mid key, closing it
    /// in the process. Children get cheap reference half-files; the
    /// caller reopens them for service. Returns `None` when no split is
    /// needed.
    pub fn split_region(
        &self,
        listener: Option<&dyn RegionUnavailableListener>,
    ) -> Result<Option<(RegionInfo, RegionInfo)>, RegionError> {
        let _split_guard = self
            .split_lock()
            .lock()
            .map_err(|_| RegionError::Internal("split lock poisoned".into()))?;

        if self.is_closed() {
            return Ok(None);
        }
        let Some(mid_key) = self.needs_split()? else {
            return Ok(None);
        };

        let start_key = self.info.start_key.clone();
        let end_key = self.info.end_key.clone();
        if start_key == mid_key {
            debug!("start key and mid key are the same, not splitting");
            return Ok(None);
        }
        if mid_key == end_key {
            debug!("end key and mid key are the same, not splitting");
            return Ok(None);
        }

        let splits_dir = self.region_dir.join(SPLIT_DIR_NAME);
        fs::create_dir_all(&splits_dir)?;

        let info_a = RegionInfo::new(self.info.table.clone(), start_key, mid_key.clone());
        let dir_a = splits_dir.join(info_a.encoded_name());
        if dir_a.exists() {
            return Err(RegionError::Internal(format!(
                "cannot split; target file collision at {}",
                dir_a.display()
            )));
        }
        let info_b = RegionInfo::new(self.info.table.clone(), mid_key.clone(), end_key);
        let dir_b = splits_dir.join(info_b.encoded_name());
        if dir_b.exists() {
            return Err(RegionError::Internal(format!(
                "cannot split; target file collision at {}",
                dir_b.display()
            )));
        }

        // Close waits on outstanding rows and flushes one final time.
        let files = self.internal_close(false, listener)?.ok_or_else(|| {
            RegionError::Internal("close returned no store files to split".into())
        })?;

        // Each parent file fans into a bottom reference for child A and
        // a top reference for child B.
        for file in &files {
            let parent_sequence = file.load_info()?;

            let reference_a = Reference {
                parent_region: self.info.encoded_name().to_string(),
                file_id: file.id(),
                split_key: mid_key.clone(),
                half: Half::Bottom,
            };
            StoreFile::new_unique(
                &splits_dir,
                info_a.encoded_name(),
                file.family(),
                Some(reference_a),
            )?
            .write_reference(parent_sequence)?;

            let reference_b = Reference {
                parent_region: self.info.encoded_name().to_string(),
                file_id: file.id(),
                split_key: mid_key.clone(),
                half: Half::Top,
            };
            StoreFile::new_unique(
                &splits_dir,
                info_b.encoded_name(),
                file.family(),
                Some(reference_b),
            )?
            .write_reference(parent_sequence)?;
        }

        // Open the children briefly to move the split files into place
        // and sanity-check them, then close so the caller can reopen.
        let region_a = Region::open(
            &self.basedir,
            Arc::clone(&self.wal),
            info_a.clone(),
            self.config.clone(),
            Some(&dir_a),
            None,
        )?;
        region_a.close(false, None)?;
        let region_b = Region::open(
            &self.basedir,
            Arc::clone(&self.wal),
            info_b.clone(),
            self.config.clone(),
            Some(&dir_b),
            None,
        )?;
        region_b.close(false, None)?;

        fs::remove_dir_all(&splits_dir)?;

        info!(
            region = %self.region_name_lossy(),
            child_a = %String::from_utf8_lossy(info_a.region_name()),
            child_b = %String::from_utf8_lossy(info_b.region_name()),
            "region split complete"
        );
        Ok(Some((info_a, info_b)))
    }

    fn split_lock(&self) -> &Mutex<()> {
        // The split lock doubles as the close lock; kept in a helper so
        // both paths name the same object.
        &self.split_close_lock
    }

    // --------------------------------------------------------------------------------------------
    // Close
    // --------------------------------------------------------------------------------------------

    /// Closes the region: disables flushes and compactions, waits for
    /// in-flight ones, blocks new scanners and row locks, drains both,
    /// flushes once more (unless aborting) and closes every store.
    ///
    /// Returns the stores' files for reuse by split or merge, or `None`
    /// when already closed.
    pub fn close(
        &self,
        abort: bool,
        listener: Option<&dyn RegionUnavailableListener>,
    ) -> Result<Option<Vec<StoreFile>>, RegionError> {
        let _split_guard = self
            .split_lock()
            .lock()
            .map_err(|_| RegionError::Internal("split lock poisoned".into()))?;
        self.internal_close(abort, listener)
    }

    fn internal_close(
        &self,
        abort: bool,
        listener: Option<&dyn RegionUnavailableListener>,
    ) -> Result<Option<Vec<StoreFile>>, RegionError> {
        if self.is_closed() {
            warn!(region = %self.region_name_lossy(), "already closed");
            return Ok(None);
        }

        {
            let mut state = self.lock_write_state()?;
            state.writes_enabled = false;
            debug!(
                region = %self.region_name_lossy(),
                "compactions and cache flushes disabled"
            );
            while state.compacting || state.flushing {
                debug!(
                    compacting = state.compacting,
                    flushing = state.flushing,
                    "waiting for flush/compaction to complete"
                );
                match self
                    .write_state_changed
                    .wait_timeout(state, self.config.thread_wake_frequency)
                {
                    Ok((guard, _)) => state = guard,
                    Err(_) => return Err(RegionError::Internal("write state poisoned".into())),
                }
            }
        }

        let _write_guard = self
            .lock
            .write()
            .map_err(|_| RegionError::Internal("region lock poisoned".into()))?;
        debug!(
            region = %self.region_name_lossy(),
            "new updates and scanners disabled"
        );

        // Wait for active scanners; the write lock prevents new ones.
        self.scanner_gate
            .wait_for_zero(self.config.thread_wake_frequency);
        debug!(region = %self.region_name_lossy(), "no more active scanners");

        // No more row locks can be handed out; wait on the outstanding
        // ones so we do not drop updates in flight.
        self.row_locks
            .wait_until_empty(self.config.thread_wake_frequency);
        debug!(region = %self.region_name_lossy(), "no more row locks outstanding");

        if let Some(listener) = listener {
            listener.closing(self.info.region_name());
        }

        if !abort {
            let sequence_id = {
                let _update_guard = self
                    .update_lock
                    .lock()
                    .map_err(|_| RegionError::Internal("update lock poisoned".into()))?;
                self.snapshot_memcaches()?
            };
            self.internal_flushcache(sequence_id)?;
        }

        let mut files = Vec::new();
        for store in self.stores.values() {
            files.extend(store.close()?);
        }
        self.closed.store(true, Ordering::SeqCst);

        if let Some(listener) = listener {
            listener.closed(self.info.region_name());
        }

        info!(region = %self.region_name_lossy(), "closed");
        Ok(Some(files))
    }

    // --------------------------------------------------------------------------------------------
    // Scanners
    // --------------------------------------------------------------------------------------------

    /// Builds a region scanner over the families covering `columns`,
    /// starting at `first_row`, bounded by `timestamp`, with an
    /// optional row filter.
    pub fn get_scanner(
        &self,
        columns: &[Vec<u8>],
        first_row: &[u8],
        timestamp: u64,
        filter: Option<Box<dyn RowFilter>>,
    ) -> Result<RegionScanner, RegionError> {
        let _guard = self.read_lock()?;
        self.check_open()?;

        let families: BTreeSet<Vec<u8>> =
            columns.iter().map(|c| family_of(c).to_vec()).collect();

        let mut store_scanners = Vec::new();
        for family in families {
            let Some(store) = self.stores.get(&family) else {
                continue;
            };
            store_scanners.push(store.get_scanner(timestamp, columns, first_row)?);
        }

        RegionScanner::new(store_scanners, filter, Arc::clone(&self.scanner_gate))
    }

    // --------------------------------------------------------------------------------------------
    // Merge
    // --------------------------------------------------------------------------------------------

    /// Merges two **adjacent** regions of the same table into one.
    pub fn merge_adjacent(src_a: Region, src_b: Region) -> Result<Region, RegionError> {
        let (a, b) = if src_a.start_key().is_empty() {
            if src_b.start_key().is_empty() {
                return Err(RegionError::MergePrecondition(
                    "cannot merge two regions with null start key".into(),
                ));
            }
            (src_a, src_b)
        } else if src_b.start_key().is_empty() || src_a.start_key() > src_b.start_key() {
            (src_b, src_a)
        } else {
            (src_a, src_b)
        };

        if a.end_key() != b.start_key() {
            return Err(RegionError::MergePrecondition(
                "cannot merge non-adjacent regions".into(),
            ));
        }
        Self::merge(a, b)
    }

    /// Merges two regions of the same table, adjacent or not: flushes
    /// and compacts both, closes them, moves their files under a new
    /// region covering the union of the key ranges, opens it and
    /// compacts once. Source directories are deleted only after the new
    /// region is open.
    pub fn merge(a: Region, b: Region) -> Result<Region, RegionError> {
        if a.info.table.name != b.info.table.name {
            return Err(RegionError::MergePrecondition(
                "regions do not belong to the same table".into(),
            ));
        }

        a.flushcache()?;
        b.flushcache()?;
        a.compact_stores()?;
        b.compact_stores()?;

        let table = a.info.table.clone();
        let basedir = a.basedir.clone();
        let wal = Arc::clone(&a.wal);
        let config = a.config.clone();

        let start_key = if a.start_key().is_empty() || b.start_key().is_empty() {
            Vec::new()
        } else {
            a.start_key().min(b.start_key()).to_vec()
        };
        let end_key = if a.end_key().is_empty() || b.end_key().is_empty() {
            Vec::new()
        } else {
            a.end_key().max(b.end_key()).to_vec()
        };

        let merged_info = RegionInfo::new(table, start_key, end_key);
        info!(
            region = %String::from_utf8_lossy(merged_info.region_name()),
            "creating merged region"
        );
        let merged_dir = region_dir(&basedir, merged_info.encoded_name());
        if merged_dir.exists() {
            return Err(RegionError::MergePrecondition(format!(
                "cannot merge; target file collision at {}",
                merged_dir.display()
            )));
        }
        fs::create_dir_all(&merged_dir)?;

        let dir_a = a.region_dir.clone();
        let dir_b = b.region_dir.clone();

        // Collect both regions' files grouped by family.
        let mut by_family: BTreeMap<Vec<u8>, Vec<StoreFile>> = BTreeMap::new();
        for region in [&a, &b] {
            let files = region
                .close(false, None)?
                .ok_or_else(|| RegionError::MergePrecondition("source region already closed".into()))?;
            for file in files {
                by_family.entry(file.family().to_vec()).or_default().push(file);
            }
        }

        for (family, files) in &by_family {
            // Compaction left at most one file per source; two halves
            // sharing a sequence id would collide, so nudge one down.
            if files.len() == 2 {
                let seq_a = files[0].load_info()?;
                let seq_b = files[1].load_info()?;
                if seq_a == seq_b {
                    debug!("adjusting sequence id of merged store file");
                    files[1].write_info(seq_b - 1)?;
                }
            }
            for file in files {
                let dst = StoreFile::new_unique(
                    &basedir,
                    merged_info.encoded_name(),
                    family,
                    None,
                )?;
                file.rename_to(&dst)?;
            }
        }

        let merged = Region::open(&basedir, wal, merged_info, config, None, None)?;
        merged.compact_stores()?;

        // Only now is it safe to drop the sources.
        fs::remove_dir_all(&dir_a)?;
        fs::remove_dir_all(&dir_b)?;

        info!(
            region = %merged.region_name_lossy(),
            "merge completed"
        );
        Ok(merged)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
