//! # Family store
//!
//! One store serves a single column family of a region: the memcache,
//! the ordered set of store files, and everything that moves data
//! between them.
//!
//! ## Design Invariants
//!
//! - Store files are keyed by the max WAL sequence id they cover; the
//!   newest file has the largest key. Every edit in a file has a
//!   sequence id at or below the file's recorded maximum.
//! - A flushed file only joins the readers set after its info sidecar
//!   is written, so readers never observe a partially flushed file.
//! - Compaction never drops a file until its replacement is registered.
//! - A store holding any reference half-file is not splitable and is
//!   compacted eagerly, which materialises an independent file and lets
//!   the parent region be retired.
//!
//! ## Locking
//!
//! - `state` (read/write): guards the file/reader maps. Readers and
//!   writers take read; close and compaction-commit take write.
//! - `flush_lock` / `compact_lock`: at most one flush and one
//!   compaction run at a time.
//! - `new_scanner_lock`: compaction-commit takes write to block *new*
//!   scanners while it drains the active ones via the scanner gate;
//!   scanner construction takes read.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

mod scanner;
pub use scanner::{RowResults, StoreScanner};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Condvar, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::key::{ALL_VERSIONS, StoreKey, family_of, is_deleted};
use crate::memcache::{Memcache, MemcacheError};
use crate::region::RegionConfig;
use crate::scanner::{ColumnMatchSet, ScannerError};
use crate::schema::{ColumnDescriptor, RegionInfo, filter_dir, info_dir, map_dir};
use crate::storefile::bloom::StoreFilter;
use crate::storefile::{StoreFile, StoreFileError, StoreFileWriter};
use crate::wal::{LogRecord, Wal, WalError};

const BLOOMFILTER_FILE_NAME: &str = "filter";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Store`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Memcache failure.
    #[error("Memcache error: {0}")]
    Memcache(#[from] MemcacheError),

    /// Store file failure.
    #[error("Store file error: {0}")]
    StoreFile(#[from] StoreFileError),

    /// WAL failure while replaying a reconstruction log.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Scanner construction failure.
    #[error("Scanner error: {0}")]
    Scanner(#[from] ScannerError),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Scanner gate
// ------------------------------------------------------------------------------------------------

/// Counts active scanners and lets maintenance wait for quiescence.
pub(crate) struct ScannerGate {
    count: Mutex<usize>,
    zero: Condvar,
}

impl ScannerGate {
    pub(crate) fn new() -> Self {
        Self {
            count: Mutex::new(0),
            zero: Condvar::new(),
        }
    }

    pub(crate) fn enter(&self) {
        if let Ok(mut count) = self.count.lock() {
            *count += 1;
        }
    }

    pub(crate) fn exit(&self) {
        if let Ok(mut count) = self.count.lock() {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.zero.notify_all();
            }
        }
    }

    /// Blocks until no scanner is active, waking periodically so
    /// shutdown signals can propagate.
    pub(crate) fn wait_for_zero(&self, wake: Duration) {
        let Ok(mut count) = self.count.lock() else {
            return;
        };
        while *count != 0 {
            match self.zero.wait_timeout(count, wake) {
                Ok((guard, _)) => count = guard,
                Err(_) => return,
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Store state and sizing
// ------------------------------------------------------------------------------------------------

/// Files and readers, both keyed by max covered sequence id.
struct StoreFiles {
    files: BTreeMap<u64, StoreFile>,
    readers: BTreeMap<u64, crate::storefile::StoreFileReader>,
}

/// Result of a store size probe, used for split decisions.
#[derive(Debug)]
pub struct StoreSize {
    /// Sum of all file sizes.
    pub aggregate: u64,

    /// Size of the largest file.
    pub largest: u64,

    /// False when any file is a reference, or the largest file cannot
    /// be meaningfully halved.
    pub splitable: bool,

    /// Row that halves the largest file, when splitable.
    pub mid_key: Option<Vec<u8>>,
}

// ------------------------------------------------------------------------------------------------
// Store Core
// ------------------------------------------------------------------------------------------------

/// The store of one column family within a region.
pub struct Store {
    info: Arc<RegionInfo>,
    family: ColumnDescriptor,

    /// Table directory.
    basedir: PathBuf,

    /// Compaction scratch base (`{table}/compaction.dir`).
    compaction_basedir: PathBuf,

    /// Bloom filter file, when the family keeps one.
    filter_path: Option<PathBuf>,

    memcache: Memcache,
    state: RwLock<StoreFiles>,

    compact_lock: Mutex<()>,
    flush_lock: Mutex<()>,
    new_scanner_lock: RwLock<()>,
    scanner_gate: Arc<ScannerGate>,

    bloom: Option<Mutex<StoreFilter>>,

    /// Largest sequence id reflected on disk, plus one (the floor for
    /// new WAL sequence ids).
    max_seq_id: AtomicU64,

    compaction_threshold: usize,
    thread_wake_frequency: Duration,

    /// `{encoded-region}/{family}` — for log lines.
    store_name: String,
}

impl Store {
    /// Opens the store: loads its files (cleaning up orphans from
    /// crashes), loads or creates the bloom filter, replays the
    /// region's reconstruction log if one is present, and opens a
    /// reader per file.
    pub fn open(
        basedir: &Path,
        info: Arc<RegionInfo>,
        family: ColumnDescriptor,
        reconstruction_log: Option<&Path>,
        config: &RegionConfig,
    ) -> Result<Self, StoreError> {
        let encoded = info.encoded_name().to_string();
        let store_name = format!("{}/{}", encoded, String::from_utf8_lossy(&family.name));

        let mapdir = map_dir(basedir, &encoded, &family.name);
        let infodir = info_dir(basedir, &encoded, &family.name);
        fs::create_dir_all(&mapdir)?;
        fs::create_dir_all(&infodir)?;

        let (filter_path, bloom) = match &family.bloom_filter {
            Some(spec) => {
                let dir = filter_dir(basedir, &encoded, &family.name);
                fs::create_dir_all(&dir)?;
                let path = dir.join(BLOOMFILTER_FILE_NAME);
                let filter = StoreFilter::load_or_create(&path, spec)?;
                (Some(path), Some(Mutex::new(filter)))
            }
            None => (None, None),
        };

        debug!(store = %store_name, "starting store");

        let files = Self::load_store_files(basedir, &encoded, &family.name, &infodir, &mapdir)?;

        let mut file_map = BTreeMap::new();
        let mut max_seq_id = 0u64;
        for file in files {
            let seq = file.load_info()?;
            max_seq_id = max_seq_id.max(seq);
            file_map.insert(seq, file);
        }

        let store = Self {
            info,
            family,
            basedir: basedir.to_path_buf(),
            compaction_basedir: crate::schema::compaction_dir(basedir),
            filter_path,
            memcache: Memcache::new(),
            state: RwLock::new(StoreFiles {
                files: file_map,
                readers: BTreeMap::new(),
            }),
            compact_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            new_scanner_lock: RwLock::new(()),
            scanner_gate: Arc::new(ScannerGate::new()),
            bloom,
            max_seq_id: AtomicU64::new(max_seq_id),
            compaction_threshold: config.compaction_threshold,
            thread_wake_frequency: config.thread_wake_frequency,
            store_name,
        };

        if let Some(log_path) = reconstruction_log {
            if log_path.exists() {
                store.replay_reconstruction_log(log_path)?;
            }
        }

        // The floor for new sequence ids sits just above everything on
        // disk.
        store.max_seq_id.fetch_add(1, Ordering::SeqCst);

        // Open readers for every loaded file.
        {
            let mut state = store.write_state()?;
            let files: Vec<(u64, StoreFile)> = state
                .files
                .iter()
                .map(|(seq, file)| (*seq, file.clone()))
                .collect();
            for (seq, file) in files {
                state.readers.insert(seq, file.reader()?);
            }
        }

        Ok(store)
    }

    /// Pairs up data files and info sidecars, deleting whichever half
    /// of an unpaired file survives a crash.
    fn load_store_files(
        basedir: &Path,
        encoded: &str,
        family: &[u8],
        infodir: &Path,
        mapdir: &Path,
    ) -> Result<Vec<StoreFile>, StoreError> {
        let mut results = Vec::new();
        let mut data_files = Vec::new();

        for entry in fs::read_dir(infodir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((id, parent)) = StoreFile::parse_file_name(&name) else {
                warn!(file = %name, "unparseable info file name, skipping");
                continue;
            };

            let data_path = mapdir.join(&name);
            if !data_path.exists() {
                warn!(file = %name, "data file missing, cleaning up info file");
                fs::remove_file(entry.path())?;
                continue;
            }

            let reference = match parent {
                Some(_) => Some(StoreFile::read_reference(&data_path)?),
                None => None,
            };

            results.push(StoreFile::new(basedir, encoded, family, id, reference));
            data_files.push(data_path);
        }

        // A data file without an info sidecar never became visible.
        for entry in fs::read_dir(mapdir)? {
            let entry = entry?;
            if !data_files.contains(&entry.path()) {
                warn!(file = %entry.path().display(), "orphan data file, deleting");
                fs::remove_file(entry.path())?;
            }
        }

        Ok(results)
    }

    /// Replays the region's share of a pre-crash WAL: edits for this
    /// family with sequence ids above both the newest on-disk file and
    /// the last flush-complete record are rebuilt into a cache and
    /// flushed as a fresh store file.
    fn replay_reconstruction_log(&self, log_path: &Path) -> Result<(), StoreError> {
        let max_on_disk = self.max_seq_id.load(Ordering::SeqCst);
        let mut reconstructed: BTreeMap<StoreKey, Vec<u8>> = BTreeMap::new();
        let mut max_seq_in_log = 0u64;
        let mut flush_complete = 0u64;
        let mut applied = 0u64;
        let mut skipped = 0u64;

        let log = Wal::open(log_path, None)?;
        for record in log.replay_iter()? {
            let record = record?;
            if record.region() != self.info.region_name() {
                continue;
            }
            max_seq_in_log = max_seq_in_log.max(record.sequence());

            match record {
                LogRecord::CacheFlushComplete { sequence, .. } => {
                    flush_complete = flush_complete.max(sequence);
                }
                LogRecord::Edits {
                    sequence, edits, ..
                } => {
                    if sequence <= max_on_disk || sequence <= flush_complete {
                        skipped += 1;
                        continue;
                    }
                    for edit in edits {
                        if family_of(&edit.column) != self.family.name.as_slice() {
                            continue;
                        }
                        reconstructed.insert(
                            StoreKey::new(edit.row, edit.column, edit.timestamp),
                            edit.value,
                        );
                        applied += 1;
                    }
                }
                LogRecord::CacheFlushStart { .. } => {}
            }
        }

        debug!(
            store = %self.store_name,
            applied,
            skipped,
            "reconstruction log replayed"
        );

        if !reconstructed.is_empty() {
            // A virtual flush just past the log's newest sequence id.
            self.internal_flush(reconstructed, max_seq_in_log + 1)?;
        }
        Ok(())
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, StoreFiles>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Internal("store lock poisoned".into()))
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, StoreFiles>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Internal("store lock poisoned".into()))
    }

    /// Family schema this store serves.
    pub fn family(&self) -> &ColumnDescriptor {
        &self.family
    }

    /// The floor for new WAL sequence ids: one past the largest
    /// sequence id reflected on disk at open.
    pub fn max_sequence_id(&self) -> u64 {
        self.max_seq_id.load(Ordering::SeqCst)
    }

    /// Adds a value to the memcache.
    pub fn add(&self, key: StoreKey, value: Vec<u8>) -> Result<(), StoreError> {
        let _guard = self.read_state()?;
        self.memcache.add(key, value)?;
        Ok(())
    }

    /// Moves the memcache's live edits into its flush snapshot.
    pub fn snapshot_memcache(&self) -> Result<(), StoreError> {
        self.memcache.snapshot()?;
        Ok(())
    }

    /// Closes all readers and returns the store's files for reuse by a
    /// split or merge. The region holds its write lock, so no further
    /// reads arrive.
    pub fn close(&self) -> Result<Vec<StoreFile>, StoreError> {
        let mut state = self.write_state()?;
        state.readers.clear();
        let files = std::mem::take(&mut state.files);
        debug!(store = %self.store_name, "closed");
        Ok(files.into_values().collect())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Up to `versions` newest values for `key`, newest first: memcache
    /// first, then store files newest-to-oldest, honouring tombstones
    /// across tiers.
    pub fn get(&self, key: &StoreKey, versions: usize) -> Result<Vec<Vec<u8>>, StoreError> {
        if versions == 0 {
            return Err(StoreError::Internal(
                "number of versions must be > 0".into(),
            ));
        }

        let state = self.read_state()?;

        // The newest tombstone met in any tier occludes every value at
        // or below its timestamp in colder tiers.
        let mut newest_tombstone: Option<u64> = None;
        let mut results = self
            .memcache
            .get_versions(key, versions, &mut newest_tombstone)?;
        if results.len() >= versions {
            return Ok(results);
        }

        // The store-wide filter can rule the row out of every file.
        if let Some(bloom) = &self.bloom {
            let filter = bloom
                .lock()
                .map_err(|_| StoreError::Internal("bloom lock poisoned".into()))?;
            if !filter.maybe_contains(&key.row) {
                return Ok(results);
            }
        }

        for reader in state.readers.values().rev() {
            let mut reader = reader.clone();
            let Some((mut read_key, mut read_val)) = reader.get_closest(key, false)? else {
                continue;
            };
            if !read_key.matches_row_col(key) {
                continue;
            }
            loop {
                if self.memcache.is_deleted(&read_key)? || is_deleted(&read_val) {
                    if newest_tombstone.is_none_or(|ts| ts < read_key.timestamp) {
                        newest_tombstone = Some(read_key.timestamp);
                    }
                } else if !newest_tombstone.is_some_and(|ts| read_key.timestamp <= ts) {
                    results.push(read_val);
                    if results.len() >= versions {
                        break;
                    }
                }
                match reader.next()? {
                    Some((k, v)) if k.matches_row_col(key) => {
                        read_key = k;
                        read_val = v;
                    }
                    _ => break,
                }
            }
            if results.len() >= versions {
                break;
            }
        }

        Ok(results)
    }

    /// For every column of `key.row` visible at `key.timestamp`,
    /// records the newest live value into `results`: memcache first,
    /// then files newest-to-oldest, with per-column tombstone
    /// occlusion.
    pub fn get_full(
        &self,
        key: &StoreKey,
        results: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Result<(), StoreError> {
        let mut deletes: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

        let state = self.read_state()?;
        self.memcache.get_full(key, &mut deletes, results)?;

        for reader in state.readers.values().rev() {
            let mut reader = reader.clone();
            let Some((mut read_key, mut read_val)) = reader.get_closest(key, false)? else {
                continue;
            };
            loop {
                let read_col = read_key.column.clone();
                if !results.contains_key(&read_col) && key.matches_without_column(&read_key) {
                    if is_deleted(&read_val) {
                        let newest = deletes.entry(read_col).or_insert(0);
                        if *newest < read_key.timestamp {
                            *newest = read_key.timestamp;
                        }
                    } else if deletes
                        .get(&read_col)
                        .is_none_or(|ts| *ts < read_key.timestamp)
                    {
                        results.insert(read_col, read_val.clone());
                    }
                } else if key.row < read_key.row {
                    break;
                }

                match reader.next()? {
                    Some((k, v)) => {
                        read_key = k;
                        read_val = v;
                    }
                    None => break,
                }
            }
        }

        Ok(())
    }

    /// Up to `versions` keys matching `origin` — same row, and same
    /// column when `origin.column` is non-empty — newest first across
    /// memcache and files.
    pub fn get_keys(&self, origin: &StoreKey, versions: usize) -> Result<Vec<StoreKey>, StoreError> {
        let mut keys = self.memcache.get_keys(origin, versions)?;
        if versions != ALL_VERSIONS && keys.len() >= versions {
            return Ok(keys);
        }

        let state = self.read_state()?;
        for reader in state.readers.values().rev() {
            let mut reader = reader.clone();
            let Some((mut read_key, mut read_val)) = reader.get_closest(origin, false)? else {
                continue;
            };
            loop {
                if !Self::row_matches(origin, &read_key) {
                    break;
                }
                if Self::cell_matches(origin, &read_key)
                    && !is_deleted(&read_val)
                    && !keys.contains(&read_key)
                {
                    keys.push(read_key.clone());
                    if versions != ALL_VERSIONS && keys.len() >= versions {
                        return Ok(keys);
                    }
                }
                match reader.next()? {
                    Some((k, v)) => {
                        read_key = k;
                        read_val = v;
                    }
                    None => break,
                }
            }
        }

        Ok(keys)
    }

    /// Row and timestamp match when the origin has no column, full
    /// row/column match otherwise.
    fn cell_matches(origin: &StoreKey, target: &StoreKey) -> bool {
        if origin.column.is_empty() {
            origin.row == target.row && target.timestamp <= origin.timestamp
        } else {
            target.matches_row_col(origin)
        }
    }

    /// Row match when the origin has no column, full row/column match
    /// otherwise.
    fn row_matches(origin: &StoreKey, target: &StoreKey) -> bool {
        if origin.column.is_empty() {
            origin.row == target.row
        } else {
            target.matches_row_col(origin)
        }
    }

    /// The largest row at or before `row` across every tier, honouring
    /// tombstones. Files are consulted oldest to newest, the memcache
    /// last, each folding its candidates into a shared map.
    pub fn row_key_at_or_before(&self, row: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let mut candidates: BTreeMap<StoreKey, u64> = BTreeMap::new();

        let state = self.read_state()?;
        for reader in state.readers.values() {
            let mut reader = reader.clone();
            Self::row_at_or_before_from_file(&mut reader, row, &mut candidates)?;
        }
        self.memcache.row_key_at_or_before(row, &mut candidates)?;

        Ok(candidates.keys().next_back().map(|key| key.row.clone()))
    }

    fn row_at_or_before_from_file(
        reader: &mut crate::storefile::StoreFileReader,
        row: &[u8],
        candidates: &mut BTreeMap<StoreKey, u64>,
    ) -> Result<(), StoreError> {
        reader.reset();
        if reader.is_empty() {
            return Ok(());
        }

        let search_key = match candidates.keys().next() {
            // Start from the earliest candidate so tombstones between
            // it and the target are seen.
            Some(first) => StoreKey::for_row(first.row.clone()),
            None => StoreKey::for_row(row.to_vec()),
        };

        // Tail: the first cell at or past the search point. The search
        // key sorts before every real cell of its row, so a target row
        // sitting at the very start of the file is still found.
        let tail_first = match reader.get_closest(&search_key, false)? {
            Some((key, value)) if key.row.as_slice() <= row => Some((key, value)),
            _ => None,
        };

        if let Some((mut found_key, mut found_val)) = tail_first {
            // Walk keys up to and including the target row, applying
            // tombstones against the candidate set.
            loop {
                if found_key.row.as_slice() > row {
                    return Ok(());
                }
                Self::fold_candidate(candidates, &found_key, &found_val);
                match reader.next()? {
                    Some((k, v)) => {
                        found_key = k;
                        found_val = v;
                    }
                    None => return Ok(()),
                }
            }
        }

        // The tail held nothing at or before the target; look at the
        // cells preceding the search point.
        let Some((last_key, _)) = reader.get_closest(&search_key, true)? else {
            return Ok(());
        };

        if candidates.is_empty() {
            // Scan trailing rows backwards until one yields a live
            // candidate. Within a row, oldest version first, so a
            // newer tombstone strikes the values it covers.
            let mut this_row = last_key.row.clone();
            loop {
                Self::fold_row_cells(reader, &this_row, true, candidates)?;
                if !candidates.is_empty() {
                    return Ok(());
                }
                // Previous row, if any.
                let row_start = StoreKey::for_row(this_row);
                match reader.get_closest(&row_start, true)? {
                    Some((key, _)) => this_row = key.row,
                    None => return Ok(()),
                }
            }
        }

        // With candidates present, only the last row's worth of head
        // cells can matter; smaller rows would have started the search
        // earlier.
        Self::fold_row_cells(reader, &last_key.row, false, candidates)
    }

    /// Applies one cell to the closest-row candidate set: live cells
    /// become candidates, tombstones strike the candidate they cover.
    fn fold_candidate(candidates: &mut BTreeMap<StoreKey, u64>, key: &StoreKey, value: &[u8]) {
        let stripped = key.without_timestamp();
        if is_deleted(value) {
            if candidates
                .get(&stripped)
                .is_some_and(|best| *best <= key.timestamp)
            {
                candidates.remove(&stripped);
            }
        } else {
            candidates.insert(stripped, key.timestamp);
        }
    }

    /// Folds every cell of `target_row` into the candidate set.
    /// `oldest_first` reverses the visit order so a row's own newer
    /// tombstones strike its older values (used when no candidates
    /// exist yet).
    fn fold_row_cells(
        reader: &mut crate::storefile::StoreFileReader,
        target_row: &[u8],
        oldest_first: bool,
        candidates: &mut BTreeMap<StoreKey, u64>,
    ) -> Result<(), StoreError> {
        let mut cells = Vec::new();
        let row_start = StoreKey::for_row(target_row.to_vec());
        if let Some((key, value)) = reader.get_closest(&row_start, false)? {
            if key.row.as_slice() == target_row {
                cells.push((key, value));
                while let Some((key, value)) = reader.next()? {
                    if key.row.as_slice() != target_row {
                        break;
                    }
                    cells.push((key, value));
                }
            }
        }

        if oldest_first {
            for (key, value) in cells.iter().rev() {
                Self::fold_candidate(candidates, key, value);
            }
        } else {
            for (key, value) in &cells {
                Self::fold_candidate(candidates, key, value);
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Writes the memcache snapshot to a new store file stamped with
    /// `sequence_id` and registers it atomically.
    pub fn flush_cache(&self, sequence_id: u64) -> Result<(), StoreError> {
        let snapshot = self.memcache.take_snapshot()?;
        self.internal_flush(snapshot, sequence_id)
    }

    fn internal_flush(
        &self,
        cache: BTreeMap<StoreKey, Vec<u8>>,
        sequence_id: u64,
    ) -> Result<(), StoreError> {
        let _flush_guard = self
            .flush_lock
            .lock()
            .map_err(|_| StoreError::Internal("flush lock poisoned".into()))?;

        if cache.is_empty() {
            return Ok(());
        }

        // A. Write the sorted cells of this family out to a new file.
        let flushed =
            StoreFile::new_unique(&self.basedir, self.info.encoded_name(), &self.family.name, None)?;
        let mut writer = StoreFileWriter::create(&flushed.map_path())?;
        let mut entries = 0usize;
        for (key, value) in &cache {
            if key.family() != self.family.name.as_slice() {
                continue;
            }
            writer.append(key, value)?;
            entries += 1;
            if let Some(bloom) = &self.bloom {
                let mut filter = bloom
                    .lock()
                    .map_err(|_| StoreError::Internal("bloom lock poisoned".into()))?;
                filter.insert_row(&key.row);
            }
        }
        writer.finish()?;

        // B. The info sidecar is the durability marker: the file covers
        // the log up to and including `sequence_id`.
        flushed.write_info(sequence_id)?;

        // C. Flush the bloom filter if any.
        if let (Some(bloom), Some(path)) = (&self.bloom, &self.filter_path) {
            let filter = bloom
                .lock()
                .map_err(|_| StoreError::Internal("bloom lock poisoned".into()))?;
            filter.flush(path)?;
        }

        // D. Make the new file available to readers.
        {
            let mut state = self.write_state()?;
            state.readers.insert(sequence_id, flushed.reader()?);
            state.files.insert(sequence_id, flushed);
            self.max_seq_id.fetch_max(sequence_id, Ordering::SeqCst);
        }

        debug!(
            store = %self.store_name,
            entries,
            sequence_id,
            "flushed memcache snapshot"
        );
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// True when the file count reaches the compaction threshold or any
    /// file is a reference.
    pub fn needs_compaction(&self) -> bool {
        match self.read_state() {
            Ok(state) => {
                state.files.len() >= self.compaction_threshold
                    || state.files.values().any(|f| f.is_reference())
            }
            Err(_) => false,
        }
    }

    /// Merges all store files into one, dropping occluded cells,
    /// tombstones and excess versions, then atomically swaps the result
    /// in. Returns false when there was nothing to compact.
    pub fn compact(&self) -> Result<bool, StoreError> {
        let _compact_guard = self
            .compact_lock
            .lock()
            .map_err(|_| StoreError::Internal("compact lock poisoned".into()))?;

        // Newest first: ties on identical keys resolve to the file with
        // the larger sequence id.
        let files_to_compact: Vec<StoreFile> = {
            let state = self.read_state()?;
            state.files.values().rev().cloned().collect()
        };

        if files_to_compact.is_empty()
            || (files_to_compact.len() == 1 && !files_to_compact[0].is_reference())
        {
            debug!(store = %self.store_name, "nothing to compact");
            return Ok(false);
        }

        info!(
            store = %self.store_name,
            files = files_to_compact.len(),
            "starting compaction"
        );

        let scratch = StoreFile::new_unique(
            &self.compaction_basedir,
            self.info.encoded_name(),
            &self.family.name,
            None,
        )?;
        let mut writer = StoreFileWriter::create(&scratch.map_path())?;
        self.compact_files(&mut writer, &files_to_compact)?;
        writer.finish()?;

        // The compacted file covers everything its inputs covered.
        let mut max_seq = 0u64;
        for file in &files_to_compact {
            max_seq = max_seq.max(file.load_info()?);
        }
        scratch.write_info(max_seq)?;

        self.complete_compaction(&files_to_compact, scratch)?;
        Ok(true)
    }

    /// K-way merge of the input files (newest first) into `writer`.
    ///
    /// Scanning ascending key order means versions of a (row, column)
    /// arrive newest first; `times_seen` caps them at the family's
    /// version limit, and tombstones are recorded and dropped together
    /// with everything they occlude.
    fn compact_files(
        &self,
        writer: &mut StoreFileWriter,
        files: &[StoreFile],
    ) -> Result<(), StoreError> {
        let mut readers = Vec::with_capacity(files.len());
        for file in files {
            match file.reader() {
                Ok(mut reader) => {
                    reader.reset();
                    readers.push(reader);
                }
                Err(e) => {
                    warn!(
                        store = %self.store_name,
                        file = file.id(),
                        reference = file.is_reference(),
                        "failed opening compaction reader"
                    );
                    return Err(e.into());
                }
            }
        }

        let mut currents: Vec<Option<(StoreKey, Vec<u8>)>> = Vec::with_capacity(readers.len());
        for reader in &mut readers {
            currents.push(reader.next()?);
        }

        let max_versions = self.family.max_versions as usize;
        let mut times_seen = 0usize;
        let mut last_seen: Option<(Vec<u8>, Vec<u8>)> = None;
        let mut last_written: Option<StoreKey> = None;
        let mut deletes: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();

        loop {
            // Pick the smallest current key; strict comparison keeps
            // the earliest (newest) file on ties.
            let mut smallest: Option<usize> = None;
            for (idx, current) in currents.iter().enumerate() {
                let Some((key, _)) = current else { continue };
                match smallest {
                    None => smallest = Some(idx),
                    Some(s) => {
                        let (skey, _) = currents[s].as_ref().ok_or_else(|| {
                            StoreError::Internal("empty compaction cursor".into())
                        })?;
                        if key < skey {
                            smallest = Some(idx);
                        }
                    }
                }
            }
            let Some(smallest) = smallest else { break };

            let (key, value) = currents[smallest]
                .take()
                .ok_or_else(|| StoreError::Internal("empty compaction cursor".into()))?;

            if last_seen
                .as_ref()
                .is_some_and(|(row, column)| *row == key.row && *column == key.column)
            {
                times_seen += 1;
            } else {
                times_seen = 1;
                deletes.clear();
            }

            let mut drop_cell = false;
            if is_deleted(&value) {
                deletes
                    .entry(key.column.clone())
                    .or_default()
                    .push(key.timestamp);
                drop_cell = true;
            } else if deletes
                .get(&key.column)
                .is_some_and(|stamps| stamps.contains(&key.timestamp))
            {
                drop_cell = true;
            } else if times_seen > max_versions {
                drop_cell = true;
            } else if last_written.as_ref() == Some(&key) {
                // Identical key in an older file: the newer writer won.
                drop_cell = true;
            }

            if !drop_cell && !key.row.is_empty() && !key.column.is_empty() {
                writer.append(&key, &value)?;
                last_written = Some(key.clone());
            }

            last_seen = Some((key.row, key.column));
            currents[smallest] = readers[smallest].next()?;
        }

        Ok(())
    }

    /// Compaction commit:
    /// 1. block new scanners, 2. wait for active scanners to quiesce,
    /// 3. take the store write lock, 4. move the compacted file into
    /// the store, 5. drop replaced readers, 6. delete replaced files,
    /// 7. register the new file's reader under its sequence id.
    fn complete_compaction(
        &self,
        replaced: &[StoreFile],
        scratch: StoreFile,
    ) -> Result<(), StoreError> {
        let _new_scanner_guard = self
            .new_scanner_lock
            .write()
            .map_err(|_| StoreError::Internal("scanner lock poisoned".into()))?;

        self.scanner_gate.wait_for_zero(self.thread_wake_frequency);

        let mut state = self.write_state()?;

        let compacted = StoreFile::new_unique(
            &self.basedir,
            self.info.encoded_name(),
            &self.family.name,
            None,
        )?;
        scratch.rename_to(&compacted)?;

        let replaced_ids: Vec<u64> = replaced.iter().map(|f| f.id()).collect();
        let replaced_seqs: Vec<u64> = state
            .files
            .iter()
            .filter(|(_, f)| replaced_ids.contains(&f.id()))
            .map(|(seq, _)| *seq)
            .collect();

        for seq in &replaced_seqs {
            state.readers.remove(seq);
        }
        for seq in &replaced_seqs {
            if let Some(file) = state.files.remove(seq) {
                if let Err(e) = file.delete() {
                    warn!(
                        store = %self.store_name,
                        file = file.id(),
                        error = %e,
                        "failed deleting replaced store file"
                    );
                }
            }
        }

        let new_seq = compacted.load_info()?;
        state.readers.insert(new_seq, compacted.reader()?);
        state.files.insert(new_seq, compacted);

        info!(
            store = %self.store_name,
            replaced = replaced_seqs.len(),
            sequence_id = new_seq,
            "compaction complete"
        );
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Sizing / scanners
    // --------------------------------------------------------------------------------------------

    /// Sizes the store for split consideration. Reports
    /// `splitable = false` when any file is a reference or the largest
    /// file's mid key cannot partition it.
    pub fn size(&self) -> Result<StoreSize, StoreError> {
        let state = self.read_state()?;
        if state.files.is_empty() {
            return Ok(StoreSize {
                aggregate: 0,
                largest: 0,
                splitable: true,
                mid_key: None,
            });
        }

        let mut aggregate = 0u64;
        let mut largest = 0u64;
        let mut largest_seq = 0u64;
        let mut splitable = true;
        for (seq, file) in &state.files {
            let len = file.length()?;
            aggregate += len;
            if largest == 0 || len > largest {
                largest = len;
                largest_seq = *seq;
            }
            if splitable {
                splitable = !file.is_reference();
            }
        }

        let mut mid_key = None;
        if splitable {
            if let Some(reader) = state.readers.get(&largest_seq) {
                let first = reader.first_key()?;
                let last = reader.final_key()?;
                let mid = reader.mid_key()?;
                if let (Some(first), Some(last), Some(mid)) = (first, last, mid) {
                    // A mid key equal to both ends cannot partition the
                    // file.
                    if mid.row == first.row && mid.row == last.row {
                        splitable = false;
                    } else {
                        mid_key = Some(mid.row);
                    }
                }
            }
        }

        Ok(StoreSize {
            aggregate,
            largest,
            splitable,
            mid_key,
        })
    }

    /// Builds a scanner over the memcache snapshot and every store
    /// file, seeked to `first_row` and restricted to `columns`.
    pub fn get_scanner(
        &self,
        timestamp: u64,
        columns: &[Vec<u8>],
        first_row: &[u8],
    ) -> Result<StoreScanner, StoreError> {
        // Construction is barred while a compaction commit is swapping
        // files; active scanners keep the commit waiting instead.
        let _new_scanner_guard = self
            .new_scanner_lock
            .read()
            .map_err(|_| StoreError::Internal("scanner lock poisoned".into()))?;
        let state = self.read_state()?;

        let matchers = ColumnMatchSet::new(columns)?;
        let snapshot = self.memcache.snapshot_for_scanner()?;
        let file_readers: Vec<crate::storefile::StoreFileReader> =
            state.readers.values().rev().cloned().collect();

        StoreScanner::new(
            matchers,
            timestamp,
            first_row,
            snapshot,
            file_readers,
            Arc::clone(&self.scanner_gate),
        )
    }

    /// Store name (`{encoded-region}/{family}`) for diagnostics.
    pub fn name(&self) -> &str {
        &self.store_name
    }
}
