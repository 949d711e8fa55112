//! # Memcache
//!
//! The in-memory mutable buffer of one family store, plus the immutable
//! snapshot a flush drains.
//!
//! ## Design Invariants
//!
//! - The live map holds every edit since the last snapshot; `snapshot()`
//!   moves the live contents into the snapshot map atomically and does
//!   nothing when the live map is empty.
//! - Reads consult the live map first, then the snapshot, so an edit is
//!   visible continuously from `add` until the flushed store file has
//!   been registered.
//! - Tombstones are stored as ordinary cells carrying the delete marker;
//!   read paths skip them and record their timestamps so older cells in
//!   colder tiers stay occluded.
//!
//! ## Suspension
//!
//! All state sits behind one `RwLock`. Point reads take the read lock;
//! `add` and `snapshot` take the write lock (a sorted map insert needs
//! exclusive access). Scanner construction holds the write lock only
//! long enough to snapshot and clone.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    ops::Bound::{Excluded, Included, Unbounded},
    sync::RwLock,
};

use thiserror::Error;
use tracing::{error, trace};

use crate::key::{ALL_VERSIONS, HexKey, StoreKey, is_deleted};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Memcache`] operations.
#[derive(Debug, Error)]
pub enum MemcacheError {
    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Memcache Core
// ------------------------------------------------------------------------------------------------

/// Internal shared state: live edits plus the flush snapshot.
struct MemcacheInner {
    /// Edits accumulated since the last snapshot.
    live: BTreeMap<StoreKey, Vec<u8>>,

    /// Frozen edits a flush is (or will be) writing out.
    snapshot: BTreeMap<StoreKey, Vec<u8>>,
}

/// The in-memory buffer of a single family store.
pub struct Memcache {
    inner: RwLock<MemcacheInner>,
}

impl Default for Memcache {
    fn default() -> Self {
        Self::new()
    }
}

impl Memcache {
    /// Empty memcache.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemcacheInner {
                live: BTreeMap::new(),
                snapshot: BTreeMap::new(),
            }),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemcacheInner>, MemcacheError> {
        self.inner.read().map_err(|_| {
            error!("Memcache lock poisoned");
            MemcacheError::Internal("RwLock poisoned".into())
        })
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemcacheInner>, MemcacheError> {
        self.inner.write().map_err(|_| {
            error!("Memcache lock poisoned");
            MemcacheError::Internal("RwLock poisoned".into())
        })
    }

    /// Store a value.
    pub fn add(&self, key: StoreKey, value: Vec<u8>) -> Result<(), MemcacheError> {
        trace!("add() key: {}", key);
        let mut guard = self.write()?;
        guard.live.insert(key, value);
        Ok(())
    }

    /// Moves the live map's contents into the snapshot map, leaving the
    /// live map empty. Does nothing when the live map is empty.
    pub fn snapshot(&self) -> Result<(), MemcacheError> {
        let mut guard = self.write()?;
        Self::snapshot_locked(&mut guard);
        Ok(())
    }

    fn snapshot_locked(guard: &mut MemcacheInner) {
        if guard.live.is_empty() {
            return;
        }
        let live = std::mem::take(&mut guard.live);
        guard.snapshot.extend(live);
    }

    /// Hands the current snapshot to a flush, resetting it to empty.
    pub fn take_snapshot(&self) -> Result<BTreeMap<StoreKey, Vec<u8>>, MemcacheError> {
        let mut guard = self.write()?;
        Ok(std::mem::take(&mut guard.snapshot))
    }

    /// Snapshot source for a scanner: forces a snapshot (same semantics
    /// as [`Memcache::snapshot`]) and returns a private clone of it.
    pub fn snapshot_for_scanner(&self) -> Result<BTreeMap<StoreKey, Vec<u8>>, MemcacheError> {
        let mut guard = self.write()?;
        Self::snapshot_locked(&mut guard);
        Ok(guard.snapshot.clone())
    }

    /// Up to `versions` newest non-tombstone values row-column-equal to
    /// `key`, searching the live map then the snapshot. A tombstone
    /// occludes every value at or below its timestamp.
    pub fn get(&self, key: &StoreKey, versions: usize) -> Result<Vec<Vec<u8>>, MemcacheError> {
        let mut newest_tombstone = None;
        self.get_versions(key, versions, &mut newest_tombstone)
    }

    /// [`Memcache::get`], additionally reporting the newest tombstone
    /// timestamp met, so the store can occlude older file cells.
    pub(crate) fn get_versions(
        &self,
        key: &StoreKey,
        versions: usize,
        newest_tombstone: &mut Option<u64>,
    ) -> Result<Vec<Vec<u8>>, MemcacheError> {
        trace!("get() key: {}, versions: {}", key, versions);
        let guard = self.read()?;
        let mut results = Vec::new();
        Self::internal_get(&guard.live, key, versions, newest_tombstone, &mut results);
        Self::internal_get(&guard.snapshot, key, versions, newest_tombstone, &mut results);
        Ok(results)
    }

    fn internal_get(
        map: &BTreeMap<StoreKey, Vec<u8>>,
        key: &StoreKey,
        versions: usize,
        newest_tombstone: &mut Option<u64>,
        results: &mut Vec<Vec<u8>>,
    ) {
        if versions != ALL_VERSIONS && results.len() >= versions {
            return;
        }
        for (it_key, value) in map.range((Included(key), Unbounded)) {
            if !it_key.matches_row_col(key) {
                break;
            }
            if is_deleted(value) {
                if newest_tombstone.is_none_or(|ts| ts < it_key.timestamp) {
                    *newest_tombstone = Some(it_key.timestamp);
                }
            } else if !newest_tombstone.is_some_and(|ts| it_key.timestamp <= ts) {
                results.push(value.clone());
            }
            if versions != ALL_VERSIONS && results.len() >= versions {
                break;
            }
        }
    }

    /// For every column at `key.row` with timestamp at or below
    /// `key.timestamp`, records the newest non-tombstone value per
    /// column into `results`. Tombstones raise `deletes[column]` to the
    /// newest tombstoned timestamp; a cell is suppressed when
    /// `deletes[column]` is at or above its timestamp.
    pub fn get_full(
        &self,
        key: &StoreKey,
        deletes: &mut BTreeMap<Vec<u8>, u64>,
        results: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Result<(), MemcacheError> {
        let guard = self.read()?;
        Self::internal_get_full(&guard.live, key, deletes, results);
        Self::internal_get_full(&guard.snapshot, key, deletes, results);
        Ok(())
    }

    fn internal_get_full(
        map: &BTreeMap<StoreKey, Vec<u8>>,
        key: &StoreKey,
        deletes: &mut BTreeMap<Vec<u8>, u64>,
        results: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    ) {
        for (it_key, value) in map.range((Included(key), Unbounded)) {
            let it_col = &it_key.column;
            if !results.contains_key(it_col) && key.matches_without_column(it_key) {
                if is_deleted(value) {
                    let newest = deletes.entry(it_col.clone()).or_insert(0);
                    if *newest < it_key.timestamp {
                        *newest = it_key.timestamp;
                    }
                } else if deletes.get(it_col).is_none_or(|ts| *ts < it_key.timestamp) {
                    results.insert(it_col.clone(), value.clone());
                }
            } else if key.row < it_key.row {
                break;
            }
        }
    }

    /// Up to `versions` non-tombstone keys at or older than `origin` —
    /// same row, and same column when `origin.column` is non-empty.
    pub fn get_keys(
        &self,
        origin: &StoreKey,
        versions: usize,
    ) -> Result<Vec<StoreKey>, MemcacheError> {
        let guard = self.read()?;
        let mut results = Vec::new();
        Self::internal_get_keys(&guard.live, origin, versions, &mut results);
        Self::internal_get_keys(&guard.snapshot, origin, versions, &mut results);
        Ok(results)
    }

    fn internal_get_keys(
        map: &BTreeMap<StoreKey, Vec<u8>>,
        origin: &StoreKey,
        versions: usize,
        results: &mut Vec<StoreKey>,
    ) {
        if versions != ALL_VERSIONS && results.len() >= versions {
            return;
        }
        for (it_key, value) in map.range((Included(origin), Unbounded)) {
            if origin.column.is_empty() {
                // Row-scoped: stop at the next row, skip cells newer
                // than the origin timestamp.
                if it_key.row != origin.row {
                    break;
                }
                if it_key.timestamp > origin.timestamp {
                    continue;
                }
            } else if !it_key.matches_row_col(origin) {
                break;
            }

            if !is_deleted(value) {
                results.push(it_key.clone());
                if versions != ALL_VERSIONS && results.len() >= versions {
                    break;
                }
            }
        }
    }

    /// True when the live map holds a tombstone at exactly `key`.
    pub fn is_deleted(&self, key: &StoreKey) -> Result<bool, MemcacheError> {
        let guard = self.read()?;
        Ok(guard.live.get(key).is_some_and(|value| is_deleted(value)))
    }

    /// Folds this memcache's candidates for "closest row at or before
    /// `row`" into `candidates`, obeying tombstones. Part of the
    /// cross-tier protocol driven by the store.
    pub fn row_key_at_or_before(
        &self,
        row: &[u8],
        candidates: &mut BTreeMap<StoreKey, u64>,
    ) -> Result<(), MemcacheError> {
        trace!("row_key_at_or_before() row: {}", HexKey(row));
        let guard = self.read()?;
        Self::internal_row_at_or_before(&guard.live, row, candidates);
        Self::internal_row_at_or_before(&guard.snapshot, row, candidates);
        Ok(())
    }

    fn internal_row_at_or_before(
        map: &BTreeMap<StoreKey, Vec<u8>>,
        row: &[u8],
        candidates: &mut BTreeMap<StoreKey, u64>,
    ) {
        // Search forward from the earliest still-interesting position:
        // the first existing candidate's row, or the target itself.
        let search_key = match candidates.keys().next() {
            Some(first) => StoreKey::for_row(first.row.clone()),
            None => StoreKey::for_row(row.to_vec()),
        };

        let mut tail = map.range((Included(&search_key), Unbounded)).peekable();

        let tail_usable = tail
            .peek()
            .is_some_and(|(first, _)| first.row.as_slice() <= row);

        if tail_usable {
            // Walk keys up to and including the target row, applying
            // tombstones against the candidate set.
            for (found, value) in tail {
                if found.row.as_slice() > row {
                    break;
                }
                let stripped = found.without_timestamp();
                if is_deleted(value) {
                    if candidates
                        .get(&stripped)
                        .is_some_and(|best| *best <= found.timestamp)
                    {
                        candidates.remove(&stripped);
                    }
                } else {
                    candidates.insert(stripped, found.timestamp);
                }
            }
            return;
        }

        // The tail held nothing at or before the target; look at the
        // keys preceding the search point.
        let mut head = map.range((Unbounded, Excluded(&search_key)));
        let Some((last_key, _)) = head.next_back() else {
            return;
        };

        if candidates.is_empty() {
            // Walk backwards until we leave the last row that has a
            // live cell. Reverse order visits older versions first, so
            // a tombstone met later strikes the candidate it covers.
            let mut last_row_found: Option<Vec<u8>> = None;
            for (it_key, value) in map.range((Unbounded, Excluded(&search_key))).rev() {
                if let Some(ref last_row) = last_row_found {
                    if last_row != &it_key.row {
                        break;
                    }
                }
                let stripped = it_key.without_timestamp();
                if is_deleted(value) {
                    if candidates
                        .get(&stripped)
                        .is_some_and(|best| *best <= it_key.timestamp)
                    {
                        candidates.remove(&stripped);
                    }
                } else {
                    last_row_found = Some(it_key.row.clone());
                    candidates.insert(stripped, it_key.timestamp);
                }
            }
        } else {
            // With candidates present, only the last row's worth of
            // head keys can matter; smaller rows would have started the
            // search earlier.
            let row_start = StoreKey::for_row(last_key.row.clone());
            for (it_key, value) in map.range((Included(&row_start), Excluded(&search_key))) {
                let stripped = it_key.without_timestamp();
                if is_deleted(value) {
                    if candidates
                        .get(&stripped)
                        .is_some_and(|best| *best <= it_key.timestamp)
                    {
                        candidates.remove(&stripped);
                    }
                } else {
                    candidates.insert(stripped, it_key.timestamp);
                }
            }
        }
    }
}
