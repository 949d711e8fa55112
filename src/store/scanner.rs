//! Store-level scanner: a pull-based sorted merge of the memcache
//! snapshot and one cursor per store file, yielding per-row bundles.
//!
//! Construction seeks each cursor to the first cell at or past the
//! scan's first row whose column matches and whose timestamp is within
//! the scan timestamp. `next` picks the smallest row across cursors
//! (ties broken by the larger timestamp), drains that row merging
//! first-value-per-column-wins, suppresses tombstoned columns, then
//! advances every cursor past the row.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use tracing::trace;

use super::{ScannerGate, StoreError};
use crate::key::{HexKey, StoreKey, is_deleted};
use crate::scanner::ColumnMatchSet;
use crate::storefile::StoreFileReader;

/// One row's merged cells: column → value.
pub type RowResults = BTreeMap<Vec<u8>, Vec<u8>>;

// ------------------------------------------------------------------------------------------------
// Cell cursors
// ------------------------------------------------------------------------------------------------

/// Where a cursor draws its cells from.
enum CursorSource {
    /// Private clone of the memcache snapshot, pre-tailed to the first
    /// row.
    Memcache {
        entries: Vec<(StoreKey, Vec<u8>)>,
        pos: usize,
    },

    /// Store file reader with an optional not-yet-consumed seek result.
    File {
        reader: StoreFileReader,
        pending: Option<(StoreKey, Vec<u8>)>,
    },
}

/// A positioned cell stream over one tier, filtered to the scan
/// timestamp.
struct CellCursor {
    source: CursorSource,
    timestamp: u64,
    current: Option<(StoreKey, Vec<u8>)>,
}

impl CellCursor {
    /// Pulls the next cell whose timestamp is within the scan
    /// timestamp; clears `current` at exhaustion.
    fn advance(&mut self) -> Result<(), StoreError> {
        loop {
            let next = match &mut self.source {
                CursorSource::Memcache { entries, pos } => {
                    let cell = entries.get(*pos).cloned();
                    *pos += 1;
                    cell
                }
                CursorSource::File { reader, pending } => match pending.take() {
                    Some(cell) => Some(cell),
                    None => reader.next()?,
                },
            };

            match next {
                None => {
                    self.current = None;
                    return Ok(());
                }
                Some((key, value)) if key.timestamp <= self.timestamp => {
                    self.current = Some((key, value));
                    return Ok(());
                }
                Some(_) => {} // newer than the scan sees; keep pulling
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// StoreScanner
// ------------------------------------------------------------------------------------------------

/// Scanner over one family store: memcache snapshot plus every store
/// file, newest tiers first so the first value per column wins.
pub struct StoreScanner {
    matchers: ColumnMatchSet,
    cursors: Vec<CellCursor>,
    gate: Arc<ScannerGate>,
}

impl StoreScanner {
    pub(crate) fn new(
        matchers: ColumnMatchSet,
        timestamp: u64,
        first_row: &[u8],
        snapshot: BTreeMap<StoreKey, Vec<u8>>,
        file_readers: Vec<StoreFileReader>,
        gate: Arc<ScannerGate>,
    ) -> Result<Self, StoreError> {
        trace!(
            first_row = %HexKey(first_row),
            files = file_readers.len(),
            "constructing store scanner"
        );

        let mut cursors = Vec::with_capacity(1 + file_readers.len());

        // Memcache snapshot first: the newest tier wins column merges.
        let entries: Vec<(StoreKey, Vec<u8>)> = if first_row.is_empty() {
            snapshot.into_iter().collect()
        } else {
            let seek = StoreKey::for_row(first_row.to_vec());
            snapshot.into_iter().filter(|(k, _)| *k >= seek).collect()
        };
        cursors.push(CellCursor {
            source: CursorSource::Memcache { entries, pos: 0 },
            timestamp,
            current: None,
        });

        for mut reader in file_readers {
            reader.reset();
            let pending = if first_row.is_empty() {
                None
            } else {
                // Position at the first cell of the first row; `None`
                // leaves the cursor exhausted.
                match reader.get_closest(&StoreKey::for_row(first_row.to_vec()), false)? {
                    Some(cell) => Some(cell),
                    None => {
                        cursors.push(CellCursor {
                            source: CursorSource::File {
                                reader,
                                pending: None,
                            },
                            timestamp,
                            current: None,
                        });
                        continue;
                    }
                }
            };
            let mut cursor = CellCursor {
                source: CursorSource::File { reader, pending },
                timestamp,
                current: None,
            };
            cursor.advance()?;
            cursors.push(cursor);
        }

        // Initial position of the memcache cursor.
        cursors[0].advance()?;

        // Each cursor must sit on a column-matching cell.
        for cursor in &mut cursors {
            while let Some((key, _)) = &cursor.current {
                if matchers.matches(&key.column) {
                    break;
                }
                cursor.advance()?;
            }
        }

        gate.enter();
        Ok(Self {
            matchers,
            cursors,
            gate,
        })
    }

    /// Any matcher is a wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.matchers.is_wildcard()
    }

    /// Some family has several matchers.
    pub fn is_multiple_match(&self) -> bool {
        self.matchers.is_multiple()
    }

    /// The next row bundle: the chosen row's key (row + timestamp) and
    /// its merged columns. Rows whose every matching cell is tombstoned
    /// are skipped. `None` when all cursors are exhausted.
    pub fn next(&mut self) -> Result<Option<(StoreKey, RowResults)>, StoreError> {
        let wildcard = self.matchers.is_wildcard();
        let multiple = self.matchers.is_multiple();

        loop {
            // Smallest row across cursors; within it, the largest
            // timestamp.
            let mut chosen: Option<(Vec<u8>, u64)> = None;
            for cursor in &self.cursors {
                let Some((key, _)) = &cursor.current else {
                    continue;
                };
                let better = match &chosen {
                    None => true,
                    Some((row, ts)) => {
                        key.row < *row || (key.row == *row && key.timestamp > *ts)
                    }
                };
                if better {
                    chosen = Some((key.row.clone(), key.timestamp));
                }
            }
            let Some((chosen_row, chosen_timestamp)) = chosen else {
                return Ok(None);
            };

            let mut results: RowResults = BTreeMap::new();
            let mut deleted_columns: BTreeSet<Vec<u8>> = BTreeSet::new();
            let matchers = &self.matchers;

            for cursor in &mut self.cursors {
                while let Some((key, value)) = cursor.current.clone() {
                    if key.row != chosen_row {
                        break;
                    }
                    // Only one timestamp is wanted when a single
                    // literal column is asked for.
                    if !wildcard && !multiple && key.timestamp != chosen_timestamp {
                        break;
                    }
                    if matchers.matches(&key.column) {
                        if is_deleted(&value) {
                            deleted_columns.insert(key.column.clone());
                        } else if !deleted_columns.contains(&key.column)
                            && !results.contains_key(&key.column)
                        {
                            // First (newest) value per column wins.
                            results.insert(key.column.clone(), value);
                        }
                    }
                    cursor.advance()?;
                }
            }

            // Move every cursor past the chosen row, skipping cells
            // whose column does not match.
            for cursor in &mut self.cursors {
                loop {
                    match &cursor.current {
                        Some((key, _))
                            if key.row.as_slice() <= chosen_row.as_slice()
                                || !matchers.matches(&key.column) =>
                        {
                            cursor.advance()?;
                        }
                        _ => break,
                    }
                }
            }

            if !results.is_empty() {
                return Ok(Some((
                    StoreKey::for_row_at(chosen_row, chosen_timestamp),
                    results,
                )));
            }
            // Nothing visible on this row (all tombstoned or matched
            // nothing); move on to the next one.
        }
    }
}

impl Drop for StoreScanner {
    fn drop(&mut self) {
        self.gate.exit();
    }
}
