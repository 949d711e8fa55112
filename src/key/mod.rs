//! # Key model
//!
//! Every cell in a region is addressed by a [`StoreKey`]: a row, a column
//! of the form `family:qualifier`, and a 64-bit timestamp.
//!
//! ## Design Invariants
//!
//! - Keys are totally ordered by **row ascending, column ascending,
//!   timestamp descending** — within a row/column run the newest version
//!   always sorts first. Memcache maps, store files and every merge in
//!   the crate rely on this order; changing it breaks reads.
//! - A column splits on the **first** `:` into family and qualifier. An
//!   empty qualifier means "the whole family".
//! - Deletions are ordinary cells whose value is the [`DELETE_MARKER`]
//!   sentinel. A tombstone occludes same-(row, column) cells with
//!   timestamps at or below its own.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Timestamp meaning "now / the newest version".
pub const LATEST_TIMESTAMP: u64 = u64::MAX;

/// Version count meaning "every version".
pub const ALL_VERSIONS: usize = usize::MAX;

/// Sentinel value marking a cell as a tombstone.
pub const DELETE_MARKER: &[u8] = b"STRATA::DELETE";

/// Returns true if `value` is the tombstone sentinel.
pub fn is_deleted(value: &[u8]) -> bool {
    value == DELETE_MARKER
}

// ------------------------------------------------------------------------------------------------
// Column helpers
// ------------------------------------------------------------------------------------------------

/// The family portion of a `family:qualifier` column (bytes before the
/// first `:`; the whole column if there is none).
pub fn family_of(column: &[u8]) -> &[u8] {
    match column.iter().position(|b| *b == b':') {
        Some(idx) => &column[..idx],
        None => column,
    }
}

/// The qualifier portion of a `family:qualifier` column. Empty when the
/// column names only a family.
pub fn qualifier_of(column: &[u8]) -> &[u8] {
    match column.iter().position(|b| *b == b':') {
        Some(idx) => &column[idx + 1..],
        None => &[],
    }
}

// ------------------------------------------------------------------------------------------------
// StoreKey
// ------------------------------------------------------------------------------------------------

/// Address of a single cell version: (row, column, timestamp).
///
/// The derived `bincode` impls make keys directly persistable in WAL
/// records and store-file cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub struct StoreKey {
    /// Row key bytes.
    pub row: Vec<u8>,

    /// Column bytes, `family:qualifier`. Empty for row-only keys.
    pub column: Vec<u8>,

    /// Version timestamp. [`LATEST_TIMESTAMP`] addresses the newest.
    pub timestamp: u64,
}

impl StoreKey {
    /// Full cell address.
    pub fn new(row: impl Into<Vec<u8>>, column: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            row: row.into(),
            column: column.into(),
            timestamp,
        }
    }

    /// Row-only key at [`LATEST_TIMESTAMP`] — sorts before every real
    /// cell of the row, so it seeds seeks and tail scans.
    pub fn for_row(row: impl Into<Vec<u8>>) -> Self {
        Self::for_row_at(row, LATEST_TIMESTAMP)
    }

    /// Row-only key at an explicit timestamp.
    pub fn for_row_at(row: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            row: row.into(),
            column: Vec::new(),
            timestamp,
        }
    }

    /// The family portion of this key's column.
    pub fn family(&self) -> &[u8] {
        family_of(&self.column)
    }

    /// True iff `other` has the same row.
    pub fn matches_row(&self, other: &StoreKey) -> bool {
        self.row == other.row
    }

    /// True iff `other` has the same row and column.
    pub fn matches_row_col(&self, other: &StoreKey) -> bool {
        self.row == other.row && self.column == other.column
    }

    /// True iff `other` is on the same row and no newer than this key,
    /// regardless of column. Used by full-row reads where `self` carries
    /// the read timestamp.
    pub fn matches_without_column(&self, other: &StoreKey) -> bool {
        self.row == other.row && other.timestamp <= self.timestamp
    }

    /// Copy with the timestamp zeroed. Candidate maps in the
    /// closest-row protocol key on (row, column) only.
    pub fn without_timestamp(&self) -> StoreKey {
        Self {
            row: self.row.clone(),
            column: self.column.clone(),
            timestamp: 0,
        }
    }
}

impl Ord for StoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.column.cmp(&other.column))
            // Newest first within a row/column run.
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for StoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            HexKey(&self.row),
            HexKey(&self.column),
            self.timestamp
        )
    }
}

// ------------------------------------------------------------------------------------------------
// Tracing Helper
// ------------------------------------------------------------------------------------------------

/// Hex rendering of byte keys for log lines, truncated past 32 bytes.
pub(crate) struct HexKey<'a>(pub &'a [u8]);

impl<'a> std::fmt::Display for HexKey<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.len() <= 32 {
            for byte in self.0 {
                write!(f, "{:02x}", byte)?;
            }
        } else {
            for byte in &self.0[..16] {
                write!(f, "{:02x}", byte)?;
            }
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}
