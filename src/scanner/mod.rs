//! # Scanner support
//!
//! Column matching and row filtering shared by the store-level and
//! region-level scanners.
//!
//! ## Column matchers
//!
//! A scan's target columns come in three forms:
//!
//! - **family only** (`cf` or `cf:`) — any qualifier in the family;
//! - **regex** — the qualifier contains one of ``\+|^&*$[]{}()`` and the
//!   whole `family:qualifier` string is compiled as a pattern;
//! - **literal** — exact `family:qualifier` compare.
//!
//! A matcher is a *wildcard* unless literal. A scanner over a match set
//! is wildcard if any matcher is, and multi-matcher if any family has
//! two or more matchers; both flags feed the single-timestamp
//! optimisation in the row merge.
//!
//! ## Row filters
//!
//! [`RowFilter`] lets a caller discard rows wholesale (by row key, or by
//! any cell) and terminate the scan early. The region scanner drives
//! the contract; two small filters ship here for callers and tests.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;

use regex::Regex;
use thiserror::Error;

use crate::key::{family_of, qualifier_of};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised while building scanner machinery.
#[derive(Debug, Error)]
pub enum ScannerError {
    /// A target column's qualifier was not a usable pattern.
    #[error("Invalid column matcher for {column}: {reason}")]
    InvalidColumn {
        /// Offending column spec, lossily decoded.
        column: String,
        /// What went wrong compiling it.
        reason: String,
    },

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Column matchers
// ------------------------------------------------------------------------------------------------

/// Characters that mark a qualifier as a regular expression.
const REGEX_MARKERS: &[u8] = br"\+|^&*$[]{}()";

fn is_regex_qualifier(qualifier: &[u8]) -> bool {
    qualifier.iter().any(|b| REGEX_MARKERS.contains(b))
}

enum MatchKind {
    /// Any qualifier within the family.
    FamilyOnly(Vec<u8>),
    /// Whole-column pattern match.
    Pattern(Regex),
    /// Exact column compare.
    Literal(Vec<u8>),
}

/// Matches candidate columns against one target column spec.
pub struct ColumnMatcher {
    kind: MatchKind,
    wildcard: bool,
}

impl ColumnMatcher {
    /// Builds a matcher from a target column spec.
    pub fn new(column: &[u8]) -> Result<Self, ScannerError> {
        let qualifier = qualifier_of(column);

        if qualifier.is_empty() {
            return Ok(Self {
                kind: MatchKind::FamilyOnly(family_of(column).to_vec()),
                wildcard: true,
            });
        }

        if is_regex_qualifier(qualifier) {
            let text = std::str::from_utf8(column).map_err(|e| ScannerError::InvalidColumn {
                column: String::from_utf8_lossy(column).into_owned(),
                reason: e.to_string(),
            })?;
            // Anchored: the whole column must match the pattern.
            let regex =
                Regex::new(&format!("^(?:{text})$")).map_err(|e| ScannerError::InvalidColumn {
                    column: text.to_string(),
                    reason: e.to_string(),
                })?;
            return Ok(Self {
                kind: MatchKind::Pattern(regex),
                wildcard: true,
            });
        }

        Ok(Self {
            kind: MatchKind::Literal(column.to_vec()),
            wildcard: false,
        })
    }

    /// True iff `column` satisfies this matcher.
    pub fn matches(&self, column: &[u8]) -> bool {
        match &self.kind {
            MatchKind::FamilyOnly(family) => family_of(column) == family.as_slice(),
            MatchKind::Pattern(regex) => match std::str::from_utf8(column) {
                Ok(text) => regex.is_match(text),
                Err(_) => false,
            },
            MatchKind::Literal(literal) => column == literal.as_slice(),
        }
    }

    /// True unless this is a literal matcher.
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }
}

/// The matchers of one scan, grouped by family.
pub struct ColumnMatchSet {
    /// Matchers keyed by family name.
    matchers: BTreeMap<Vec<u8>, Vec<ColumnMatcher>>,

    /// Any matcher is a wildcard.
    wildcard: bool,

    /// Some family has two or more matchers.
    multiple: bool,
}

impl ColumnMatchSet {
    /// Builds the per-family matcher table for a scan's target columns.
    pub fn new(columns: &[Vec<u8>]) -> Result<Self, ScannerError> {
        let mut matchers: BTreeMap<Vec<u8>, Vec<ColumnMatcher>> = BTreeMap::new();
        let mut wildcard = false;
        let mut multiple = false;

        for column in columns {
            let matcher = ColumnMatcher::new(column)?;
            if matcher.is_wildcard() {
                wildcard = true;
            }
            let family = family_of(column).to_vec();
            let bucket = matchers.entry(family).or_default();
            bucket.push(matcher);
            if bucket.len() > 1 {
                multiple = true;
            }
        }

        Ok(Self {
            matchers,
            wildcard,
            multiple,
        })
    }

    /// True iff any matcher for the column's family accepts it.
    pub fn matches(&self, column: &[u8]) -> bool {
        match self.matchers.get(family_of(column)) {
            Some(bucket) => bucket.iter().any(|m| m.matches(column)),
            None => false,
        }
    }

    /// Any matcher is a wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// Some family has two or more matchers.
    pub fn is_multiple(&self) -> bool {
        self.multiple
    }
}

// ------------------------------------------------------------------------------------------------
// Row filters
// ------------------------------------------------------------------------------------------------

/// Row-level filtering contract applied by the region scanner.
///
/// `filter_row_key` may discard a row before any cell is examined;
/// `filter_cell` may discard the row based on any cell's content;
/// `filter_all_remaining` ends the scan. `row_processed` is the
/// bookkeeping callback filters use to track progress.
pub trait RowFilter: Send {
    /// Returns the filter to its initial state.
    fn reset(&mut self);

    /// True once no further row can pass.
    fn filter_all_remaining(&self) -> bool;

    /// True iff the whole row should be discarded.
    fn filter_row_key(&mut self, row: &[u8]) -> bool;

    /// True iff the row should be discarded because of this cell.
    fn filter_cell(&mut self, row: &[u8], column: &[u8], value: &[u8]) -> bool;

    /// Called once per examined row with the final decision.
    fn row_processed(&mut self, filtered: bool, row: &[u8]);
}

/// Ends the scan at a stop row (exclusive).
pub struct StopRowFilter {
    stop_row: Vec<u8>,
    passed: bool,
}

impl StopRowFilter {
    /// Scan ends when a row at or past `stop_row` is reached.
    pub fn new(stop_row: impl Into<Vec<u8>>) -> Self {
        Self {
            stop_row: stop_row.into(),
            passed: false,
        }
    }
}

impl RowFilter for StopRowFilter {
    fn reset(&mut self) {
        self.passed = false;
    }

    fn filter_all_remaining(&self) -> bool {
        self.passed
    }

    fn filter_row_key(&mut self, row: &[u8]) -> bool {
        if row >= self.stop_row.as_slice() {
            self.passed = true;
        }
        self.passed
    }

    fn filter_cell(&mut self, _row: &[u8], _column: &[u8], _value: &[u8]) -> bool {
        false
    }

    fn row_processed(&mut self, _filtered: bool, _row: &[u8]) {}
}

/// Keeps only rows starting with a prefix.
pub struct RowPrefixFilter {
    prefix: Vec<u8>,
}

impl RowPrefixFilter {
    /// Rows not starting with `prefix` are discarded.
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl RowFilter for RowPrefixFilter {
    fn reset(&mut self) {}

    fn filter_all_remaining(&self) -> bool {
        false
    }

    fn filter_row_key(&mut self, row: &[u8]) -> bool {
        !row.starts_with(&self.prefix)
    }

    fn filter_cell(&mut self, _row: &[u8], _column: &[u8], _value: &[u8]) -> bool {
        false
    }

    fn row_processed(&mut self, _filtered: bool, _row: &[u8]) {}
}
