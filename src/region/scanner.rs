//! Region-level scanner: merges one store scanner per family and
//! applies the optional row filter.
//!
//! Each `next` picks the smallest row across the per-family scanners
//! (ties broken by the larger timestamp), merges their bundles with
//! first-value-per-column-wins, and consults the filter: the row key
//! alone may discard the row, any cell may discard it, and
//! `filter_all_remaining` ends the scan. Discarded and empty rows are
//! skipped by advancing and retrying.

use std::{collections::BTreeMap, sync::Arc};

use super::RegionError;
use crate::key::StoreKey;
use crate::scanner::RowFilter;
use crate::store::{RowResults, ScannerGate, StoreScanner};

/// Scanner over every family a scan's columns touch.
pub struct RegionScanner {
    scanners: Vec<Option<StoreScanner>>,
    currents: Vec<Option<(StoreKey, RowResults)>>,
    filter: Option<Box<dyn RowFilter>>,
    gate: Arc<ScannerGate>,
}

impl RegionScanner {
    pub(crate) fn new(
        store_scanners: Vec<StoreScanner>,
        mut filter: Option<Box<dyn RowFilter>>,
        gate: Arc<ScannerGate>,
    ) -> Result<Self, RegionError> {
        if let Some(filter) = &mut filter {
            filter.reset();
        }

        let mut scanners: Vec<Option<StoreScanner>> = store_scanners.into_iter().map(Some).collect();

        // Prefetch the first bundle of every store; an exhausted store
        // is closed immediately.
        let mut currents = Vec::with_capacity(scanners.len());
        for slot in &mut scanners {
            let current = match slot {
                Some(scanner) => scanner.next()?,
                None => None,
            };
            if current.is_none() {
                *slot = None;
            }
            currents.push(current);
        }

        gate.enter();
        Ok(Self {
            scanners,
            currents,
            filter,
            gate,
        })
    }

    /// Pulls the next bundle from store `i`, closing it at exhaustion.
    fn advance(&mut self, i: usize) -> Result<(), RegionError> {
        let next = match &mut self.scanners[i] {
            Some(scanner) => scanner.next()?,
            None => None,
        };
        if next.is_none() {
            self.scanners[i] = None;
        }
        self.currents[i] = next;
        Ok(())
    }

    /// The next surviving row: its key (row + chosen timestamp) and the
    /// merged columns across families. `None` once every store is
    /// exhausted or the filter ends the scan.
    pub fn next(&mut self) -> Result<Option<(StoreKey, RowResults)>, RegionError> {
        let mut filtered = true;
        let mut more = true;
        let mut out_key: Option<StoreKey> = None;
        let mut results: RowResults = BTreeMap::new();

        while filtered && more {
            results.clear();

            // Smallest row across families; within it, the largest
            // timestamp.
            let mut chosen: Option<(Vec<u8>, u64)> = None;
            for current in &self.currents {
                let Some((key, _)) = current else { continue };
                let better = match &chosen {
                    None => true,
                    Some((row, ts)) => key.row < *row || (key.row == *row && key.timestamp > *ts),
                };
                if better {
                    chosen = Some((key.row.clone(), key.timestamp));
                }
            }

            // Filter whole row by row key?
            filtered = match (&mut self.filter, &chosen) {
                (Some(filter), Some((row, _))) => filter.filter_row_key(row),
                _ => false,
            };

            if let Some((chosen_row, chosen_timestamp)) = &chosen {
                out_key = Some(StoreKey::for_row_at(chosen_row.clone(), *chosen_timestamp));

                if !filtered {
                    'stores: for i in 0..self.currents.len() {
                        while let Some((key, bundle)) = self.currents[i].clone() {
                            if key.row != *chosen_row {
                                break;
                            }
                            for (column, value) in bundle {
                                if results.contains_key(&column) {
                                    // First (newest store order) wins.
                                    continue;
                                }
                                if let Some(filter) = &mut self.filter {
                                    // Filter whole row by cell content?
                                    if filter.filter_cell(chosen_row, &column, &value) {
                                        filtered = true;
                                        results.clear();
                                        break;
                                    }
                                }
                                results.insert(column, value);
                            }
                            if filtered {
                                break 'stores;
                            }
                            self.advance(i)?;
                        }
                    }
                }

                // Move every family past the chosen row.
                for i in 0..self.currents.len() {
                    while self.currents[i]
                        .as_ref()
                        .is_some_and(|(key, _)| key.row.as_slice() <= chosen_row.as_slice())
                    {
                        self.advance(i)?;
                    }
                }
            }

            more = chosen.is_some();

            if let Some(filter) = &mut self.filter {
                if more {
                    if let Some((row, _)) = &chosen {
                        filter.row_processed(filtered, row);
                    }
                }
                if filter.filter_all_remaining() {
                    more = false;
                }
            }

            // A row with no surviving cells does not end the scan;
            // treat it as filtered so the loop advances.
            if results.is_empty() && !filtered {
                filtered = true;
            }
        }

        if !filtered && !results.is_empty() {
            let key = out_key
                .ok_or_else(|| RegionError::Internal("scanner produced results without a key".into()))?;
            return Ok(Some((key, results)));
        }
        Ok(None)
    }
}

impl Drop for RegionScanner {
    fn drop(&mut self) {
        // Store scanners close (and release their gates) on drop.
        self.scanners.clear();
        self.gate.exit();
    }
}
