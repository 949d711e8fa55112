//! Per-store approximate row membership.
//!
//! A family store may own one filter (plain, counting, or retouched per
//! its schema), shared by every file in the store and persisted beside
//! them under `filter/filter`. Point reads consult it to skip the file
//! walk entirely when the row was certainly never written here.
//!
//! The filter answers "maybe present" / "certainly absent"; false
//! positives only cost a wasted file probe.

use std::{
    fs::{self, File},
    io::{Read, Write},
    path::Path,
};

use bincode::{config::standard, decode_from_slice, encode_to_vec};
use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use tracing::debug;

use super::StoreFileError;
use crate::schema::{BloomFilterKind, BloomFilterSpec};

/// Serialized form: kind tag plus the filter's bit vector.
#[derive(bincode::Encode, bincode::Decode)]
struct PersistedFilter {
    kind: BloomFilterKind,
    data: Vec<u8>,
}

/// The bloom filter a store owns when its family schema asks for one.
pub struct StoreFilter {
    kind: BloomFilterKind,
    bloom: Bloom<[u8]>,
}

impl StoreFilter {
    /// Fresh filter sized from the family schema.
    pub fn new(spec: &BloomFilterSpec) -> Result<Self, StoreFileError> {
        let bloom = Bloom::new_for_fp_rate(spec.expected_rows.max(1), spec.false_positive_rate)
            .map_err(|e| StoreFileError::Internal(format!("bloom filter: {e}")))?;
        Ok(Self {
            kind: spec.kind,
            bloom,
        })
    }

    /// Loads the persisted filter, or builds a fresh one when no file
    /// exists yet.
    pub fn load_or_create(path: &Path, spec: &BloomFilterSpec) -> Result<Self, StoreFileError> {
        if !path.exists() {
            return Self::new(spec);
        }

        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        if bytes.len() < 4 {
            return Err(StoreFileError::Internal("bloom filter file too small".into()));
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let mut hasher = Crc32::new();
        hasher.update(body);
        let stored = u32::from_le_bytes(
            crc_bytes
                .try_into()
                .map_err(|_| StoreFileError::Internal("short bloom checksum".into()))?,
        );
        if stored != hasher.finalize() {
            return Err(StoreFileError::ChecksumMismatch);
        }

        let config = standard().with_fixed_int_encoding();
        let (persisted, _) = decode_from_slice::<PersistedFilter, _>(body, config)?;
        let bloom = Bloom::from_slice(&persisted.data)
            .map_err(|e| StoreFileError::Internal(format!("bloom filter: {e}")))?;

        debug!(path = %path.display(), "loaded bloom filter");
        Ok(Self {
            kind: persisted.kind,
            bloom,
        })
    }

    /// Which filter flavour this is.
    pub fn kind(&self) -> BloomFilterKind {
        self.kind
    }

    /// Records a row.
    pub fn insert_row(&mut self, row: &[u8]) {
        self.bloom.set(row);
    }

    /// `false` means the row was certainly never inserted.
    pub fn maybe_contains(&self, row: &[u8]) -> bool {
        self.bloom.check(row)
    }

    /// Persists the filter with a trailing CRC32.
    pub fn flush(&self, path: &Path) -> Result<(), StoreFileError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config = standard().with_fixed_int_encoding();
        let persisted = PersistedFilter {
            kind: self.kind,
            data: self.bloom.as_slice().to_vec(),
        };
        let body = encode_to_vec(&persisted, config)?;

        let mut hasher = Crc32::new();
        hasher.update(&body);
        let checksum = hasher.finalize();

        let mut file = File::create(path)?;
        file.write_all(&body)?;
        file.write_all(&checksum.to_le_bytes())?;
        file.sync_all()?;

        debug!(path = %path.display(), "flushed bloom filter");
        Ok(())
    }
}
