//! # Store files
//!
//! Immutable, sorted, on-disk data files of one family store, plus the
//! info sidecar that records the max WAL sequence id each file covers
//! and the *reference* variant that projects one half of a parent
//! region's file after a split.
//!
//! ## Design Invariants
//!
//! - Cells appear in ascending [`StoreKey`] order, so timestamps within
//!   a row/column run appear newest-first.
//! - A file only becomes visible to readers after its info sidecar is
//!   written; a data file without a sidecar (or vice versa) is garbage
//!   from a crash and is deleted at store open.
//! - A reference file's bytes live in the parent region; its own data
//!   file holds only the encoded projection (parent region, parent file
//!   id, split key, half). Readers clamp to the chosen half.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES (magic, version, crc)]
//! [CELL_HEADER][ROW][COLUMN][VALUE]
//! [CELL_HEADER][ROW][COLUMN][VALUE]
//! ...
//! [INDEX_LEN_LE][INDEX_BYTES][INDEX_CRC32_LE]
//! [FOOTER_BYTES]
//! ```
//!
//! The index is the vector of cell offsets; the reader mmaps the file
//! and binary-searches the index for `get_closest`, `mid_key` and
//! reference bounds.
//!
//! # Naming
//!
//! Data and info files are named `{id}` — or `{id}.{parent-region}`
//! when the file is a reference (regex `^(\d+)(?:\.(.+))?$`).

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

pub mod bloom;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use bincode::{config::standard, decode_from_slice, encode_to_vec};
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::key::StoreKey;
use crate::schema::{info_dir, map_dir};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const SF_MAGIC: [u8; 4] = *b"SFD1";
const SF_VERSION: u32 = 1;
/// bincode fixed-int size of [`FileHeader`].
const SF_HEADER_SIZE: usize = 12;
/// bincode fixed-int size of [`FileFooter`].
const SF_FOOTER_SIZE: usize = 28;
/// bincode fixed-int size of [`CellHeader`].
const SF_CELL_HEADER_SIZE: usize = 20;

const FILE_NAME_PATTERN: &str = r"^(\d+)(?:\.(.+))?$";

fn file_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(FILE_NAME_PATTERN).expect("store file name pattern is valid"))
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by store file operations.
#[derive(Debug, Error)]
pub enum StoreFileError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error.
    #[error("Serialization (encode) error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Deserialization error.
    #[error("Deserialization (decode) error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// Data integrity failure — checksum did not match.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Keys handed to the writer were not in ascending order.
    #[error("Out-of-order append: {0}")]
    OutOfOrderAppend(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// On-disk structures
// ------------------------------------------------------------------------------------------------

#[derive(Debug, bincode::Encode, bincode::Decode)]
struct FileHeader {
    magic: [u8; 4],
    version: u32,
    header_crc: u32,
}

#[derive(Debug, bincode::Encode, bincode::Decode)]
struct FileFooter {
    /// Offset of the framed index block.
    index_offset: u64,
    /// Byte size of the framed index block.
    index_size: u64,
    /// Number of cells in the file.
    cell_count: u64,
    footer_crc: u32,
}

#[derive(Debug, bincode::Encode, bincode::Decode)]
struct CellHeader {
    row_len: u32,
    column_len: u32,
    value_len: u32,
    timestamp: u64,
}

// ------------------------------------------------------------------------------------------------
// References
// ------------------------------------------------------------------------------------------------

/// Which half of the parent file a reference projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum Half {
    /// Rows strictly below the split key.
    Bottom,
    /// Rows at or above the split key.
    Top,
}

/// Projection of one half of a parent region's store file.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct Reference {
    /// Encoded name of the parent region holding the bytes.
    pub parent_region: String,

    /// File id of the parent data file.
    pub file_id: u64,

    /// Row key the parent was split at.
    pub split_key: Vec<u8>,

    /// Which side of the split this reference serves.
    pub half: Half,
}

// ------------------------------------------------------------------------------------------------
// StoreFile identity
// ------------------------------------------------------------------------------------------------

/// Identity of one store file: where it lives and whether it is a
/// concrete file or a reference into a parent region.
#[derive(Debug, Clone)]
pub struct StoreFile {
    /// Table directory (or a scratch directory laid out the same way).
    basedir: PathBuf,

    /// Encoded name of the owning region.
    encoded_region: String,

    /// Family the file belongs to.
    family: Vec<u8>,

    /// File id; unique within the family directory.
    id: u64,

    /// Present iff this file is a reference half-file.
    reference: Option<Reference>,
}

impl StoreFile {
    /// Store file with a known id.
    pub fn new(
        basedir: &Path,
        encoded_region: &str,
        family: &[u8],
        id: u64,
        reference: Option<Reference>,
    ) -> Self {
        Self {
            basedir: basedir.to_path_buf(),
            encoded_region: encoded_region.to_string(),
            family: family.to_vec(),
            id,
            reference,
        }
    }

    /// Store file with a freshly drawn id that collides with nothing in
    /// the family directory. Creates the `mapfiles/` and `info/`
    /// directories if needed.
    pub fn new_unique(
        basedir: &Path,
        encoded_region: &str,
        family: &[u8],
        reference: Option<Reference>,
    ) -> Result<Self, StoreFileError> {
        fs::create_dir_all(map_dir(basedir, encoded_region, family))?;
        fs::create_dir_all(info_dir(basedir, encoded_region, family))?;
        loop {
            let id: u64 = rand::random();
            let candidate = Self::new(basedir, encoded_region, family, id, reference.clone());
            if !candidate.map_path().exists() && !candidate.info_path().exists() {
                return Ok(candidate);
            }
        }
    }

    /// Parses `{id}` / `{id}.{parent-region}` file names. Returns the
    /// file id and the parent encoded region name when present.
    pub fn parse_file_name(name: &str) -> Option<(u64, Option<String>)> {
        let captures = file_name_regex().captures(name)?;
        let id = captures.get(1)?.as_str().parse::<u64>().ok()?;
        let parent = captures.get(2).map(|m| m.as_str().to_string());
        Some((id, parent))
    }

    fn file_name(&self) -> String {
        match &self.reference {
            Some(reference) => format!("{}.{}", self.id, reference.parent_region),
            None => format!("{}", self.id),
        }
    }

    /// File id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Family this file belongs to.
    pub fn family(&self) -> &[u8] {
        &self.family
    }

    /// The reference projection, when this file is one.
    pub fn reference(&self) -> Option<&Reference> {
        self.reference.as_ref()
    }

    /// True iff this file is a reference half-file.
    pub fn is_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Path of the data file.
    pub fn map_path(&self) -> PathBuf {
        map_dir(&self.basedir, &self.encoded_region, &self.family).join(self.file_name())
    }

    /// Path of the info sidecar.
    pub fn info_path(&self) -> PathBuf {
        info_dir(&self.basedir, &self.encoded_region, &self.family).join(self.file_name())
    }

    /// Path of the parent data file a reference points into.
    fn parent_map_path(&self, reference: &Reference) -> PathBuf {
        let parent = StoreFile::new(
            &self.basedir,
            &reference.parent_region,
            &self.family,
            reference.file_id,
            None,
        );
        parent.map_path()
    }

    /// Writes the info sidecar: the max WAL sequence id this file
    /// reflects, as 8 little-endian bytes. This is the durability
    /// marker recovery keys off, so it is fsynced.
    pub fn write_info(&self, sequence_id: u64) -> Result<(), StoreFileError> {
        let mut file = File::create(self.info_path())?;
        file.write_all(&sequence_id.to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Reads the max WAL sequence id from the info sidecar.
    pub fn load_info(&self) -> Result<u64, StoreFileError> {
        let mut file = File::open(self.info_path())?;
        let mut bytes = [0u8; 8];
        file.read_exact(&mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Approximate byte size of the data this file serves. A reference
    /// counts as half its parent file.
    pub fn length(&self) -> Result<u64, StoreFileError> {
        match &self.reference {
            Some(reference) => {
                let len = fs::metadata(self.parent_map_path(reference))?.len();
                Ok(len / 2)
            }
            None => Ok(fs::metadata(self.map_path())?.len()),
        }
    }

    /// Deletes the data file and the info sidecar.
    pub fn delete(&self) -> Result<(), StoreFileError> {
        fs::remove_file(self.map_path())?;
        fs::remove_file(self.info_path())?;
        Ok(())
    }

    /// Moves this file's data and info under `dst`'s identity.
    pub fn rename_to(&self, dst: &StoreFile) -> Result<(), StoreFileError> {
        if let Some(parent) = dst.map_path().parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = dst.info_path().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(self.map_path(), dst.map_path())?;
        fs::rename(self.info_path(), dst.info_path())?;
        Ok(())
    }

    /// Materialises a reference half-file for a split child: the data
    /// file holds the framed [`Reference`], the info sidecar carries
    /// the parent's sequence id.
    pub fn write_reference(&self, sequence_id: u64) -> Result<(), StoreFileError> {
        let reference = self.reference.as_ref().ok_or_else(|| {
            StoreFileError::Internal("write_reference on a concrete store file".into())
        })?;

        let config = standard().with_fixed_int_encoding();
        let bytes = encode_to_vec(reference, config)?;

        let mut hasher = Crc32::new();
        hasher.update(&bytes);
        let checksum = hasher.finalize();

        if let Some(parent) = self.map_path().parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(self.map_path())?;
        file.write_all(&(bytes.len() as u32).to_le_bytes())?;
        file.write_all(&bytes)?;
        file.write_all(&checksum.to_le_bytes())?;
        file.sync_all()?;

        self.write_info(sequence_id)
    }

    /// Reads the framed [`Reference`] out of a reference data file.
    pub fn read_reference(path: &Path) -> Result<Reference, StoreFileError> {
        let mut file = File::open(path)?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut bytes = vec![0u8; len];
        file.read_exact(&mut bytes)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;

        let mut hasher = Crc32::new();
        hasher.update(&bytes);
        if u32::from_le_bytes(checksum_bytes) != hasher.finalize() {
            return Err(StoreFileError::ChecksumMismatch);
        }

        let config = standard().with_fixed_int_encoding();
        let (reference, _) = decode_from_slice::<Reference, _>(&bytes, config)?;
        Ok(reference)
    }

    /// Opens a reader on this file, resolving references through the
    /// parent region's data file.
    pub fn reader(&self) -> Result<StoreFileReader, StoreFileError> {
        match &self.reference {
            Some(reference) => {
                StoreFileReader::open_reference(&self.parent_map_path(reference), reference)
            }
            None => StoreFileReader::open(&self.map_path()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Sequential writer producing one sorted store file.
pub struct StoreFileWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    position: u64,
    offsets: Vec<u64>,
    last_key: Option<StoreKey>,
}

impl StoreFileWriter {
    /// Creates the data file and writes its header.
    pub fn create(path: &Path) -> Result<Self, StoreFileError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        let config = standard().with_fixed_int_encoding();
        let zeroed = FileHeader {
            magic: SF_MAGIC,
            version: SF_VERSION,
            header_crc: 0,
        };
        let zeroed_bytes = encode_to_vec(&zeroed, config)?;
        let mut hasher = Crc32::new();
        hasher.update(&zeroed_bytes);
        let header = FileHeader {
            header_crc: hasher.finalize(),
            ..zeroed
        };
        let header_bytes = encode_to_vec(&header, config)?;
        writer.write_all(&header_bytes)?;

        Ok(Self {
            writer,
            path: path.to_path_buf(),
            position: header_bytes.len() as u64,
            offsets: Vec::new(),
            last_key: None,
        })
    }

    /// Appends one cell. Keys must arrive in strictly ascending order.
    pub fn append(&mut self, key: &StoreKey, value: &[u8]) -> Result<(), StoreFileError> {
        if let Some(last) = &self.last_key {
            if key <= last {
                return Err(StoreFileError::OutOfOrderAppend(format!(
                    "{} after {}",
                    key, last
                )));
            }
        }

        let config = standard().with_fixed_int_encoding();
        let header = CellHeader {
            row_len: key.row.len() as u32,
            column_len: key.column.len() as u32,
            value_len: value.len() as u32,
            timestamp: key.timestamp,
        };
        let header_bytes = encode_to_vec(&header, config)?;

        self.offsets.push(self.position);
        self.writer.write_all(&header_bytes)?;
        self.writer.write_all(&key.row)?;
        self.writer.write_all(&key.column)?;
        self.writer.write_all(value)?;
        self.position +=
            (header_bytes.len() + key.row.len() + key.column.len() + value.len()) as u64;
        self.last_key = Some(key.clone());
        Ok(())
    }

    /// Number of cells appended so far.
    pub fn entries(&self) -> usize {
        self.offsets.len()
    }

    /// Writes the index and footer, then flushes and fsyncs the file.
    pub fn finish(mut self) -> Result<(), StoreFileError> {
        let config = standard().with_fixed_int_encoding();

        let index_bytes = encode_to_vec(&self.offsets, config)?;
        let mut hasher = Crc32::new();
        hasher.update(&index_bytes);
        let index_crc = hasher.finalize();

        let index_offset = self.position;
        self.writer.write_all(&(index_bytes.len() as u32).to_le_bytes())?;
        self.writer.write_all(&index_bytes)?;
        self.writer.write_all(&index_crc.to_le_bytes())?;
        let index_size = (4 + index_bytes.len() + 4) as u64;

        let zeroed = FileFooter {
            index_offset,
            index_size,
            cell_count: self.offsets.len() as u64,
            footer_crc: 0,
        };
        let zeroed_bytes = encode_to_vec(&zeroed, config)?;
        let mut hasher = Crc32::new();
        hasher.update(&zeroed_bytes);
        let footer = FileFooter {
            footer_crc: hasher.finalize(),
            ..zeroed
        };
        self.writer.write_all(&encode_to_vec(&footer, config)?)?;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        debug!(
            path = %self.path.display(),
            cells = self.offsets.len(),
            "store file written"
        );
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

struct ReaderInner {
    mmap: Mmap,
    offsets: Vec<u64>,
}

/// Random-access reader over one store file (or one half of a parent
/// file, for references).
///
/// Cloning is cheap — clones share the mmap and index but carry their
/// own cursor, which is how scanners get independent positions.
pub struct StoreFileReader {
    inner: Arc<ReaderInner>,

    /// First visible index slot (reference bottom bound).
    lower: usize,

    /// One past the last visible index slot (reference top bound).
    upper: usize,

    /// Cursor for sequential `next` reads.
    pos: usize,
}

impl Clone for StoreFileReader {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            lower: self.lower,
            upper: self.upper,
            pos: self.lower,
        }
    }
}

impl StoreFileReader {
    /// Opens a concrete data file.
    pub fn open(path: &Path) -> Result<Self, StoreFileError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let config = standard().with_fixed_int_encoding();

        if mmap.len() < SF_HEADER_SIZE + SF_FOOTER_SIZE {
            return Err(StoreFileError::Internal(format!(
                "file too small: {}",
                path.display()
            )));
        }

        // Header: verify crc over the zeroed struct, then magic/version.
        let (mut header, _) =
            decode_from_slice::<FileHeader, _>(&mmap[..SF_HEADER_SIZE], config)?;
        let stored_crc = header.header_crc;
        header.header_crc = 0;
        let mut hasher = Crc32::new();
        hasher.update(&encode_to_vec(&header, config)?);
        if stored_crc != hasher.finalize() {
            return Err(StoreFileError::ChecksumMismatch);
        }
        if header.magic != SF_MAGIC {
            return Err(StoreFileError::Internal("bad store file magic".into()));
        }
        if header.version != SF_VERSION {
            return Err(StoreFileError::Internal(format!(
                "unsupported store file version {}",
                header.version
            )));
        }

        // Footer.
        let footer_start = mmap.len() - SF_FOOTER_SIZE;
        let (mut footer, _) = decode_from_slice::<FileFooter, _>(&mmap[footer_start..], config)?;
        let stored_crc = footer.footer_crc;
        footer.footer_crc = 0;
        let mut hasher = Crc32::new();
        hasher.update(&encode_to_vec(&footer, config)?);
        if stored_crc != hasher.finalize() {
            return Err(StoreFileError::ChecksumMismatch);
        }

        // Index block: [len][bytes][crc].
        let index_start = footer.index_offset as usize;
        let index_end = index_start + footer.index_size as usize;
        if index_end > footer_start {
            return Err(StoreFileError::Internal("index block out of bounds".into()));
        }
        let len = u32::from_le_bytes(
            mmap[index_start..index_start + 4]
                .try_into()
                .map_err(|_| StoreFileError::Internal("short index length".into()))?,
        ) as usize;
        let bytes = &mmap[index_start + 4..index_start + 4 + len];
        let stored_crc = u32::from_le_bytes(
            mmap[index_start + 4 + len..index_start + 4 + len + 4]
                .try_into()
                .map_err(|_| StoreFileError::Internal("short index checksum".into()))?,
        );
        let mut hasher = Crc32::new();
        hasher.update(bytes);
        if stored_crc != hasher.finalize() {
            return Err(StoreFileError::ChecksumMismatch);
        }
        let (offsets, _) = decode_from_slice::<Vec<u64>, _>(bytes, config)?;

        if offsets.len() as u64 != footer.cell_count {
            warn!(
                path = %path.display(),
                "index entry count disagrees with footer cell count"
            );
        }

        let upper = offsets.len();
        Ok(Self {
            inner: Arc::new(ReaderInner { mmap, offsets }),
            lower: 0,
            upper,
            pos: 0,
        })
    }

    /// Opens a reader restricted to one half of a parent data file.
    pub fn open_reference(
        parent_path: &Path,
        reference: &Reference,
    ) -> Result<Self, StoreFileError> {
        let mut reader = Self::open(parent_path)?;
        let pivot = reader.partition_point(|key| key.row.as_slice() < reference.split_key.as_slice())?;
        match reference.half {
            Half::Bottom => reader.upper = pivot,
            Half::Top => reader.lower = pivot,
        }
        reader.pos = reader.lower;
        Ok(reader)
    }

    /// Number of visible cells.
    pub fn len(&self) -> usize {
        self.upper - self.lower
    }

    /// True when no cell is visible.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes the cell at an absolute index slot.
    fn cell_at(&self, idx: usize) -> Result<(StoreKey, Vec<u8>), StoreFileError> {
        let offset = self.inner.offsets[idx] as usize;
        let config = standard().with_fixed_int_encoding();
        let end = offset + SF_CELL_HEADER_SIZE;
        if end > self.inner.mmap.len() {
            return Err(StoreFileError::Internal("cell header out of bounds".into()));
        }
        let (header, _) = decode_from_slice::<CellHeader, _>(&self.inner.mmap[offset..end], config)?;

        let row_start = end;
        let column_start = row_start + header.row_len as usize;
        let value_start = column_start + header.column_len as usize;
        let value_end = value_start + header.value_len as usize;
        if value_end > self.inner.mmap.len() {
            return Err(StoreFileError::Internal("cell body out of bounds".into()));
        }

        let key = StoreKey::new(
            self.inner.mmap[row_start..column_start].to_vec(),
            self.inner.mmap[column_start..value_start].to_vec(),
            header.timestamp,
        );
        Ok((key, self.inner.mmap[value_start..value_end].to_vec()))
    }

    /// First index slot in `[lower, upper)` whose key fails `pred`
    /// (`pred` must be monotone: true then false over the slot range).
    fn partition_point(
        &self,
        mut pred: impl FnMut(&StoreKey) -> bool,
    ) -> Result<usize, StoreFileError> {
        let mut lo = self.lower;
        let mut hi = self.upper;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (key, _) = self.cell_at(mid)?;
            if pred(&key) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Rewinds the cursor to the first visible cell.
    pub fn reset(&mut self) {
        self.pos = self.lower;
    }

    /// Next cell in key order, or `None` past the end.
    pub fn next(&mut self) -> Result<Option<(StoreKey, Vec<u8>)>, StoreFileError> {
        if self.pos >= self.upper {
            return Ok(None);
        }
        let cell = self.cell_at(self.pos)?;
        self.pos += 1;
        Ok(Some(cell))
    }

    /// Positions at and returns the smallest cell with key ≥ `search`
    /// — or, when `at_or_before` is set, the largest cell with key ≤
    /// `search`. Subsequent [`StoreFileReader::next`] calls continue
    /// from just past the returned cell.
    pub fn get_closest(
        &mut self,
        search: &StoreKey,
        at_or_before: bool,
    ) -> Result<Option<(StoreKey, Vec<u8>)>, StoreFileError> {
        if self.is_empty() {
            return Ok(None);
        }
        if at_or_before {
            // First slot strictly past the search key, minus one.
            let idx = self.partition_point(|key| key <= search)?;
            if idx == self.lower {
                return Ok(None);
            }
            let cell = self.cell_at(idx - 1)?;
            self.pos = idx;
            Ok(Some(cell))
        } else {
            let idx = self.partition_point(|key| key < search)?;
            if idx >= self.upper {
                return Ok(None);
            }
            let cell = self.cell_at(idx)?;
            self.pos = idx + 1;
            Ok(Some(cell))
        }
    }

    /// The largest visible key.
    pub fn final_key(&self) -> Result<Option<StoreKey>, StoreFileError> {
        if self.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.cell_at(self.upper - 1)?.0))
    }

    /// A key partitioning the visible cells roughly in half.
    pub fn mid_key(&self) -> Result<Option<StoreKey>, StoreFileError> {
        if self.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.cell_at(self.lower + self.len() / 2)?.0))
    }

    /// The smallest visible key.
    pub fn first_key(&self) -> Result<Option<StoreKey>, StoreFileError> {
        if self.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.cell_at(self.lower)?.0))
    }
}
