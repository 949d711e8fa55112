//! # Write-Ahead Log
//!
//! Durable, append-only log shared by every region a process serves.
//! Each batched update is appended **before** it becomes visible in any
//! memcache, and cache flushes bracket their work with marker records so
//! recovery knows which edits are already on disk.
//!
//! ## Record types
//!
//! - [`LogRecord::Edits`] — one batch of cell edits for a region, all
//!   carrying the same sequence id.
//! - [`LogRecord::CacheFlushStart`] — a flush obtained this sequence id;
//!   the store files it writes are stamped with it.
//! - [`LogRecord::CacheFlushComplete`] — the flush finished; on replay,
//!   edits for the region with sequence ids at or below this one may be
//!   skipped.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! Records are `bincode` (fixed-int) encoded; the CRC32 covers
//! `len || record_bytes`. Replay stops at the first checksum failure or
//! truncated record.
//!
//! # Concurrency model
//!
//! The file handle is shared via `Arc<Mutex<File>>`. Sequence ids are
//! allocated inside the append critical section, so sequence order and
//! append order always agree. [`WalIter`] keeps its own logical offset
//! and seeks before each read, which lets replay run concurrently with
//! appenders.

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
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use bincode::{config::standard, decode_from_slice, encode_to_vec};
use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{error, info, trace};

use crate::key::StoreKey;

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
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

    /// Record exceeds the configured maximum size.
    #[error("Record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// Unexpected end-of-file during read.
    #[error("Unexpected end of file")]
    UnexpectedEof,

    /// WAL header failed integrity validation.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Header / Record structures
// ------------------------------------------------------------------------------------------------

/// Metadata written at the start of the WAL file, followed by a CRC32.
#[derive(Debug, bincode::Encode, bincode::Decode)]
pub struct WalHeader {
    /// Magic constant identifying WAL files (`b"RWAL"`).
    pub magic: [u8; 4],

    /// WAL format version.
    pub version: u32,

    /// Maximum record size (in bytes).
    pub max_record_size: u32,
}

impl WalHeader {
    /// Expected 4-byte magic constant.
    pub const MAGIC: [u8; 4] = *b"RWAL";

    /// Current supported version number.
    pub const VERSION: u32 = 1;

    /// Default maximum record size (8 MiB — a whole batch is one record).
    pub const DEFAULT_MAX_RECORD_SIZE: u32 = 8 * 1024 * 1024;

    fn new(max_record_size: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            max_record_size,
        }
    }
}

/// A single cell edit inside a batch record. Tombstones carry the
/// delete-marker sentinel as their value.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct LogEdit {
    /// Row key.
    pub row: Vec<u8>,

    /// Column (`family:qualifier`).
    pub column: Vec<u8>,

    /// Cell timestamp.
    pub timestamp: u64,

    /// Cell value, or the delete marker.
    pub value: Vec<u8>,
}

/// One durable WAL record.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub enum LogRecord {
    /// A batch of edits for one region, sharing a sequence id.
    Edits {
        region: Vec<u8>,
        table: Vec<u8>,
        sequence: u64,
        edits: Vec<LogEdit>,
    },

    /// A cache flush obtained this sequence id and is writing files.
    CacheFlushStart {
        region: Vec<u8>,
        table: Vec<u8>,
        sequence: u64,
    },

    /// The flush at this sequence id is fully on disk; older edits for
    /// the region are redundant.
    CacheFlushComplete {
        region: Vec<u8>,
        table: Vec<u8>,
        sequence: u64,
    },
}

impl LogRecord {
    /// The sequence id this record carries.
    pub fn sequence(&self) -> u64 {
        match self {
            LogRecord::Edits { sequence, .. }
            | LogRecord::CacheFlushStart { sequence, .. }
            | LogRecord::CacheFlushComplete { sequence, .. } => *sequence,
        }
    }

    /// The region name this record belongs to.
    pub fn region(&self) -> &[u8] {
        match self {
            LogRecord::Edits { region, .. }
            | LogRecord::CacheFlushStart { region, .. }
            | LogRecord::CacheFlushComplete { region, .. } => region,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// A thread-safe write-ahead log handle.
///
/// One `Wal` may be shared (via `Arc`) by every region on a server; the
/// sequence counter is global to the handle, which is what makes store
/// file sequence ids comparable across flushes.
#[derive(Debug)]
pub struct Wal {
    /// Thread-safe file handle for WAL operations.
    inner_file: Arc<Mutex<File>>,

    /// Path to the WAL file on disk.
    path: String,

    /// Persistent header with metadata and integrity info.
    header: WalHeader,

    /// Next sequence id to hand out.
    next_sequence: AtomicU64,
}

impl Wal {
    /// Open or create a WAL file at the given path.
    ///
    /// An existing log is scanned once so the sequence counter resumes
    /// above every record already present.
    pub fn open<P: AsRef<Path>>(path: P, max_record_size: Option<u32>) -> Result<Self, WalError> {
        let path_ref = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path_ref)?;

        let config = standard().with_fixed_int_encoding();

        let header = if file.metadata()?.len() == 0 {
            let header =
                WalHeader::new(max_record_size.unwrap_or(WalHeader::DEFAULT_MAX_RECORD_SIZE));

            let header_bytes = encode_to_vec(&header, config).map_err(WalError::Encode)?;

            let mut hasher = Crc32::new();
            hasher.update(&header_bytes);
            let checksum = hasher.finalize();

            file.write_all(&header_bytes)?;
            file.write_all(&checksum.to_le_bytes())?;
            file.sync_all()?;

            info!("Created new WAL header at {}", path_ref.display());

            header
        } else {
            // Existing WAL: read and validate header + checksum.
            file.seek(SeekFrom::Start(0))?;

            let sample = WalHeader::new(WalHeader::DEFAULT_MAX_RECORD_SIZE);
            let sample_bytes = encode_to_vec(&sample, config).map_err(WalError::Encode)?;
            let header_len = sample_bytes.len();

            let mut header_bytes = vec![0u8; header_len];
            file.read_exact(&mut header_bytes)?;

            let mut checksum_bytes = [0u8; U32_SIZE];
            file.read_exact(&mut checksum_bytes)?;
            let stored_checksum = u32::from_le_bytes(checksum_bytes);

            let mut hasher = Crc32::new();
            hasher.update(&header_bytes);
            if stored_checksum != hasher.finalize() {
                return Err(WalError::InvalidHeader("Header checksum mismatched".into()));
            }

            let (header, _) = decode_from_slice::<WalHeader, _>(&header_bytes, config)?;

            if header.magic != WalHeader::MAGIC {
                return Err(WalError::InvalidHeader("Bad magic".into()));
            }
            if header.version != WalHeader::VERSION {
                return Err(WalError::InvalidHeader(format!(
                    "Unsupported version {}",
                    header.version
                )));
            }

            header
        };

        let wal = Self {
            inner_file: Arc::new(Mutex::new(file)),
            path: path_ref.display().to_string(),
            header,
            next_sequence: AtomicU64::new(1),
        };

        // Resume the sequence counter past anything already logged. A
        // torn tail is expected after a crash; replaying callers will
        // surface it, open does not.
        let mut max_seen = 0;
        for record in wal.replay_iter()? {
            match record {
                Ok(record) => max_seen = max_seen.max(record.sequence()),
                Err(_) => break,
            }
        }
        wal.next_sequence.store(max_seen + 1, Ordering::SeqCst);

        info!("Opened WAL file at {}", path_ref.display());

        Ok(wal)
    }

    /// Appends one batch of edits for `region` as a single record and
    /// returns the sequence id the batch carries.
    pub fn append_edits(
        &self,
        region: &[u8],
        table: &[u8],
        edits: &BTreeMap<StoreKey, Vec<u8>>,
    ) -> Result<u64, WalError> {
        self.append_with_sequence(|sequence| LogRecord::Edits {
            region: region.to_vec(),
            table: table.to_vec(),
            sequence,
            edits: edits
                .iter()
                .map(|(key, value)| LogEdit {
                    row: key.row.clone(),
                    column: key.column.clone(),
                    timestamp: key.timestamp,
                    value: value.clone(),
                })
                .collect(),
        })
    }

    /// Logs that a cache flush is starting and returns the sequence id
    /// the flushed store files must be stamped with.
    pub fn start_cache_flush(&self, region: &[u8], table: &[u8]) -> Result<u64, WalError> {
        self.append_with_sequence(|sequence| LogRecord::CacheFlushStart {
            region: region.to_vec(),
            table: table.to_vec(),
            sequence,
        })
    }

    /// Logs that the flush at `sequence` completed; recovery may skip
    /// older edits for the region from here on.
    pub fn complete_cache_flush(
        &self,
        region: &[u8],
        table: &[u8],
        sequence: u64,
    ) -> Result<(), WalError> {
        let record = LogRecord::CacheFlushComplete {
            region: region.to_vec(),
            table: table.to_vec(),
            sequence,
        };
        let mut guard = self.lock_file()?;
        self.write_record(&mut guard, &record)
    }

    /// Ensures every future sequence id is strictly greater than
    /// `floor`. Called when a region opens with store files that already
    /// carry sequence ids.
    pub fn advance_sequence(&self, floor: u64) {
        self.next_sequence.fetch_max(floor + 1, Ordering::SeqCst);
    }

    /// Allocates a sequence id and appends the record built from it,
    /// both inside the file critical section so sequence order matches
    /// append order.
    fn append_with_sequence(&self, build: impl FnOnce(u64) -> LogRecord) -> Result<u64, WalError> {
        let mut guard = self.lock_file()?;
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let record = build(sequence);
        self.write_record(&mut guard, &record)?;
        Ok(sequence)
    }

    fn lock_file(&self) -> Result<std::sync::MutexGuard<'_, File>, WalError> {
        self.inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))
    }

    /// Frames and appends a single record: `[len][bytes][crc32]`.
    fn write_record(&self, file: &mut File, record: &LogRecord) -> Result<(), WalError> {
        trace!("Appending record: {:?}", record);

        let config = standard().with_fixed_int_encoding();

        let record_bytes = encode_to_vec(record, config).map_err(WalError::Encode)?;
        let record_len = record_bytes.len() as u32;

        if record_len > self.header.max_record_size {
            return Err(WalError::RecordTooLarge(record_len as usize));
        }

        let mut hasher = Crc32::new();
        hasher.update(&record_len.to_le_bytes());
        hasher.update(&record_bytes);
        let checksum = hasher.finalize();

        file.write_all(&record_len.to_le_bytes())?;
        file.write_all(&record_bytes)?;
        file.write_all(&checksum.to_le_bytes())?;
        file.sync_all()?;

        Ok(())
    }

    /// Returns an iterator that replays all valid records from the WAL.
    pub fn replay_iter(&self) -> Result<WalIter, WalError> {
        let config = standard().with_fixed_int_encoding();
        let header_bytes = encode_to_vec(&self.header, config).map_err(WalError::Encode)?;
        let start_offset = (header_bytes.len() + U32_SIZE) as u64;

        Ok(WalIter {
            file: Arc::clone(&self.inner_file),
            config,
            offset: start_offset,
            max_record_size: self.header.max_record_size as usize,
        })
    }

    /// Get the path of the underlying WAL file.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        match self.inner_file.lock() {
            Ok(guard) => {
                if let Err(e) = guard.sync_all() {
                    error!("Failed to sync WAL on drop: {}", e);
                }
            }
            Err(poisoned) => {
                let file = poisoned.into_inner();
                if let Err(e) = file.sync_all() {
                    error!("Failed to sync WAL (poisoned) on drop: {}", e);
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// WalIter
// ------------------------------------------------------------------------------------------------

/// Streaming WAL replay iterator.
///
/// Reads records sequentially, verifies CRC32 checksums, and yields
/// decoded [`LogRecord`]s. Holds the shared file handle but locks it
/// only for one record at a time.
pub struct WalIter {
    /// Shared file handle protected by a mutex.
    file: Arc<Mutex<File>>,

    /// Bincode configuration for decoding.
    config: bincode::config::Configuration<
        bincode::config::LittleEndian,
        bincode::config::Fixint,
        bincode::config::NoLimit,
    >,

    /// Current byte offset within the WAL file.
    offset: u64,

    /// Maximum allowed record size.
    max_record_size: usize,
}

impl Iterator for WalIter {
    type Item = Result<LogRecord, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut guard = match self.file.lock() {
            Ok(g) => g,
            Err(_) => return Some(Err(WalError::Internal("Mutex poisoned".into()))),
        };

        if let Err(e) = guard.seek(SeekFrom::Start(self.offset)) {
            return Some(Err(WalError::Io(e)));
        }

        let mut len_bytes = [0u8; U32_SIZE];
        match guard.read_exact(&mut len_bytes) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                trace!("End of WAL reached");
                return None;
            }
            Err(e) => return Some(Err(WalError::Io(e))),
        }

        let record_len = u32::from_le_bytes(len_bytes) as usize;
        if record_len > self.max_record_size {
            return Some(Err(WalError::RecordTooLarge(record_len)));
        }

        let mut record_bytes = vec![0u8; record_len];
        if let Err(e) = guard.read_exact(&mut record_bytes) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                error!("Truncated WAL record detected");
                return Some(Err(WalError::UnexpectedEof));
            }
            return Some(Err(WalError::Io(e)));
        }

        let mut checksum_bytes = [0u8; U32_SIZE];
        if let Err(e) = guard.read_exact(&mut checksum_bytes) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                error!("Truncated WAL record detected");
                return Some(Err(WalError::UnexpectedEof));
            }
            return Some(Err(WalError::Io(e)));
        }
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        if let Ok(pos) = guard.stream_position() {
            self.offset = pos;
        }

        let mut hasher = Crc32::new();
        hasher.update(&len_bytes);
        hasher.update(&record_bytes);
        if stored_checksum != hasher.finalize() {
            error!("Checksum mismatch for record of length {}", record_len);
            return Some(Err(WalError::ChecksumMismatch));
        }

        match decode_from_slice::<LogRecord, _>(&record_bytes, self.config) {
            Ok((record, _)) => Some(Ok(record)),
            Err(e) => Some(Err(WalError::Decode(e))),
        }
    }
}
