//! Append-only file store.
//!
//! A durable `KvStore` built on a single log file. Every put is appended as a
//! checksummed record and the in-memory index is rebuilt by scanning the log
//! on open. Later records for the same key shadow earlier ones.
//!
//! # Record Format
//!
//! ```text
//! +----------+-----------------------------------------------+
//! | 0-3      | record_length (4 bytes, whole record)          |
//! | 4-7      | key_length (4 bytes)                           |
//! | 8-K      | key                                            |
//! | K-N      | value                                          |
//! | N-N+3    | CRC32 checksum (4 bytes)                       |
//! +----------+-----------------------------------------------+
//! ```
//!
//! # Recovery
//!
//! A crash in the middle of a batch leaves a torn record at the end of the
//! log. Opening the store stops at the first record that is truncated or fails
//! its checksum, truncates the file there and logs a warning. Everything
//! before that point is served normally.

// Record lengths fit in u32, file offsets use u64
#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::storage::store::{Batch, KvStore, StoreError};

/// `record_length` (4) + `key_length` (4).
const RECORD_HEADER_SIZE: usize = 8;

/// CRC32 checksum size at end of record.
const CHECKSUM_SIZE: usize = 4;

/// Location of a value inside the log file.
#[derive(Debug, Clone, Copy)]
struct ValueLocation {
    offset: u64,
    len: usize,
}

struct LogFile {
    file: File,
    /// Offset one past the last valid record.
    end: u64,
}

/// Durable key-value store backed by an append-only log file.
pub struct FileStore {
    path: PathBuf,
    log: Mutex<LogFile>,
    index: RwLock<HashMap<Vec<u8>, ValueLocation>>,
}

/// Result of replaying the log on open.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Number of valid records replayed.
    pub records: u64,
    /// Bytes cut from the end of the log because the tail was torn.
    pub truncated_bytes: u64,
}

/// Result of rewriting the log down to its live records.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompactionStats {
    /// Keys written to the new log.
    pub live_records: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Serialize one put as a log record.
fn encode_record(key: &[u8], value: &[u8]) -> Vec<u8> {
    let total_len = RECORD_HEADER_SIZE + key.len() + value.len() + CHECKSUM_SIZE;
    let mut bytes = Vec::with_capacity(total_len);

    bytes.extend_from_slice(&(total_len as u32).to_le_bytes());
    bytes.extend_from_slice(&(key.len() as u32).to_le_bytes());
    bytes.extend_from_slice(key);
    bytes.extend_from_slice(value);

    // CRC32 checksum - computed over everything before it
    let checksum = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&checksum.to_le_bytes());

    bytes
}

/// Read the next record from the log.
///
/// `remaining` is the number of bytes left in the file, which bounds the
/// record length before anything is allocated for it.
///
/// Returns `Ok(None)` at a clean end of file or at a torn/corrupt record.
fn read_record<R: Read>(
    reader: &mut R,
    remaining: u64,
) -> Result<Option<(Vec<u8>, usize, usize)>, StoreError> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(StoreError::Io(e)),
    }

    let record_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let key_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if record_len < RECORD_HEADER_SIZE + CHECKSUM_SIZE + key_len
        || record_len as u64 > remaining
    {
        return Ok(None);
    }

    let mut record = vec![0u8; record_len];
    record[..RECORD_HEADER_SIZE].copy_from_slice(&header);
    match reader.read_exact(&mut record[RECORD_HEADER_SIZE..]) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(StoreError::Io(e)),
    }

    let body_end = record_len - CHECKSUM_SIZE;
    let stored_checksum = u32::from_le_bytes([
        record[body_end],
        record[body_end + 1],
        record[body_end + 2],
        record[body_end + 3],
    ]);
    if crc32fast::hash(&record[..body_end]) != stored_checksum {
        return Ok(None);
    }

    let value_len = body_end - RECORD_HEADER_SIZE - key_len;
    Ok(Some((record, key_len, value_len)))
}

/// Write `buffer` at `offset` and flush it to disk.
fn append_at(file: &mut File, offset: u64, buffer: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buffer)?;
    file.sync_data()
}

/// Copy the latest value of every key in `index` from `source` into a fresh
/// log at `path`, keys in ascending order. Returns the synced file, its
/// length and the index over it.
fn write_compacted(
    source: &mut File,
    index: &HashMap<Vec<u8>, ValueLocation>,
    path: &Path,
) -> Result<(File, u64, HashMap<Vec<u8>, ValueLocation>), StoreError> {
    let mut out = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    let mut keys: Vec<&Vec<u8>> = index.keys().collect();
    keys.sort();

    let mut new_index = HashMap::with_capacity(keys.len());
    let mut offset = 0u64;
    {
        let mut writer = BufWriter::new(&mut out);
        for key in keys {
            let location = index[key];
            let mut value = vec![0u8; location.len];
            source.seek(SeekFrom::Start(location.offset))?;
            source.read_exact(&mut value)?;

            let record = encode_record(key, &value);
            new_index.insert(
                key.clone(),
                ValueLocation {
                    offset: offset + (RECORD_HEADER_SIZE + key.len()) as u64,
                    len: value.len(),
                },
            );
            writer.write_all(&record)?;
            offset += record.len() as u64;
        }
        writer.flush()?;
    }
    out.sync_all()?;
    Ok((out, offset, new_index))
}

impl FileStore {
    /// Open the store at `path`, creating an empty log if it doesn't exist.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_stats(path).map(|(store, _)| store)
    }

    /// Open the store and report what the log replay found.
    pub fn open_with_stats(path: &Path) -> Result<(Self, RecoveryStats), StoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let mut index = HashMap::new();
        let mut stats = RecoveryStats::default();
        let mut offset = 0u64;

        {
            let mut reader = BufReader::new(&mut file);
            while let Some((record, key_len, value_len)) =
                read_record(&mut reader, file_len - offset)?
            {
                let key = record[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + key_len].to_vec();
                let value_offset = offset + (RECORD_HEADER_SIZE + key_len) as u64;
                index.insert(
                    key,
                    ValueLocation {
                        offset: value_offset,
                        len: value_len,
                    },
                );
                offset += record.len() as u64;
                stats.records += 1;
            }
        }

        if offset < file_len {
            stats.truncated_bytes = file_len - offset;
            tracing::warn!(
                "Truncating torn tail of {}: {} bytes after offset {}",
                path.display(),
                stats.truncated_bytes,
                offset
            );
            file.set_len(offset)?;
            file.sync_all()?;
        }

        tracing::debug!(
            "Opened file store {}: {} records, {} live keys",
            path.display(),
            stats.records,
            index.len()
        );

        Ok((
            Self {
                path: path.to_path_buf(),
                log: Mutex::new(LogFile { file, end: offset }),
                index: RwLock::new(index),
            },
            stats,
        ))
    }

    /// Path of the underlying log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the log so it holds only the latest record of every key.
    ///
    /// The compacted log is written to a sibling file and renamed over the
    /// original, so a crash leaves one complete log or the other. Writers
    /// and readers wait until the swap is done.
    pub fn compact(&self) -> Result<CompactionStats, StoreError> {
        let mut log = self.log.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut index = self.index.write().map_err(|_| StoreError::LockPoisoned)?;
        let bytes_before = log.end;
        let tmp_path = self.path.with_extension("compact");

        let rewritten = write_compacted(&mut log.file, &index, &tmp_path)
            .and_then(|out| Ok((out, std::fs::rename(&tmp_path, &self.path)?)));
        let ((file, end, new_index), ()) = match rewritten {
            Ok(done) => done,
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_file(&tmp_path) {
                    tracing::warn!("Failed to remove {}: {cleanup}", tmp_path.display());
                }
                return Err(e);
            }
        };

        let stats = CompactionStats {
            live_records: new_index.len() as u64,
            bytes_before,
            bytes_after: end,
        };
        log.file = file;
        log.end = end;
        *index = new_index;

        tracing::info!(
            "Compacted {}: {} live records, {} -> {} bytes",
            self.path.display(),
            stats.live_records,
            stats.bytes_before,
            stats.bytes_after
        );
        Ok(stats)
    }

    /// Number of live keys.
    pub fn len(&self) -> Result<usize, StoreError> {
        let index = self.index.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(index.len())
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let location = {
            let index = self.index.read().map_err(|_| StoreError::LockPoisoned)?;
            match index.get(key) {
                Some(location) => *location,
                None => return Ok(None),
            }
        };

        let mut log = self.log.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut value = vec![0u8; location.len];
        log.file.seek(SeekFrom::Start(location.offset))?;
        log.file.read_exact(&mut value)?;
        Ok(Some(value))
    }

    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        let index = self.index.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(index.contains_key(key))
    }

    fn write(&self, batch: &Batch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut buffer = Vec::with_capacity(batch.value_size() + batch.len() * 16);
        let mut locations = Vec::with_capacity(batch.len());
        let mut log = self.log.lock().map_err(|_| StoreError::LockPoisoned)?;
        let start = log.end;

        for (key, value) in batch.iter() {
            let value_offset = start + (buffer.len() + RECORD_HEADER_SIZE + key.len()) as u64;
            locations.push((
                key.to_vec(),
                ValueLocation {
                    offset: value_offset,
                    len: value.len(),
                },
            ));
            buffer.extend_from_slice(&encode_record(key, value));
        }

        if let Err(e) = append_at(&mut log.file, start, &buffer) {
            // Drop whatever part of the batch made it to disk so the next
            // append starts at a record boundary.
            if let Err(rollback) = log.file.set_len(start) {
                tracing::warn!(
                    "Failed to roll back partial batch in {} to offset {start}: {rollback}",
                    self.path.display()
                );
            }
            return Err(StoreError::Io(e));
        }
        log.end = start + buffer.len() as u64;

        let mut index = self.index.write().map_err(|_| StoreError::LockPoisoned)?;
        index.extend(locations);
        Ok(())
    }
}
